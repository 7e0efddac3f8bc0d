//! Hierarchical sector graph
//!
//! The combined view of memories, their per-sector vectors and
//! associative waypoints: routing text into sectors, the single write
//! path that keeps rows and vectors consistent, and hybrid retrieval
//! with spreading activation.

mod query;
mod router;
mod writer;

pub use query::HsgQuery;
pub use router::{Routing, SectorRouter};
pub use writer::HsgWriter;
