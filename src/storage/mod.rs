//! Storage engine for Mnema
//!
//! SQLite rows for memories, waypoints, facts, edges, user profiles,
//! classifier models and the maintenance log, plus the sector vector
//! table with flat-scan kNN. The table store owns row lifetimes; the
//! vector table owns vector blobs; the HSG writer is the only mutator
//! that touches both.

mod connection;
mod facts;
mod migrations;
pub mod queries;
pub mod stats;
pub mod vectors;

pub use connection::Storage;
pub use facts::*;
pub use migrations::run_migrations;
pub use vectors::{VectorHit, VectorStore};
