//! Background maintenance workers
//!
//! Decay, reflection, user summaries, classifier retraining and
//! waypoint pruning. Workers trap their own failures, log them to the
//! maintenance stats table and never kill the scheduler loop that
//! drives them.

mod decay;
mod reflection;
mod trainer;
mod user_summary;

pub use decay::{DecayOutcome, DecayWorker};
pub use reflection::ReflectionWorker;
pub use trainer::TrainerWorker;
pub use user_summary::UserSummaryWorker;

use chrono::Utc;

use crate::dynamics::WAYPOINT_PRUNE_FLOOR;
use crate::error::Result;
use crate::storage::{queries, stats, Storage};
use crate::types::MaintenanceKind;

/// Drop waypoints that have decayed below the prune floor. Runs on a
/// weekly schedule.
pub fn run_waypoint_prune(storage: &Storage) -> Result<i64> {
    let removed = storage.with_connection(|conn| {
        let removed = queries::prune_waypoints(conn, WAYPOINT_PRUNE_FLOOR)?;
        stats::log_maintenance(conn, MaintenanceKind::Prune, removed, Utc::now())?;
        Ok(removed)
    })?;
    if removed > 0 {
        tracing::info!(removed, "pruned weak waypoints");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TenantScope;
    use crate::types::Waypoint;

    #[test]
    fn test_prune_removes_only_weak_edges() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();

        storage
            .with_connection(|conn| {
                for (src, dst, weight) in [("a", "b", 0.5), ("b", "c", 0.01)] {
                    queries::upsert_waypoint(
                        conn,
                        &Waypoint {
                            src_id: src.to_string(),
                            dst_id: dst.to_string(),
                            tenant_id: None,
                            weight,
                            created_at: now,
                            last_traversed_at: now,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let removed = run_waypoint_prune(&storage).unwrap();
        assert_eq!(removed, 1);

        let kept = storage
            .with_connection(|conn| queries::waypoints_from(conn, "a", &TenantScope::System))
            .unwrap();
        assert_eq!(kept.len(), 1);
    }
}
