//! Maintenance log and aggregate statistics

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::context::TenantScope;
use crate::error::Result;
use crate::types::{EngineStats, MaintenanceKind, MaintenanceStat};

/// Append a maintenance counter row
pub fn log_maintenance(
    conn: &Connection,
    kind: MaintenanceKind,
    count: i64,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO stats (type, count, ts) VALUES (?, ?, ?)",
        params![kind.as_str(), count, ts.to_rfc3339()],
    )?;
    Ok(())
}

/// Most recent maintenance rows, newest first
pub fn maintenance_tail(conn: &Connection, limit: i64) -> Result<Vec<MaintenanceStat>> {
    let mut stmt =
        conn.prepare("SELECT type, count, ts FROM stats ORDER BY id DESC LIMIT ?")?;
    let rows = stmt
        .query_map(params![limit], |row| {
            let kind: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let ts: String = row.get(2)?;
            Ok((kind, count, ts))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let stats = rows
        .into_iter()
        .filter_map(|(kind, count, ts)| {
            let kind = match kind.as_str() {
                "decay" => MaintenanceKind::Decay,
                "reflect" => MaintenanceKind::Reflect,
                "summary" => MaintenanceKind::Summary,
                "train" => MaintenanceKind::Train,
                "prune" => MaintenanceKind::Prune,
                "error" => MaintenanceKind::Error,
                _ => return None,
            };
            let ts = DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()?;
            Some(MaintenanceStat { kind, count, ts })
        })
        .collect();
    Ok(stats)
}

/// Aggregate store statistics for a scope
pub fn engine_stats(conn: &Connection, scope: &TenantScope) -> Result<EngineStats> {
    let mut stats = EngineStats::default();

    let (filter, param): (&str, Option<String>) = match scope {
        TenantScope::Id(id) => (" WHERE tenant_id = ?", Some(id.clone())),
        TenantScope::System => (" WHERE tenant_id IS NULL", None),
        TenantScope::Any => ("", None),
    };

    let count_with = |sql: &str| -> Result<i64> {
        let full = format!("{}{}", sql, filter);
        let count = match &param {
            Some(p) => conn.query_row(&full, params![p], |row| row.get(0))?,
            None => conn.query_row(&full, [], |row| row.get(0))?,
        };
        Ok(count)
    };

    stats.total_memories = count_with("SELECT COUNT(*) FROM memories")?;
    stats.total_vectors = count_with("SELECT COUNT(*) FROM sector_vectors")?;
    stats.total_waypoints = count_with("SELECT COUNT(*) FROM waypoints")?;
    stats.total_facts = count_with("SELECT COUNT(*) FROM facts")?;

    {
        let sql = format!(
            "SELECT primary_sector, COUNT(*) FROM memories{} GROUP BY primary_sector",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(String, i64)> = match &param {
            Some(p) => stmt
                .query_map(params![p], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        stats.memories_by_sector = rows.into_iter().collect();
    }

    if matches!(scope, TenantScope::Any) {
        let mut stmt = conn.prepare(
            "SELECT COALESCE(tenant_id, ''), COUNT(*) FROM memories GROUP BY tenant_id",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        stats.memories_by_tenant = rows.into_iter().collect();
    }

    stats.maintenance_tail = maintenance_tail(conn, 20)?;
    Ok(stats)
}
