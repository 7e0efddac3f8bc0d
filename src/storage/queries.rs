//! Database queries for memory and waypoint rows
//!
//! All operations are tenant-scoped: callers pass the effective
//! `TenantScope` and every statement filters on it. `TenantScope::Any`
//! (admin) is the only scope that skips the filter.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use super::vectors::{blob_to_vec, vec_to_blob};
use crate::context::TenantScope;
use crate::embedding::EncoderDigest;
use crate::error::{MnemaError, Result};
use crate::types::{
    ClassifierModel, Memory, MemoryId, MemoryMetadata, Sector, UserProfile, Waypoint,
};

/// Append a tenant filter for `column` to a WHERE fragment
pub(crate) fn push_tenant_filter(
    sql: &mut String,
    params: &mut Vec<Box<dyn ToSql>>,
    scope: &TenantScope,
    column: &str,
) {
    match scope {
        TenantScope::Id(id) => {
            sql.push_str(&format!(" AND {} = ?", column));
            params.push(Box::new(id.clone()));
        }
        TenantScope::System => {
            sql.push_str(&format!(" AND {} IS NULL", column));
        }
        TenantScope::Any => {}
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse a memory from a database row
pub fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let id: String = row.get("id")?;
    let tenant_id: Option<String> = row.get("tenant_id")?;
    let content: String = row.get("content_encrypted")?;
    let sector_str: String = row.get("primary_sector")?;
    let tags_json: String = row.get("tags_json")?;
    let metadata_json: String = row.get("metadata_json")?;
    let segment: u32 = row.get::<_, i64>("segment")? as u32;
    let simhash: i64 = row.get("simhash")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_seen_at: String = row.get("last_seen_at")?;
    let salience: f64 = row.get("salience")?;
    let decay_lambda: f64 = row.get("decay_lambda")?;
    let version: i64 = row.get("version")?;
    let mean_vec: Option<Vec<u8>> = row.get("mean_vec")?;
    let compressed_vec: Option<Vec<u8>> = row.get("compressed_vec")?;
    let coactivations: i64 = row.get("coactivations")?;
    let feedback_score: f64 = row.get("feedback_score")?;
    let generated_summary: Option<String> = row.get("generated_summary")?;

    let primary_sector = sector_str.parse().unwrap_or(Sector::Semantic);
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let metadata: MemoryMetadata = serde_json::from_str(&metadata_json).unwrap_or_default();

    Ok(Memory {
        id,
        tenant_id,
        content,
        primary_sector,
        tags,
        metadata,
        segment,
        simhash: simhash as u64,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_seen_at: parse_ts(&last_seen_at),
        salience,
        decay_lambda,
        version,
        mean_vec: mean_vec.map(|b| blob_to_vec(&b)).unwrap_or_default(),
        compressed_vec: compressed_vec.map(|b| blob_to_vec(&b)),
        coactivations,
        feedback_score,
        generated_summary,
    })
}

const MEMORY_COLUMNS: &str = "id, tenant_id, content_encrypted, primary_sector, tags_json, \
     metadata_json, segment, simhash, created_at, updated_at, last_seen_at, salience, \
     decay_lambda, version, mean_dim, mean_vec, compressed_vec, coactivations, \
     feedback_score, generated_summary";

/// Insert a new memory row
pub fn insert_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO memories ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            MEMORY_COLUMNS
        ),
        params![
            memory.id,
            memory.tenant_id,
            memory.content,
            memory.primary_sector.as_str(),
            serde_json::to_string(&memory.tags)?,
            serde_json::to_string(&memory.metadata)?,
            memory.segment as i64,
            memory.simhash as i64,
            memory.created_at.to_rfc3339(),
            memory.updated_at.to_rfc3339(),
            memory.last_seen_at.to_rfc3339(),
            memory.salience.clamp(0.0, 1.0),
            memory.decay_lambda,
            memory.version,
            memory.mean_vec.len() as i64,
            if memory.mean_vec.is_empty() {
                None
            } else {
                Some(vec_to_blob(&memory.mean_vec))
            },
            memory.compressed_vec.as_ref().map(|v| vec_to_blob(v)),
            memory.coactivations,
            memory.feedback_score,
            memory.generated_summary,
        ],
    )?;
    Ok(())
}

/// Fetch a memory by id within a tenant scope
pub fn get_memory(conn: &Connection, id: &str, scope: &TenantScope) -> Result<Option<Memory>> {
    let mut sql = format!("SELECT {} FROM memories WHERE id = ?", MEMORY_COLUMNS);
    let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(id.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

    let memory = conn
        .query_row(
            &sql,
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            memory_from_row,
        )
        .optional()?;
    Ok(memory)
}

/// Persist a mutated memory row with an optimistic version check.
///
/// `memory.version` must already be the incremented value; the update
/// applies only where the stored row still holds `expected_version`.
pub fn update_memory(conn: &Connection, memory: &Memory, expected_version: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET content_encrypted = ?, primary_sector = ?, tags_json = ?,
                metadata_json = ?, simhash = ?, updated_at = ?, last_seen_at = ?,
                salience = ?, decay_lambda = ?, version = ?, mean_dim = ?, mean_vec = ?,
                compressed_vec = ?, coactivations = ?, feedback_score = ?,
                generated_summary = ?
         WHERE id = ? AND version = ?",
        params![
            memory.content,
            memory.primary_sector.as_str(),
            serde_json::to_string(&memory.tags)?,
            serde_json::to_string(&memory.metadata)?,
            memory.simhash as i64,
            memory.updated_at.to_rfc3339(),
            memory.last_seen_at.to_rfc3339(),
            memory.salience.clamp(0.0, 1.0),
            memory.decay_lambda,
            memory.version,
            memory.mean_vec.len() as i64,
            if memory.mean_vec.is_empty() {
                None
            } else {
                Some(vec_to_blob(&memory.mean_vec))
            },
            memory.compressed_vec.as_ref().map(|v| vec_to_blob(v)),
            memory.coactivations,
            memory.feedback_score,
            memory.generated_summary,
            memory.id,
            expected_version,
        ],
    )?;

    if changed == 0 {
        let found: Option<i64> = conn
            .query_row(
                "SELECT version FROM memories WHERE id = ?",
                params![memory.id],
                |row| row.get(0),
            )
            .optional()?;
        return match found {
            Some(found) => Err(MnemaError::Conflict {
                id: memory.id.clone(),
                expected: expected_version,
                found,
            }),
            None => Err(MnemaError::NotFound(memory.id.clone())),
        };
    }
    Ok(())
}

/// Delete a memory row and cascade to vectors, waypoints, facts and
/// edges referencing it. Returns false when no row matched the scope.
pub fn delete_memory(conn: &Connection, id: &str, scope: &TenantScope) -> Result<bool> {
    let mut sql = "DELETE FROM memories WHERE id = ?".to_string();
    let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(id.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

    let removed = conn.execute(
        &sql,
        rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
    )?;
    if removed == 0 {
        return Ok(false);
    }

    conn.execute("DELETE FROM sector_vectors WHERE mem_id = ?", params![id])?;
    conn.execute(
        "DELETE FROM waypoints WHERE src_id = ? OR dst_id = ?",
        params![id, id],
    )?;
    conn.execute(
        "DELETE FROM facts WHERE subject = ? OR object = ?",
        params![id, id],
    )?;
    conn.execute(
        "DELETE FROM temporal_edges WHERE source_id = ? OR target_id = ?",
        params![id, id],
    )?;
    Ok(true)
}

/// Wipe every memory within a scope, cascading. Returns the number of
/// memories removed.
pub fn delete_all_memories(conn: &Connection, scope: &TenantScope) -> Result<i64> {
    let mut sql = "SELECT id FROM memories WHERE 1=1".to_string();
    let mut bound: Vec<Box<dyn ToSql>> = Vec::new();
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

    let mut stmt = conn.prepare(&sql)?;
    let ids: Vec<String> = stmt
        .query_map(
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    for id in &ids {
        delete_memory(conn, id, scope)?;
    }
    Ok(ids.len() as i64)
}

/// Most recent memories for a scope, newest first
pub fn list_recent(conn: &Connection, scope: &TenantScope, limit: i64) -> Result<Vec<Memory>> {
    let mut sql = format!("SELECT {} FROM memories WHERE 1=1", MEMORY_COLUMNS);
    let mut bound: Vec<Box<dyn ToSql>> = Vec::new();
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
    sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ?");
    bound.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map(
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            memory_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(memories)
}

/// All memories of one maintenance segment (across tenants), id order
pub fn list_segment(conn: &Connection, segment: u32) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM memories WHERE segment = ? ORDER BY id ASC",
        MEMORY_COLUMNS
    ))?;
    let memories = stmt
        .query_map(params![segment as i64], memory_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(memories)
}

/// Count memories in a scope
pub fn count_memories(conn: &Connection, scope: &TenantScope) -> Result<i64> {
    let mut sql = "SELECT COUNT(*) FROM memories WHERE 1=1".to_string();
    let mut bound: Vec<Box<dyn ToSql>> = Vec::new();
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

    let count = conn.query_row(
        &sql,
        rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Distinct tenants that currently hold memories (system bucket
/// included as `None`)
pub fn list_active_tenants(conn: &Connection) -> Result<Vec<Option<String>>> {
    let mut stmt = conn.prepare("SELECT DISTINCT tenant_id FROM memories")?;
    let tenants = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tenants)
}

/// Batch-commit salience updates from the decay worker
pub fn update_salience_batch(
    conn: &Connection,
    updates: &[(MemoryId, f64)],
    now: DateTime<Utc>,
) -> Result<()> {
    let now_str = now.to_rfc3339();
    for (id, salience) in updates {
        conn.execute(
            "UPDATE memories SET salience = ?, updated_at = ?, version = version + 1 WHERE id = ?",
            params![salience.clamp(0.0, 1.0), now_str, id],
        )?;
    }
    Ok(())
}

/// Increment co-retrieval counters for a batch of ids
pub fn increment_coactivations(conn: &Connection, ids: &[MemoryId]) -> Result<()> {
    for id in ids {
        conn.execute(
            "UPDATE memories SET coactivations = coactivations + 1 WHERE id = ?",
            params![id],
        )?;
    }
    Ok(())
}

/// Replace the generated summary without a version bump (maintenance)
pub fn set_generated_summary(conn: &Connection, id: &str, summary: &str) -> Result<()> {
    conn.execute(
        "UPDATE memories SET generated_summary = ? WHERE id = ?",
        params![summary, id],
    )?;
    Ok(())
}

/// Training samples for the classifier: anchor vector + primary sector
pub fn classifier_samples(
    conn: &Connection,
    scope: &TenantScope,
    limit: i64,
) -> Result<Vec<(Vec<f32>, Sector)>> {
    let mut sql =
        "SELECT mean_vec, primary_sector FROM memories WHERE mean_vec IS NOT NULL".to_string();
    let mut bound: Vec<Box<dyn ToSql>> = Vec::new();
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
    sql.push_str(" ORDER BY created_at DESC LIMIT ?");
    bound.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let samples = stmt
        .query_map(
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            |row| {
                let blob: Vec<u8> = row.get(0)?;
                let sector: String = row.get(1)?;
                Ok((blob, sector))
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter_map(|(blob, sector)| {
            sector
                .parse::<Sector>()
                .ok()
                .map(|s| (blob_to_vec(&blob), s))
        })
        .collect();
    Ok(samples)
}

// -- Waypoints --------------------------------------------------------

/// Upsert a directed waypoint. Self-edges are rejected.
pub fn upsert_waypoint(conn: &Connection, waypoint: &Waypoint) -> Result<()> {
    if waypoint.src_id == waypoint.dst_id {
        return Err(MnemaError::InvalidInput(
            "waypoint endpoints must differ".to_string(),
        ));
    }
    conn.execute(
        "INSERT INTO waypoints (src_id, dst_id, tenant_id, weight, created_at, last_traversed_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(src_id, dst_id) DO UPDATE SET
            weight = excluded.weight,
            last_traversed_at = excluded.last_traversed_at",
        params![
            waypoint.src_id,
            waypoint.dst_id,
            waypoint.tenant_id,
            waypoint.weight.clamp(0.0, 1.0),
            waypoint.created_at.to_rfc3339(),
            waypoint.last_traversed_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn waypoint_from_row(row: &Row) -> rusqlite::Result<Waypoint> {
    let created_at: String = row.get("created_at")?;
    let last_traversed_at: String = row.get("last_traversed_at")?;
    Ok(Waypoint {
        src_id: row.get("src_id")?,
        dst_id: row.get("dst_id")?,
        tenant_id: row.get("tenant_id")?,
        weight: row.get("weight")?,
        created_at: parse_ts(&created_at),
        last_traversed_at: parse_ts(&last_traversed_at),
    })
}

/// Outgoing waypoints from a memory, strongest first
pub fn waypoints_from(conn: &Connection, src_id: &str, scope: &TenantScope) -> Result<Vec<Waypoint>> {
    let mut sql = "SELECT src_id, dst_id, tenant_id, weight, created_at, last_traversed_at
         FROM waypoints WHERE src_id = ?"
        .to_string();
    let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(src_id.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
    sql.push_str(" ORDER BY weight DESC, dst_id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let waypoints = stmt
        .query_map(
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            waypoint_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(waypoints)
}

/// Refresh traversal time for an edge
pub fn touch_waypoint(conn: &Connection, src_id: &str, dst_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE waypoints SET last_traversed_at = ? WHERE src_id = ? AND dst_id = ?",
        params![now.to_rfc3339(), src_id, dst_id],
    )?;
    Ok(())
}

/// Drop waypoints below the prune floor. Returns removed count.
pub fn prune_waypoints(conn: &Connection, floor: f64) -> Result<i64> {
    let removed = conn.execute("DELETE FROM waypoints WHERE weight < ?", params![floor])?;
    Ok(removed as i64)
}

// -- User profiles ----------------------------------------------------

/// Upsert a tenant profile. The tenant key for the system bucket is
/// the empty string (SQLite PK cannot be NULL).
pub fn save_user_profile(conn: &Connection, profile: &UserProfile) -> Result<()> {
    let key = profile.tenant_id.clone().unwrap_or_default();
    conn.execute(
        "INSERT INTO users (tenant_id, summary, reflection_count, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(tenant_id) DO UPDATE SET
            summary = excluded.summary,
            reflection_count = excluded.reflection_count,
            updated_at = excluded.updated_at",
        params![
            key,
            profile.summary,
            profile.reflection_count,
            profile.created_at.to_rfc3339(),
            profile.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_user_profile(conn: &Connection, tenant_id: &Option<String>) -> Result<Option<UserProfile>> {
    let key = tenant_id.clone().unwrap_or_default();
    let profile = conn
        .query_row(
            "SELECT tenant_id, summary, reflection_count, created_at, updated_at
             FROM users WHERE tenant_id = ?",
            params![key],
            |row| {
                let tenant: String = row.get(0)?;
                let created_at: String = row.get(3)?;
                let updated_at: String = row.get(4)?;
                Ok(UserProfile {
                    tenant_id: if tenant.is_empty() { None } else { Some(tenant) },
                    summary: row.get(1)?,
                    reflection_count: row.get(2)?,
                    created_at: parse_ts(&created_at),
                    updated_at: parse_ts(&updated_at),
                })
            },
        )
        .optional()?;
    Ok(profile)
}

/// Bump a tenant's reflection counter, creating the row if absent
pub fn increment_reflection_count(
    conn: &Connection,
    tenant_id: &Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let key = tenant_id.clone().unwrap_or_default();
    let now_str = now.to_rfc3339();
    conn.execute(
        "INSERT INTO users (tenant_id, summary, reflection_count, created_at, updated_at)
         VALUES (?, '', 1, ?, ?)
         ON CONFLICT(tenant_id) DO UPDATE SET
            reflection_count = reflection_count + 1,
            updated_at = excluded.updated_at",
        params![key, now_str, now_str],
    )?;
    Ok(())
}

// -- Classifier models ------------------------------------------------

pub fn save_classifier_model(conn: &Connection, model: &ClassifierModel) -> Result<()> {
    let key = model.tenant_id.clone().unwrap_or_default();
    conn.execute(
        "INSERT INTO classifier_models (tenant_id, weights_json, biases_json, version, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(tenant_id) DO UPDATE SET
            weights_json = excluded.weights_json,
            biases_json = excluded.biases_json,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![
            key,
            serde_json::to_string(&model.weights)?,
            serde_json::to_string(&model.biases)?,
            model.version,
            model.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_classifier_model(
    conn: &Connection,
    tenant_id: &Option<String>,
) -> Result<Option<ClassifierModel>> {
    let key = tenant_id.clone().unwrap_or_default();
    let model = conn
        .query_row(
            "SELECT tenant_id, weights_json, biases_json, version, updated_at
             FROM classifier_models WHERE tenant_id = ?",
            params![key],
            |row| {
                let tenant: String = row.get(0)?;
                let weights_json: String = row.get(1)?;
                let biases_json: String = row.get(2)?;
                let version: i64 = row.get(3)?;
                let updated_at: String = row.get(4)?;
                Ok((tenant, weights_json, biases_json, version, updated_at))
            },
        )
        .optional()?;

    match model {
        None => Ok(None),
        Some((tenant, weights_json, biases_json, version, updated_at)) => {
            Ok(Some(ClassifierModel {
                tenant_id: if tenant.is_empty() { None } else { Some(tenant) },
                weights: serde_json::from_str(&weights_json)?,
                biases: serde_json::from_str(&biases_json)?,
                version,
                updated_at: parse_ts(&updated_at),
            }))
        }
    }
}

// -- Encoder digest ---------------------------------------------------

pub fn load_encoder_digest(conn: &Connection) -> Result<Option<EncoderDigest>> {
    let digest = conn
        .query_row(
            "SELECT provider, model, dims FROM encoder_digest WHERE id = 1",
            [],
            |row| {
                Ok(EncoderDigest {
                    provider: row.get(0)?,
                    model: row.get(1)?,
                    dims: row.get::<_, i64>(2)? as usize,
                })
            },
        )
        .optional()?;
    Ok(digest)
}

pub fn store_encoder_digest(conn: &Connection, digest: &EncoderDigest) -> Result<()> {
    conn.execute(
        "INSERT INTO encoder_digest (id, provider, model, dims, updated_at)
         VALUES (1, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            provider = excluded.provider,
            model = excluded.model,
            dims = excluded.dims,
            updated_at = excluded.updated_at",
        params![
            digest.provider,
            digest.model,
            digest.dims as i64,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample_memory(id: &str, tenant: Option<&str>) -> Memory {
        let now = Utc::now();
        Memory {
            id: id.to_string(),
            tenant_id: tenant.map(String::from),
            content: "ciphertext".to_string(),
            primary_sector: Sector::Semantic,
            tags: vec!["pref".to_string()],
            metadata: MemoryMetadata::default(),
            segment: 3,
            simhash: 0xdeadbeefdeadbeef,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            salience: 0.5,
            decay_lambda: 0.01,
            version: 1,
            mean_vec: vec![0.5, 0.5, 0.5, 0.5],
            compressed_vec: None,
            coactivations: 0,
            feedback_score: 0.0,
            generated_summary: None,
        }
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let conn = test_conn();
        let memory = sample_memory("m1", Some("u1"));
        insert_memory(&conn, &memory).unwrap();

        let loaded = get_memory(&conn, "m1", &TenantScope::Id("u1".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, "m1");
        assert_eq!(loaded.simhash, 0xdeadbeefdeadbeef);
        assert_eq!(loaded.mean_vec, vec![0.5, 0.5, 0.5, 0.5]);
        assert_eq!(loaded.tags, vec!["pref".to_string()]);
    }

    #[test]
    fn test_tenant_isolation() {
        let conn = test_conn();
        insert_memory(&conn, &sample_memory("m1", Some("a"))).unwrap();

        assert!(get_memory(&conn, "m1", &TenantScope::Id("b".to_string()))
            .unwrap()
            .is_none());
        assert!(get_memory(&conn, "m1", &TenantScope::System).unwrap().is_none());
        assert!(get_memory(&conn, "m1", &TenantScope::Any).unwrap().is_some());
    }

    #[test]
    fn test_version_conflict() {
        let conn = test_conn();
        let mut memory = sample_memory("m1", None);
        insert_memory(&conn, &memory).unwrap();

        memory.version = 2;
        update_memory(&conn, &memory, 1).unwrap();

        // Stale expected version now conflicts
        memory.version = 3;
        let err = update_memory(&conn, &memory, 1).unwrap_err();
        assert!(matches!(err, MnemaError::Conflict { found: 2, .. }));
    }

    #[test]
    fn test_delete_cascades() {
        let conn = test_conn();
        insert_memory(&conn, &sample_memory("m1", Some("a"))).unwrap();
        insert_memory(&conn, &sample_memory("m2", Some("a"))).unwrap();

        let now = Utc::now();
        upsert_waypoint(
            &conn,
            &Waypoint {
                src_id: "m1".to_string(),
                dst_id: "m2".to_string(),
                tenant_id: Some("a".to_string()),
                weight: 0.8,
                created_at: now,
                last_traversed_at: now,
            },
        )
        .unwrap();

        assert!(delete_memory(&conn, "m1", &TenantScope::Id("a".to_string())).unwrap());

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM waypoints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_self_waypoint_rejected() {
        let conn = test_conn();
        let now = Utc::now();
        let err = upsert_waypoint(
            &conn,
            &Waypoint {
                src_id: "m1".to_string(),
                dst_id: "m1".to_string(),
                tenant_id: None,
                weight: 0.5,
                created_at: now,
                last_traversed_at: now,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MnemaError::InvalidInput(_)));
    }

    #[test]
    fn test_delete_all_counts() {
        let conn = test_conn();
        insert_memory(&conn, &sample_memory("m1", Some("a"))).unwrap();
        insert_memory(&conn, &sample_memory("m2", Some("a"))).unwrap();
        insert_memory(&conn, &sample_memory("m3", Some("b"))).unwrap();

        let removed = delete_all_memories(&conn, &TenantScope::Id("a".to_string())).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(count_memories(&conn, &TenantScope::Any).unwrap(), 1);

        let all = delete_all_memories(&conn, &TenantScope::Any).unwrap();
        assert_eq!(all, 1);
    }

    #[test]
    fn test_classifier_model_round_trip() {
        let conn = test_conn();
        let model = ClassifierModel {
            tenant_id: Some("u1".to_string()),
            weights: vec![vec![0.1, 0.2], vec![0.3, 0.4]],
            biases: vec![0.0, 0.1],
            version: 1,
            updated_at: Utc::now(),
        };
        save_classifier_model(&conn, &model).unwrap();

        let loaded = get_classifier_model(&conn, &Some("u1".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.weights, model.weights);
        assert_eq!(loaded.version, 1);
    }
}
