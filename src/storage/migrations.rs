//! Database migrations for Mnema

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Memory rows. Content is ciphertext; tenant NULL is the
        -- system/global bucket.
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            tenant_id TEXT,
            content_encrypted TEXT NOT NULL,
            primary_sector TEXT NOT NULL DEFAULT 'semantic',
            tags_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            segment INTEGER NOT NULL DEFAULT 0,
            simhash INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            salience REAL NOT NULL DEFAULT 0.5,
            decay_lambda REAL NOT NULL DEFAULT 0.01,
            version INTEGER NOT NULL DEFAULT 1,
            mean_dim INTEGER NOT NULL DEFAULT 0,
            mean_vec BLOB,
            compressed_vec BLOB,
            coactivations INTEGER NOT NULL DEFAULT 0,
            feedback_score REAL NOT NULL DEFAULT 0.0,
            generated_summary TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_memories_tenant ON memories(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_memories_sector ON memories(primary_sector);
        CREATE INDEX IF NOT EXISTS idx_memories_segment ON memories(segment);
        CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

        -- One vector per (memory, sector-or-cold, tenant)
        CREATE TABLE IF NOT EXISTS sector_vectors (
            mem_id TEXT NOT NULL,
            sector TEXT NOT NULL,
            tenant_id TEXT,
            vector_blob BLOB NOT NULL,
            dim INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (mem_id, sector)
        );

        CREATE INDEX IF NOT EXISTS idx_vectors_sector ON sector_vectors(sector, tenant_id);

        -- Directed associative edges, per tenant
        CREATE TABLE IF NOT EXISTS waypoints (
            src_id TEXT NOT NULL,
            dst_id TEXT NOT NULL,
            tenant_id TEXT,
            weight REAL NOT NULL,
            created_at TEXT NOT NULL,
            last_traversed_at TEXT NOT NULL,
            PRIMARY KEY (src_id, dst_id)
        );

        CREATE INDEX IF NOT EXISTS idx_waypoints_src ON waypoints(src_id);
        CREATE INDEX IF NOT EXISTS idx_waypoints_dst ON waypoints(dst_id);

        -- Temporal triples; the current fact has valid_to NULL
        CREATE TABLE IF NOT EXISTS facts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT,
            subject TEXT NOT NULL,
            predicate TEXT NOT NULL,
            object TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            confidence REAL NOT NULL DEFAULT 1.0,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_facts_subject ON facts(tenant_id, subject, predicate);

        CREATE TABLE IF NOT EXISTS temporal_edges (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            weight REAL NOT NULL DEFAULT 1.0,
            tenant_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_edges_source ON temporal_edges(source_id);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON temporal_edges(target_id);

        -- Per-tenant synthesized profiles
        CREATE TABLE IF NOT EXISTS users (
            tenant_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL DEFAULT '',
            reflection_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Per-tenant linear classifier weights
        CREATE TABLE IF NOT EXISTS classifier_models (
            tenant_id TEXT PRIMARY KEY,
            weights_json TEXT NOT NULL,
            biases_json TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );

        -- Append-only maintenance counters
        CREATE TABLE IF NOT EXISTS stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            ts TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_stats_type ON stats(type, ts);
        "#,
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    Ok(())
}

/// v2: encoder digest recorded for the compatibility check
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS encoder_digest (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}
