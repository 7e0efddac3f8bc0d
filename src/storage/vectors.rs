//! Sector vector persistence and kNN
//!
//! Vectors live in the `sector_vectors` table as little-endian f32
//! blobs, keyed by (memory, sector-or-cold, tenant). Retrieval is a
//! flat cosine scan, descending score, ties broken by ascending memory
//! id for determinism.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use super::queries::push_tenant_filter;
use crate::context::TenantScope;
use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::types::{MemoryId, SectorKey, SectorVector, TenantId};

/// Encode an f32 slice as a little-endian blob
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for value in vec {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian blob back to f32s
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// One kNN hit
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub memory_id: MemoryId,
    pub score: f32,
}

/// Vector store over the shared SQLite connection
pub struct VectorStore;

impl VectorStore {
    /// Fetch one entry
    pub fn get(
        conn: &Connection,
        mem_id: &str,
        sector: SectorKey,
        scope: &TenantScope,
    ) -> Result<Option<SectorVector>> {
        let mut sql = "SELECT mem_id, sector, tenant_id, vector_blob, dim, updated_at
             FROM sector_vectors WHERE mem_id = ? AND sector = ?"
            .to_string();
        let mut bound: Vec<Box<dyn ToSql>> =
            vec![Box::new(mem_id.to_string()), Box::new(sector.as_string())];
        push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

        let entry = conn
            .query_row(
                &sql,
                rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
                Self::entry_from_row,
            )
            .optional()?;
        Ok(entry.flatten())
    }

    /// All sector entries for one memory
    pub fn get_by_memory(
        conn: &Connection,
        mem_id: &str,
        scope: &TenantScope,
    ) -> Result<Vec<SectorVector>> {
        let mut sql = "SELECT mem_id, sector, tenant_id, vector_blob, dim, updated_at
             FROM sector_vectors WHERE mem_id = ?"
            .to_string();
        let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(mem_id.to_string())];
        push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
        sql.push_str(" ORDER BY sector ASC");

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(
                rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
                Self::entry_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        Ok(entries)
    }

    /// Upsert one entry
    pub fn store(
        conn: &Connection,
        mem_id: &str,
        sector: SectorKey,
        vector: &[f32],
        tenant_id: &TenantId,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO sector_vectors (mem_id, sector, tenant_id, vector_blob, dim, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(mem_id, sector) DO UPDATE SET
                vector_blob = excluded.vector_blob,
                dim = excluded.dim,
                tenant_id = excluded.tenant_id,
                updated_at = excluded.updated_at",
            params![
                mem_id,
                sector.as_string(),
                tenant_id,
                vec_to_blob(vector),
                vector.len() as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete one entry
    pub fn delete(conn: &Connection, mem_id: &str, sector: SectorKey) -> Result<()> {
        conn.execute(
            "DELETE FROM sector_vectors WHERE mem_id = ? AND sector = ?",
            params![mem_id, sector.as_string()],
        )?;
        Ok(())
    }

    /// Delete every entry for a memory
    pub fn delete_all(conn: &Connection, mem_id: &str) -> Result<()> {
        conn.execute("DELETE FROM sector_vectors WHERE mem_id = ?", params![mem_id])?;
        Ok(())
    }

    /// Flat-scan kNN within one sector and tenant scope.
    ///
    /// Results are descending by cosine, ties by ascending memory id.
    /// `k = 0` returns an empty list.
    pub fn knn(
        conn: &Connection,
        query: &[f32],
        sector: SectorKey,
        scope: &TenantScope,
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = "SELECT mem_id, vector_blob FROM sector_vectors WHERE sector = ?".to_string();
        let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(sector.as_string())];
        push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

        let mut stmt = conn.prepare(&sql)?;
        let mut hits: Vec<VectorHit> = stmt
            .query_map(
                rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
                |row| {
                    let mem_id: String = row.get(0)?;
                    let blob: Vec<u8> = row.get(1)?;
                    Ok((mem_id, blob))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(memory_id, blob)| {
                let vector = blob_to_vec(&blob);
                VectorHit {
                    memory_id,
                    score: cosine_similarity(query, &vector),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Every entry stored under one sector key within a scope
    pub fn list_sector(
        conn: &Connection,
        sector: SectorKey,
        scope: &TenantScope,
    ) -> Result<Vec<SectorVector>> {
        let mut sql = "SELECT mem_id, sector, tenant_id, vector_blob, dim, updated_at
             FROM sector_vectors WHERE sector = ?"
            .to_string();
        let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(sector.as_string())];
        push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
        sql.push_str(" ORDER BY mem_id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(
                rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
                Self::entry_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        Ok(entries)
    }

    fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<Option<SectorVector>> {
        let mem_id: String = row.get(0)?;
        let sector_str: String = row.get(1)?;
        let tenant_id: Option<String> = row.get(2)?;
        let blob: Vec<u8> = row.get(3)?;
        let dim: i64 = row.get(4)?;
        let updated_at: String = row.get(5)?;

        Ok(SectorKey::parse(&sector_str).map(|sector| SectorVector {
            memory_id: mem_id,
            sector,
            tenant_id,
            vector: blob_to_vec(&blob),
            dim: dim as usize,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }
}
