//! Temporal facts and typed edges
//!
//! A fact is a (subject, predicate, object) triple with a validity
//! window. For each (subject, predicate, tenant) at most one row has
//! `valid_to = NULL`; creating a new current fact closes its
//! predecessor in the same transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::collections::HashMap;

use super::queries::push_tenant_filter;
use crate::context::TenantScope;
use crate::error::Result;
use crate::types::{Fact, TemporalEdge, TenantId};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn fact_from_row(row: &Row) -> rusqlite::Result<Fact> {
    let valid_from: String = row.get("valid_from")?;
    let valid_to: Option<String> = row.get("valid_to")?;
    let metadata_json: String = row.get("metadata")?;
    Ok(Fact {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        subject: row.get("subject")?,
        predicate: row.get("predicate")?,
        object: row.get("object")?,
        valid_from: parse_ts(&valid_from),
        valid_to: valid_to.map(|s| parse_ts(&s)),
        confidence: row.get("confidence")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

/// Insert a fact as the new current row for its (subject, predicate),
/// closing any open predecessor at the new fact's `valid_from`.
pub fn insert_current_fact(conn: &Connection, fact: &Fact) -> Result<()> {
    conn.execute(
        "UPDATE facts SET valid_to = ?
         WHERE subject = ? AND predicate = ? AND valid_to IS NULL
           AND (tenant_id = ? OR (tenant_id IS NULL AND ? IS NULL))",
        params![
            fact.valid_from.to_rfc3339(),
            fact.subject,
            fact.predicate,
            fact.tenant_id,
            fact.tenant_id,
        ],
    )?;

    conn.execute(
        "INSERT INTO facts (id, tenant_id, subject, predicate, object, valid_from, valid_to, confidence, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            fact.id,
            fact.tenant_id,
            fact.subject,
            fact.predicate,
            fact.object,
            fact.valid_from.to_rfc3339(),
            fact.valid_to.map(|t| t.to_rfc3339()),
            fact.confidence.clamp(0.0, 1.0),
            serde_json::to_string(&fact.metadata)?,
        ],
    )?;
    Ok(())
}

/// The current fact for (subject, predicate) within a scope
pub fn current_fact(
    conn: &Connection,
    subject: &str,
    predicate: &str,
    scope: &TenantScope,
) -> Result<Option<Fact>> {
    let mut sql = "SELECT id, tenant_id, subject, predicate, object, valid_from, valid_to, confidence, metadata
         FROM facts WHERE subject = ? AND predicate = ? AND valid_to IS NULL"
        .to_string();
    let mut bound: Vec<Box<dyn ToSql>> =
        vec![Box::new(subject.to_string()), Box::new(predicate.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
    sql.push_str(" ORDER BY valid_from DESC LIMIT 1");

    let fact = conn
        .query_row(
            &sql,
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            fact_from_row,
        )
        .optional()?;
    Ok(fact)
}

/// Close a fact's validity window. Returns false when not found.
pub fn end_fact(conn: &Connection, id: &str, at: DateTime<Utc>, scope: &TenantScope) -> Result<bool> {
    let mut sql = "UPDATE facts SET valid_to = ? WHERE id = ? AND valid_to IS NULL".to_string();
    let mut bound: Vec<Box<dyn ToSql>> =
        vec![Box::new(at.to_rfc3339()), Box::new(id.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");

    let changed = conn.execute(
        &sql,
        rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
    )?;
    Ok(changed > 0)
}

/// History for (subject, predicate), newest first
pub fn fact_history(
    conn: &Connection,
    subject: &str,
    predicate: &str,
    scope: &TenantScope,
) -> Result<Vec<Fact>> {
    let mut sql = "SELECT id, tenant_id, subject, predicate, object, valid_from, valid_to, confidence, metadata
         FROM facts WHERE subject = ? AND predicate = ?"
        .to_string();
    let mut bound: Vec<Box<dyn ToSql>> =
        vec![Box::new(subject.to_string()), Box::new(predicate.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
    sql.push_str(" ORDER BY valid_from DESC");

    let mut stmt = conn.prepare(&sql)?;
    let facts = stmt
        .query_map(
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            fact_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(facts)
}

fn edge_from_row(row: &Row) -> rusqlite::Result<TemporalEdge> {
    let valid_from: String = row.get("valid_from")?;
    let valid_to: Option<String> = row.get("valid_to")?;
    let metadata_json: String = row.get("metadata")?;
    Ok(TemporalEdge {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relation_type: row.get("relation_type")?,
        valid_from: parse_ts(&valid_from),
        valid_to: valid_to.map(|s| parse_ts(&s)),
        weight: row.get("weight")?,
        tenant_id: row.get("tenant_id")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

/// Insert a typed temporal edge
pub fn insert_edge(conn: &Connection, edge: &TemporalEdge) -> Result<()> {
    conn.execute(
        "INSERT INTO temporal_edges (id, source_id, target_id, relation_type, valid_from, valid_to, weight, tenant_id, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            edge.id,
            edge.source_id,
            edge.target_id,
            edge.relation_type,
            edge.valid_from.to_rfc3339(),
            edge.valid_to.map(|t| t.to_rfc3339()),
            edge.weight,
            edge.tenant_id,
            serde_json::to_string(&edge.metadata)?,
        ],
    )?;
    Ok(())
}

/// Edges touching a node (either direction) within a scope
pub fn edges_for(conn: &Connection, node_id: &str, scope: &TenantScope) -> Result<Vec<TemporalEdge>> {
    let mut sql = "SELECT id, source_id, target_id, relation_type, valid_from, valid_to, weight, tenant_id, metadata
         FROM temporal_edges WHERE (source_id = ? OR target_id = ?)"
        .to_string();
    let mut bound: Vec<Box<dyn ToSql>> =
        vec![Box::new(node_id.to_string()), Box::new(node_id.to_string())];
    push_tenant_filter(&mut sql, &mut bound, scope, "tenant_id");
    sql.push_str(" ORDER BY valid_from DESC");

    let mut stmt = conn.prepare(&sql)?;
    let edges = stmt
        .query_map(
            rusqlite::params_from_iter(bound.iter().map(|p| p.as_ref())),
            edge_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Convenience constructor for a current fact
pub fn new_fact(
    tenant_id: TenantId,
    subject: &str,
    predicate: &str,
    object: &str,
    confidence: f64,
) -> Fact {
    Fact {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id,
        subject: subject.to_string(),
        predicate: predicate.to_string(),
        object: object.to_string(),
        valid_from: Utc::now(),
        valid_to: None,
        confidence,
        metadata: HashMap::new(),
    }
}
