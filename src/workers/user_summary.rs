//! User summary worker
//!
//! Regenerates the per-tenant profile from recent memories. A
//! configured generator gets a locally compressed digest and a short
//! prompt; otherwise a heuristic profile is assembled from memory
//! metadata. At most five tenants are summarized concurrently.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::context::TenantScope;
use crate::crypto::CryptoBox;
use crate::error::Result;
use crate::generation::GeneratorCache;
use crate::scheduler::AbortSignal;
use crate::storage::{queries, stats, Storage};
use crate::text::{extractive_summary, truncate_chars};
use crate::types::{MaintenanceKind, Memory, UserProfile};

/// Memories scanned per tenant
const SCAN_LIMIT: i64 = 50;
/// Tenants summarized concurrently
const MAX_IN_FLIGHT: usize = 5;

/// Periodic per-tenant profile synthesis
pub struct UserSummaryWorker {
    storage: Storage,
    crypto: CryptoBox,
    generators: Arc<GeneratorCache>,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
}

impl UserSummaryWorker {
    pub fn new(
        storage: Storage,
        crypto: CryptoBox,
        generators: Arc<GeneratorCache>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            crypto,
            generators,
            config,
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
        }
    }

    /// One pass over every active tenant. Returns profiles written.
    pub async fn run(&self, abort: &AbortSignal) -> Result<usize> {
        let tenants = self.storage.with_connection(queries::list_active_tenants)?;

        let mut handles = Vec::new();
        for tenant_id in tenants {
            abort.check("user_summary")?;

            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| crate::error::MnemaError::Internal("semaphore closed".to_string()))?;
            let storage = self.storage.clone();
            let crypto = self.crypto.clone();
            let generators = self.generators.clone();
            let layers = self.config.summary_layers as usize;

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                summarize_tenant(&storage, &crypto, &generators, layers, &tenant_id)
            }));
        }

        let mut written = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(true)) => written += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => tracing::warn!("user summary failed: {}", e),
                Err(e) => tracing::warn!("user summary task panicked: {}", e),
            }
        }

        if written > 0 {
            self.storage.with_connection(|conn| {
                stats::log_maintenance(conn, MaintenanceKind::Summary, written as i64, Utc::now())
            })?;
        }
        Ok(written)
    }
}

fn summarize_tenant(
    storage: &Storage,
    crypto: &CryptoBox,
    generators: &GeneratorCache,
    layers: usize,
    tenant_id: &Option<String>,
) -> Result<bool> {
    let scope = match tenant_id {
        Some(id) => TenantScope::Id(id.clone()),
        None => TenantScope::System,
    };

    let memories = storage.with_connection(|conn| queries::list_recent(conn, &scope, SCAN_LIMIT))?;
    if memories.is_empty() {
        return Ok(false);
    }

    let summary = match generators.get(tenant_id) {
        Some(generator) => {
            // Compress locally before spending generator tokens
            let contents: Vec<String> = memories
                .iter()
                .map(|m| crypto.decrypt_lossy(&m.content))
                .collect();
            let digest = extractive_summary(&contents.join(" "), layers.max(2) * 3, 1500);
            let prompt = format!(
                "Recent activity digest:\n{}\n\nWrite a 2-3 sentence professional profile of this user.",
                digest
            );
            match generator.generate(&prompt) {
                Ok(text) if !text.trim().is_empty() => truncate_chars(text.trim(), 600),
                _ => heuristic_profile(&memories),
            }
        }
        None => heuristic_profile(&memories),
    };

    let now = Utc::now();
    let existing = storage.with_connection(|conn| queries::get_user_profile(conn, tenant_id))?;
    let profile = UserProfile {
        tenant_id: tenant_id.clone(),
        summary,
        reflection_count: existing.as_ref().map(|p| p.reflection_count).unwrap_or(0),
        created_at: existing.map(|p| p.created_at).unwrap_or(now),
        updated_at: now,
    };
    storage.with_connection(|conn| queries::save_user_profile(conn, &profile))?;
    Ok(true)
}

/// Deterministic profile from memory metadata: projects, languages
/// (from file extensions), files and event counts.
fn heuristic_profile(memories: &[Memory]) -> String {
    let mut projects: BTreeSet<String> = BTreeSet::new();
    let mut files: BTreeSet<String> = BTreeSet::new();
    let mut languages: BTreeSet<String> = BTreeSet::new();
    let mut events: BTreeMap<String, usize> = BTreeMap::new();
    let mut sectors: BTreeMap<&'static str, usize> = BTreeMap::new();

    for memory in memories {
        if let Some(project) = &memory.metadata.ide_project_name {
            projects.insert(project.clone());
        }
        if let Some(path) = &memory.metadata.ide_file_path {
            if let Some(name) = path.rsplit('/').next() {
                files.insert(name.to_string());
            }
            if let Some(ext) = path.rsplit('.').next().filter(|e| e.len() <= 4) {
                if let Some(lang) = language_for(ext) {
                    languages.insert(lang.to_string());
                }
            }
        }
        if let Some(event) = &memory.metadata.ide_event_type {
            *events.entry(event.clone()).or_insert(0) += 1;
        }
        *sectors.entry(memory.primary_sector.as_str()).or_insert(0) += 1;
    }

    let mut parts: Vec<String> = Vec::new();
    if !projects.is_empty() {
        parts.push(format!(
            "Works on {}",
            projects.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !languages.is_empty() {
        parts.push(format!(
            "uses {}",
            languages.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !files.is_empty() {
        parts.push(format!("recently touched {} files", files.len()));
    }
    if !events.is_empty() {
        let total: usize = events.values().sum();
        parts.push(format!("{} editor events", total));
    }
    if parts.is_empty() {
        let dominant = sectors
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(sector, _)| *sector)
            .unwrap_or("semantic");
        parts.push(format!(
            "{} stored memories, mostly {}",
            memories.len(),
            dominant
        ));
    }

    let mut profile = parts.join("; ");
    profile.push('.');
    profile
}

fn language_for(ext: &str) -> Option<&'static str> {
    match ext {
        "rs" => Some("Rust"),
        "ts" | "tsx" => Some("TypeScript"),
        "js" | "jsx" => Some("JavaScript"),
        "py" => Some("Python"),
        "go" => Some("Go"),
        "java" => Some("Java"),
        "rb" => Some("Ruby"),
        "c" | "h" => Some("C"),
        "cpp" | "cc" | "hpp" => Some("C++"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryMetadata, Sector};
    use tokio::sync::watch;

    fn abort_signal() -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        AbortSignal::from_receiver(rx)
    }

    fn memory_with(metadata: MemoryMetadata, tenant: Option<&str>) -> Memory {
        let now = Utc::now();
        Memory {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.map(String::from),
            content: String::new(),
            primary_sector: Sector::Contextual,
            tags: vec![],
            metadata,
            segment: 0,
            simhash: 0,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            salience: 0.5,
            decay_lambda: 0.01,
            version: 1,
            mean_vec: vec![],
            compressed_vec: None,
            coactivations: 0,
            feedback_score: 0.0,
            generated_summary: None,
        }
    }

    #[test]
    fn test_heuristic_profile_from_ide_metadata() {
        let memories = vec![
            memory_with(
                MemoryMetadata {
                    ide_project_name: Some("mnema".to_string()),
                    ide_file_path: Some("src/engine.rs".to_string()),
                    ide_event_type: Some("save".to_string()),
                    ..Default::default()
                },
                Some("u1"),
            ),
            memory_with(
                MemoryMetadata {
                    ide_file_path: Some("web/app.tsx".to_string()),
                    ide_event_type: Some("open".to_string()),
                    ..Default::default()
                },
                Some("u1"),
            ),
        ];

        let profile = heuristic_profile(&memories);
        assert!(profile.contains("mnema"));
        assert!(profile.contains("Rust"));
        assert!(profile.contains("TypeScript"));
        assert!(profile.contains("2 editor events"));
    }

    #[test]
    fn test_heuristic_profile_without_metadata() {
        let memories = vec![memory_with(MemoryMetadata::default(), Some("u1"))];
        let profile = heuristic_profile(&memories);
        assert!(profile.contains("1 stored memories"));
    }

    #[tokio::test]
    async fn test_run_writes_profile_row() {
        let storage = Storage::open_in_memory().unwrap();
        let crypto = CryptoBox::from_secret("test");

        let memory = {
            let mut m = memory_with(MemoryMetadata::default(), Some("u1"));
            m.content = crypto.encrypt("knows about storage engines").unwrap();
            m
        };
        storage
            .with_connection(|conn| queries::insert_memory(conn, &memory))
            .unwrap();

        let worker = UserSummaryWorker::new(
            storage.clone(),
            crypto,
            Arc::new(GeneratorCache::default()),
            Arc::new(EngineConfig::in_memory()),
        );
        let written = worker.run(&abort_signal()).await.unwrap();
        assert_eq!(written, 1);

        let profile = storage
            .with_connection(|conn| queries::get_user_profile(conn, &Some("u1".to_string())))
            .unwrap()
            .unwrap();
        assert!(!profile.summary.is_empty());
    }
}
