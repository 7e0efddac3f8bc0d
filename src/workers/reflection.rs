//! Reflection worker
//!
//! Clusters recent, similar memories per tenant and writes one
//! higher-order reflective memory per cluster. Source memories are
//! marked consolidated so they are never clustered twice. Synthesis
//! prefers the configured generator; the deterministic template is the
//! contract and always available.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::context::{SecurityContext, TenantScope};
use crate::crypto::CryptoBox;
use crate::error::Result;
use crate::generation::GeneratorCache;
use crate::hsg::HsgWriter;
use crate::scheduler::AbortSignal;
use crate::storage::{queries, stats, Storage};
use crate::text::{text_similarity, truncate_chars};
use crate::types::{
    CreateMemoryInput, MaintenanceKind, Memory, MemoryMetadata, Sector,
};

/// Memories fetched per tenant per pass
const SCAN_LIMIT: i64 = 100;
/// Token-set similarity required to join a cluster
const CLUSTER_SIMILARITY: f64 = 0.8;
/// Max snippet characters handed to the generator
const SYNTHESIS_MAX_CHARS: usize = 3000;
/// Recency time constant (12 hours, in milliseconds)
const RECENCY_TAU_MS: f64 = 43_200_000.0;

/// One cluster of similar memories awaiting synthesis
struct Cluster {
    sector: Sector,
    members: Vec<Memory>,
}

/// Periodic reflection worker
pub struct ReflectionWorker {
    storage: Storage,
    crypto: CryptoBox,
    writer: Arc<HsgWriter>,
    generators: Arc<GeneratorCache>,
    config: Arc<EngineConfig>,
}

impl ReflectionWorker {
    pub fn new(
        storage: Storage,
        crypto: CryptoBox,
        writer: Arc<HsgWriter>,
        generators: Arc<GeneratorCache>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            crypto,
            writer,
            generators,
            config,
        }
    }

    /// One reflection pass over every active tenant. Returns the
    /// number of reflective memories written.
    pub async fn run(&self, abort: &AbortSignal) -> Result<usize> {
        let tenants = self
            .storage
            .with_connection(queries::list_active_tenants)?;

        let mut total = 0usize;
        for tenant_id in tenants {
            abort.check("reflect")?;
            match self.reflect_tenant(&tenant_id, abort).await {
                Ok(count) => total += count,
                Err(e) => {
                    // A failing tenant never stops the pass
                    tracing::warn!(?tenant_id, "reflection failed for tenant: {}", e);
                }
            }
            tokio::task::yield_now().await;
        }

        if total > 0 {
            self.storage.with_connection(|conn| {
                stats::log_maintenance(conn, MaintenanceKind::Reflect, total as i64, Utc::now())
            })?;
        }
        Ok(total)
    }

    async fn reflect_tenant(
        &self,
        tenant_id: &Option<String>,
        abort: &AbortSignal,
    ) -> Result<usize> {
        let scope = match tenant_id {
            Some(id) => TenantScope::Id(id.clone()),
            None => TenantScope::System,
        };

        let memories = self
            .storage
            .with_connection(|conn| queries::list_recent(conn, &scope, SCAN_LIMIT))?;
        if memories.len() < self.config.reflect_min {
            return Ok(0);
        }

        // Plaintext lives only for the duration of the analysis
        let contents: Vec<String> = memories
            .iter()
            .map(|m| self.crypto.decrypt_lossy(&m.content))
            .collect();

        let clusters = build_clusters(&memories, &contents);
        let now = Utc::now();
        let mut written = 0usize;

        for cluster in clusters {
            abort.check("reflect")?;
            match self
                .consolidate_cluster(&cluster, &contents, &memories, tenant_id, now)
                .await
            {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(sector = %cluster.sector, "cluster skipped: {}", e);
                }
            }
            tokio::task::yield_now().await;
        }

        if written > 0 {
            self.storage.with_connection(|conn| {
                queries::increment_reflection_count(conn, tenant_id, now)
            })?;
        }
        Ok(written)
    }

    async fn consolidate_cluster(
        &self,
        cluster: &Cluster,
        contents: &[String],
        all: &[Memory],
        tenant_id: &Option<String>,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let count = cluster.members.len();
        let snippets: Vec<&str> = cluster
            .members
            .iter()
            .map(|member| {
                let idx = all.iter().position(|m| m.id == member.id).unwrap_or(0);
                contents[idx].as_str()
            })
            .collect();

        let insight = self.synthesize(tenant_id, cluster.sector, &snippets);
        let salience = reflective_salience(&cluster.members, now);
        let source_ids: Vec<String> = cluster.members.iter().map(|m| m.id.clone()).collect();

        let ctx = match tenant_id {
            Some(id) => SecurityContext::for_tenant(id.clone()),
            None => SecurityContext::system(),
        };

        let metadata = MemoryMetadata {
            kind: Some("auto_reflect".to_string()),
            sources: source_ids.clone(),
            frequency: Some(count as u32),
            at: Some(now.to_rfc3339()),
            ..Default::default()
        };

        let reflective = self
            .writer
            .add(
                &ctx,
                CreateMemoryInput {
                    content: insight,
                    tags: vec!["reflect:auto".to_string()],
                    metadata,
                    sector_hint: Some(Sector::Reflective),
                },
            )
            .await?;

        self.storage.with_connection(|conn| {
            queries::update_salience_batch(conn, &[(reflective.id.clone(), salience)], now)
        })?;

        // Mark sources consolidated, refresh recall, boost salience
        let scope = match tenant_id {
            Some(id) => TenantScope::Id(id.clone()),
            None => TenantScope::System,
        };
        for member in &cluster.members {
            let Some(mut source) = self
                .storage
                .with_connection(|conn| queries::get_memory(conn, &member.id, &scope))?
            else {
                continue;
            };
            let expected_version = source.version;
            source.metadata.consolidated = true;
            source.last_seen_at = now;
            source.updated_at = now;
            source.salience = (source.salience * 1.1).clamp(0.0, 1.0);
            source.version = expected_version + 1;
            self.storage.with_connection(|conn| {
                queries::update_memory(conn, &source, expected_version)
            })?;
        }

        tracing::debug!(
            sector = %cluster.sector,
            members = count,
            id = %reflective.id,
            "cluster consolidated into reflective memory"
        );
        Ok(())
    }

    /// Generator synthesis with the deterministic template as both the
    /// prompt scaffold and the fallback contract.
    fn synthesize(&self, tenant_id: &Option<String>, sector: Sector, snippets: &[&str]) -> String {
        let joined = truncate_chars(&snippets.join(" "), 200);
        let fallback = format!(
            "{} {} pattern detected: {}",
            snippets.len(),
            sector,
            joined
        );

        let Some(generator) = self.generators.get(tenant_id) else {
            return fallback;
        };

        let corpus = truncate_chars(&snippets.join("\n"), SYNTHESIS_MAX_CHARS);
        let prompt = format!(
            "These {} notes follow one {} pattern:\n{}\n\nReply with a 1-2 sentence insight beginning \"{} {} pattern detected:\"",
            snippets.len(),
            sector,
            corpus,
            snippets.len(),
            sector
        );

        match generator.generate(&prompt) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                tracing::debug!("generator synthesis failed, using template: {}", e);
                fallback
            }
        }
    }
}

/// Greedy same-sector clustering by canonical-token similarity.
/// Reflective and already-consolidated memories never seed or join.
fn build_clusters(memories: &[Memory], contents: &[String]) -> Vec<Cluster> {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut clusters = Vec::new();

    for i in 0..memories.len() {
        if visited.contains(&i) || !clusterable(&memories[i]) {
            continue;
        }

        let mut members = vec![memories[i].clone()];
        let mut member_indices = vec![i];
        for j in (i + 1)..memories.len() {
            if visited.contains(&j) || !clusterable(&memories[j]) {
                continue;
            }
            if memories[j].primary_sector != memories[i].primary_sector {
                continue;
            }
            if text_similarity(&contents[i], &contents[j]) > CLUSTER_SIMILARITY {
                members.push(memories[j].clone());
                member_indices.push(j);
            }
        }

        if members.len() >= 2 {
            for idx in member_indices {
                visited.insert(idx);
            }
            clusters.push(Cluster {
                sector: memories[i].primary_sector,
                members,
            });
        }
    }
    clusters
}

fn clusterable(memory: &Memory) -> bool {
    memory.primary_sector != Sector::Reflective && !memory.metadata.consolidated
}

/// Salience of a freshly synthesized reflective memory
fn reflective_salience(members: &[Memory], now: chrono::DateTime<Utc>) -> f64 {
    let count = members.len() as f64;
    let mean_recency: f64 = members
        .iter()
        .map(|m| {
            let age_ms = (now - m.created_at).num_milliseconds().max(0) as f64;
            (-age_ms / RECENCY_TAU_MS).exp()
        })
        .sum::<f64>()
        / count;
    let emotional = members.iter().any(|m| {
        m.primary_sector == Sector::Emotional
            || m.tags.iter().any(|t| t.starts_with("emotion"))
    });

    let emotional_bonus = if emotional { 0.1 } else { 0.0 };
    (0.6 * (count / 10.0) + 0.3 * mean_recency + emotional_bonus).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ModelCache;
    use crate::embedding::{SectorEncoder, SyntheticEncoder};
    use crate::events::EventBus;
    use tokio::sync::watch;

    fn abort_signal() -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        AbortSignal::from_receiver(rx)
    }

    fn test_worker(reflect_min: usize) -> (ReflectionWorker, Arc<HsgWriter>) {
        let storage = Storage::open_in_memory().unwrap();
        let crypto = CryptoBox::from_secret("test");
        let encoder: Arc<dyn SectorEncoder> = Arc::new(SyntheticEncoder::new(64));
        let mut config = EngineConfig::in_memory();
        config.reflect_min = reflect_min;
        let config = Arc::new(config);

        let writer = Arc::new(HsgWriter::new(
            storage.clone(),
            crypto.clone(),
            encoder,
            Arc::new(ModelCache::default()),
            EventBus::default(),
            config.clone(),
        ));
        let worker = ReflectionWorker::new(
            storage,
            crypto,
            writer.clone(),
            Arc::new(GeneratorCache::default()),
            config,
        );
        (worker, writer)
    }

    async fn seed(writer: &HsgWriter, ctx: &SecurityContext, content: &str, sector: Sector) {
        writer
            .add(
                ctx,
                CreateMemoryInput {
                    content: content.to_string(),
                    sector_hint: Some(sector),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_consolidates_near_duplicates() {
        let (worker, writer) = test_worker(3);
        let ctx = SecurityContext::for_tenant("u2");

        for suffix in ["", "", " again"] {
            seed(
                &writer,
                &ctx,
                &format!("restart the ingest service after deploys{}", suffix),
                Sector::Procedural,
            )
            .await;
        }

        let written = worker.run(&abort_signal()).await.unwrap();
        assert_eq!(written, 1);

        let scope = TenantScope::Id("u2".to_string());
        let all = worker
            .storage
            .with_connection(|conn| queries::list_recent(conn, &scope, 50))
            .unwrap();

        let reflective: Vec<&Memory> = all
            .iter()
            .filter(|m| m.primary_sector == Sector::Reflective)
            .collect();
        assert_eq!(reflective.len(), 1);
        assert_eq!(reflective[0].metadata.sources.len(), 3);
        assert_eq!(reflective[0].metadata.kind.as_deref(), Some("auto_reflect"));
        assert!(reflective[0].tags.contains(&"reflect:auto".to_string()));

        for source in all.iter().filter(|m| m.primary_sector == Sector::Procedural) {
            assert!(source.metadata.consolidated);
        }
    }

    #[tokio::test]
    async fn test_skips_below_reflect_min() {
        let (worker, writer) = test_worker(20);
        let ctx = SecurityContext::for_tenant("u2");
        for _ in 0..3 {
            seed(&writer, &ctx, "identical text", Sector::Semantic).await;
        }
        assert_eq!(worker.run(&abort_signal()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consolidated_memories_not_reclustered() {
        let (worker, writer) = test_worker(2);
        let ctx = SecurityContext::for_tenant("u2");
        for _ in 0..2 {
            seed(&writer, &ctx, "build cache before running suite", Sector::Procedural).await;
        }

        assert_eq!(worker.run(&abort_signal()).await.unwrap(), 1);
        // Second pass: sources are consolidated, the reflective memory
        // is excluded by sector, nothing new is written
        assert_eq!(worker.run(&abort_signal()).await.unwrap(), 0);
    }

    #[test]
    fn test_reflective_salience_formula() {
        let now = Utc::now();
        let member = |sector: Sector| Memory {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: None,
            content: String::new(),
            primary_sector: sector,
            tags: vec![],
            metadata: MemoryMetadata::default(),
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
        };

        // 2 fresh members, no emotional tag: 0.6*0.2 + 0.3*1.0 = 0.42
        let plain = reflective_salience(&[member(Sector::Semantic), member(Sector::Semantic)], now);
        assert!((plain - 0.42).abs() < 1e-6);

        // Emotional member adds 0.1
        let emotional =
            reflective_salience(&[member(Sector::Emotional), member(Sector::Semantic)], now);
        assert!((emotional - 0.52).abs() < 1e-6);

        // Large clusters clamp at 1
        let many: Vec<Memory> = (0..30).map(|_| member(Sector::Semantic)).collect();
        assert_eq!(reflective_salience(&many, now), 1.0);
    }

    #[test]
    fn test_template_synthesis_shape() {
        let (worker, _) = test_worker(2);
        let text = worker.synthesize(&None, Sector::Procedural, &["one", "two", "three"]);
        assert!(text.starts_with("3 procedural pattern detected:"));
    }
}
