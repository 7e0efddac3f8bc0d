//! HSG write path
//!
//! The writer is the only mutator that touches both memory rows and
//! sector vectors. Row insert, vector stores and waypoint opening run
//! inside one table-store transaction, so a row is never left without
//! its primary vector. Per-memory writes are serialized by an id lock
//! and versions increase strictly via a compare-and-set update.

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;

use crate::classifier::{self, ModelCache};
use crate::config::EngineConfig;
use crate::context::{SecurityContext, TenantScope};
use crate::crypto::CryptoBox;
use crate::dynamics::WAYPOINT_WRITE_FLOOR;
use crate::embedding::{fingerprint_vector, l2_normalize, simhash64, SectorEncoder};
use crate::error::{MnemaError, Result};
use crate::events::{Event, EventBus};
use crate::storage::queries;
use crate::storage::{Storage, VectorStore};
use crate::types::{
    CreateMemoryInput, Memory, MemoryId, Sector, SectorKey, UpdateMemoryInput, Waypoint,
};

use super::router::SectorRouter;

/// Default reinforcement boost
pub const DEFAULT_BOOST: f64 = 0.1;

/// Memory writer
pub struct HsgWriter {
    storage: Storage,
    crypto: CryptoBox,
    encoder: Arc<dyn SectorEncoder>,
    router: SectorRouter,
    models: Arc<ModelCache>,
    events: EventBus,
    config: Arc<EngineConfig>,
    locks: DashMap<MemoryId, Arc<tokio::sync::Mutex<()>>>,
}

impl HsgWriter {
    pub fn new(
        storage: Storage,
        crypto: CryptoBox,
        encoder: Arc<dyn SectorEncoder>,
        models: Arc<ModelCache>,
        events: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            crypto,
            encoder,
            router: SectorRouter,
            models,
            events,
            config,
            locks: DashMap::new(),
        }
    }

    /// Shared storage handle for collaborating components
    pub(crate) fn storage_handle(&self) -> Storage {
        self.storage.clone()
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// A write requires a concrete tenant bucket
    fn write_scope(&self, ctx: &SecurityContext) -> Result<TenantScope> {
        let scope = ctx.effective_tenant(None)?;
        if scope == TenantScope::Any {
            return Err(MnemaError::InvalidInput(
                "writes must address a concrete tenant".to_string(),
            ));
        }
        Ok(scope)
    }

    /// Embed text into a sector, degrading to the deterministic
    /// fingerprint when the provider is down.
    fn embed_or_fingerprint(&self, text: &str, sector: Sector) -> Vec<f32> {
        match self.encoder.embed(text, sector) {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(sector = %sector, "encoder failed, storing fingerprint: {}", e);
                fingerprint_vector(text)
            }
        }
    }

    /// Classifier prediction for routing, when a model exists
    fn predict_sector(&self, content: &str, tenant_id: &Option<String>) -> Option<classifier::Prediction> {
        let model = match self.models.get(tenant_id) {
            Some(model) => model,
            None => {
                let loaded = self
                    .storage
                    .with_connection(|conn| queries::get_classifier_model(conn, tenant_id))
                    .ok()
                    .flatten()?;
                self.models.put(loaded.clone());
                Arc::new(loaded)
            }
        };
        let anchor = self.encoder.embed(content, Sector::Semantic).ok()?;
        classifier::predict(&model, &anchor)
    }

    /// Create a memory: route, embed, persist row + vectors, open
    /// waypoints to the nearest neighbors in the primary sector.
    pub async fn add(&self, ctx: &SecurityContext, input: CreateMemoryInput) -> Result<Memory> {
        let scope = self.write_scope(ctx)?;
        let tenant_id = scope.stored().flatten();

        let content = input.content.trim();
        if content.is_empty() {
            return Err(MnemaError::InvalidInput("content must not be empty".to_string()));
        }

        let routing = match input.sector_hint {
            Some(primary) => super::router::Routing {
                primary,
                secondary: Vec::new(),
            },
            None => {
                let prediction = self.predict_sector(content, &tenant_id);
                self.router.route(content, prediction)
            }
        };

        let mut vectors: Vec<(SectorKey, Vec<f32>)> = Vec::new();
        vectors.push((
            SectorKey::live(routing.primary),
            self.embed_or_fingerprint(content, routing.primary),
        ));
        for sector in &routing.secondary {
            vectors.push((
                SectorKey::live(*sector),
                self.embed_or_fingerprint(content, *sector),
            ));
        }

        let mean_vec = mean_anchor(&vectors).unwrap_or_else(|| fingerprint_vector(content));
        let now = Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            content: self.crypto.encrypt(content)?,
            primary_sector: routing.primary,
            tags: input.tags,
            metadata: input.metadata,
            segment: rand::thread_rng().gen_range(0..self.config.cache_segments),
            simhash: simhash64(content),
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            salience: 0.5,
            decay_lambda: routing.primary.default_decay_lambda(),
            version: 1,
            mean_vec,
            compressed_vec: None,
            coactivations: 0,
            feedback_score: 0.0,
            generated_summary: None,
        };

        let waypoint_k = self.config.waypoint_k;
        let primary_key = SectorKey::live(routing.primary);
        let primary_vec = vectors[0].1.clone();
        let memory_for_tx = memory.clone();
        let tenant_for_tx = tenant_id.clone();
        let scope_for_tx = scope.clone();

        // Row, vectors and waypoints commit or roll back together; the
        // row cannot outlive a failed vector store.
        self.storage.with_transaction(move |conn| {
            queries::insert_memory(conn, &memory_for_tx)?;

            // Neighbors are searched before this memory's own vectors land
            let neighbors = VectorStore::knn(
                conn,
                &primary_vec,
                primary_key,
                &scope_for_tx,
                waypoint_k,
            )?;

            for (key, vector) in &vectors {
                VectorStore::store(conn, &memory_for_tx.id, *key, vector, &tenant_for_tx)?;
            }

            for hit in neighbors {
                let weight = hit.score as f64;
                if weight < WAYPOINT_WRITE_FLOOR {
                    continue;
                }
                queries::upsert_waypoint(
                    conn,
                    &Waypoint {
                        src_id: memory_for_tx.id.clone(),
                        dst_id: hit.memory_id,
                        tenant_id: tenant_for_tx.clone(),
                        weight,
                        created_at: memory_for_tx.created_at,
                        last_traversed_at: memory_for_tx.created_at,
                    },
                )?;
            }
            Ok(())
        })?;

        self.events.emit(Event::memory_added(&memory.id, tenant_id));
        tracing::debug!(id = %memory.id, sector = %memory.primary_sector, "memory added");
        Ok(memory)
    }

    /// Update content, tags or metadata. Content changes re-encrypt,
    /// re-hash and re-embed every stored sector; the version bump is a
    /// compare-and-set so concurrent updates on the same id linearize.
    pub async fn update(
        &self,
        ctx: &SecurityContext,
        id: &str,
        input: UpdateMemoryInput,
    ) -> Result<Memory> {
        let scope = self.write_scope(ctx)?;
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut memory = self
            .storage
            .with_connection(|conn| queries::get_memory(conn, id, &scope))?
            .ok_or_else(|| MnemaError::NotFound(id.to_string()))?;

        let expected_version = memory.version;
        let now = Utc::now();

        if let Some(tags) = input.tags {
            memory.tags = tags;
        }
        if let Some(metadata) = input.metadata {
            memory.metadata = metadata;
        }

        let mut new_vectors: Vec<(SectorKey, Vec<f32>)> = Vec::new();
        let mut drop_cold = false;
        if let Some(content) = input.content.as_deref() {
            let content = content.trim();
            if content.is_empty() {
                return Err(MnemaError::InvalidInput("content must not be empty".to_string()));
            }
            let previous = self.crypto.decrypt_lossy(&memory.content);
            if previous != content {
                memory.content = self.crypto.encrypt(content)?;
                memory.simhash = simhash64(content);

                let stored = self
                    .storage
                    .with_connection(|conn| VectorStore::get_by_memory(conn, id, &scope))?;
                let mut sectors: Vec<Sector> =
                    stored.iter().map(|entry| entry.sector.sector).collect();
                if sectors.is_empty() {
                    sectors.push(memory.primary_sector);
                }
                sectors.sort_by_key(|s| s.index());
                sectors.dedup();

                for sector in sectors {
                    new_vectors.push((
                        SectorKey::live(sector),
                        self.embed_or_fingerprint(content, sector),
                    ));
                }
                // Fresh content supersedes any cold state
                drop_cold = stored.iter().any(|entry| entry.sector.cold);
                memory.compressed_vec = None;
                memory.generated_summary = None;
                if let Some(anchor) = mean_anchor(&new_vectors) {
                    memory.mean_vec = anchor;
                }
            }
        }

        memory.version = expected_version + 1;
        memory.updated_at = now;
        memory.last_seen_at = now;
        // Segment is assigned at insert and intentionally never changes

        let memory_for_tx = memory.clone();
        let tenant_for_tx = memory.tenant_id.clone();
        let id_owned = id.to_string();
        self.storage.with_transaction(move |conn| {
            queries::update_memory(conn, &memory_for_tx, expected_version)?;
            if drop_cold {
                for sector in Sector::all() {
                    VectorStore::delete(conn, &id_owned, SectorKey::cold(*sector))?;
                }
            }
            for (key, vector) in &new_vectors {
                VectorStore::store(conn, &id_owned, *key, vector, &tenant_for_tx)?;
            }
            Ok(())
        })?;

        self.events
            .emit(Event::memory_updated(&memory.id, memory.tenant_id.clone()));
        Ok(memory)
    }

    /// Boost salience and refresh `last_seen_at`
    pub async fn reinforce(&self, ctx: &SecurityContext, id: &str, boost: f64) -> Result<Memory> {
        let scope = self.write_scope(ctx)?;
        self.reinforce_scoped(&scope, id, boost).await
    }

    /// Reinforcement with a pre-resolved scope; also the query-hit hook
    pub(crate) async fn reinforce_scoped(
        &self,
        scope: &TenantScope,
        id: &str,
        boost: f64,
    ) -> Result<Memory> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut memory = self
            .storage
            .with_connection(|conn| queries::get_memory(conn, id, scope))?
            .ok_or_else(|| MnemaError::NotFound(id.to_string()))?;

        let expected_version = memory.version;
        memory.salience = crate::dynamics::reinforce(memory.salience, boost);
        memory.last_seen_at = Utc::now();
        memory.updated_at = memory.last_seen_at;
        memory.version = expected_version + 1;

        let memory_for_tx = memory.clone();
        self.storage
            .with_connection(move |conn| queries::update_memory(conn, &memory_for_tx, expected_version))?;
        Ok(memory)
    }

    /// Delete a memory, cascading to vectors, waypoints, facts, edges
    pub async fn delete(&self, ctx: &SecurityContext, id: &str) -> Result<bool> {
        let scope = self.write_scope(ctx)?;
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let memory = self
            .storage
            .with_connection(|conn| queries::get_memory(conn, id, &scope))?;
        let Some(memory) = memory else {
            return Ok(false);
        };

        let id_owned = id.to_string();
        let scope_owned = scope.clone();
        let removed = self
            .storage
            .with_transaction(move |conn| queries::delete_memory(conn, &id_owned, &scope_owned))?;

        if removed {
            self.locks.remove(id);
            self.events
                .emit(Event::memory_deleted(&memory.id, memory.tenant_id));
        }
        Ok(removed)
    }
}

/// Average the sector embeddings that share the dominant dimension
/// into one normalized anchor vector.
fn mean_anchor(vectors: &[(SectorKey, Vec<f32>)]) -> Option<Vec<f32>> {
    let dim = vectors.first().map(|(_, v)| v.len())?;
    let same_dim: Vec<&Vec<f32>> = vectors
        .iter()
        .filter(|(_, v)| v.len() == dim)
        .map(|(_, v)| v)
        .collect();
    if same_dim.is_empty() || dim == 0 {
        return None;
    }

    let mut mean = vec![0.0f32; dim];
    for vector in &same_dim {
        for (m, x) in mean.iter_mut().zip(vector.iter()) {
            *m += x;
        }
    }
    let n = same_dim.len() as f32;
    for m in &mut mean {
        *m /= n;
    }
    l2_normalize(&mut mean);
    Some(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::SyntheticEncoder;

    fn test_writer() -> HsgWriter {
        let config = Arc::new(EngineConfig::in_memory());
        HsgWriter::new(
            Storage::open_in_memory().unwrap(),
            CryptoBox::from_secret("test"),
            Arc::new(SyntheticEncoder::new(64)),
            Arc::new(ModelCache::default()),
            EventBus::default(),
            config,
        )
    }

    fn input(content: &str) -> CreateMemoryInput {
        CreateMemoryInput {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_creates_row_and_primary_vector() {
        let writer = test_writer();
        let ctx = SecurityContext::for_tenant("u1");

        let memory = writer.add(&ctx, input("I prefer dark theme")).await.unwrap();
        assert_eq!(memory.primary_sector, Sector::Semantic);
        assert_eq!(memory.version, 1);
        assert!(memory.segment < writer.config.cache_segments);

        let entries = writer
            .storage
            .with_connection(|conn| {
                VectorStore::get_by_memory(conn, &memory.id, &TenantScope::Id("u1".to_string()))
            })
            .unwrap();
        assert!(entries
            .iter()
            .any(|e| e.sector == SectorKey::live(Sector::Semantic)));
    }

    #[tokio::test]
    async fn test_add_rejects_empty_content() {
        let writer = test_writer();
        let ctx = SecurityContext::for_tenant("u1");
        assert!(matches!(
            writer.add(&ctx, input("   ")).await,
            Err(MnemaError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_add_opens_waypoints_to_similar_memories() {
        let writer = test_writer();
        let ctx = SecurityContext::for_tenant("u1");

        let first = writer
            .add(&ctx, input("rust compiler borrow checker errors"))
            .await
            .unwrap();
        let second = writer
            .add(&ctx, input("rust compiler borrow checker lifetimes"))
            .await
            .unwrap();

        let waypoints = writer
            .storage
            .with_connection(|conn| {
                queries::waypoints_from(conn, &second.id, &TenantScope::Id("u1".to_string()))
            })
            .unwrap();
        assert!(waypoints.iter().any(|w| w.dst_id == first.id));
        assert!(waypoints.iter().all(|w| w.weight >= WAYPOINT_WRITE_FLOOR));
    }

    #[tokio::test]
    async fn test_reinforce_bumps_version_and_clamps() {
        let writer = test_writer();
        let ctx = SecurityContext::for_tenant("u1");
        let memory = writer.add(&ctx, input("note")).await.unwrap();

        let boosted = writer.reinforce(&ctx, &memory.id, 0.2).await.unwrap();
        assert!((boosted.salience - 0.7).abs() < 1e-9);
        assert_eq!(boosted.version, 2);
        assert!(boosted.last_seen_at >= memory.last_seen_at);

        let maxed = writer.reinforce(&ctx, &memory.id, 0.9).await.unwrap();
        assert_eq!(maxed.salience, 1.0);
        assert_eq!(maxed.version, 3);
    }

    #[tokio::test]
    async fn test_update_reembeds_only_on_content_change() {
        let writer = test_writer();
        let ctx = SecurityContext::for_tenant("u1");
        let memory = writer.add(&ctx, input("original content")).await.unwrap();

        let before = writer
            .storage
            .with_connection(|conn| {
                VectorStore::get(
                    conn,
                    &memory.id,
                    SectorKey::live(Sector::Semantic),
                    &TenantScope::Any,
                )
            })
            .unwrap()
            .unwrap();

        // Tags-only update leaves vectors alone
        let updated = writer
            .update(
                &ctx,
                &memory.id,
                UpdateMemoryInput {
                    tags: Some(vec!["t".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let unchanged = writer
            .storage
            .with_connection(|conn| {
                VectorStore::get(
                    conn,
                    &memory.id,
                    SectorKey::live(Sector::Semantic),
                    &TenantScope::Any,
                )
            })
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.vector, before.vector);

        // Content update re-embeds
        let updated = writer
            .update(
                &ctx,
                &memory.id,
                UpdateMemoryInput {
                    content: Some("completely different words".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 3);

        let changed = writer
            .storage
            .with_connection(|conn| {
                VectorStore::get(
                    conn,
                    &memory.id,
                    SectorKey::live(Sector::Semantic),
                    &TenantScope::Any,
                )
            })
            .unwrap()
            .unwrap();
        assert_ne!(changed.vector, before.vector);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_reports() {
        let writer = test_writer();
        let ctx = SecurityContext::for_tenant("u1");
        let memory = writer.add(&ctx, input("to be removed")).await.unwrap();

        assert!(writer.delete(&ctx, &memory.id).await.unwrap());
        assert!(!writer.delete(&ctx, &memory.id).await.unwrap());

        let vectors = writer
            .storage
            .with_connection(|conn| VectorStore::get_by_memory(conn, &memory.id, &TenantScope::Any))
            .unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_tenant_cannot_touch_foreign_memory() {
        let writer = test_writer();
        let owner = SecurityContext::for_tenant("a");
        let intruder = SecurityContext::for_tenant("b");
        let memory = writer.add(&owner, input("private")).await.unwrap();

        assert!(matches!(
            writer.reinforce(&intruder, &memory.id, 0.1).await,
            Err(MnemaError::NotFound(_))
        ));
        assert!(!writer.delete(&intruder, &memory.id).await.unwrap());
    }

    #[test]
    fn test_mean_anchor_normalized() {
        let vectors = vec![
            (SectorKey::live(Sector::Semantic), vec![1.0, 0.0]),
            (SectorKey::live(Sector::Episodic), vec![0.0, 1.0]),
        ];
        let anchor = mean_anchor(&vectors).unwrap();
        let norm: f32 = anchor.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
