//! Memory engine facade
//!
//! Owns the storage handles, crypto box, encoder, event bus and the
//! background maintenance schedule, and exposes the foreground API:
//! add/update/delete/reinforce/search, facts and edges, stats and the
//! administrative wipe. Foreground queries pass through an
//! active-query counter that gates the decay worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::classifier::ModelCache;
use crate::config::EngineConfig;
use crate::context::{SecurityContext, TenantScope};
use crate::crypto::CryptoBox;
use crate::embedding::{check_compatibility, create_encoder, SectorEncoder};
use crate::error::{MnemaError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::generation::{Generator, GeneratorCache};
use crate::hsg::{HsgQuery, HsgWriter};
use crate::scheduler::{Scheduler, TaskSpec};
use crate::storage::{self, queries, stats, Storage};
use crate::types::{
    CreateMemoryInput, EngineStats, Fact, Memory, SearchFilter, SearchMatch, TemporalEdge,
    UpdateMemoryInput, UserProfile,
};
use crate::workers::{
    run_waypoint_prune, DecayWorker, ReflectionWorker, TrainerWorker, UserSummaryWorker,
};

/// Default shutdown grace for in-flight maintenance
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Failed maintenance runs leave a `type=error` row so operators can
/// watch the failure rate without scraping logs
fn surface_failure(storage: &Storage, task: &'static str, error: &MnemaError) {
    tracing::warn!(task, "maintenance task failed: {}", error);
    let _ = storage.with_connection(|conn| {
        stats::log_maintenance(conn, crate::types::MaintenanceKind::Error, 1, Utc::now())
    });
}

struct ActiveQueryGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActiveQueryGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The memory engine
pub struct MemoryEngine {
    config: Arc<EngineConfig>,
    storage: Storage,
    crypto: CryptoBox,
    encoder: Arc<dyn SectorEncoder>,
    events: EventBus,
    models: Arc<ModelCache>,
    generators: Arc<GeneratorCache>,
    writer: Arc<HsgWriter>,
    query: HsgQuery,
    scheduler: Scheduler,
    active_queries: Arc<AtomicUsize>,
}

impl MemoryEngine {
    /// Open the engine over the configured database
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let storage = Storage::open(&config.db_path)?;
        let crypto = CryptoBox::from_secret(&config.secret);
        let encoder = create_encoder(&config)?;

        // Stored vectors are only comparable with the encoder that
        // produced them
        let digest = encoder.digest();
        storage.with_connection(|conn| {
            let stored = queries::load_encoder_digest(conn)?;
            check_compatibility(&digest, stored.as_ref());
            queries::store_encoder_digest(conn, &digest)
        })?;

        let events = EventBus::default();
        let models = Arc::new(ModelCache::default());
        let generators = Arc::new(GeneratorCache::default());

        let writer = Arc::new(HsgWriter::new(
            storage.clone(),
            crypto.clone(),
            encoder.clone(),
            models.clone(),
            events.clone(),
            config.clone(),
        ));
        let query = HsgQuery::new(
            storage.clone(),
            crypto.clone(),
            encoder.clone(),
            config.clone(),
            crate::dynamics::ResonanceMatrix::default(),
            writer.clone(),
        );

        Ok(Self {
            config,
            storage,
            crypto,
            encoder,
            events,
            models,
            generators,
            writer,
            query,
            scheduler: Scheduler::new(),
            active_queries: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// In-memory engine for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::in_memory())
    }

    /// Install an LLM generator used by reflection and user summaries
    pub fn set_generator(&self, generator: Option<Arc<dyn Generator>>) {
        self.generators.set_default(generator);
    }

    /// Invalidate a tenant's cached generator after a config change
    pub fn invalidate_generator(&self, tenant_id: &Option<String>) {
        self.generators.invalidate(tenant_id);
    }

    /// Register all periodic maintenance on the scheduler
    pub fn start_maintenance(&self) {
        let decay = Arc::new(DecayWorker::new(
            self.storage.clone(),
            self.crypto.clone(),
            self.config.clone(),
            self.active_queries.clone(),
        ));
        let decay_storage = self.storage.clone();
        self.scheduler.register(
            TaskSpec::new(
                "decay",
                Duration::from_secs(self.config.decay_interval_minutes * 60),
                move |abort| {
                    let decay = decay.clone();
                    let storage = decay_storage.clone();
                    async move {
                        decay.run(&abort).await.map(|_| ()).map_err(|e| {
                            surface_failure(&storage, "decay", &e);
                            e
                        })
                    }
                },
            )
            .with_timeout(Duration::from_secs(self.config.decay_interval_minutes * 30)),
        );

        if self.config.auto_reflect {
            let reflection = Arc::new(ReflectionWorker::new(
                self.storage.clone(),
                self.crypto.clone(),
                self.writer.clone(),
                self.generators.clone(),
                self.config.clone(),
            ));
            let reflect_storage = self.storage.clone();
            self.scheduler.register(TaskSpec::new(
                "reflect",
                Duration::from_secs(self.config.reflect_interval_minutes * 60),
                move |abort| {
                    let reflection = reflection.clone();
                    let storage = reflect_storage.clone();
                    async move {
                        reflection.run(&abort).await.map(|_| ()).map_err(|e| {
                            surface_failure(&storage, "reflect", &e);
                            e
                        })
                    }
                },
            ));
        }

        let summaries = Arc::new(UserSummaryWorker::new(
            self.storage.clone(),
            self.crypto.clone(),
            self.generators.clone(),
            self.config.clone(),
        ));
        let summary_storage = self.storage.clone();
        self.scheduler.register(TaskSpec::new(
            "user_summary",
            Duration::from_secs(self.config.user_summary_interval_minutes * 60),
            move |abort| {
                let summaries = summaries.clone();
                let storage = summary_storage.clone();
                async move {
                    summaries.run(&abort).await.map(|_| ()).map_err(|e| {
                        surface_failure(&storage, "user_summary", &e);
                        e
                    })
                }
            },
        ));

        let trainer = Arc::new(TrainerWorker::new(self.storage.clone(), self.models.clone()));
        let trainer_storage = self.storage.clone();
        self.scheduler.register(TaskSpec::new(
            "classifier_train",
            Duration::from_secs(self.config.classifier_train_interval_minutes * 60),
            move |abort| {
                let trainer = trainer.clone();
                let storage = trainer_storage.clone();
                async move {
                    trainer.run(&abort).await.map(|_| ()).map_err(|e| {
                        surface_failure(&storage, "classifier_train", &e);
                        e
                    })
                }
            },
        ));

        let prune_storage = self.storage.clone();
        self.scheduler.register(TaskSpec::new(
            "waypoint_prune",
            Duration::from_secs(7 * 24 * 3600),
            move |_abort| {
                let storage = prune_storage.clone();
                async move {
                    run_waypoint_prune(&storage).map(|_| ()).map_err(|e| {
                        surface_failure(&storage, "waypoint_prune", &e);
                        e
                    })
                }
            },
        ));

        tracing::info!(tasks = ?self.scheduler.task_names(), "maintenance scheduled");
    }

    /// Scheduler handle for task stats
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Subscribe to the event bus
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // -- Memory API ---------------------------------------------------

    pub async fn add(&self, ctx: &SecurityContext, input: CreateMemoryInput) -> Result<Memory> {
        self.writer.add(ctx, input).await
    }

    pub async fn update(
        &self,
        ctx: &SecurityContext,
        id: &str,
        input: UpdateMemoryInput,
    ) -> Result<Memory> {
        self.writer.update(ctx, id, input).await
    }

    pub async fn delete(&self, ctx: &SecurityContext, id: &str) -> Result<bool> {
        self.writer.delete(ctx, id).await
    }

    pub async fn reinforce(&self, ctx: &SecurityContext, id: &str, boost: f64) -> Result<Memory> {
        self.writer.reinforce(ctx, id, boost).await
    }

    /// Fetch a memory row (content stays encrypted)
    pub fn get(&self, ctx: &SecurityContext, id: &str) -> Result<Option<Memory>> {
        let scope = ctx.effective_tenant(None)?;
        self.storage
            .with_connection(|conn| queries::get_memory(conn, id, &scope))
    }

    /// Decrypted content of one memory
    pub fn content(&self, ctx: &SecurityContext, id: &str) -> Result<String> {
        let memory = self
            .get(ctx, id)?
            .ok_or_else(|| MnemaError::NotFound(id.to_string()))?;
        Ok(self.crypto.decrypt_lossy(&memory.content))
    }

    /// Most recent memories in scope
    pub fn list(&self, ctx: &SecurityContext, limit: i64) -> Result<Vec<Memory>> {
        let scope = ctx.effective_tenant(None)?;
        self.storage
            .with_connection(|conn| queries::list_recent(conn, &scope, limit))
    }

    /// Hybrid search, gated by the active-query counter
    pub async fn search(
        &self,
        ctx: &SecurityContext,
        query_text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchMatch>> {
        let active = self.active_queries.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveQueryGuard {
            counter: self.active_queries.clone(),
        };
        if active >= self.config.max_active {
            return Err(MnemaError::Unavailable {
                message: format!("{} queries already in flight", active),
                retryable: true,
            });
        }

        self.query.search(ctx, query_text, k, filter).await
    }

    /// Wipe all memories in scope; admins with the any-tenant scope
    /// wipe every tenant. Returns the number of memories removed.
    pub fn delete_all(&self, ctx: &SecurityContext) -> Result<i64> {
        let scope = ctx.effective_tenant(None)?;
        let removed = self
            .storage
            .with_transaction(|conn| queries::delete_all_memories(conn, &scope))?;
        tracing::info!(removed, "bulk delete completed");
        Ok(removed)
    }

    // -- Facts and edges ----------------------------------------------

    /// Record a new current fact, closing any open predecessor
    pub fn add_fact(
        &self,
        ctx: &SecurityContext,
        subject: &str,
        predicate: &str,
        object: &str,
        confidence: f64,
    ) -> Result<Fact> {
        let scope = ctx.effective_tenant(None)?;
        let tenant_id = match &scope {
            TenantScope::Id(id) => Some(id.clone()),
            TenantScope::System => None,
            TenantScope::Any => {
                return Err(MnemaError::InvalidInput(
                    "facts must address a concrete tenant".to_string(),
                ))
            }
        };

        let fact = storage::new_fact(tenant_id.clone(), subject, predicate, object, confidence);
        let fact_for_tx = fact.clone();
        self.storage
            .with_transaction(move |conn| storage::insert_current_fact(conn, &fact_for_tx))?;

        self.events.emit(Event::new(
            EventKind::TemporalFactCreated,
            tenant_id,
            Some(fact.id.clone()),
        ));
        Ok(fact)
    }

    /// The current fact for (subject, predicate)
    pub fn current_fact(
        &self,
        ctx: &SecurityContext,
        subject: &str,
        predicate: &str,
    ) -> Result<Option<Fact>> {
        let scope = ctx.effective_tenant(None)?;
        self.storage
            .with_connection(|conn| storage::current_fact(conn, subject, predicate, &scope))
    }

    /// Close a fact's validity window
    pub fn end_fact(&self, ctx: &SecurityContext, fact_id: &str) -> Result<bool> {
        let scope = ctx.effective_tenant(None)?;
        let ended = self
            .storage
            .with_connection(|conn| storage::end_fact(conn, fact_id, Utc::now(), &scope))?;
        if ended {
            self.events.emit(Event::new(
                EventKind::TemporalFactDeleted,
                scope.stored().flatten(),
                Some(fact_id.to_string()),
            ));
        }
        Ok(ended)
    }

    /// Create a typed temporal edge between two memories
    pub fn add_edge(
        &self,
        ctx: &SecurityContext,
        source_id: &str,
        target_id: &str,
        relation_type: &str,
        weight: f64,
    ) -> Result<TemporalEdge> {
        let scope = ctx.effective_tenant(None)?;
        let tenant_id = scope.stored().flatten();

        // Both endpoints must be visible in scope
        for id in [source_id, target_id] {
            if self
                .storage
                .with_connection(|conn| queries::get_memory(conn, id, &scope))?
                .is_none()
            {
                return Err(MnemaError::NotFound(id.to_string()));
            }
        }

        let edge = TemporalEdge {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relation_type: relation_type.to_string(),
            valid_from: Utc::now(),
            valid_to: None,
            weight,
            tenant_id: tenant_id.clone(),
            metadata: Default::default(),
        };
        let edge_for_tx = edge.clone();
        self.storage
            .with_connection(move |conn| storage::insert_edge(conn, &edge_for_tx))?;

        self.events.emit(Event::new(
            EventKind::TemporalEdgeCreated,
            tenant_id,
            Some(edge.id.clone()),
        ));
        Ok(edge)
    }

    /// Edges touching a memory or fact
    pub fn edges_for(&self, ctx: &SecurityContext, node_id: &str) -> Result<Vec<TemporalEdge>> {
        let scope = ctx.effective_tenant(None)?;
        self.storage
            .with_connection(|conn| storage::edges_for(conn, node_id, &scope))
    }

    // -- Introspection ------------------------------------------------

    /// Aggregate statistics for the caller's scope
    pub fn stats(&self, ctx: &SecurityContext) -> Result<EngineStats> {
        let scope = ctx.effective_tenant(None)?;
        self.storage
            .with_connection(|conn| stats::engine_stats(conn, &scope))
    }

    /// Synthesized tenant profile, when one exists
    pub fn profile(&self, ctx: &SecurityContext) -> Result<Option<UserProfile>> {
        let scope = ctx.effective_tenant(None)?;
        let tenant_id = match scope {
            TenantScope::Id(id) => Some(id),
            TenantScope::System => None,
            TenantScope::Any => {
                return Err(MnemaError::InvalidInput(
                    "profiles are per tenant".to_string(),
                ))
            }
        };
        self.storage
            .with_connection(|conn| queries::get_user_profile(conn, &tenant_id))
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared storage handle (also used by integration tests)
    pub fn storage_handle(&self) -> Storage {
        self.storage.clone()
    }

    /// Active encoder
    pub fn encoder_handle(&self) -> Arc<dyn SectorEncoder> {
        self.encoder.clone()
    }

    /// Run one reflection pass immediately, outside the schedule.
    /// Returns the number of reflective memories written.
    pub async fn run_reflection(&self) -> Result<usize> {
        let worker = ReflectionWorker::new(
            self.storage.clone(),
            self.crypto.clone(),
            self.writer.clone(),
            self.generators.clone(),
            self.config.clone(),
        );
        let (_tx, rx) = tokio::sync::watch::channel(false);
        worker
            .run(&crate::scheduler::AbortSignal::from_receiver(rx))
            .await
    }

    /// Run one decay pass immediately, outside the schedule
    pub async fn run_decay(&self) -> Result<crate::workers::DecayOutcome> {
        let worker = DecayWorker::new(
            self.storage.clone(),
            self.crypto.clone(),
            self.config.clone(),
            Arc::new(AtomicUsize::new(0)),
        );
        let (_tx, rx) = tokio::sync::watch::channel(false);
        worker
            .run(&crate::scheduler::AbortSignal::from_receiver(rx))
            .await
    }

    /// Stop maintenance, waiting up to the grace period
    pub async fn shutdown(&self) {
        self.scheduler.stop_all(SHUTDOWN_GRACE).await;
        if let Err(e) = self.storage.checkpoint() {
            tracing::debug!("wal checkpoint on shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(content: &str) -> CreateMemoryInput {
        CreateMemoryInput {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_search_round_trip() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        let ctx = SecurityContext::for_tenant("u1");

        let memory = engine.add(&ctx, input("I prefer dark theme")).await.unwrap();
        let matches = engine
            .search(&ctx, "user likes dark mode", 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(matches[0].id, memory.id);
        assert_eq!(engine.content(&ctx, &memory.id).unwrap(), "I prefer dark theme");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_admin_wipe_returns_count() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        engine
            .add(&SecurityContext::for_tenant("a"), input("one"))
            .await
            .unwrap();
        engine
            .add(&SecurityContext::for_tenant("b"), input("two"))
            .await
            .unwrap();

        let removed = engine.delete_all(&SecurityContext::admin()).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            engine.stats(&SecurityContext::admin()).unwrap().total_memories,
            0
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tenant_wipe_is_scoped() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        let a = SecurityContext::for_tenant("a");
        let b = SecurityContext::for_tenant("b");
        engine.add(&a, input("one")).await.unwrap();
        engine.add(&b, input("two")).await.unwrap();

        assert_eq!(engine.delete_all(&a).unwrap(), 1);
        assert_eq!(engine.stats(&SecurityContext::admin()).unwrap().total_memories, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fact_lifecycle_with_events() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        let ctx = SecurityContext::for_tenant("u1");
        let mut rx = engine.subscribe();

        let fact = engine
            .add_fact(&ctx, "user", "prefers_theme", "dark", 0.9)
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::TemporalFactCreated);

        let current = engine.current_fact(&ctx, "user", "prefers_theme").unwrap();
        assert_eq!(current.unwrap().object, "dark");

        assert!(engine.end_fact(&ctx, &fact.id).unwrap());
        assert!(engine
            .current_fact(&ctx, "user", "prefers_theme")
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_edge_requires_visible_endpoints() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        let a = SecurityContext::for_tenant("a");
        let b = SecurityContext::for_tenant("b");

        let own = engine.add(&a, input("mine")).await.unwrap();
        let foreign = engine.add(&b, input("theirs")).await.unwrap();

        let err = engine
            .add_edge(&a, &own.id, &foreign.id, "references", 0.5)
            .unwrap_err();
        assert!(matches!(err, MnemaError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_maintenance_registration_and_shutdown() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        engine.start_maintenance();

        let names = engine.scheduler().task_names();
        for task in ["decay", "reflect", "user_summary", "classifier_train", "waypoint_prune"] {
            assert!(names.contains(&task.to_string()), "missing task {}", task);
        }

        engine.shutdown().await;
        assert!(engine.scheduler().task_names().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stats_by_scope() {
        let engine = MemoryEngine::open_in_memory().unwrap();
        let a = SecurityContext::for_tenant("a");
        engine.add(&a, input("note one")).await.unwrap();
        engine.add(&a, input("note two")).await.unwrap();

        let scoped = engine.stats(&a).unwrap();
        assert_eq!(scoped.total_memories, 2);
        assert!(scoped.memories_by_sector.contains_key("semantic"));
    }
}
