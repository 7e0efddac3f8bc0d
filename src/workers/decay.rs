//! Decay worker
//!
//! Periodically samples a window of each maintenance segment, applies
//! tiered salience decay, and moves fading memories through vector
//! compression and finally fingerprinting. Yields after every memory
//! and sleeps between segments so foreground latency is unaffected;
//! refuses to run at all while queries are active.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::crypto::CryptoBox;
use crate::dynamics::{assign_tier, decay_step, Tier};
use crate::embedding::{fingerprint_vector, pool_vector};
use crate::error::Result;
use crate::scheduler::AbortSignal;
use crate::storage::{queries, stats, Storage, VectorStore};
use crate::text::{extractive_summary, top_keywords, truncate_chars};
use crate::types::{MaintenanceKind, Memory, MemoryId, SectorKey};

/// Minimum pause between two decay runs
const COOLDOWN: Duration = Duration::from_secs(60);
/// Retention factor below which vectors are compressed
const COMPRESS_THRESHOLD: f64 = 0.7;
/// Hard floor for the fingerprint decision
const FINGERPRINT_FLOOR: f64 = 0.3;
/// Keywords kept for fully cold memories
const COLD_KEYWORDS: usize = 3;

/// Tier counts for one run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierCounts {
    pub hot: u64,
    pub warm: u64,
    pub cold: u64,
}

/// Counters reported by one decay run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DecayOutcome {
    pub processed: u64,
    pub decayed: u64,
    pub compressed: u64,
    pub fingerprinted: u64,
    pub skipped: bool,
    pub tiers: TierCounts,
}

impl DecayOutcome {
    fn merge(&mut self, other: DecayOutcome) {
        self.processed += other.processed;
        self.decayed += other.decayed;
        self.compressed += other.compressed;
        self.fingerprinted += other.fingerprinted;
        self.tiers.hot += other.tiers.hot;
        self.tiers.warm += other.tiers.warm;
        self.tiers.cold += other.tiers.cold;
    }
}

/// Periodic decay worker
pub struct DecayWorker {
    storage: Storage,
    crypto: CryptoBox,
    config: Arc<EngineConfig>,
    active_queries: Arc<AtomicUsize>,
    last_run: Mutex<Option<Instant>>,
}

impl DecayWorker {
    pub fn new(
        storage: Storage,
        crypto: CryptoBox,
        config: Arc<EngineConfig>,
        active_queries: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            storage,
            crypto,
            config,
            active_queries,
            last_run: Mutex::new(None),
        }
    }

    /// One decay pass over a sample of every segment
    pub async fn run(&self, abort: &AbortSignal) -> Result<DecayOutcome> {
        // Foreground queries always win; also honor the cooldown
        if self.active_queries.load(Ordering::SeqCst) > 0 {
            tracing::debug!("decay skipped: queries active");
            return Ok(DecayOutcome {
                skipped: true,
                ..Default::default()
            });
        }
        {
            let mut last_run = self.last_run.lock();
            if let Some(last) = *last_run {
                if last.elapsed() < COOLDOWN {
                    return Ok(DecayOutcome {
                        skipped: true,
                        ..Default::default()
                    });
                }
            }
            *last_run = Some(Instant::now());
        }

        let mut outcome = DecayOutcome::default();
        let now = Utc::now();

        // Segments are processed `decay_threads` at a time
        let segments: Vec<u32> = (0..self.config.cache_segments).collect();
        for batch in segments.chunks(self.config.decay_threads.max(1)) {
            abort.check("decay")?;

            let results = futures::future::join_all(
                batch
                    .iter()
                    .map(|segment| self.process_segment(*segment, now, abort)),
            )
            .await;
            for result in results {
                outcome.merge(result?);
            }

            if self.config.decay_sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.decay_sleep_ms)).await;
            }
        }

        self.storage.with_connection(|conn| {
            stats::log_maintenance(conn, MaintenanceKind::Decay, outcome.processed as i64, now)
        })?;
        tracing::info!(
            processed = outcome.processed,
            decayed = outcome.decayed,
            compressed = outcome.compressed,
            fingerprinted = outcome.fingerprinted,
            hot = outcome.tiers.hot,
            warm = outcome.tiers.warm,
            cold = outcome.tiers.cold,
            "decay run complete"
        );
        Ok(outcome)
    }

    /// Decay a random window of one segment
    async fn process_segment(
        &self,
        segment: u32,
        now: chrono::DateTime<Utc>,
        abort: &AbortSignal,
    ) -> Result<DecayOutcome> {
        let mut outcome = DecayOutcome::default();
        let memories = self
            .storage
            .with_connection(|conn| queries::list_segment(conn, segment))?;
        if memories.is_empty() {
            return Ok(outcome);
        }

        let window = ((memories.len() as f64) * self.config.decay_ratio).ceil() as usize;
        let offset = rand::thread_rng().gen_range(0..memories.len());

        let mut salience_updates: Vec<(MemoryId, f64)> = Vec::new();
        for i in 0..window.min(memories.len()) {
            abort.check("decay")?;
            let memory = &memories[(offset + i) % memories.len()];

            self.process_memory(memory, now, &mut salience_updates, &mut outcome)?;
            outcome.processed += 1;

            // Cooperative point between memories
            tokio::task::yield_now().await;
        }

        self.storage
            .with_connection(|conn| queries::update_salience_batch(conn, &salience_updates, now))?;
        Ok(outcome)
    }

    fn process_memory(
        &self,
        memory: &Memory,
        now: chrono::DateTime<Utc>,
        salience_updates: &mut Vec<(MemoryId, f64)>,
        outcome: &mut DecayOutcome,
    ) -> Result<()> {
        let age_days = (now - memory.last_seen_at).num_milliseconds().max(0) as f64 / 86_400_000.0;

        let tier = assign_tier(age_days, memory.coactivations, memory.salience);
        match tier {
            Tier::Hot => outcome.tiers.hot += 1,
            Tier::Warm => outcome.tiers.warm += 1,
            Tier::Cold => outcome.tiers.cold += 1,
        }

        let (new_salience, retention) =
            decay_step(memory.salience, memory.coactivations, age_days, tier.lambda());
        if (new_salience - memory.salience).abs() > 1e-9 {
            salience_updates.push((memory.id.clone(), new_salience));
            outcome.decayed += 1;
        }

        if retention < COMPRESS_THRESHOLD {
            self.compress_memory(memory, retention, outcome)?;
        }
        Ok(())
    }

    /// Shrink a fading memory's primary vector; fully cold memories
    /// are replaced by a deterministic fingerprint and a keyword
    /// summary.
    fn compress_memory(
        &self,
        memory: &Memory,
        retention: f64,
        outcome: &mut DecayOutcome,
    ) -> Result<()> {
        let live_key = SectorKey::live(memory.primary_sector);
        let cold_key = SectorKey::cold(memory.primary_sector);
        let scope = crate::context::TenantScope::Any;

        let fingerprint_threshold = FINGERPRINT_FLOOR.max(self.config.decay_cold_threshold);
        let live = self
            .storage
            .with_connection(|conn| VectorStore::get(conn, &memory.id, live_key, &scope))?;
        let existing_cold = self
            .storage
            .with_connection(|conn| VectorStore::get(conn, &memory.id, cold_key, &scope))?;

        if retention < fingerprint_threshold {
            // Already a fingerprint: nothing to do
            if existing_cold
                .as_ref()
                .map(|e| e.dim == crate::embedding::FINGERPRINT_DIM)
                .unwrap_or(false)
            {
                return Ok(());
            }

            let content = self.crypto.decrypt_lossy(&memory.content);
            let fingerprint = fingerprint_vector(&content);
            let summary = top_keywords(&content, COLD_KEYWORDS);

            let memory_id = memory.id.clone();
            let tenant_id = memory.tenant_id.clone();
            self.storage.with_transaction(move |conn| {
                VectorStore::store(conn, &memory_id, cold_key, &fingerprint, &tenant_id)?;
                VectorStore::delete(conn, &memory_id, live_key)?;
                queries::set_generated_summary(conn, &memory_id, &summary)?;
                conn.execute(
                    "UPDATE memories SET compressed_vec = ? WHERE id = ?",
                    rusqlite::params![crate::storage::vectors::vec_to_blob(&fingerprint), memory_id],
                )?;
                Ok(())
            })?;
            outcome.fingerprinted += 1;
            return Ok(());
        }

        // Pooled compression. Target dimension is derived from the
        // configured live dimension, so re-compressing an already-cold
        // vector with the same retention is a no-op.
        let target_dim = ((self.config.vec_dim as f64 * retention).ceil() as usize)
            .max(self.config.min_vector_dim);

        let source = match (&live, &existing_cold) {
            (Some(entry), _) => entry.vector.clone(),
            (None, Some(entry)) if entry.vector.len() > target_dim => entry.vector.clone(),
            _ => return Ok(()),
        };

        let pooled = pool_vector(&source, target_dim);
        if pooled.len() >= source.len() && live.is_none() {
            return Ok(());
        }

        let content = self.crypto.decrypt_lossy(&memory.content);
        let summary = compressed_summary(&content, retention, self.config.summary_layers as usize);

        let memory_id = memory.id.clone();
        let tenant_id = memory.tenant_id.clone();
        self.storage.with_transaction(move |conn| {
            VectorStore::store(conn, &memory_id, cold_key, &pooled, &tenant_id)?;
            VectorStore::delete(conn, &memory_id, live_key)?;
            queries::set_generated_summary(conn, &memory_id, &summary)?;
            conn.execute(
                "UPDATE memories SET compressed_vec = ? WHERE id = ?",
                rusqlite::params![crate::storage::vectors::vec_to_blob(&pooled), memory_id],
            )?;
            Ok(())
        })?;
        outcome.compressed += 1;
        Ok(())
    }
}

/// Summary kept alongside a compressed vector, graded by retention
fn compressed_summary(content: &str, retention: f64, layers: usize) -> String {
    if retention > 0.8 {
        truncate_chars(content, 200)
    } else if retention > 0.4 {
        let max_chars = ((200.0 * retention) as usize).max(80);
        extractive_summary(content, layers, max_chars)
    } else {
        top_keywords(content, COLD_KEYWORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TenantScope;
    use crate::embedding::FINGERPRINT_DIM;
    use crate::types::{MemoryMetadata, Sector};
    use chrono::Duration as ChronoDuration;
    use tokio::sync::watch;

    fn abort_signal() -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        AbortSignal::from_receiver(rx)
    }

    fn worker(active: usize) -> DecayWorker {
        let counter = Arc::new(AtomicUsize::new(active));
        DecayWorker::new(
            Storage::open_in_memory().unwrap(),
            CryptoBox::from_secret("test"),
            Arc::new(EngineConfig::in_memory()),
            counter,
        )
    }

    fn seed_memory(worker: &DecayWorker, id: &str, age_days: i64, salience: f64) -> Memory {
        let now = Utc::now();
        let then = now - ChronoDuration::days(age_days);
        let content = worker.crypto.encrypt("alpha beta beta gamma gamma gamma").unwrap();
        let memory = Memory {
            id: id.to_string(),
            tenant_id: Some("u1".to_string()),
            content,
            primary_sector: Sector::Semantic,
            tags: vec![],
            metadata: MemoryMetadata::default(),
            segment: 0,
            simhash: 0,
            created_at: then,
            updated_at: then,
            last_seen_at: then,
            salience,
            decay_lambda: 0.008,
            version: 1,
            mean_vec: vec![0.1; 128],
            compressed_vec: None,
            coactivations: 0,
            feedback_score: 0.0,
            generated_summary: None,
        };
        worker
            .storage
            .with_connection(|conn| {
                queries::insert_memory(conn, &memory)?;
                VectorStore::store(
                    conn,
                    id,
                    SectorKey::live(Sector::Semantic),
                    &vec![0.1; 128],
                    &memory.tenant_id,
                )?;
                Ok(())
            })
            .unwrap();
        memory
    }

    #[tokio::test]
    async fn test_skips_while_queries_active() {
        let worker = worker(1);
        let outcome = worker.run(&abort_signal()).await.unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.processed, 0);
    }

    #[tokio::test]
    async fn test_cooldown_between_runs() {
        let worker = worker(0);
        let first = worker.run(&abort_signal()).await.unwrap();
        assert!(!first.skipped);
        let second = worker.run(&abort_signal()).await.unwrap();
        assert!(second.skipped);
    }

    #[tokio::test]
    async fn test_old_memory_fingerprinted() {
        let mut config = EngineConfig::in_memory();
        config.decay_ratio = 1.0;
        let worker = DecayWorker::new(
            Storage::open_in_memory().unwrap(),
            CryptoBox::from_secret("test"),
            Arc::new(config),
            Arc::new(AtomicUsize::new(0)),
        );
        let memory = seed_memory(&worker, "m1", 30, 0.3);

        let outcome = worker.run(&abort_signal()).await.unwrap();
        assert!(outcome.processed >= 1);
        assert_eq!(outcome.fingerprinted, 1);

        // Live vector replaced by a 32-dim cold fingerprint
        let live = worker
            .storage
            .with_connection(|conn| {
                VectorStore::get(conn, "m1", SectorKey::live(Sector::Semantic), &TenantScope::Any)
            })
            .unwrap();
        assert!(live.is_none());

        let cold = worker
            .storage
            .with_connection(|conn| {
                VectorStore::get(conn, "m1", SectorKey::cold(Sector::Semantic), &TenantScope::Any)
            })
            .unwrap()
            .unwrap();
        assert_eq!(cold.dim, FINGERPRINT_DIM);

        // Summary is the space-joined top keywords
        let reloaded = worker
            .storage
            .with_connection(|conn| queries::get_memory(conn, "m1", &TenantScope::Any))
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.generated_summary.as_deref(), Some("gamma beta alpha"));
        assert!(reloaded.salience < memory.salience);
    }

    #[tokio::test]
    async fn test_fresh_memory_untouched() {
        let mut config = EngineConfig::in_memory();
        config.decay_ratio = 1.0;
        let worker = DecayWorker::new(
            Storage::open_in_memory().unwrap(),
            CryptoBox::from_secret("test"),
            Arc::new(config),
            Arc::new(AtomicUsize::new(0)),
        );
        seed_memory(&worker, "m1", 0, 0.8);

        let outcome = worker.run(&abort_signal()).await.unwrap();
        assert_eq!(outcome.fingerprinted, 0);
        assert_eq!(outcome.compressed, 0);
        assert_eq!(outcome.tiers.hot, 1);

        let live = worker
            .storage
            .with_connection(|conn| {
                VectorStore::get(conn, "m1", SectorKey::live(Sector::Semantic), &TenantScope::Any)
            })
            .unwrap();
        assert!(live.is_some());
    }

    #[test]
    fn test_compressed_summary_grades() {
        let content = "First sentence here. Second sentence with detail. Third one.";
        assert!(compressed_summary(content, 0.9, 2).starts_with("First sentence"));
        let mid = compressed_summary(content, 0.5, 2);
        assert!(!mid.is_empty() && mid.len() <= 200);
        let low = compressed_summary(content, 0.2, 2);
        assert!(!low.contains('.'));
    }
}
