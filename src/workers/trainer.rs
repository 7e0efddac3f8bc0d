//! Classifier retraining worker
//!
//! Periodically refits each active tenant's sector classifier on its
//! accumulated (anchor vector, primary sector) pairs and invalidates
//! the in-memory model cache so the router picks up the new weights.

use chrono::Utc;
use std::sync::Arc;

use crate::classifier::{self, ModelCache, MAX_TRAIN_SAMPLES};
use crate::context::TenantScope;
use crate::error::Result;
use crate::scheduler::AbortSignal;
use crate::storage::{queries, stats, Storage};
use crate::types::MaintenanceKind;

/// Minimum samples before a tenant gets a model
const MIN_SAMPLES: usize = 25;
const LEARNING_RATE: f32 = 0.05;
const EPOCHS: usize = 5;

/// Periodic classifier trainer
pub struct TrainerWorker {
    storage: Storage,
    models: Arc<ModelCache>,
}

impl TrainerWorker {
    pub fn new(storage: Storage, models: Arc<ModelCache>) -> Self {
        Self { storage, models }
    }

    /// One training pass. Returns the number of models refreshed.
    pub async fn run(&self, abort: &AbortSignal) -> Result<usize> {
        let tenants = self.storage.with_connection(queries::list_active_tenants)?;

        let mut trained = 0usize;
        for tenant_id in tenants {
            abort.check("classifier_train")?;

            let scope = match &tenant_id {
                Some(id) => TenantScope::Id(id.clone()),
                None => TenantScope::System,
            };
            let samples = self.storage.with_connection(|conn| {
                queries::classifier_samples(conn, &scope, MAX_TRAIN_SAMPLES as i64)
            })?;
            if samples.len() < MIN_SAMPLES {
                continue;
            }

            let existing = self
                .storage
                .with_connection(|conn| queries::get_classifier_model(conn, &tenant_id))?;

            let Some(model) = classifier::train(
                &samples,
                existing.as_ref(),
                tenant_id.clone(),
                LEARNING_RATE,
                EPOCHS,
            ) else {
                continue;
            };

            self.storage
                .with_connection(|conn| queries::save_classifier_model(conn, &model))?;
            self.models.invalidate(&tenant_id);
            trained += 1;
            tracing::debug!(?tenant_id, version = model.version, "classifier retrained");

            tokio::task::yield_now().await;
        }

        if trained > 0 {
            self.storage.with_connection(|conn| {
                stats::log_maintenance(conn, MaintenanceKind::Train, trained as i64, Utc::now())
            })?;
        }
        Ok(trained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Memory, MemoryMetadata, Sector};
    use tokio::sync::watch;

    fn abort_signal() -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        AbortSignal::from_receiver(rx)
    }

    fn seed_samples(storage: &Storage, tenant: &str, count: usize, sector: Sector) {
        let now = Utc::now();
        for i in 0..count {
            let mut vec = vec![0.0f32; 8];
            vec[sector.index() % 8] = 1.0;
            let memory = Memory {
                id: format!("{}-{}", sector.as_str(), i),
                tenant_id: Some(tenant.to_string()),
                content: "x".to_string(),
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
                mean_vec: vec,
                compressed_vec: None,
                coactivations: 0,
                feedback_score: 0.0,
                generated_summary: None,
            };
            storage
                .with_connection(|conn| queries::insert_memory(conn, &memory))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_trains_and_persists_model() {
        let storage = Storage::open_in_memory().unwrap();
        seed_samples(&storage, "u3", 30, Sector::Procedural);

        let models = Arc::new(ModelCache::default());
        let trainer = TrainerWorker::new(storage.clone(), models.clone());

        let trained = trainer.run(&abort_signal()).await.unwrap();
        assert_eq!(trained, 1);

        let model = storage
            .with_connection(|conn| {
                queries::get_classifier_model(conn, &Some("u3".to_string()))
            })
            .unwrap()
            .unwrap();
        assert_eq!(model.version, 1);

        // Retrain bumps the version
        assert_eq!(trainer.run(&abort_signal()).await.unwrap(), 1);
        let model = storage
            .with_connection(|conn| {
                queries::get_classifier_model(conn, &Some("u3".to_string()))
            })
            .unwrap()
            .unwrap();
        assert_eq!(model.version, 2);
    }

    #[tokio::test]
    async fn test_skips_sparse_tenants() {
        let storage = Storage::open_in_memory().unwrap();
        seed_samples(&storage, "u3", 3, Sector::Semantic);

        let trainer = TrainerWorker::new(storage, Arc::new(ModelCache::default()));
        assert_eq!(trainer.run(&abort_signal()).await.unwrap(), 0);
    }
}
