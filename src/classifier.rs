//! Per-tenant online sector classifier
//!
//! A softmax linear model over the eight sector labels, trained by SGD
//! on (anchor vector, primary sector) samples. The router consults it
//! before falling back to keyword heuristics; predictions below the
//! confidence gate are ignored.

use chrono::Utc;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::types::{ClassifierModel, Sector, TenantId};

/// Confidence below which the router ignores the model
pub const CONFIDENCE_GATE: f64 = 0.6;

/// Max samples per training run
pub const MAX_TRAIN_SAMPLES: usize = 10_000;

/// A prediction with its softmax confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub sector: Sector,
    pub confidence: f64,
}

/// Softmax over raw scores, numerically stabilized
fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        vec![1.0 / scores.len() as f32; scores.len()]
    } else {
        exps.into_iter().map(|e| e / sum).collect()
    }
}

/// Predict the sector for a vector; `None` when the model dimension
/// does not match the input.
pub fn predict(model: &ClassifierModel, vector: &[f32]) -> Option<Prediction> {
    let labels = Sector::all();
    if model.weights.len() != labels.len() || model.biases.len() != labels.len() {
        return None;
    }

    let mut scores = Vec::with_capacity(labels.len());
    for (weights, bias) in model.weights.iter().zip(model.biases.iter()) {
        if weights.len() != vector.len() {
            return None;
        }
        let dot: f32 = weights.iter().zip(vector.iter()).map(|(w, x)| w * x).sum();
        scores.push(dot + bias);
    }

    let probs = softmax(&scores);
    let (best, confidence) = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    Some(Prediction {
        sector: labels[best],
        confidence: *confidence as f64,
    })
}

/// Train (or continue training) a model by SGD.
///
/// `existing` seeds the weights when its dimension matches; the
/// returned model's version is `existing.version + 1`.
pub fn train(
    samples: &[(Vec<f32>, Sector)],
    existing: Option<&ClassifierModel>,
    tenant_id: TenantId,
    learning_rate: f32,
    epochs: usize,
) -> Option<ClassifierModel> {
    let samples: Vec<&(Vec<f32>, Sector)> = samples.iter().take(MAX_TRAIN_SAMPLES).collect();
    let dim = samples.first().map(|(v, _)| v.len())?;
    if dim == 0 {
        return None;
    }

    let labels = Sector::all();
    let (mut weights, mut biases) = match existing {
        Some(model)
            if model.weights.len() == labels.len()
                && model.weights.iter().all(|w| w.len() == dim) =>
        {
            (model.weights.clone(), model.biases.clone())
        }
        _ => (vec![vec![0.0f32; dim]; labels.len()], vec![0.0f32; labels.len()]),
    };

    let mut order: Vec<usize> = (0..samples.len()).collect();
    let mut rng = rand::thread_rng();

    for _ in 0..epochs.max(1) {
        order.shuffle(&mut rng);
        for &i in &order {
            let (vector, label) = samples[i];
            if vector.len() != dim {
                continue;
            }

            let scores: Vec<f32> = weights
                .iter()
                .zip(biases.iter())
                .map(|(w, b)| w.iter().zip(vector.iter()).map(|(wi, xi)| wi * xi).sum::<f32>() + b)
                .collect();
            let probs = softmax(&scores);

            for (class, (class_weights, bias)) in
                weights.iter_mut().zip(biases.iter_mut()).enumerate()
            {
                let target = if labels[class] == *label { 1.0 } else { 0.0 };
                let gradient = probs[class] - target;
                for (w, x) in class_weights.iter_mut().zip(vector.iter()) {
                    *w -= learning_rate * gradient * x;
                }
                *bias -= learning_rate * gradient;
            }
        }
    }

    Some(ClassifierModel {
        tenant_id,
        weights,
        biases,
        version: existing.map(|m| m.version).unwrap_or(0) + 1,
        updated_at: Utc::now(),
    })
}

/// In-memory per-tenant model cache, invalidated on retrain
#[derive(Default)]
pub struct ModelCache {
    models: DashMap<String, Arc<ClassifierModel>>,
}

impl ModelCache {
    fn key(tenant_id: &TenantId) -> String {
        tenant_id.clone().unwrap_or_default()
    }

    pub fn get(&self, tenant_id: &TenantId) -> Option<Arc<ClassifierModel>> {
        self.models.get(&Self::key(tenant_id)).map(|m| m.clone())
    }

    pub fn put(&self, model: ClassifierModel) {
        self.models
            .insert(Self::key(&model.tenant_id), Arc::new(model));
    }

    pub fn invalidate(&self, tenant_id: &TenantId) {
        self.models.remove(&Self::key(tenant_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[0]);
    }

    #[test]
    fn test_train_separable_samples() {
        // Dimension 0 active -> procedural, dimension 1 active -> semantic
        let mut samples = Vec::new();
        for _ in 0..100 {
            samples.push((one_hot(4, 0), Sector::Procedural));
            samples.push((one_hot(4, 1), Sector::Semantic));
        }

        let model = train(&samples, None, Some("u1".to_string()), 0.1, 20).unwrap();
        assert_eq!(model.version, 1);

        let procedural = predict(&model, &one_hot(4, 0)).unwrap();
        assert_eq!(procedural.sector, Sector::Procedural);
        assert!(procedural.confidence >= CONFIDENCE_GATE);

        let semantic = predict(&model, &one_hot(4, 1)).unwrap();
        assert_eq!(semantic.sector, Sector::Semantic);
    }

    #[test]
    fn test_version_increments_on_retrain() {
        let samples = vec![(one_hot(4, 0), Sector::Procedural)];
        let first = train(&samples, None, None, 0.1, 1).unwrap();
        let second = train(&samples, Some(&first), None, 0.1, 1).unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn test_predict_rejects_dimension_mismatch() {
        let samples = vec![(one_hot(4, 0), Sector::Procedural)];
        let model = train(&samples, None, None, 0.1, 1).unwrap();
        assert!(predict(&model, &[1.0, 0.0]).is_none());
    }

    #[test]
    fn test_train_empty_samples() {
        assert!(train(&[], None, None, 0.1, 1).is_none());
    }

    #[test]
    fn test_cache_invalidation() {
        let cache = ModelCache::default();
        let samples = vec![(one_hot(4, 0), Sector::Procedural)];
        let model = train(&samples, None, Some("u1".to_string()), 0.1, 1).unwrap();
        let tenant = Some("u1".to_string());

        cache.put(model);
        assert!(cache.get(&tenant).is_some());
        cache.invalidate(&tenant);
        assert!(cache.get(&tenant).is_none());
    }
}
