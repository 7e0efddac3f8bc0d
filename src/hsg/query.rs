//! Hybrid retrieval
//!
//! Per-sector kNN candidates are scored by a composite of cosine,
//! salience and recency, modulated by cross-sector resonance, merged
//! deterministically and optionally expanded by spreading activation
//! over waypoints. Encoder failures downgrade to a canonical-token
//! Jaccard fallback; the call still succeeds.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{SecurityContext, TenantScope};
use crate::crypto::CryptoBox;
use crate::dynamics::{composite_score, recency_modulator, spread_activation, ResonanceMatrix};
use crate::embedding::{
    cosine_similarity, fingerprint_vector, pool_vector, SectorEncoder, FINGERPRINT_DIM,
};
use crate::error::Result;
use crate::config::EngineConfig;
use crate::storage::{queries, Storage, VectorStore};
use crate::text::{canonical_tokens, search_document};
use crate::types::{
    Memory, MemoryId, SearchFilter, SearchMatch, Sector, SectorKey,
};

use super::writer::{HsgWriter, DEFAULT_BOOST};

/// Spreading activation depth when the per-query flag is set
const SPREAD_MAX_ITER: usize = 2;
/// Candidate pool size for the keyword fallback scan
const FALLBACK_SCAN_LIMIT: i64 = 500;

struct Candidate {
    memory: Memory,
    score: f64,
    path: Vec<MemoryId>,
    cold: bool,
}

/// Hybrid query engine
pub struct HsgQuery {
    storage: Storage,
    crypto: CryptoBox,
    encoder: Arc<dyn SectorEncoder>,
    config: Arc<EngineConfig>,
    resonance: ResonanceMatrix,
    writer: Arc<HsgWriter>,
}

impl HsgQuery {
    pub fn new(
        storage: Storage,
        crypto: CryptoBox,
        encoder: Arc<dyn SectorEncoder>,
        config: Arc<EngineConfig>,
        resonance: ResonanceMatrix,
        writer: Arc<HsgWriter>,
    ) -> Self {
        Self {
            storage,
            crypto,
            encoder,
            config,
            resonance,
            writer,
        }
    }

    /// Hybrid search. Returns matches ordered by score with
    /// deterministic tie-breaks (salience, recency, id).
    pub async fn search(
        &self,
        ctx: &SecurityContext,
        query_text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchMatch>> {
        let scope = ctx.effective_tenant(None)?;

        if k == 0 {
            return Ok(Vec::new());
        }
        if let (Some(start), Some(end)) = (filter.start_time, filter.end_time) {
            if end < start {
                return Ok(Vec::new());
            }
        }

        let sectors: Vec<Sector> = if filter.sectors.is_empty() {
            vec![Sector::Semantic]
        } else {
            filter.sectors.clone()
        };

        // Encoder failure downgrades the whole call to keyword matching
        let mut query_vectors: Vec<(Sector, Vec<f32>)> = Vec::new();
        for sector in &sectors {
            match self.encoder.embed(query_text, *sector) {
                Ok(vector) => query_vectors.push((*sector, vector)),
                Err(e) => {
                    tracing::warn!("query encoder failed, using keyword fallback: {}", e);
                    return self.keyword_fallback(&scope, query_text, k, filter);
                }
            }
        }

        let pool = k.saturating_mul(2).max(1);
        let mut candidates: HashMap<MemoryId, Candidate> = HashMap::new();

        for (sector, query_vec) in &query_vectors {
            let live_hits = self.storage.with_connection(|conn| {
                VectorStore::knn(conn, query_vec, SectorKey::live(*sector), &scope, pool)
            })?;

            for hit in live_hits {
                self.consider(
                    &mut candidates,
                    &scope,
                    &hit.memory_id,
                    hit.score as f64,
                    *sector,
                    filter,
                    false,
                )?;
            }

            // Cold vectors still answer, against a degraded query
            let cold_entries = self.storage.with_connection(|conn| {
                VectorStore::list_sector(conn, SectorKey::cold(*sector), &scope)
            })?;
            if !cold_entries.is_empty() {
                let query_fingerprint = fingerprint_vector(query_text);
                for entry in cold_entries {
                    let cosine = if entry.dim == FINGERPRINT_DIM {
                        cosine_similarity(&query_fingerprint, &entry.vector)
                    } else {
                        cosine_similarity(&pool_vector(query_vec, entry.dim), &entry.vector)
                    };
                    self.consider(
                        &mut candidates,
                        &scope,
                        &entry.memory_id,
                        cosine as f64,
                        *sector,
                        filter,
                        true,
                    )?;
                }
            }
        }

        if filter.spread && !candidates.is_empty() {
            self.spread(&mut candidates, &scope, filter)?;
        }

        let mut merged: Vec<Candidate> = candidates.into_values().collect();
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.memory
                        .salience
                        .partial_cmp(&a.memory.salience)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.memory.last_seen_at.cmp(&a.memory.last_seen_at))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        merged.truncate(k);

        let matches: Vec<SearchMatch> = merged
            .iter()
            .map(|candidate| self.to_match(candidate))
            .collect::<Result<Vec<_>>>()?;

        self.fire_query_hits(&merged);
        Ok(matches)
    }

    /// Score one candidate id within a sector, applying filters and
    /// cross-sector resonance, keeping the best score per memory.
    #[allow(clippy::too_many_arguments)]
    fn consider(
        &self,
        candidates: &mut HashMap<MemoryId, Candidate>,
        scope: &TenantScope,
        memory_id: &str,
        cosine: f64,
        query_sector: Sector,
        filter: &SearchFilter,
        cold: bool,
    ) -> Result<()> {
        let Some(memory) = self
            .storage
            .with_connection(|conn| queries::get_memory(conn, memory_id, scope))?
        else {
            return Ok(());
        };
        if !passes_filter(&memory, filter) {
            return Ok(());
        }

        let now = Utc::now();
        let recency = recency_modulator(now, memory.last_seen_at);
        let base = composite_score(cosine, memory.salience, memory.coactivations, recency);
        let score = base * self.resonance.factor(query_sector, memory.primary_sector);

        match candidates.get_mut(memory_id) {
            Some(existing) => {
                if score > existing.score {
                    existing.score = score;
                    existing.cold = existing.cold || cold;
                }
            }
            None => {
                candidates.insert(
                    memory_id.to_string(),
                    Candidate {
                        memory,
                        score,
                        path: Vec::new(),
                        cold,
                    },
                );
            }
        }
        Ok(())
    }

    /// Expand candidates along waypoints with attenuated energy
    fn spread(
        &self,
        candidates: &mut HashMap<MemoryId, Candidate>,
        scope: &TenantScope,
        filter: &SearchFilter,
    ) -> Result<()> {
        let seeds: Vec<(MemoryId, f64)> = candidates
            .iter()
            .map(|(id, c)| (id.clone(), c.score.clamp(0.0, 1.0)))
            .collect();

        // Collect the adjacency reachable within the spread depth
        let mut adjacency: HashMap<MemoryId, Vec<(MemoryId, f64)>> = HashMap::new();
        let mut frontier: Vec<MemoryId> = seeds.iter().map(|(id, _)| id.clone()).collect();
        for _ in 0..SPREAD_MAX_ITER {
            let mut next = Vec::new();
            for id in &frontier {
                if adjacency.contains_key(id) {
                    continue;
                }
                let waypoints = self
                    .storage
                    .with_connection(|conn| queries::waypoints_from(conn, id, scope))?;
                let edges: Vec<(MemoryId, f64)> = waypoints
                    .into_iter()
                    .map(|w| {
                        next.push(w.dst_id.clone());
                        (w.dst_id, w.weight)
                    })
                    .collect();
                adjacency.insert(id.clone(), edges);
            }
            frontier = next;
        }

        let activations = spread_activation(&seeds, &adjacency, SPREAD_MAX_ITER);
        let now = Utc::now();

        for (id, activation) in activations {
            if activation.path.len() > 1 {
                // Refresh traversal times along the path
                for pair in activation.path.windows(2) {
                    self.storage.with_connection(|conn| {
                        queries::touch_waypoint(conn, &pair[0], &pair[1], now)
                    })?;
                }
            }

            match candidates.get_mut(&id) {
                Some(existing) => {
                    if activation.path.len() > 1 && existing.path.is_empty() {
                        existing.path = activation.path;
                    }
                }
                None => {
                    let Some(memory) = self
                        .storage
                        .with_connection(|conn| queries::get_memory(conn, &id, scope))?
                    else {
                        continue;
                    };
                    if !passes_filter(&memory, filter) {
                        continue;
                    }
                    candidates.insert(
                        id,
                        Candidate {
                            memory,
                            score: activation.energy,
                            path: activation.path,
                            cold: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn to_match(&self, candidate: &Candidate) -> Result<SearchMatch> {
        let memory = &candidate.memory;
        let sectors = self
            .storage
            .with_connection(|conn| {
                VectorStore::get_by_memory(conn, &memory.id, &TenantScope::Any)
            })?
            .into_iter()
            .map(|entry| entry.sector.as_string())
            .collect();

        Ok(SearchMatch {
            id: memory.id.clone(),
            content: self.crypto.decrypt_lossy(&memory.content),
            score: candidate.score,
            sectors,
            primary_sector: memory.primary_sector,
            path: candidate.path.clone(),
            salience: memory.salience,
            last_seen_at: memory.last_seen_at,
            updated_at: memory.updated_at,
            decay_lambda: memory.decay_lambda,
            version: memory.version,
            segment: memory.segment,
            simhash: memory.simhash,
            generated_summary: memory.generated_summary.clone(),
        })
    }

    /// Asynchronous per-hit side effects: co-activation counting,
    /// optional reinforcement, cold-to-live regeneration.
    fn fire_query_hits(&self, returned: &[Candidate]) {
        if returned.is_empty() {
            return;
        }

        let hits: Vec<(MemoryId, Option<String>, bool)> = returned
            .iter()
            .map(|c| (c.memory.id.clone(), c.memory.tenant_id.clone(), c.cold))
            .collect();
        let co_retrieved = hits.len() > 1;

        let storage = self.storage.clone();
        let crypto = self.crypto.clone();
        let encoder = self.encoder.clone();
        let config = self.config.clone();
        let writer = self.writer.clone();

        tokio::spawn(async move {
            if co_retrieved {
                let ids: Vec<MemoryId> = hits.iter().map(|(id, _, _)| id.clone()).collect();
                if let Err(e) =
                    storage.with_connection(|conn| queries::increment_coactivations(conn, &ids))
                {
                    tracing::warn!("coactivation update failed: {}", e);
                }
            }

            for (id, tenant_id, cold) in hits {
                let scope = match &tenant_id {
                    Some(t) => TenantScope::Id(t.clone()),
                    None => TenantScope::System,
                };

                if config.decay_reinforce_on_query {
                    if let Err(e) = writer.reinforce_scoped(&scope, &id, DEFAULT_BOOST).await {
                        tracing::debug!(id = %id, "query-hit reinforcement skipped: {}", e);
                    }
                }

                if cold && config.regeneration_enabled {
                    if let Err(e) = regenerate(&storage, &crypto, encoder.as_ref(), &id, &scope) {
                        tracing::warn!(id = %id, "cold regeneration failed: {}", e);
                    }
                }
            }
        });
    }

    /// Keyword fallback: Jaccard of canonical token sets over recent
    /// memories in scope.
    fn keyword_fallback(
        &self,
        scope: &TenantScope,
        query_text: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchMatch>> {
        let query_tokens: std::collections::HashSet<String> =
            canonical_tokens(query_text).into_iter().collect();

        let recent = self
            .storage
            .with_connection(|conn| queries::list_recent(conn, scope, FALLBACK_SCAN_LIMIT))?;

        let mut scored: Vec<Candidate> = Vec::new();
        for memory in recent {
            if !passes_filter(&memory, filter) {
                continue;
            }
            let content = self.crypto.decrypt_lossy(&memory.content);
            let document = search_document(&content);
            let score = crate::text::jaccard(&document, &query_tokens);
            if score <= 0.0 {
                continue;
            }
            scored.push(Candidate {
                memory,
                score,
                path: Vec::new(),
                cold: false,
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.memory
                        .salience
                        .partial_cmp(&a.memory.salience)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        scored.truncate(k);

        scored.iter().map(|c| self.to_match(c)).collect()
    }
}

fn passes_filter(memory: &Memory, filter: &SearchFilter) -> bool {
    if let Some(min) = filter.min_salience {
        if memory.salience < min {
            return false;
        }
    }
    if let Some(start) = filter.start_time {
        if memory.created_at < start {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if memory.created_at > end {
            return false;
        }
    }
    true
}

/// Re-embed decrypted content and promote a cold memory back to its
/// live sector.
fn regenerate(
    storage: &Storage,
    crypto: &CryptoBox,
    encoder: &dyn SectorEncoder,
    id: &str,
    scope: &TenantScope,
) -> Result<()> {
    let Some(mut memory) =
        storage.with_connection(|conn| queries::get_memory(conn, id, scope))?
    else {
        return Ok(());
    };

    let content = crypto.decrypt(&memory.content)?;
    let vector = encoder.embed(&content, memory.primary_sector)?;

    let expected_version = memory.version;
    memory.compressed_vec = None;
    memory.version = expected_version + 1;
    memory.updated_at = Utc::now();

    let sector = memory.primary_sector;
    let tenant_id = memory.tenant_id.clone();
    let id_owned = id.to_string();
    storage.with_transaction(move |conn| {
        VectorStore::store(conn, &id_owned, SectorKey::live(sector), &vector, &tenant_id)?;
        VectorStore::delete(conn, &id_owned, SectorKey::cold(sector))?;
        queries::update_memory(conn, &memory, expected_version)?;
        Ok(())
    })?;

    tracing::debug!(id = %id, "cold memory promoted back to live sector");
    Ok(())
}
