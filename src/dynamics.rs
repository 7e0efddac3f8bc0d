//! Temporal dynamics
//!
//! Pure salience math shared by the query path and the maintenance
//! workers: dual-phase decay, activity tiers, reinforcement,
//! cross-sector resonance, waypoint weighting and spreading
//! activation. No I/O happens here; callers pass state in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{MemoryId, Sector};

/// Weight of the fast decay phase
pub const DUAL_PHASE_ALPHA: f64 = 0.6;
/// Fast-phase rate (per day); dominates the first days
pub const LAMBDA_FAST: f64 = 0.35;

/// Per-tier slow decay rates (per day)
pub const LAMBDA_HOT: f64 = 0.005;
pub const LAMBDA_WARM: f64 = 0.02;
pub const LAMBDA_COLD: f64 = 0.05;

/// Recency time constant for query scoring
pub const RECENCY_TAU_DAYS: f64 = 7.0;
/// Waypoint age time constant
pub const EDGE_TAU_DAYS: f64 = 30.0;
/// Minimum weight worth writing for a waypoint
pub const WAYPOINT_WRITE_FLOOR: f64 = 0.05;
/// Weight below which stored waypoints are pruned
pub const WAYPOINT_PRUNE_FLOOR: f64 = 0.02;
/// Per-hop attenuation during spreading activation
pub const SPREAD_GAMMA: f64 = 0.5;
/// Energy below which activation stops propagating
pub const SPREAD_ENERGY_FLOOR: f64 = 0.05;

/// Composite score weights for hybrid retrieval
pub const SCORE_W_COSINE: f64 = 0.7;
pub const SCORE_W_SALIENCE: f64 = 0.2;
pub const SCORE_W_RECENCY: f64 = 0.1;

/// Recency/activity bucket driving decay rate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub fn lambda(&self) -> f64 {
        match self {
            Tier::Hot => LAMBDA_HOT,
            Tier::Warm => LAMBDA_WARM,
            Tier::Cold => LAMBDA_COLD,
        }
    }
}

/// Assign the activity tier for a memory
pub fn assign_tier(age_days: f64, coactivations: i64, salience: f64) -> Tier {
    let recent = age_days < 6.0;
    if recent && (coactivations > 5 || salience > 0.7) {
        Tier::Hot
    } else if recent || salience > 0.4 {
        Tier::Warm
    } else {
        Tier::Cold
    }
}

/// Dual-phase retention: a fast early phase superposed on the
/// per-sector slow phase.
pub fn dual_phase_retention(salience: f64, days: f64, lambda_slow: f64) -> f64 {
    let days = days.max(0.0);
    let fast = (-LAMBDA_FAST * days).exp();
    let slow = (-lambda_slow * days).exp();
    (salience * (DUAL_PHASE_ALPHA * fast + (1.0 - DUAL_PHASE_ALPHA) * slow)).clamp(0.0, 1.0)
}

/// Salience amplified by co-retrieval history, clamped to [0,1]
pub fn effective_salience(salience: f64, coactivations: i64) -> f64 {
    (salience * (1.0 + (coactivations.max(0) as f64).ln_1p())).clamp(0.0, 1.0)
}

/// One decay step. Returns the new salience and the retention factor
/// `f` the maintenance worker keys compression decisions on.
///
/// Monotone: the result never exceeds the input salience's effective
/// value, and `f = 1` at `Δt = 0`.
pub fn decay_step(salience: f64, coactivations: i64, age_days: f64, lambda: f64) -> (f64, f64) {
    let sal_eff = effective_salience(salience, coactivations);
    let f = (-lambda * (age_days.max(0.0) / (sal_eff + 0.1))).exp();
    ((sal_eff * f).clamp(0.0, 1.0), f)
}

/// Reinforcement on recall
pub fn reinforce(salience: f64, boost: f64) -> f64 {
    (salience + boost).min(1.0)
}

/// Recency modulator for query scoring
pub fn recency_modulator(now: DateTime<Utc>, last_seen_at: DateTime<Utc>) -> f64 {
    let days = (now - last_seen_at).num_milliseconds().max(0) as f64 / 86_400_000.0;
    (-days / RECENCY_TAU_DAYS).exp()
}

/// Composite retrieval score before resonance
pub fn composite_score(cosine: f64, salience: f64, coactivations: i64, recency: f64) -> f64 {
    SCORE_W_COSINE * cosine
        + SCORE_W_SALIENCE * effective_salience(salience, coactivations)
        + SCORE_W_RECENCY * recency
}

/// Cross-sector resonance matrix. Diagonal is 1.0; off-diagonal
/// entries live in [0.2, 0.9].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResonanceMatrix {
    values: [[f64; 8]; 8],
}

impl Default for ResonanceMatrix {
    fn default() -> Self {
        // Rows: query sector. Columns: memory sector.
        // semantic episodic procedural reflective emotional sensory temporal contextual
        let values = [
            [1.0, 0.6, 0.5, 0.7, 0.4, 0.3, 0.4, 0.6],
            [0.6, 1.0, 0.4, 0.6, 0.6, 0.4, 0.8, 0.5],
            [0.5, 0.4, 1.0, 0.5, 0.2, 0.3, 0.3, 0.5],
            [0.7, 0.6, 0.5, 1.0, 0.5, 0.3, 0.4, 0.5],
            [0.4, 0.6, 0.2, 0.5, 1.0, 0.5, 0.4, 0.4],
            [0.3, 0.4, 0.3, 0.3, 0.5, 1.0, 0.4, 0.4],
            [0.4, 0.8, 0.3, 0.4, 0.4, 0.4, 1.0, 0.5],
            [0.6, 0.5, 0.5, 0.5, 0.4, 0.4, 0.5, 1.0],
        ];
        Self { values }
    }
}

impl ResonanceMatrix {
    /// Construct from explicit values, validating the invariants
    pub fn new(values: [[f64; 8]; 8]) -> crate::error::Result<Self> {
        for (i, row) in values.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                if i == j && *v != 1.0 {
                    return Err(crate::error::MnemaError::Config(
                        "resonance diagonal must be 1.0".to_string(),
                    ));
                }
                if i != j && !(0.2..=0.9).contains(v) {
                    return Err(crate::error::MnemaError::Config(format!(
                        "resonance[{}][{}] = {} outside [0.2, 0.9]",
                        i, j, v
                    )));
                }
            }
        }
        Ok(Self { values })
    }

    pub fn factor(&self, query: Sector, memory: Sector) -> f64 {
        self.values[query.index()][memory.index()]
    }
}

/// Waypoint weight from cosine similarity and edge age
pub fn waypoint_weight(cosine: f64, age_days: f64) -> f64 {
    (cosine * (-age_days.max(0.0) / EDGE_TAU_DAYS).exp()).clamp(0.0, 1.0)
}

/// Result of activating one node during spreading
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub energy: f64,
    /// Ids traversed from the seed to this node (seed first)
    pub path: Vec<MemoryId>,
}

/// Spreading activation over the waypoint adjacency.
///
/// Breadth-first, depth ≤ `max_iter`; each hop multiplies energy by
/// `edge_weight * γ` and edges whose propagated energy falls below the
/// floor terminate. `max_iter = 0` returns exactly the seeds with
/// their input energies. When multiple paths reach a node the highest
/// energy wins.
pub fn spread_activation(
    seeds: &[(MemoryId, f64)],
    adjacency: &HashMap<MemoryId, Vec<(MemoryId, f64)>>,
    max_iter: usize,
) -> HashMap<MemoryId, Activation> {
    let mut best: HashMap<MemoryId, Activation> = HashMap::new();
    let mut frontier: Vec<(MemoryId, f64, Vec<MemoryId>)> = Vec::new();

    for (id, energy) in seeds {
        best.insert(
            id.clone(),
            Activation {
                energy: *energy,
                path: vec![id.clone()],
            },
        );
        frontier.push((id.clone(), *energy, vec![id.clone()]));
    }

    for _ in 0..max_iter {
        let mut next = Vec::new();
        for (id, energy, path) in &frontier {
            let Some(neighbors) = adjacency.get(id) else {
                continue;
            };
            for (neighbor, weight) in neighbors {
                let propagated = energy * weight * SPREAD_GAMMA;
                if propagated < SPREAD_ENERGY_FLOOR {
                    continue;
                }
                if path.contains(neighbor) {
                    continue;
                }
                let mut neighbor_path = path.clone();
                neighbor_path.push(neighbor.clone());

                let improved = best
                    .get(neighbor)
                    .map(|existing| propagated > existing.energy)
                    .unwrap_or(true);
                if improved {
                    best.insert(
                        neighbor.clone(),
                        Activation {
                            energy: propagated,
                            path: neighbor_path.clone(),
                        },
                    );
                    next.push((neighbor.clone(), propagated, neighbor_path));
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_assignment() {
        assert_eq!(assign_tier(1.0, 10, 0.5), Tier::Hot);
        assert_eq!(assign_tier(1.0, 0, 0.9), Tier::Hot);
        assert_eq!(assign_tier(1.0, 0, 0.2), Tier::Warm);
        assert_eq!(assign_tier(30.0, 0, 0.5), Tier::Warm);
        assert_eq!(assign_tier(30.0, 0, 0.2), Tier::Cold);
        assert!(Tier::Hot.lambda() < Tier::Warm.lambda());
        assert!(Tier::Warm.lambda() < Tier::Cold.lambda());
    }

    #[test]
    fn test_dual_phase_retention_monotone() {
        let mut previous = dual_phase_retention(0.8, 0.0, 0.01);
        assert!((previous - 0.8).abs() < 1e-9);
        for day in 1..60 {
            let retained = dual_phase_retention(0.8, day as f64, 0.01);
            assert!(retained <= previous, "retention must not increase");
            previous = retained;
        }
    }

    #[test]
    fn test_decay_step_monotone_and_bounded() {
        // No time elapsed: f = 1, salience only amplified then clamped
        let (sal, f) = decay_step(0.5, 0, 0.0, LAMBDA_COLD);
        assert!((f - 1.0).abs() < 1e-9);
        assert!((sal - 0.5).abs() < 1e-9);

        // Old, inactive memory decays
        let (decayed, f) = decay_step(0.3, 0, 30.0, LAMBDA_COLD);
        assert!(decayed < 0.3);
        assert!(f < 0.7);

        // Coactivations slow the effective decay
        let (active, _) = decay_step(0.3, 20, 30.0, LAMBDA_COLD);
        assert!(active > decayed);

        for (sal, coact, days) in [(0.0, 0, 0.0), (1.0, 100, 365.0), (0.5, 3, 10.0)] {
            let (new_sal, f) = decay_step(sal, coact, days, LAMBDA_WARM);
            assert!((0.0..=1.0).contains(&new_sal));
            assert!((0.0..=1.0).contains(&f));
            assert!(new_sal <= effective_salience(sal, coact));
        }
    }

    #[test]
    fn test_reinforce_clamps() {
        assert_eq!(reinforce(0.5, 0.2), 0.7);
        assert_eq!(reinforce(0.95, 0.2), 1.0);
    }

    #[test]
    fn test_resonance_defaults_valid() {
        let matrix = ResonanceMatrix::default();
        for a in Sector::all() {
            for b in Sector::all() {
                let factor = matrix.factor(*a, *b);
                if a == b {
                    assert_eq!(factor, 1.0);
                } else {
                    assert!((0.2..=0.9).contains(&factor));
                }
            }
        }
        // Episodic and temporal resonate strongly both ways
        assert_eq!(
            matrix.factor(Sector::Episodic, Sector::Temporal),
            matrix.factor(Sector::Temporal, Sector::Episodic)
        );
    }

    #[test]
    fn test_resonance_validation() {
        let mut values = [[0.5; 8]; 8];
        for (i, row) in values.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        assert!(ResonanceMatrix::new(values).is_ok());

        values[0][1] = 0.1;
        assert!(ResonanceMatrix::new(values).is_err());
    }

    #[test]
    fn test_waypoint_weight_age_discount() {
        let fresh = waypoint_weight(0.9, 0.0);
        let month = waypoint_weight(0.9, 30.0);
        assert!((fresh - 0.9).abs() < 1e-9);
        assert!(month < fresh);
        assert!((month - 0.9 * (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_spread_zero_iterations_returns_seeds() {
        let adjacency = HashMap::from([(
            "a".to_string(),
            vec![("b".to_string(), 0.9)],
        )]);
        let result = spread_activation(&[("a".to_string(), 1.0)], &adjacency, 0);
        assert_eq!(result.len(), 1);
        assert_eq!(result["a"].energy, 1.0);
        assert_eq!(result["a"].path, vec!["a".to_string()]);
    }

    #[test]
    fn test_spread_attenuates_per_hop() {
        let adjacency = HashMap::from([
            ("a".to_string(), vec![("b".to_string(), 0.8)]),
            ("b".to_string(), vec![("c".to_string(), 0.8)]),
        ]);
        let result = spread_activation(&[("a".to_string(), 1.0)], &adjacency, 2);

        let b = &result["b"];
        assert!((b.energy - 0.8 * SPREAD_GAMMA).abs() < 1e-9);
        assert_eq!(b.path, vec!["a".to_string(), "b".to_string()]);

        let c = &result["c"];
        assert!((c.energy - 0.8 * SPREAD_GAMMA * 0.8 * SPREAD_GAMMA).abs() < 1e-9);
        assert_eq!(c.path.len(), 3);
    }

    #[test]
    fn test_spread_respects_energy_floor() {
        let adjacency = HashMap::from([("a".to_string(), vec![("b".to_string(), 0.05)])]);
        let result = spread_activation(&[("a".to_string(), 1.0)], &adjacency, 2);
        assert!(!result.contains_key("b"), "sub-floor energy must not propagate");
    }

    #[test]
    fn test_spread_depth_limit() {
        let adjacency = HashMap::from([
            ("a".to_string(), vec![("b".to_string(), 0.9)]),
            ("b".to_string(), vec![("c".to_string(), 0.9)]),
        ]);
        let result = spread_activation(&[("a".to_string(), 1.0)], &adjacency, 1);
        assert!(result.contains_key("b"));
        assert!(!result.contains_key("c"));
    }
}
