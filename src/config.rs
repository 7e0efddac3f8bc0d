//! Engine configuration
//!
//! One flat options struct with serde defaults, plus tier presets that
//! bundle vector dimension, cache sizing and encoder choice.

use serde::{Deserialize, Serialize};

/// Operating tier: presets for vector dimension, cache sizing and
/// encoder choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineTier {
    #[default]
    Fast,
    Smart,
    Deep,
    Hybrid,
}

impl std::str::FromStr for EngineTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(EngineTier::Fast),
            "smart" => Ok(EngineTier::Smart),
            "deep" => Ok(EngineTier::Deep),
            "hybrid" => Ok(EngineTier::Hybrid),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the SQLite database (":memory:" for tests)
    pub db_path: String,
    #[serde(default)]
    pub tier: EngineTier,
    /// Target vector dimension; must match the encoder
    #[serde(default = "default_vec_dim")]
    pub vec_dim: usize,
    /// Number of maintenance segments memories are sharded into
    #[serde(default = "default_cache_segments")]
    pub cache_segments: u32,
    /// Upper bound on concurrent foreground queries
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Parallelism for the decay worker
    #[serde(default = "default_decay_threads")]
    pub decay_threads: usize,
    /// Fraction of each segment processed per decay tick
    #[serde(default = "default_decay_ratio")]
    pub decay_ratio: f64,
    #[serde(default = "default_decay_interval")]
    pub decay_interval_minutes: u64,
    /// Retention factor below which fingerprinting kicks in
    #[serde(default = "default_cold_threshold")]
    pub decay_cold_threshold: f64,
    /// Boost salience on every query hit
    #[serde(default = "default_true")]
    pub decay_reinforce_on_query: bool,
    /// Re-embed cold memories back to live on query hit
    #[serde(default = "default_true")]
    pub regeneration_enabled: bool,
    #[serde(default = "default_max_vector_dim")]
    pub max_vector_dim: usize,
    #[serde(default = "default_min_vector_dim")]
    pub min_vector_dim: usize,
    /// Sleep between decay segments to bound CPU share
    #[serde(default = "default_decay_sleep_ms")]
    pub decay_sleep_ms: u64,
    /// Depth of extractive summaries (1-3)
    #[serde(default = "default_summary_layers")]
    pub summary_layers: u8,
    /// Minimum memories per tenant before reflection runs
    #[serde(default = "default_reflect_min")]
    pub reflect_min: usize,
    #[serde(default = "default_reflect_interval")]
    pub reflect_interval_minutes: u64,
    /// Master switch for the reflection worker
    #[serde(default = "default_true")]
    pub auto_reflect: bool,
    #[serde(default = "default_user_summary_interval")]
    pub user_summary_interval_minutes: u64,
    #[serde(default = "default_classifier_interval")]
    pub classifier_train_interval_minutes: u64,
    /// Top-K waypoints opened per new memory
    #[serde(default = "default_waypoint_k")]
    pub waypoint_k: usize,
    /// Passphrase the content key is derived from
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default)]
    pub verbose: bool,
}

fn default_vec_dim() -> usize {
    128
}

fn default_cache_segments() -> u32 {
    8
}

fn default_max_active() -> usize {
    32
}

fn default_decay_threads() -> usize {
    1
}

fn default_decay_ratio() -> f64 {
    0.2
}

fn default_decay_interval() -> u64 {
    10
}

fn default_cold_threshold() -> f64 {
    0.25
}

fn default_max_vector_dim() -> usize {
    1536
}

fn default_min_vector_dim() -> usize {
    32
}

fn default_decay_sleep_ms() -> u64 {
    5
}

fn default_summary_layers() -> u8 {
    2
}

fn default_reflect_min() -> usize {
    20
}

fn default_reflect_interval() -> u64 {
    10
}

fn default_user_summary_interval() -> u64 {
    30
}

fn default_classifier_interval() -> u64 {
    60
}

fn default_waypoint_k() -> usize {
    5
}

fn default_secret() -> String {
    "mnema-dev-secret".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{\"db_path\":\":memory:\"}").expect("default config")
    }
}

impl EngineConfig {
    /// In-memory config for tests
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Apply tier presets on top of whatever is already set
    pub fn with_tier(mut self, tier: EngineTier) -> Self {
        self.tier = tier;
        match tier {
            EngineTier::Fast => {
                self.vec_dim = 128;
                self.cache_segments = 8;
            }
            EngineTier::Smart => {
                self.vec_dim = 384;
                self.cache_segments = 16;
            }
            EngineTier::Deep => {
                self.vec_dim = 768;
                self.cache_segments = 32;
            }
            EngineTier::Hybrid => {
                self.vec_dim = 384;
                self.cache_segments = 16;
            }
        }
        self
    }

    /// Validate invariants between options
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::MnemaError;
        if self.vec_dim < self.min_vector_dim || self.vec_dim > self.max_vector_dim {
            return Err(MnemaError::Config(format!(
                "vec_dim {} outside [{}, {}]",
                self.vec_dim, self.min_vector_dim, self.max_vector_dim
            )));
        }
        if !(0.0..=1.0).contains(&self.decay_ratio) {
            return Err(MnemaError::Config(format!(
                "decay_ratio {} outside [0, 1]",
                self.decay_ratio
            )));
        }
        if self.cache_segments == 0 {
            return Err(MnemaError::Config("cache_segments must be > 0".to_string()));
        }
        if !(1..=3).contains(&self.summary_layers) {
            return Err(MnemaError::Config(format!(
                "summary_layers {} outside [1, 3]",
                self.summary_layers
            )));
        }
        Ok(())
    }
}
