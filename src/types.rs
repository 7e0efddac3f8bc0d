//! Core types for Mnema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a memory (opaque UUID string)
pub type MemoryId = String;

/// Tenant identifier. `None` is the system/global bucket.
pub type TenantId = Option<String>;

/// Cognitive sector a memory is routed into.
///
/// The set is closed: retrieval, decay rates and the resonance matrix
/// are all keyed by these eight labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sector {
    #[default]
    Semantic,
    Episodic,
    Procedural,
    Reflective,
    Emotional,
    Sensory,
    Temporal,
    Contextual,
}

impl Sector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Semantic => "semantic",
            Sector::Episodic => "episodic",
            Sector::Procedural => "procedural",
            Sector::Reflective => "reflective",
            Sector::Emotional => "emotional",
            Sector::Sensory => "sensory",
            Sector::Temporal => "temporal",
            Sector::Contextual => "contextual",
        }
    }

    pub fn all() -> &'static [Sector] {
        &[
            Sector::Semantic,
            Sector::Episodic,
            Sector::Procedural,
            Sector::Reflective,
            Sector::Emotional,
            Sector::Sensory,
            Sector::Temporal,
            Sector::Contextual,
        ]
    }

    /// Index into the 8x8 resonance matrix
    pub fn index(&self) -> usize {
        match self {
            Sector::Semantic => 0,
            Sector::Episodic => 1,
            Sector::Procedural => 2,
            Sector::Reflective => 3,
            Sector::Emotional => 4,
            Sector::Sensory => 5,
            Sector::Temporal => 6,
            Sector::Contextual => 7,
        }
    }

    /// Per-sector slow decay rate (per day)
    pub fn default_decay_lambda(&self) -> f64 {
        match self {
            Sector::Semantic => 0.008,
            Sector::Episodic => 0.02,
            Sector::Procedural => 0.005,
            Sector::Reflective => 0.004,
            Sector::Emotional => 0.015,
            Sector::Sensory => 0.03,
            Sector::Temporal => 0.025,
            Sector::Contextual => 0.018,
        }
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "semantic" => Ok(Sector::Semantic),
            "episodic" => Ok(Sector::Episodic),
            "procedural" => Ok(Sector::Procedural),
            "reflective" => Ok(Sector::Reflective),
            "emotional" => Ok(Sector::Emotional),
            "sensory" => Ok(Sector::Sensory),
            "temporal" => Ok(Sector::Temporal),
            "contextual" => Ok(Sector::Contextual),
            _ => Err(format!("Unknown sector: {}", s)),
        }
    }
}

/// Suffix appended to a sector name for compressed/fingerprint vectors
pub const COLD_SUFFIX: &str = "_cold";

/// Storage key for a sector vector: a live sector or its cold variant.
///
/// A memory holds exactly one of `live(primary)` / `cold(primary)`,
/// never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorKey {
    pub sector: Sector,
    pub cold: bool,
}

impl SectorKey {
    pub fn live(sector: Sector) -> Self {
        Self { sector, cold: false }
    }

    pub fn cold(sector: Sector) -> Self {
        Self { sector, cold: true }
    }

    /// Column form: `semantic` or `semantic_cold`
    pub fn as_string(&self) -> String {
        if self.cold {
            format!("{}{}", self.sector.as_str(), COLD_SUFFIX)
        } else {
            self.sector.as_str().to_string()
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if let Some(base) = s.strip_suffix(COLD_SUFFIX) {
            base.parse().ok().map(SectorKey::cold)
        } else {
            s.parse().ok().map(SectorKey::live)
        }
    }
}

/// Typed memory metadata with a catch-all for adapter-supplied fields
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryMetadata {
    /// Set when a reflection consumed this memory as a cluster source
    #[serde(default, skip_serializing_if = "is_false")]
    pub consolidated: bool,
    /// Source memory ids for a reflective memory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<MemoryId>,
    /// Kind marker (e.g. "auto_reflect")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Cluster size recorded by reflection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    /// ISO timestamp recorded by reflection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    /// IDE adapter fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ide_project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ide_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ide_event_type: Option<String>,
    /// Anything adapters attach that the core does not interpret
    #[serde(default, flatten)]
    pub extras: HashMap<String, serde_json::Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A memory row. `content` is stored encrypted; the plaintext only
/// exists transiently inside query and worker read paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub tenant_id: TenantId,
    /// Encrypted content (base64 nonce+ciphertext)
    pub content: String,
    pub primary_sector: Sector,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: MemoryMetadata,
    /// Maintenance shard, stable for the memory's lifetime
    pub segment: u32,
    /// 64-bit content simhash for near-duplicate detection
    pub simhash: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Current importance in [0,1]; decays over time, boosted on recall
    #[serde(default = "default_salience")]
    pub salience: f64,
    /// Per-sector slow decay rate
    pub decay_lambda: f64,
    /// Monotonic write version
    #[serde(default = "default_version")]
    pub version: i64,
    /// Anchor vector averaged across sector embeddings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mean_vec: Vec<f32>,
    /// Shrunken vector kept while the memory is cold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_vec: Option<Vec<f32>>,
    /// Times this memory was co-retrieved with others
    #[serde(default)]
    pub coactivations: i64,
    #[serde(default)]
    pub feedback_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_summary: Option<String>,
}

fn default_salience() -> f64 {
    0.5
}

fn default_version() -> i64 {
    1
}

/// Per-(memory, sector, tenant) vector store entry
#[derive(Debug, Clone)]
pub struct SectorVector {
    pub memory_id: MemoryId,
    pub sector: SectorKey,
    pub tenant_id: TenantId,
    pub vector: Vec<f32>,
    pub dim: usize,
    pub updated_at: DateTime<Utc>,
}

/// Directed associative edge between two memories of the same tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub src_id: MemoryId,
    pub dst_id: MemoryId,
    pub tenant_id: TenantId,
    /// Edge weight in [0,1]
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub last_traversed_at: DateTime<Utc>,
}

/// Temporal triple. The current fact for (subject, predicate, tenant)
/// is the row with `valid_to = NULL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub tenant_id: TenantId,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    /// Confidence in [0,1]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Typed relation between two memories or facts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation_type: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub weight: f64,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-tenant profile synthesized by the user summary worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub tenant_id: TenantId,
    pub summary: String,
    pub reflection_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted per-tenant linear classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub tenant_id: TenantId,
    /// Row-major [labels x dims]
    pub weights: Vec<Vec<f32>>,
    pub biases: Vec<f32>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Kind tag for maintenance log rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceKind {
    Decay,
    Reflect,
    Summary,
    Train,
    Prune,
    Error,
}

impl MaintenanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceKind::Decay => "decay",
            MaintenanceKind::Reflect => "reflect",
            MaintenanceKind::Summary => "summary",
            MaintenanceKind::Train => "train",
            MaintenanceKind::Prune => "prune",
            MaintenanceKind::Error => "error",
        }
    }
}

/// Append-only maintenance log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceStat {
    pub kind: MaintenanceKind,
    pub count: i64,
    pub ts: DateTime<Utc>,
}

/// Input for creating a new memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateMemoryInput {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: MemoryMetadata,
    /// Skip routing and force a primary sector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_hint: Option<Sector>,
}

/// Input for updating a memory. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<MemoryMetadata>,
}

/// Filter for hybrid search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Target sectors; empty means `semantic`
    #[serde(default)]
    pub sectors: Vec<Sector>,
    pub min_salience: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Run spreading activation after the merge (1-2 hops)
    #[serde(default)]
    pub spread: bool,
}

/// One hybrid search match with decrypted content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    pub id: MemoryId,
    pub content: String,
    pub score: f64,
    /// All sectors this memory carries vectors for
    pub sectors: Vec<String>,
    pub primary_sector: Sector,
    /// Ids traversed when spreading activation reached this match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<MemoryId>,
    pub salience: f64,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decay_lambda: f64,
    pub version: i64,
    pub segment: u32,
    pub simhash: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_summary: Option<String>,
}

/// Aggregate store statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineStats {
    pub total_memories: i64,
    pub total_vectors: i64,
    pub total_waypoints: i64,
    pub total_facts: i64,
    pub memories_by_sector: HashMap<String, i64>,
    pub memories_by_tenant: HashMap<String, i64>,
    pub maintenance_tail: Vec<MaintenanceStat>,
}
