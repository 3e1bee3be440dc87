//! Core data model: the durable record types written to and read from the
//! state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::MetadataBag;

/// One per ingested object. Immutable except for metadata merges by later
/// stages; destroyed only by explicit delete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub ingest_id: Uuid,
    pub tenant_id: String,
    pub source: Option<String>,
    pub object_key: String,
    pub object_suffix: String,
    pub original_basename: String,
    pub doc_type: Option<String>,
    /// SHA-256 hex over the raw bytes.
    pub checksum: String,
    pub size: u64,
    pub mime: Option<String>,
    pub uploader: Option<String>,
    pub labels: Vec<String>,
    pub metadata: MetadataBag,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl IngestionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Exactly one row per ingest_id; status is monotonic except that
/// Completed/Failed are terminal (absorbing) states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionState {
    pub ingest_id: Uuid,
    pub tenant_id: String,
    pub status: IngestionStatus,
    pub stage: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub dlq_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionState {
    pub fn queued(ingest_id: Uuid, tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            ingest_id,
            tenant_id: tenant_id.into(),
            status: IngestionStatus::Queued,
            stage: "queued".to_string(),
            started_at: None,
            finished_at: None,
            error: None,
            dlq_reason: None,
            updated_at: now,
        }
    }
}

/// A contiguous word-bounded window of a document's extracted text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable hash of `doc_id ∥ index ∥ text` (SHA-1, per the chunk_embed
    /// stage contract). Upsert is keyed on this id.
    pub chunk_id: String,
    pub doc_id: Uuid,
    pub tenant_id: String,
    pub text: String,
    pub lang: Option<String>,
    pub token_count: usize,
    pub section_path: Option<String>,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub is_table: bool,
    pub chunk_index: usize,
    pub metadata: MetadataBag,
}

/// A fixed-dimension embedding for exactly one chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vector {
    pub chunk_id: String,
    pub tenant_id: String,
    pub doc_id: Uuid,
    pub embedding: Vec<f32>,
    pub metadata: MetadataBag,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DQReport {
    pub ingest_id: Uuid,
    pub tenant_id: String,
    pub results: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl DQReport {
    pub fn all_passed(&self) -> bool {
        self.results
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .all(|(_, v)| v.as_bool().unwrap_or(false))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PIIReport {
    pub ingest_id: Uuid,
    pub tenant_id: String,
    /// Per-entity-type counts plus `_total` and `_action` aggregates.
    pub results: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl PIIReport {
    pub fn total(&self) -> u64 {
        self.results
            .get("_total")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

/// Lineage node kind: `stage:<name>:completed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineageNode {
    pub ingest_id: Uuid,
    pub kind: String,
}

impl LineageNode {
    pub fn stage_completed(ingest_id: Uuid, stage: &str) -> Self {
        Self {
            ingest_id,
            kind: format!("stage:{stage}:completed"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineageEdge {
    pub parent: Uuid,
    pub child: Uuid,
}

/// One turn of a conversation, held in a per-thread bounded deque.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub user: String,
    pub assistant: String,
    pub approx_tokens: usize,
}

impl MemoryTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        let user = user.into();
        let assistant = assistant.into();
        let approx_tokens = approx_token_count(&user) + approx_token_count(&assistant);
        Self {
            user,
            assistant,
            approx_tokens,
        }
    }
}

pub fn approx_token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RiskSpec {
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub trials: Option<serde_json::Value>,
    pub scenario_notes: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanArtifact {
    #[serde(rename = "needRag")]
    pub need_rag: bool,
    #[serde(rename = "needRisk")]
    pub need_risk: bool,
    #[serde(rename = "ragQueries")]
    pub rag_queries: Vec<String>,
    #[serde(rename = "riskSpec")]
    pub risk_spec: Option<RiskSpec>,
    pub expected: Vec<String>,
    pub confidence: f32,
}

impl PlanArtifact {
    pub fn default_no_evidence() -> Self {
        Self {
            need_rag: false,
            need_risk: false,
            rag_queries: Vec::new(),
            risk_spec: None,
            expected: Vec::new(),
            confidence: 0.0,
        }
    }

    pub fn clamp_confidence(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskResult {
    /// Hex of SHA-256 over `{spec, data_version}`.
    pub signature: String,
    pub result: Option<serde_json::Value>,
    pub version: String,
    pub cache_hit: bool,
    pub error: Option<String>,
}
