//! Process-wide configuration, constructed once at startup and threaded
//! through every component by explicit `Arc<Settings>` injection.

use std::time::Duration;

/// Embedding/LLM provider selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProviderKind {
    Ollama,
    OpenAi,
    Local,
    Auto,
}

impl EmbeddingProviderKind {
    fn from_env(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "ollama" => Self::Ollama,
            "openai" => Self::OpenAi,
            "local" => Self::Local,
            _ => Self::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub bucket: String,
    pub index_name: String,
    pub embedding_provider: EmbeddingProviderKind,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub rag_score_threshold: f32,
    pub rag_min_docs: usize,
    pub max_context_chunks: usize,
    pub vector_top_k: usize,
    pub vector_min_score: f32,
    pub per_doc_cap: usize,
    pub default_max_tokens: usize,
    pub default_overlap_tokens: usize,
    pub embedding_batch_size: usize,
    pub risk_min_trials: u32,
    pub risk_max_trials: u32,
    pub memory_capacity: usize,
    pub memory_token_cap: usize,
    pub summary_update_every: u64,
    pub summary_cap_chars: usize,
    pub ocr_enabled: bool,
    pub allowed_model_id: String,
    pub docs_base_url: String,
    pub sqlite_db_name: String,
    pub ingestion_worker_concurrency: usize,
    pub ingestion_worker_recycle_after: u64,
    pub retrieval_timeout: Duration,
    pub embedding_timeout: Duration,
    pub llm_timeout: Duration,
    pub simulator_timeout: Duration,
    pub target_latency_ms: TargetLatencies,
}

#[derive(Clone, Copy, Debug)]
pub struct TargetLatencies {
    pub llm_only_ms: u64,
    pub rag_ms: u64,
    pub risk_ms: u64,
    pub rag_risk_ms: u64,
}

impl Default for TargetLatencies {
    fn default() -> Self {
        Self {
            llm_only_ms: 2_000,
            rag_ms: 4_000,
            risk_ms: 6_000,
            rag_risk_ms: 8_000,
        }
    }
}

impl Settings {
    /// Build settings from environment variables, falling back to defaults.
    /// Mirrors the teacher's `RuntimeConfig::resolve_sqlite_db_name` pattern:
    /// `dotenvy::dotenv()` first, then typed `std::env::var` reads.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            bucket: env_string("OBJECT_STORE_BUCKET", "ragweave"),
            index_name: env_string("INDEX_NAME", "rag-chunks"),
            embedding_provider: EmbeddingProviderKind::from_env(&env_string(
                "EMBEDDING_PROVIDER",
                "auto",
            )),
            embedding_model: env_string("EMBEDDING_MODEL", "nomic-embed-text"),
            embedding_dim: env_usize("EMBEDDING_DIM", 768),
            rag_score_threshold: env_f32("RAG_SCORE_THRESHOLD", 0.18),
            rag_min_docs: env_usize("RAG_MIN_DOCS", 3),
            max_context_chunks: env_usize("MAX_CONTEXT_CHUNKS", 5),
            vector_top_k: env_usize("VECTOR_TOP_K", 12),
            vector_min_score: env_f32("VECTOR_MIN_SCORE", 0.0),
            per_doc_cap: env_usize("PER_DOC_CAP", 2),
            default_max_tokens: env_usize("CHUNK_MAX_TOKENS", 256),
            default_overlap_tokens: env_usize("CHUNK_OVERLAP_TOKENS", 32),
            embedding_batch_size: env_usize("EMBEDDING_BATCH_SIZE", 16),
            risk_min_trials: env_u32("RISK_MIN_TRIALS", 100),
            risk_max_trials: env_u32("RISK_MAX_TRIALS", 50_000),
            memory_capacity: env_usize("MEMORY_CAPACITY", 40),
            memory_token_cap: env_usize("MEMORY_TOKEN_CAP", 1_200),
            summary_update_every: env_u64("MEMORY_SUMMARY_EVERY", 5),
            summary_cap_chars: env_usize("MEMORY_SUMMARY_CAP_CHARS", 2_000),
            ocr_enabled: env_bool("OCR_ENABLED", false),
            allowed_model_id: env_string("LLM_ALLOWED_MODEL", "gpt-4o-mini"),
            docs_base_url: env_string("DOCS_BASE_URL", "https://docs.internal/view"),
            sqlite_db_name: env_string("SQLITE_DB_NAME", "ragweave.db"),
            ingestion_worker_concurrency: env_usize("INGESTION_WORKERS", 4),
            ingestion_worker_recycle_after: env_u64("INGESTION_WORKER_RECYCLE_AFTER", 500),
            retrieval_timeout: Duration::from_millis(env_u64("RETRIEVAL_TIMEOUT_MS", 3_000)),
            embedding_timeout: Duration::from_millis(env_u64("EMBEDDING_TIMEOUT_MS", 5_000)),
            llm_timeout: Duration::from_millis(env_u64("LLM_TIMEOUT_MS", 15_000)),
            simulator_timeout: Duration::from_millis(env_u64("SIMULATOR_TIMEOUT_MS", 10_000)),
            target_latency_ms: TargetLatencies::default(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // SAFETY: tests are single-threaded within this module; no other test
        // touches these env vars.
        unsafe {
            std::env::remove_var("RAG_SCORE_THRESHOLD");
        }
        let settings = Settings::from_env();
        assert_eq!(settings.rag_score_threshold, 0.18);
        assert_eq!(settings.per_doc_cap, 2);
        assert_eq!(settings.rag_min_docs, 3);
    }
}
