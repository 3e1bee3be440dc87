//! # ragweave: multi-tenant retrieval-augmented question answering
//!
//! Two pipelines share this crate's ambient infrastructure (event bus,
//! telemetry, error taxonomy, settings):
//!
//! - **Ingestion**: a durable per-document state machine (queue → parse →
//!   PII/DQ → enrich → chunk+embed → index+publish → complete/fail) gated by
//!   a stage ledger so retries never redo finished work.
//! - **Query orchestration**: plan → hybrid retrieve (BM25 + kNN + rerank) →
//!   optional Monte-Carlo risk simulation → synthesize, with an evidence gate
//!   and a structured response envelope.
//!
//! ## Module Guide
//!
//! - [`config`] - process-wide settings, threaded explicitly via `Arc`
//! - [`error`] - crate-wide error taxonomy
//! - [`model`] - durable record types (manifest, chunk, vector, ...)
//! - [`storage`] - object store facade over the tenant/landing/ingest layout
//! - [`state_store`] - sqlite-backed manifest/ledger/chunk/vector store
//! - [`extractor`] - text extraction and normalization
//! - [`pii_dq`] - PII detection and data-quality checks
//! - [`chunker`] - semantic chunking
//! - [`embedder`] - embedding provider chain with fallback
//! - [`ingestion`] - the ingestion stage machine
//! - [`retriever`] - hybrid BM25 + kNN + rerank retrieval
//! - [`memory`] - per-thread bounded conversation memory
//! - [`risk`] - Monte-Carlo risk simulation with signature-keyed caching
//! - [`llm`] - chat-completion client
//! - [`planner`] - query planning (need_rag / need_risk / sub-queries)
//! - [`synthesizer`] - evidence-gated answer synthesis with citations
//! - [`orchestrator`] - the query orchestration pipeline
//! - [`server`] - HTTP surface (feature `server`)
//! - [`event_bus`] - pub/sub telemetry bus
//! - [`worker`] - ingestion broker queue and worker pool
//! - [`channels`] - error event types shared across stages
//! - [`message`] - chat message type
//! - [`metadata`] - dynamic metadata bag
//! - [`types`] - shared small enums (`NodeKind`)
//! - [`telemetry`] - tracing subscriber wiring and formatters

pub mod channels;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod event_bus;
pub mod extractor;
pub mod ingestion;
pub mod llm;
pub mod memory;
pub mod message;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod pii_dq;
pub mod planner;
pub mod retriever;
pub mod risk;
#[cfg(feature = "server")]
pub mod server;
pub mod state_store;
pub mod storage;
pub mod synthesizer;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod worker;
