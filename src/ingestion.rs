//! The ingestion coordinator: an explicit stage machine.
//!
//! Each stage function takes `(ingest_id, canonical)` and returns
//! `(canonical', NextAction)`. The coordinator owns retries and ledger
//! checks — a stage never has to remember whether it already ran.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::chunker::{build_chunks, ChunkStrategy};
use crate::config::Settings;
use crate::embedder::FallbackEmbedder;
use crate::error::{RagError, RagResult};
use crate::extractor::ExtractorRegistry;
use crate::metadata::MetadataBag;
use crate::model::{DQReport, IngestionStatus, PIIReport, Vector};
use crate::pii_dq::{apply_pii, run_dq, DqOptions, PiiAction, PiiAnalyzer, PiiPolicy};
use crate::state_store::StateStore;
use crate::storage::{object_key, ObjectArea, ObjectStore};

/// The `redacted/<basename>.txt` suffix (spec §4.1), shared by the write in
/// `pii_dq` and the matching delete in `delete_ingest` so the two never drift.
fn redacted_object_suffix(original_basename: &str) -> String {
    let stem = original_basename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(original_basename);
    format!("redacted/{stem}.txt")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ParseNormalize,
    PiiDq,
    Enrich,
    ChunkEmbed,
    IndexPublish,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::ParseNormalize => "parse_normalize",
            Self::PiiDq => "pii_dq",
            Self::Enrich => "enrich",
            Self::ChunkEmbed => "chunk_embed",
            Self::IndexPublish => "index_publish",
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Self::ParseNormalize => Some(Self::PiiDq),
            Self::PiiDq => Some(Self::Enrich),
            Self::Enrich => Some(Self::ChunkEmbed),
            Self::ChunkEmbed => Some(Self::IndexPublish),
            Self::IndexPublish => None,
        }
    }
}

#[derive(Debug)]
pub enum NextAction {
    Enqueue(Stage),
    Fail(String),
    Done,
}

/// The canonical payload threaded between stages (spec §4.10's `canonical`).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Canonical {
    pub text: String,
    pub mime: Option<String>,
    pub doc_id: Uuid,
    pub tenant_id: String,
    pub lang: Option<String>,
    pub doc_type: String,
    pub owner: String,
    pub ingested_at: chrono::DateTime<Utc>,
    pub chunk_strategy: ChunkStrategyOverride,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub tables: bool,
    #[serde(default)]
    pub ocr_confidence: Option<f32>,
    pub metadata: MetadataBag,
    #[serde(default)]
    pub options: Value,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ChunkStrategyOverride {
    pub max_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
}

/// What a stage did: either it produced a (possibly updated) canonical
/// payload to carry forward, or it failed outright. `index_publish` is the
/// only stage with nothing left to carry, hence `Option`.
enum StageOutcome {
    Continue(Option<Canonical>),
    Failed(String),
}

/// What running one stage produced: the coordinator's next move, plus the
/// canonical payload to hand to whichever stage runs next.
pub struct StageRun {
    pub action: NextAction,
    pub canonical: Option<Canonical>,
}

pub struct IngestionCoordinator {
    pub settings: Arc<Settings>,
    pub store: StateStore,
    pub object_store: Arc<dyn ObjectStore>,
    pub extractors: ExtractorRegistry,
    pub embedder: FallbackEmbedder,
}

impl IngestionCoordinator {
    /// Runs one stage for `ingest_id`. Reads the manifest; if absent, logs
    /// and returns `Ok(None)` (no state change). Otherwise sets
    /// `PROCESSING(stage)`, performs the stage's work, marks the ledger,
    /// and returns the next action plus the canonical to carry forward.
    pub async fn run_stage(
        &self,
        ingest_id: Uuid,
        stage: Stage,
        canonical: Option<Canonical>,
    ) -> RagResult<Option<StageRun>> {
        let manifest = match self.store.get_manifest(ingest_id).await {
            Ok(m) => m,
            Err(_) => {
                tracing::warn!(%ingest_id, "stage invoked for unknown manifest, skipping");
                return Ok(None);
            }
        };

        if self.store.is_stage_done(ingest_id, stage.name()).await? {
            let action = stage.next().map(NextAction::Enqueue).unwrap_or(NextAction::Done);
            return Ok(Some(StageRun { action, canonical }));
        }

        self.store
            .transition(ingest_id, stage.name(), IngestionStatus::Processing, None)
            .await?;

        let outcome = match stage {
            Stage::ParseNormalize => self.parse_normalize(ingest_id, &manifest).await?,
            Stage::PiiDq => {
                let canonical = canonical.clone().ok_or_else(|| {
                    RagError::Invariant("pii_dq requires canonical payload from parse_normalize".to_string())
                })?;
                self.pii_dq(ingest_id, &manifest, canonical).await?
            }
            Stage::Enrich => {
                let canonical = canonical.clone().ok_or_else(|| {
                    RagError::Invariant("enrich requires canonical payload".to_string())
                })?;
                StageOutcome::Continue(Some(self.enrich(canonical)))
            }
            Stage::ChunkEmbed => {
                let canonical = canonical.clone().ok_or_else(|| {
                    RagError::Invariant("chunk_embed requires canonical payload".to_string())
                })?;
                self.chunk_embed(ingest_id, &manifest, canonical).await?
            }
            Stage::IndexPublish => self.index_publish(ingest_id).await?,
        };

        match outcome {
            StageOutcome::Continue(next_canonical) => {
                // Lineage node first: it's idempotent (ON CONFLICT DO NOTHING), so a
                // crash between the two writes just means this stage retries and
                // re-inserts the same row, rather than the ledger marking the stage
                // done while the lineage record silently never lands.
                self.store
                    .put_lineage_node(&crate::model::LineageNode::stage_completed(ingest_id, stage.name()))
                    .await?;
                self.store.mark_stage_done(ingest_id, stage.name()).await?;
                let action = stage.next().map(NextAction::Enqueue).unwrap_or(NextAction::Done);
                Ok(Some(StageRun {
                    action,
                    canonical: next_canonical,
                }))
            }
            StageOutcome::Failed(reason) => {
                if self.store.is_stage_done(ingest_id, stage.name()).await? {
                    // Already completed by a concurrent retry; don't double-fail.
                    let action = stage.next().map(NextAction::Enqueue).unwrap_or(NextAction::Done);
                    return Ok(Some(StageRun { action, canonical }));
                }
                self.store
                    .transition(ingest_id, stage.name(), IngestionStatus::Failed, Some(reason.clone()))
                    .await?;
                Ok(Some(StageRun {
                    action: NextAction::Fail(reason),
                    canonical,
                }))
            }
        }
    }

    async fn parse_normalize(
        &self,
        ingest_id: Uuid,
        manifest: &crate::model::Manifest,
    ) -> RagResult<StageOutcome> {
        let raw_key = object_key(&manifest.tenant_id, ObjectArea::Landing, ingest_id, "raw");
        let bytes = self.object_store.get(&raw_key).await?;
        let doc_type = manifest.doc_type.clone().unwrap_or_else(|| "text".to_string());
        let extracted = match self
            .extractors
            .extract(&doc_type, &bytes, self.settings.ocr_enabled)
            .await
        {
            Ok(doc) => doc,
            Err(e) => return Ok(StageOutcome::Failed(e.to_string())),
        };
        let text = extracted.full_text();
        let lang = if text.chars().count() >= 20 {
            extracted.detected_lang.clone()
        } else {
            None
        };

        let canonical = Canonical {
            text,
            mime: manifest.mime.clone(),
            doc_id: ingest_id,
            tenant_id: manifest.tenant_id.clone(),
            lang,
            doc_type,
            owner: manifest.uploader.clone().unwrap_or_else(|| "system".to_string()),
            ingested_at: Utc::now(),
            chunk_strategy: ChunkStrategyOverride::default(),
            pages: None,
            tables: extracted.blocks.iter().any(|b| b.is_table),
            ocr_confidence: None,
            metadata: manifest.metadata.clone(),
            options: Value::Null,
        };
        Ok(StageOutcome::Continue(Some(canonical)))
    }

    async fn pii_dq(
        &self,
        ingest_id: Uuid,
        manifest: &crate::model::Manifest,
        mut canonical: Canonical,
    ) -> RagResult<StageOutcome> {
        let options = canonical.options.get("dq").cloned().unwrap_or(Value::Null);
        let ingest_options = canonical.options.get("ingest").cloned().unwrap_or(Value::Null);

        let action_raw = options
            .pointer("/pii/action")
            .and_then(Value::as_str)
            .unwrap_or("redact");
        let mask = options
            .pointer("/pii/mask")
            .and_then(Value::as_str)
            .unwrap_or("[REDACTED]")
            .to_string();
        let action = PiiAction::from_str(action_raw);

        let analyzer = PiiAnalyzer::default();
        let policy = PiiPolicy::default();
        let pii_outcome = apply_pii(&canonical.text, &analyzer, &policy, Some(action), &mask);

        let fail_on_pii = ingest_options
            .get("fail_on_pii")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let total: u64 = pii_outcome
            .report
            .get("_total")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let pii_report = PIIReport {
            ingest_id,
            tenant_id: canonical.tenant_id.clone(),
            results: pii_outcome.report.clone(),
            created_at: Utc::now(),
        };
        self.store.put_pii_report(&pii_report).await?;

        if (fail_on_pii || action.is_blocking()) && total > 0 {
            return Ok(StageOutcome::Failed("PII policy violation".to_string()));
        }

        if total > 0 && matches!(action, PiiAction::Redact | PiiAction::Hash) {
            let redacted_key = object_key(
                &canonical.tenant_id,
                ObjectArea::Landing,
                ingest_id,
                &redacted_object_suffix(&manifest.original_basename),
            );
            self.object_store
                .put(&redacted_key, Bytes::from(pii_outcome.text.clone()))
                .await?;
            canonical.metadata.set_extra("redacted_object_key", json!(redacted_key));
        }
        canonical.text = pii_outcome.text;

        let skip: Vec<String> = options
            .get("skip")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let dq_options = DqOptions {
            language_detect: options
                .get("language_detect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ocr_confidence: canonical.ocr_confidence,
            ocr_conf_min: 0.5,
            skip,
        };
        let (passed, dq_results) = run_dq(&canonical.text, canonical.lang.as_deref(), &dq_options);
        self.store
            .put_dq_report(&DQReport {
                ingest_id,
                tenant_id: canonical.tenant_id.clone(),
                results: dq_results,
                created_at: Utc::now(),
            })
            .await?;

        let continue_on_warn = ingest_options
            .get("continue_on_warn")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !passed {
            if continue_on_warn {
                canonical.metadata.set_extra("dq_warning", json!(true));
            } else {
                return Ok(StageOutcome::Failed("DQ checks failed".to_string()));
            }
        }

        Ok(StageOutcome::Continue(Some(canonical)))
    }

    /// Stub per the contract: language re-detect plus placeholder
    /// keyphrases/entities. Not load-bearing downstream.
    fn enrich(&self, mut canonical: Canonical) -> Canonical {
        let keyphrases: Vec<&str> = canonical.text.split_whitespace().take(5).collect();
        canonical
            .metadata
            .set_extra("keyphrases", json!(keyphrases));
        canonical.metadata.set_extra("entities", json!([]));
        canonical
    }

    async fn chunk_embed(
        &self,
        ingest_id: Uuid,
        manifest: &crate::model::Manifest,
        mut canonical: Canonical,
    ) -> RagResult<StageOutcome> {
        let strategy = ChunkStrategy::new(
            canonical.chunk_strategy.max_tokens.unwrap_or(self.settings.default_max_tokens),
            canonical
                .chunk_strategy
                .overlap_tokens
                .unwrap_or(self.settings.default_overlap_tokens),
        );

        let mut chunk_metadata = manifest.metadata.clone();
        chunk_metadata.merge(&canonical.metadata);
        chunk_metadata.strip_paths();
        chunk_metadata.object = Some(manifest.object_key.clone());
        chunk_metadata.object_suffix = Some(manifest.object_suffix.clone());
        chunk_metadata.original_basename = Some(manifest.original_basename.clone());
        chunk_metadata.filename = Some(manifest.original_basename.clone());
        let raw_uri = format!(
            "{}/{}/landing/{}/raw/{}",
            self.settings.bucket, canonical.tenant_id, ingest_id, manifest.object_suffix
        );
        chunk_metadata.set_extra("raw_uri", json!(raw_uri));

        let chunks = build_chunks(
            ingest_id,
            &canonical.tenant_id,
            &canonical.text,
            strategy,
            canonical.lang.clone(),
            None,
            canonical.tables,
            &chunk_metadata,
        );
        self.store.upsert_chunks(&chunks).await?;
        canonical.metadata = chunk_metadata;
        Ok(StageOutcome::Continue(Some(canonical)))
    }

    async fn index_publish(&self, ingest_id: Uuid) -> RagResult<StageOutcome> {
        let chunks = self.store.chunks_for_doc(ingest_id).await?;
        if chunks.is_empty() {
            return Ok(StageOutcome::Continue(None));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = match self.embedder.embed_all(&texts).await {
            Ok(e) => e,
            Err(e) => return Ok(StageOutcome::Failed(e.to_string())),
        };
        if embeddings.len() != chunks.len() {
            return Err(RagError::Invariant(
                "chunk/embedding count mismatch".to_string(),
            ));
        }
        let vectors: Vec<Vector> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| Vector {
                chunk_id: chunk.chunk_id.clone(),
                tenant_id: chunk.tenant_id.clone(),
                doc_id: chunk.doc_id,
                embedding,
                metadata: chunk.metadata.clone(),
            })
            .collect();
        self.store.upsert_vectors(&vectors).await?;
        Ok(StageOutcome::Continue(None))
    }

    /// Cascading delete per the deletion contract: state-store rows first,
    /// then the object-store prefix (index document removal is the lexical
    /// index's own `delete_by_query` contract, invoked by the caller).
    pub async fn delete_ingest(&self, ingest_id: Uuid, tenant_id: &str) -> RagResult<()> {
        let basename = self.store.get_manifest(ingest_id).await.ok().map(|m| m.original_basename);
        self.store.delete_ingest_rows(ingest_id).await?;

        let mut keys = vec![
            object_key(tenant_id, ObjectArea::Landing, ingest_id, "raw"),
            object_key(tenant_id, ObjectArea::Landing, ingest_id, "metadata/manifest.json"),
        ];
        if let Some(basename) = basename {
            keys.push(object_key(
                tenant_id,
                ObjectArea::Landing,
                ingest_id,
                &redacted_object_suffix(&basename),
            ));
        }
        for key in keys {
            let _ = self.object_store.delete(&key).await;
        }
        Ok(())
    }

    /// Writes the raw object and manifest for a freshly uploaded file and
    /// queues it at `parse_normalize`. Returns the new ingest_id.
    pub async fn submit(&self, upload: NewUpload) -> RagResult<Uuid> {
        let ingest_id = Uuid::new_v4();
        let raw_key = object_key(&upload.tenant_id, ObjectArea::Landing, ingest_id, "raw");

        let checksum = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(upload.file_bytes.as_ref());
            hex::encode(hasher.finalize())
        };
        self.object_store.put(&raw_key, upload.file_bytes).await?;

        let basename = if upload.original_basename.trim().is_empty() {
            "upload.bin".to_string()
        } else {
            upload.original_basename.clone()
        };

        let manifest = crate::model::Manifest {
            ingest_id,
            tenant_id: upload.tenant_id.clone(),
            source: upload.source,
            object_key: raw_key,
            object_suffix: "raw".to_string(),
            original_basename: basename,
            doc_type: upload.doc_type,
            checksum,
            size: upload.size,
            mime: upload.mime,
            uploader: upload.uploader,
            labels: upload.labels,
            metadata: upload.metadata,
            created_at: Utc::now(),
        };
        let manifest_key = object_key(&upload.tenant_id, ObjectArea::Landing, ingest_id, "metadata/manifest.json");
        self.object_store
            .put(&manifest_key, Bytes::from(serde_json::to_vec(&manifest)?))
            .await?;
        self.store.put_manifest(&manifest).await?;
        self.store
            .put_ingestion_state(&crate::model::IngestionState::queued(ingest_id, &upload.tenant_id))
            .await?;
        Ok(ingest_id)
    }

    /// Registers an object that already landed in the bucket out-of-band
    /// (a storage-backend notification) rather than one uploaded through
    /// `submit`. No bytes move; the manifest just points at `object_key`.
    pub async fn submit_existing_object(
        &self,
        tenant_id: &str,
        object_key: &str,
        size: u64,
    ) -> RagResult<Uuid> {
        let ingest_id = Uuid::new_v4();
        let basename = object_key
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("object.bin")
            .to_string();
        let manifest = crate::model::Manifest {
            ingest_id,
            tenant_id: tenant_id.to_string(),
            source: Some("webhook".to_string()),
            object_key: object_key.to_string(),
            object_suffix: "raw".to_string(),
            original_basename: basename,
            doc_type: None,
            checksum: String::new(),
            size,
            mime: None,
            uploader: None,
            labels: Vec::new(),
            metadata: MetadataBag::default(),
            created_at: Utc::now(),
        };
        let manifest_key =
            crate::storage::object_key(tenant_id, ObjectArea::Landing, ingest_id, "metadata/manifest.json");
        self.object_store
            .put(&manifest_key, Bytes::from(serde_json::to_vec(&manifest)?))
            .await?;
        self.store.put_manifest(&manifest).await?;
        self.store
            .put_ingestion_state(&crate::model::IngestionState::queued(ingest_id, tenant_id))
            .await?;
        Ok(ingest_id)
    }
}

/// Fields required to start a new ingest, assembled by the HTTP layer from a
/// multipart upload.
pub struct NewUpload {
    pub tenant_id: String,
    pub source: Option<String>,
    pub doc_type: Option<String>,
    pub original_basename: String,
    pub mime: Option<String>,
    pub uploader: Option<String>,
    pub labels: Vec<String>,
    pub metadata: MetadataBag,
    pub size: u64,
    pub file_bytes: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_chain_follows_the_contracted_order() {
        assert_eq!(Stage::ParseNormalize.next(), Some(Stage::PiiDq));
        assert_eq!(Stage::PiiDq.next(), Some(Stage::Enrich));
        assert_eq!(Stage::Enrich.next(), Some(Stage::ChunkEmbed));
        assert_eq!(Stage::ChunkEmbed.next(), Some(Stage::IndexPublish));
        assert_eq!(Stage::IndexPublish.next(), None);
    }
}
