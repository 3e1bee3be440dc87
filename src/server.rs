//! HTTP surface (named at its contract only — route shapes and request and
//! response schemas, not a hardened production front end).
//!
//! Delegates every request straight to [`crate::ingestion::IngestionCoordinator`]
//! or [`crate::orchestrator::QueryOrchestrator`]; this module owns nothing
//! but routing, request parsing, and error-to-status mapping.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::embedder::EmbeddingProvider;
use crate::error::RagError;
use crate::ingestion::{IngestionCoordinator, NewUpload};
use crate::llm::LlmProvider;
use crate::metadata::MetadataBag;
use crate::orchestrator::QueryOrchestrator;
use crate::retriever::{LexicalIndex, Reranker, VectorIndex};
use crate::storage::ObjectStore;
use crate::worker::Broker;

pub struct AppState<L, V, E, R, P> {
    pub ingestion: Arc<IngestionCoordinator>,
    pub broker: Arc<Broker>,
    pub orchestrator: Arc<QueryOrchestrator<L, V, E, R, P>>,
    webhook_seen: Mutex<HashSet<String>>,
}

impl<L, V, E, R, P> AppState<L, V, E, R, P> {
    pub fn new(
        ingestion: Arc<IngestionCoordinator>,
        broker: Arc<Broker>,
        orchestrator: Arc<QueryOrchestrator<L, V, E, R, P>>,
    ) -> Self {
        Self {
            ingestion,
            broker,
            orchestrator,
            webhook_seen: Mutex::new(HashSet::new()),
        }
    }
}

pub fn router<L, V, E, R, P>(state: Arc<AppState<L, V, E, R, P>>) -> Router
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/v1/ingest", post(ingest::<L, V, E, R, P>))
        .route("/v1/status/{ingest_id}", get(status::<L, V, E, R, P>))
        .route("/v1/ingestions", get(list_ingestions::<L, V, E, R, P>))
        .route("/v1/reindex", post(reindex::<L, V, E, R, P>))
        .route("/v1/ingest/{ingest_id}", delete(delete_ingest::<L, V, E, R, P>))
        .route("/v1/files/presign", get(presign::<L, V, E, R, P>))
        .route("/webhook/minio", post(webhook_minio::<L, V, E, R, P>))
        .route("/v1/query", post(query::<L, V, E, R, P>))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Wraps [`RagError`] for the §7 taxonomy's HTTP mapping: Validation → 400,
/// DependencyUnavailable → 502, PolicyReject → 422, NotFound → 404,
/// everything else → 500.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::DependencyUnavailable { .. } => StatusCode::BAD_GATEWAY,
            RagError::PolicyReject(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, message.into())
}

// ---- POST /v1/ingest ----

async fn ingest<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    let mut tenant_id: Option<String> = None;
    let mut source: Option<String> = None;
    let mut doc_type: Option<String> = None;
    let mut metadata = MetadataBag::default();
    let mut labels: Vec<String> = Vec::new();
    let mut uploader: Option<String> = None;
    let mut basename: Option<String> = None;
    let mut mime: Option<String> = None;
    let mut file_bytes: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "tenant_id" => {
                tenant_id = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?)
            }
            "source" => source = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?),
            "doc_type" => {
                doc_type = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?)
            }
            "uploader" => {
                uploader = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?)
            }
            "labels" => {
                let text = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                labels = serde_json::from_str(&text).unwrap_or_else(|_| {
                    text.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
                });
            }
            "metadata" => {
                let text = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| bad_request(format!("invalid metadata JSON: {e}")))?;
                metadata = MetadataBag::from_value(value);
            }
            "options" => {
                // Accepted at the contract level; per-stage consumption
                // happens inside the stage machine, not at the HTTP seam.
                let _ = field.text().await.map_err(|e| bad_request(e.to_string()))?;
            }
            "object" | "file" => {
                basename = field.file_name().map(|s| s.to_string());
                mime = field.content_type().map(|s| s.to_string());
                let data = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
                file_bytes = Some(data);
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let tenant_id = tenant_id.ok_or_else(|| bad_request("tenant_id is required"))?;
    if tenant_id.trim().is_empty() {
        return Err(bad_request("tenant_id must not be empty"));
    }
    let file_bytes = file_bytes.ok_or_else(|| bad_request("file is required"))?;
    if file_bytes.is_empty() {
        return Err(bad_request("file must not be empty"));
    }

    let upload = NewUpload {
        tenant_id,
        source,
        doc_type,
        original_basename: basename.unwrap_or_default(),
        mime,
        uploader,
        labels,
        metadata,
        size: file_bytes.len() as u64,
        file_bytes,
    };

    let ingest_id = state.ingestion.submit(upload).await?;
    state.broker.enqueue(ingest_id, crate::ingestion::Stage::ParseNormalize);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "ingest_id": ingest_id, "status": "queued" })),
    ))
}

// ---- GET /v1/status/{ingest_id} ----

async fn status<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Path(ingest_id): Path<Uuid>,
) -> Result<Json<crate::model::IngestionState>, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    match state.ingestion.store.get_ingestion_state(ingest_id).await {
        Ok(s) => Ok(Json(s)),
        Err(_) => Err(not_found(format!("no ingestion found for {ingest_id}"))),
    }
}

// ---- GET /v1/ingestions ----

#[derive(Deserialize)]
struct ListIngestionsQuery {
    tenant_id: String,
    limit: Option<u32>,
}

async fn list_ingestions<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Query(q): Query<ListIngestionsQuery>,
) -> Result<Json<Vec<crate::model::IngestionState>>, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    let limit = q.limit.unwrap_or(25).clamp(1, 200);
    let states = state
        .ingestion
        .store
        .list_ingestion_states(&q.tenant_id, limit)
        .await
        .map_err(RagError::from)?;
    Ok(Json(states))
}

// ---- POST /v1/reindex ----

#[derive(Deserialize)]
struct ReindexRequest {
    ingest_id: Uuid,
    tenant_id: Option<String>,
}

async fn reindex<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Json(req): Json<ReindexRequest>,
) -> Result<Json<crate::model::IngestionState>, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    let manifest = state
        .ingestion
        .store
        .get_manifest(req.ingest_id)
        .await
        .map_err(|_| not_found(format!("no manifest for {}", req.ingest_id)))?;
    if let Some(tenant_id) = &req.tenant_id {
        if tenant_id != &manifest.tenant_id {
            return Err(bad_request("tenant_id does not match the ingest's owner"));
        }
    }
    let state_row = state
        .ingestion
        .store
        .reset_for_reindex(req.ingest_id)
        .await
        .map_err(RagError::from)?;
    state.broker.enqueue(req.ingest_id, crate::ingestion::Stage::ParseNormalize);
    Ok(Json(state_row))
}

// ---- DELETE /v1/ingest/{ingest_id} ----

#[derive(Deserialize)]
struct DeleteIngestQuery {
    tenant_id: String,
}

async fn delete_ingest<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Path(ingest_id): Path<Uuid>,
    Query(q): Query<DeleteIngestQuery>,
) -> Result<StatusCode, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    let manifest = state
        .ingestion
        .store
        .get_manifest(ingest_id)
        .await
        .map_err(|_| not_found(format!("no manifest for {ingest_id}")))?;
    if manifest.tenant_id != q.tenant_id {
        return Err(bad_request("tenant_id does not match the ingest's owner"));
    }
    state.ingestion.delete_ingest(ingest_id, &q.tenant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- GET /v1/files/presign ----

#[derive(Deserialize)]
struct PresignQuery {
    tenant_id: String,
    object_key: String,
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct PresignResponse {
    url: String,
    expires_in: u64,
}

async fn presign<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Query(q): Query<PresignQuery>,
) -> Result<Json<PresignResponse>, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    let expires_in = q.expires_in.unwrap_or(900).clamp(1, 3_600);
    let allowed_prefix = format!("{}/landing/", q.tenant_id);
    if !q.object_key.starts_with(&allowed_prefix) {
        return Err(bad_request("object_key is outside the tenant's landing prefix"));
    }
    let url = state
        .ingestion
        .object_store
        .presign(&q.object_key, Duration::from_secs(expires_in))
        .await
        .map_err(RagError::from)?;
    Ok(Json(PresignResponse { url, expires_in }))
}

// ---- POST /webhook/minio ----

#[derive(Deserialize)]
struct MinioNotification {
    #[serde(rename = "Records", default)]
    records: Vec<MinioRecord>,
    /// Explicit tenant override; used when the object key carries no
    /// `tenant-`-prefixed segment (see the tenant-derivation open question).
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
struct MinioRecord {
    s3: MinioS3,
}

#[derive(Deserialize)]
struct MinioS3 {
    bucket: MinioBucket,
    object: MinioObject,
}

#[derive(Deserialize)]
struct MinioBucket {
    name: String,
}

#[derive(Deserialize)]
struct MinioObject {
    key: String,
    #[serde(default)]
    size: u64,
}

/// Derives the tenant from a `tenant-<id>` path segment, per the upload
/// path's convention. Falls back to an explicit `tenant_id` field on the
/// notification body when no such segment exists.
fn tenant_from_key(key: &str) -> Option<String> {
    key.split('/')
        .find_map(|seg| seg.strip_prefix("tenant-").map(|s| s.to_string()))
}

async fn webhook_minio<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Json(payload): Json<MinioNotification>,
) -> Result<Json<Value>, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    let mut accepted = Vec::new();
    for record in payload.records {
        let key = record.s3.object.key;
        let uri = format!("{}/{}", record.s3.bucket.name, key);
        {
            let mut seen = state.webhook_seen.lock();
            if !seen.insert(uri.clone()) {
                continue;
            }
        }
        let tenant_id = tenant_from_key(&key)
            .or_else(|| payload.tenant_id.clone())
            .ok_or_else(|| bad_request("cannot derive tenant_id from object key"))?;
        let ingest_id = state
            .ingestion
            .submit_existing_object(&tenant_id, &key, record.s3.object.size)
            .await?;
        state.broker.enqueue(ingest_id, crate::ingestion::Stage::ParseNormalize);
        accepted.push(ingest_id);
    }
    Ok(Json(json!({ "accepted": accepted })))
}

// ---- POST /v1/query ----

#[derive(Deserialize)]
struct QueryRequest {
    thread_id: Option<String>,
    message: String,
    meta: Option<Value>,
}

async fn query<L, V, E, R, P>(
    State(state): State<Arc<AppState<L, V, E, R, P>>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<crate::orchestrator::AssistantResponse>, ApiError>
where
    L: LexicalIndex + 'static,
    V: VectorIndex + 'static,
    E: EmbeddingProvider + 'static,
    R: Reranker + 'static,
    P: LlmProvider + 'static,
{
    if req.message.trim().is_empty() {
        return Err(bad_request("message is required"));
    }
    let thread_id = req.thread_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let response = state.orchestrator.handle_query(&thread_id, &req.message, req.meta).await;
    Ok(Json(response))
}
