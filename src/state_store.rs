//! Durable state store: manifests, ingestion state, the stage ledger, chunks,
//! vectors, DQ/PII reports, and lineage edges.
//!
//! Grounded on the predecessor codebase's sqlite checkpointer (a `SqlitePool`
//! behind an async trait, runtime `sqlx::query`/`query_as` rather than
//! compile-time `query!` macros since no live database is available at build
//! time here either). Every write that gates a stage transition goes through
//! a single connection so the "already done" check and the write it guards
//! stay atomic.

use chrono::Utc;
use miette::Diagnostic;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use crate::metadata::MetadataBag;
use crate::model::{
    Chunk, DQReport, IngestionState, IngestionStatus, LineageNode, Manifest, PIIReport, Vector,
};

#[derive(Debug, Error, Diagnostic)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    #[diagnostic(code(ragweave::state_store::db))]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    #[diagnostic(code(ragweave::state_store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    #[diagnostic(code(ragweave::state_store::not_found))]
    NotFound(String),
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS manifests (
    ingest_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ingestion_state (
    ingest_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stage_ledger (
    ingest_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (ingest_id, stage)
);
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS vectors (
    chunk_id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dq_reports (
    ingest_id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pii_reports (
    ingest_id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS lineage_edges (
    parent TEXT NOT NULL,
    child TEXT NOT NULL,
    PRIMARY KEY (parent, child)
);
CREATE TABLE IF NOT EXISTS lineage_nodes (
    ingest_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (ingest_id, kind)
);
"#;

/// sqlx-backed store. Cheap to clone: wraps a pooled connection handle.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn connect(database_url: &str) -> StateStoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StateStoreResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- manifests ----

    pub async fn put_manifest(&self, manifest: &Manifest) -> StateStoreResult<()> {
        let body = serde_json::to_string(manifest)?;
        sqlx::query(
            "INSERT INTO manifests (ingest_id, tenant_id, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(ingest_id) DO UPDATE SET body = excluded.body",
        )
        .bind(manifest.ingest_id.to_string())
        .bind(&manifest.tenant_id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_manifest(&self, ingest_id: Uuid) -> StateStoreResult<Manifest> {
        let row = sqlx::query("SELECT body FROM manifests WHERE ingest_id = ?1")
            .bind(ingest_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StateStoreError::NotFound(format!("manifest {ingest_id}")))?;
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }

    // ---- ingestion state ----

    pub async fn put_ingestion_state(&self, state: &IngestionState) -> StateStoreResult<()> {
        let body = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO ingestion_state (ingest_id, tenant_id, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(ingest_id) DO UPDATE SET body = excluded.body",
        )
        .bind(state.ingest_id.to_string())
        .bind(&state.tenant_id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_ingestion_state(&self, ingest_id: Uuid) -> StateStoreResult<IngestionState> {
        let row = sqlx::query("SELECT body FROM ingestion_state WHERE ingest_id = ?1")
            .bind(ingest_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StateStoreError::NotFound(format!("ingestion state {ingest_id}")))?;
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Newest-first ingestion states for a tenant, capped at `limit`.
    pub async fn list_ingestion_states(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> StateStoreResult<Vec<IngestionState>> {
        let rows = sqlx::query(
            "SELECT body FROM ingestion_state WHERE tenant_id = ?1 ORDER BY rowid DESC LIMIT ?2",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }

    /// Clears the stage ledger and re-queues from `parse_normalize`,
    /// bypassing [`Self::transition`]'s terminal-state guard (reindex is the
    /// one caller allowed to revive a FAILED/COMPLETED ingest).
    pub async fn reset_for_reindex(&self, ingest_id: Uuid) -> StateStoreResult<IngestionState> {
        sqlx::query("DELETE FROM stage_ledger WHERE ingest_id = ?1")
            .bind(ingest_id.to_string())
            .execute(&self.pool)
            .await?;
        let mut state = self.get_ingestion_state(ingest_id).await?;
        state.status = IngestionStatus::Queued;
        state.stage = "parse_normalize".to_string();
        state.error = None;
        state.dlq_reason = None;
        state.finished_at = None;
        state.updated_at = Utc::now();
        self.put_ingestion_state(&state).await?;
        Ok(state)
    }

    /// Cascading row delete: every table keyed (directly or transitively) by
    /// `ingest_id`, in one transaction.
    pub async fn delete_ingest_rows(&self, ingest_id: Uuid) -> StateStoreResult<()> {
        let id = ingest_id.to_string();
        let mut tx = self.pool.begin().await?;
        for table in ["chunks", "vectors"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE doc_id = ?1"))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        for table in ["dq_reports", "pii_reports", "manifests", "ingestion_state"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE ingest_id = ?1"))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM stage_ledger WHERE ingest_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM lineage_edges WHERE parent = ?1 OR child = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM lineage_nodes WHERE ingest_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Advances stage/status, refusing to move out of a terminal state.
    pub async fn transition(
        &self,
        ingest_id: Uuid,
        stage: &str,
        status: IngestionStatus,
        error: Option<String>,
    ) -> StateStoreResult<IngestionState> {
        let mut state = self.get_ingestion_state(ingest_id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }
        state.stage = stage.to_string();
        state.status = status;
        state.error = error;
        state.updated_at = Utc::now();
        if status == IngestionStatus::Processing && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        self.put_ingestion_state(&state).await?;
        Ok(state)
    }

    // ---- stage ledger: idempotent gating ----

    pub async fn is_stage_done(&self, ingest_id: Uuid, stage: &str) -> StateStoreResult<bool> {
        let row = sqlx::query(
            "SELECT 1 as hit FROM stage_ledger WHERE ingest_id = ?1 AND stage = ?2",
        )
        .bind(ingest_id.to_string())
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn mark_stage_done(&self, ingest_id: Uuid, stage: &str) -> StateStoreResult<()> {
        sqlx::query(
            "INSERT INTO stage_ledger (ingest_id, stage, completed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(ingest_id, stage) DO NOTHING",
        )
        .bind(ingest_id.to_string())
        .bind(stage)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- chunks / vectors ----

    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> StateStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            let body = serde_json::to_string(chunk)?;
            sqlx::query(
                "INSERT INTO chunks (chunk_id, doc_id, tenant_id, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chunk_id) DO UPDATE SET body = excluded.body",
            )
            .bind(&chunk.chunk_id)
            .bind(chunk.doc_id.to_string())
            .bind(&chunk.tenant_id)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn chunks_for_doc(&self, doc_id: Uuid) -> StateStoreResult<Vec<Chunk>> {
        let rows = sqlx::query("SELECT body FROM chunks WHERE doc_id = ?1")
            .bind(doc_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }

    pub async fn upsert_vectors(&self, vectors: &[Vector]) -> StateStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for vector in vectors {
            let body = serde_json::to_string(vector)?;
            sqlx::query(
                "INSERT INTO vectors (chunk_id, doc_id, tenant_id, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chunk_id) DO UPDATE SET body = excluded.body",
            )
            .bind(&vector.chunk_id)
            .bind(vector.doc_id.to_string())
            .bind(&vector.tenant_id)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn all_vectors_for_tenant(&self, tenant_id: &str) -> StateStoreResult<Vec<Vector>> {
        let rows = sqlx::query("SELECT body FROM vectors WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }

    // ---- reports ----

    pub async fn put_dq_report(&self, report: &DQReport) -> StateStoreResult<()> {
        let body = serde_json::to_string(report)?;
        sqlx::query(
            "INSERT INTO dq_reports (ingest_id, body) VALUES (?1, ?2)
             ON CONFLICT(ingest_id) DO UPDATE SET body = excluded.body",
        )
        .bind(report.ingest_id.to_string())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_pii_report(&self, report: &PIIReport) -> StateStoreResult<()> {
        let body = serde_json::to_string(report)?;
        sqlx::query(
            "INSERT INTO pii_reports (ingest_id, body) VALUES (?1, ?2)
             ON CONFLICT(ingest_id) DO UPDATE SET body = excluded.body",
        )
        .bind(report.ingest_id.to_string())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- lineage ----

    pub async fn add_lineage_edge(&self, parent: Uuid, child: Uuid) -> StateStoreResult<()> {
        sqlx::query(
            "INSERT INTO lineage_edges (parent, child) VALUES (?1, ?2)
             ON CONFLICT(parent, child) DO NOTHING",
        )
        .bind(parent.to_string())
        .bind(child.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_lineage_node(&self, node: &LineageNode) -> StateStoreResult<()> {
        sqlx::query(
            "INSERT INTO lineage_nodes (ingest_id, kind, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(ingest_id, kind) DO NOTHING",
        )
        .bind(node.ingest_id.to_string())
        .bind(&node.kind)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn children_of(&self, parent: Uuid) -> StateStoreResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT child FROM lineage_edges WHERE parent = ?1")
            .bind(parent.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let child: String = row.try_get("child")?;
                Uuid::parse_str(&child).map_err(|e| StateStoreError::NotFound(e.to_string()))
            })
            .collect()
    }
}

/// Normalizes an arbitrary metadata value into the typed bag used across the
/// model. Kept here since callers assembling manifests from webhook/API
/// payloads reach for it alongside `StateStore`.
pub fn metadata_from_json(value: Value) -> MetadataBag {
    MetadataBag::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataBag;

    async fn memory_store() -> StateStore {
        StateStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_manifest() -> Manifest {
        Manifest {
            ingest_id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            source: None,
            object_key: "acme/landing/x/raw/a.txt".into(),
            object_suffix: "raw/a.txt".into(),
            original_basename: "a.txt".into(),
            doc_type: Some("text".into()),
            checksum: "deadbeef".into(),
            size: 4,
            mime: Some("text/plain".into()),
            uploader: None,
            labels: vec![],
            metadata: MetadataBag::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn manifest_roundtrips() {
        let store = memory_store().await;
        let manifest = sample_manifest();
        store.put_manifest(&manifest).await.unwrap();
        let fetched = store.get_manifest(manifest.ingest_id).await.unwrap();
        assert_eq!(fetched.checksum, "deadbeef");
    }

    #[tokio::test]
    async fn stage_ledger_is_idempotent() {
        let store = memory_store().await;
        let id = Uuid::new_v4();
        assert!(!store.is_stage_done(id, "parse").await.unwrap());
        store.mark_stage_done(id, "parse").await.unwrap();
        store.mark_stage_done(id, "parse").await.unwrap();
        assert!(store.is_stage_done(id, "parse").await.unwrap());
    }

    #[tokio::test]
    async fn transition_refuses_to_leave_terminal_state() {
        let store = memory_store().await;
        let id = Uuid::new_v4();
        store
            .put_ingestion_state(&IngestionState::queued(id, "acme"))
            .await
            .unwrap();
        store
            .transition(id, "complete", IngestionStatus::Completed, None)
            .await
            .unwrap();
        let after = store
            .transition(id, "chunk_embed", IngestionStatus::Processing, None)
            .await
            .unwrap();
        assert_eq!(after.status, IngestionStatus::Completed);
    }

    #[tokio::test]
    async fn delete_ingest_rows_clears_lineage_nodes_and_edges() {
        let store = memory_store().await;
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        store.put_manifest(&sample_manifest()).await.unwrap();
        store
            .put_lineage_node(&LineageNode::stage_completed(child, "parse_normalize"))
            .await
            .unwrap();
        store.add_lineage_edge(parent, child).await.unwrap();

        store.delete_ingest_rows(child).await.unwrap();

        assert!(store.children_of(parent).await.unwrap().is_empty());
        let remaining = sqlx::query("SELECT 1 as hit FROM lineage_nodes WHERE ingest_id = ?1")
            .bind(child.to_string())
            .fetch_optional(&store.pool)
            .await
            .unwrap();
        assert!(remaining.is_none());
    }
}
