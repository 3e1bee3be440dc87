//! Hybrid BM25 + kNN retrieval with cross-encoder rerank, per-doc capping,
//! and a confidence estimator over the top two scores.
//!
//! The lexical/vector index backend and the rerank model are external
//! collaborators (named at their contract only); this module defines the
//! seams (`LexicalIndex`, `VectorIndex`, `Reranker`) plus naive in-memory
//! implementations usable in tests and as a local fallback.

use std::collections::HashMap;

use async_trait::async_trait;
use miette::Diagnostic;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::embedder::{EmbedError, EmbeddingProvider};
use crate::metadata::MetadataBag;

#[derive(Debug, Error, Diagnostic)]
pub enum RetrieverError {
    #[error("lexical index error: {0}")]
    #[diagnostic(code(ragweave::retriever::lexical))]
    Lexical(String),

    #[error("vector index error: {0}")]
    #[diagnostic(code(ragweave::retriever::vector))]
    Vector(String),

    #[error(transparent)]
    #[diagnostic(code(ragweave::retriever::embed))]
    Embed(#[from] EmbedError),
}

pub type RetrieverResult<T> = Result<T, RetrieverError>;

#[derive(Clone, Debug)]
pub struct Hit {
    pub chunk_id: String,
    pub doc_id: Uuid,
    pub text: String,
    pub metadata: MetadataBag,
    pub score_bm25: f32,
    pub score_vector: f32,
    pub combined_score: f32,
    pub rerank_score: f32,
}

#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn bm25_search(&self, index_name: &str, query: &str, size: usize) -> RetrieverResult<Vec<(Hit, f32)>>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn knn_search(&self, index_name: &str, embedding: &[f32], k: usize) -> RetrieverResult<Vec<(Hit, f32)>>;
}

pub trait Reranker: Send + Sync {
    /// Returns `None` when the rerank model is unavailable; callers then
    /// fall back to `combined_score` ordering with `rerank_score = 0.0`.
    fn score(&self, query: &str, text: &str) -> Option<f32>;
}

/// Token-overlap cross-encoder stand-in: fraction of query tokens present in
/// the candidate text, always "available".
pub struct OverlapReranker;

impl Reranker for OverlapReranker {
    fn score(&self, query: &str, text: &str) -> Option<f32> {
        let query_tokens: Vec<String> = query.split_whitespace().map(|t| t.to_lowercase()).collect();
        if query_tokens.is_empty() {
            return Some(0.0);
        }
        let lower = text.to_lowercase();
        let hits = query_tokens.iter().filter(|t| lower.contains(t.as_str())).count();
        Some(hits as f32 / query_tokens.len() as f32)
    }
}

static FILENAME_TOKEN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn filename_token_pattern() -> &'static Regex {
    FILENAME_TOKEN.get_or_init(|| {
        Regex::new(r"(?i)\b\w+\.(txt|pdf|csv|md|docx|pptx|xlsx|json)\b").unwrap()
    })
}

#[derive(Clone, Copy, Debug)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub vector_top_k: usize,
    pub vector_min_score: f32,
    pub per_doc_cap: usize,
    pub source_tag: Option<&'static str>,
}

pub struct HybridRetriever<L, V, E, R> {
    lexical: L,
    vector: V,
    embedder: E,
    reranker: R,
}

impl<L, V, E, R> HybridRetriever<L, V, E, R>
where
    L: LexicalIndex,
    V: VectorIndex,
    E: EmbeddingProvider,
    R: Reranker,
{
    pub fn new(lexical: L, vector: V, embedder: E, reranker: R) -> Self {
        Self {
            lexical,
            vector,
            embedder,
            reranker,
        }
    }

    pub async fn retrieve(
        &self,
        index_name: &str,
        query: &str,
        options: RetrieveOptions,
    ) -> RetrieverResult<Vec<Hit>> {
        let size = options.top_k.max(options.vector_top_k);

        let bm25_hits = self.lexical.bm25_search(index_name, query, size).await?;

        let query_embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let mut vector_hits = self.vector.knn_search(index_name, &query_embedding, size).await?;
        let any_above_cutoff = vector_hits
            .iter()
            .any(|(_, score)| *score >= options.vector_min_score);
        if any_above_cutoff {
            vector_hits.retain(|(_, score)| *score >= options.vector_min_score);
        }

        let mut merged: HashMap<String, Hit> = HashMap::new();
        for (hit, score) in bm25_hits {
            let entry = merged.entry(hit.chunk_id.clone()).or_insert_with(|| Hit {
                score_bm25: 0.0,
                score_vector: 0.0,
                combined_score: 0.0,
                rerank_score: 0.0,
                ..hit.clone()
            });
            entry.score_bm25 = entry.score_bm25.max(score);
        }
        for (hit, score) in vector_hits {
            let entry = merged.entry(hit.chunk_id.clone()).or_insert_with(|| Hit {
                score_bm25: 0.0,
                score_vector: 0.0,
                combined_score: 0.0,
                rerank_score: 0.0,
                ..hit.clone()
            });
            entry.score_vector = entry.score_vector.max(score);
        }

        let mut hits: Vec<Hit> = merged
            .into_values()
            .map(|mut hit| {
                hit.combined_score = hit.score_bm25.max(hit.score_vector);
                hit
            })
            .collect();

        if let Some(source) = options.source_tag {
            hits.retain(|h| h.metadata.source.as_deref() == Some(source));
        }

        if let Some(caps) = filename_token_pattern().find(query) {
            let token = caps.as_str().to_lowercase();
            let scoped: Vec<Hit> = hits
                .iter()
                .filter(|h| filename_matches(&h.metadata, &token))
                .cloned()
                .collect();
            if !scoped.is_empty() {
                hits = scoped;
            }
        }

        for hit in &mut hits {
            hit.rerank_score = self.reranker.score(query, &hit.text).unwrap_or(0.0);
        }
        hits.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap()
                .then(b.combined_score.partial_cmp(&a.combined_score).unwrap())
        });

        let capped = apply_per_doc_cap(hits, options.per_doc_cap);
        Ok(capped.into_iter().take(options.top_k).collect())
    }
}

fn filename_matches(metadata: &MetadataBag, token: &str) -> bool {
    [
        metadata.filename.as_deref(),
        metadata.original_basename.as_deref(),
        metadata.object_suffix.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|candidate| candidate.to_lowercase().contains(token))
}

fn apply_per_doc_cap(hits: Vec<Hit>, per_doc_cap: usize) -> Vec<Hit> {
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    hits.into_iter()
        .filter(|hit| {
            let count = counts.entry(hit.doc_id).or_insert(0);
            if *count >= per_doc_cap {
                false
            } else {
                *count += 1;
                true
            }
        })
        .collect()
}

/// `confidence = clamp(0.5*s1 + 0.5*(s1-s2), 0, 0.99)`, 0 if `s1 <= 0`.
pub fn confidence_estimate(s1: f32, s2: f32) -> f32 {
    if s1 <= 0.0 {
        return 0.0;
    }
    (0.5 * s1 + 0.5 * (s1 - s2)).clamp(0.0, 0.99)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, doc_id: Uuid, text: &str) -> Hit {
        Hit {
            chunk_id: chunk_id.to_string(),
            doc_id,
            text: text.to_string(),
            metadata: MetadataBag::default(),
            score_bm25: 0.0,
            score_vector: 0.0,
            combined_score: 0.0,
            rerank_score: 0.0,
        }
    }

    #[test]
    fn per_doc_cap_limits_each_document() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let hits = vec![
            hit("1", doc_a, "a"),
            hit("2", doc_a, "b"),
            hit("3", doc_a, "c"),
            hit("4", doc_b, "d"),
        ];
        let capped = apply_per_doc_cap(hits, 2);
        let doc_a_count = capped.iter().filter(|h| h.doc_id == doc_a).count();
        assert_eq!(doc_a_count, 2);
        assert_eq!(capped.len(), 3);
    }

    #[test]
    fn confidence_is_zero_for_nonpositive_top_score() {
        assert_eq!(confidence_estimate(0.0, 0.0), 0.0);
        assert_eq!(confidence_estimate(-1.0, -2.0), 0.0);
    }

    #[test]
    fn confidence_is_clamped_to_point_ninety_nine() {
        assert_eq!(confidence_estimate(1.0, -1.0), 0.99);
    }

    #[test]
    fn filename_token_pattern_matches_known_extensions() {
        assert!(filename_token_pattern().is_match("show me report.pdf please"));
        assert!(!filename_token_pattern().is_match("no filename here"));
    }
}
