//! Embedding provider chain: `ollama | openai | local | auto`, with batching
//! and ordered fallback.
//!
//! `auto` tries `ollama` then `openai`. Every provider issues one request per
//! input text (or a true multi-input request when the backend supports it) —
//! earlier designs that folded a batch into a single request and sent only
//! the last payload are a latent bug this implementation does not repeat.

use async_trait::async_trait;
use miette::Diagnostic;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    #[error("provider {provider} request failed: {message}")]
    #[diagnostic(code(ragweave::embedder::provider_failed))]
    ProviderFailed { provider: &'static str, message: String },

    #[error("all embedding providers failed: {0:?}")]
    #[diagnostic(
        code(ragweave::embedder::all_failed),
        help("Check provider connectivity or fall back to the local deterministic provider.")
    )]
    AllProvidersFailed(Vec<String>),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(ragweave::embedder::dimension_mismatch))]
    DimensionMismatch { expected: usize, actual: usize },
}

pub type EmbedResult<T> = Result<T, EmbedError>;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Embeds every text in `texts`, one request per text (or a genuine
    /// multi-input request), returning vectors in the same order.
    async fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>>;
}

/// Deterministic provider: seeds an RNG per input from a stable hash of the
/// text. Used for tests and as the final fallback link.
pub struct LocalProvider {
    pub dim: usize,
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| deterministic_vector(t, self.dim)).collect())
    }
}

fn deterministic_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut hasher = FxHasher::default();
    text.hash(&mut hasher);
    let seed = hasher.finish();
    let mut rng = StdRng::seed_from_u64(seed);
    (0..dim).map(|_| rng.random_range(-1.0f32..1.0f32)).collect()
}

/// Ollama's `/api/embeddings` endpoint, one request per input text.
pub struct OllamaProvider {
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .timeout(self.timeout)
                .json(&serde_json::json!({ "model": self.model, "prompt": text }))
                .send()
                .await
                .map_err(|e| EmbedError::ProviderFailed {
                    provider: "ollama",
                    message: e.to_string(),
                })?;
            let body: OllamaEmbeddingResponse = response.json().await.map_err(|e| {
                EmbedError::ProviderFailed {
                    provider: "ollama",
                    message: e.to_string(),
                }
            })?;
            vectors.push(body.embedding);
        }
        Ok(vectors)
    }
}

#[derive(serde::Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/v1/embeddings` endpoint, a true multi-input request.
pub struct OpenAiProvider {
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|e| EmbedError::ProviderFailed {
                provider: "openai",
                message: e.to_string(),
            })?;
        let body: OpenAiEmbeddingResponse = response.json().await.map_err(|e| {
            EmbedError::ProviderFailed {
                provider: "openai",
                message: e.to_string(),
            }
        })?;
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(serde::Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingDatum>,
}

#[derive(serde::Deserialize)]
struct OpenAiEmbeddingDatum {
    embedding: Vec<f32>,
}

/// Wraps an ordered provider list: on a provider's failure, continue to the
/// next; if all fail, surface an aggregated error.
pub struct FallbackEmbedder {
    providers: Vec<Box<dyn EmbeddingProvider>>,
    dim: usize,
    batch_size: usize,
}

impl FallbackEmbedder {
    pub fn new(providers: Vec<Box<dyn EmbeddingProvider>>, dim: usize, batch_size: usize) -> Self {
        Self {
            providers,
            dim,
            batch_size,
        }
    }

    pub async fn embed_all(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }

    async fn embed_batch(&self, batch: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
        let mut errors = Vec::new();
        for provider in &self.providers {
            match provider.embed(batch).await {
                Ok(vectors) => {
                    for v in &vectors {
                        if v.len() != self.dim {
                            return Err(EmbedError::DimensionMismatch {
                                expected: self.dim,
                                actual: v.len(),
                            });
                        }
                    }
                    return Ok(vectors);
                }
                Err(e) => errors.push(format!("{}: {e}", provider.name())),
            }
        }
        Err(EmbedError::AllProvidersFailed(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_provider_is_deterministic() {
        let provider = LocalProvider { dim: 8 };
        let a = provider.embed(&["hello".to_string()]).await.unwrap();
        let b = provider.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 8);
    }

    #[tokio::test]
    async fn fallback_embedder_falls_through_on_failure() {
        struct AlwaysFails;
        #[async_trait]
        impl EmbeddingProvider for AlwaysFails {
            fn name(&self) -> &'static str {
                "broken"
            }
            async fn embed(&self, _texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
                Err(EmbedError::ProviderFailed {
                    provider: "broken",
                    message: "down".into(),
                })
            }
        }

        let embedder = FallbackEmbedder::new(
            vec![Box::new(AlwaysFails), Box::new(LocalProvider { dim: 4 })],
            4,
            16,
        );
        let result = embedder.embed_all(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn all_providers_failing_surfaces_aggregated_error() {
        struct AlwaysFails;
        #[async_trait]
        impl EmbeddingProvider for AlwaysFails {
            fn name(&self) -> &'static str {
                "broken"
            }
            async fn embed(&self, _texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
                Err(EmbedError::ProviderFailed {
                    provider: "broken",
                    message: "down".into(),
                })
            }
        }
        let embedder = FallbackEmbedder::new(vec![Box::new(AlwaysFails)], 4, 16);
        let err = embedder.embed_all(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbedError::AllProvidersFailed(_)));
    }
}
