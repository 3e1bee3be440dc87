//! Generative LLM client: a `{complete(payload) -> {text, model, usage,
//! raw}}` capability interface with an `openai | ollama | fake` provider
//! chain, mirroring the embedding provider chain in [`crate::embedder`].

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("model not allowed: {requested} (allowed: {allowed})")]
    #[diagnostic(
        code(ragweave::llm::model_not_allowed),
        help("The LLM gateway only serves requests for the configured allowed model id.")
    )]
    ModelNotAllowed { requested: String, allowed: String },

    #[error("provider {provider} request failed: {message}")]
    #[diagnostic(code(ragweave::llm::provider_failed))]
    ProviderFailed { provider: &'static str, message: String },
}

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub force_json: bool,
}

#[derive(Clone, Debug)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub raw: Value,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse>;
}

/// Deterministic provider for tests and the planner's JSON-failure path:
/// always returns valid minimal JSON so callers can exercise fallback logic
/// without a live model.
pub struct FakeProvider {
    pub fixed_text: String,
}

#[async_trait]
impl LlmProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        Ok(ChatResponse {
            text: self.fixed_text.clone(),
            model: request.model.clone(),
            prompt_tokens: crate::model::approx_token_count(&request.prompt) as u32,
            completion_tokens: crate::model::approx_token_count(&self.fixed_text) as u32,
            raw: Value::Null,
        })
    }
}

pub struct OpenAiChatProvider {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.force_json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ProviderFailed {
                provider: "openai",
                message: e.to_string(),
            })?;
        let raw: Value = response.json().await.map_err(|e| LlmError::ProviderFailed {
            provider: "openai",
            message: e.to_string(),
        })?;
        let text = raw["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let prompt_tokens = raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = raw["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
        Ok(ChatResponse {
            text,
            model: request.model.clone(),
            prompt_tokens,
            completion_tokens,
            raw,
        })
    }
}

pub struct OllamaChatProvider {
    pub client: reqwest::Client,
    pub base_url: String,
    pub timeout: Duration,
}

#[async_trait]
impl LlmProvider for OllamaChatProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": request.model,
                "prompt": request.prompt,
                "system": request.system,
                "options": { "temperature": request.temperature },
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| LlmError::ProviderFailed {
                provider: "ollama",
                message: e.to_string(),
            })?;
        let raw: Value = response.json().await.map_err(|e| LlmError::ProviderFailed {
            provider: "ollama",
            message: e.to_string(),
        })?;
        let text = raw["response"].as_str().unwrap_or_default().to_string();
        Ok(ChatResponse {
            text: text.clone(),
            model: request.model.clone(),
            prompt_tokens: crate::model::approx_token_count(&request.prompt) as u32,
            completion_tokens: crate::model::approx_token_count(&text) as u32,
            raw,
        })
    }
}

/// Gateway wrapper: enforces the allowed-model-id policy before dispatching
/// to the underlying provider.
pub struct LlmGateway<P> {
    provider: P,
    allowed_model_id: String,
}

impl<P: LlmProvider> LlmGateway<P> {
    pub fn new(provider: P, allowed_model_id: impl Into<String>) -> Self {
        Self {
            provider,
            allowed_model_id: allowed_model_id.into(),
        }
    }

    pub async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        if request.model != self.allowed_model_id {
            return Err(LlmError::ModelNotAllowed {
                requested: request.model.clone(),
                allowed: self.allowed_model_id.clone(),
            });
        }
        self.provider.complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            system: None,
            prompt: "hello".to_string(),
            temperature: 0.0,
            max_tokens: 16,
            force_json: false,
        }
    }

    #[tokio::test]
    async fn gateway_rejects_disallowed_model() {
        let gateway = LlmGateway::new(
            FakeProvider {
                fixed_text: "{}".to_string(),
            },
            "gpt-4o-mini",
        );
        let err = gateway.complete(&request("gpt-4")).await.unwrap_err();
        assert!(matches!(err, LlmError::ModelNotAllowed { .. }));
    }

    #[tokio::test]
    async fn gateway_dispatches_allowed_model() {
        let gateway = LlmGateway::new(
            FakeProvider {
                fixed_text: "hi there".to_string(),
            },
            "gpt-4o-mini",
        );
        let response = gateway.complete(&request("gpt-4o-mini")).await.unwrap();
        assert_eq!(response.text, "hi there");
    }
}
