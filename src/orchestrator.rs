//! Query orchestrator: planner → hybrid retrieval → risk simulation →
//! synthesis, with evidence gating and a structured response envelope.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Settings;
use crate::embedder::EmbeddingProvider;
use crate::llm::{LlmGateway, LlmProvider};
use crate::memory::MemoryStore;
use crate::model::PlanArtifact;
use crate::planner::{self, force_rag_by_keyword};
use crate::retriever::{Hit, HybridRetriever, LexicalIndex, Reranker, RetrieveOptions, VectorIndex};
use crate::risk::{self, RiskCache, SimulatorClient};
use crate::synthesizer::{self, infer_shape_hint, SynthesisInputs};

const INSUFFICIENT_EVIDENCE_TEXT: &str = "INSUFFICIENT EVIDENCE";
const LOW_EVIDENCE_TEXT: &str =
    "The available evidence only partially supports a confident answer here; treat the figures above as provisional.";
const APPLE_TERMS: &[&str] = &["apple", "aapl"];
const APPLE_EXPANSION: &[&str] = &[
    "Apple Inc quarterly earnings",
    "AAPL revenue guidance",
    "Apple product launch",
];
const FRESHNESS_KEYWORDS: &[&str] = &["latest", "recent", "since", "update", "new", "today", "this week"];
const FRESHNESS_CUTOFF: &str = "2024-01-01";
const FRESHNESS_BONUS: f32 = 0.05;
const COST_PER_1K_INPUT_TOKENS: f64 = 0.00015;
const COST_PER_1K_OUTPUT_TOKENS: f64 = 0.0006;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Route {
    #[serde(rename = "LLM_ONLY")]
    LlmOnly,
    #[serde(rename = "RAG")]
    Rag,
    #[serde(rename = "RISK")]
    Risk,
    #[serde(rename = "RAG_RISK")]
    RagRisk,
}

#[derive(Clone, Debug, Serialize)]
pub struct WireCitation {
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetaCitation {
    pub id: String,
    pub file_name: Option<String>,
    pub path: Option<String>,
    pub score: Option<f32>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Used {
    #[serde(rename = "docIds")]
    pub doc_ids: Vec<Uuid>,
    pub confidence: f32,
    pub router: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskUsed>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RiskUsed {
    pub signature: String,
    pub version: String,
    pub vars: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryMeta {
    #[serde(rename = "shortTokens")]
    pub short_tokens: usize,
    #[serde(rename = "longSummaryUpdated")]
    pub long_summary_updated: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Metrics {
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Telemetry {
    pub plan: PlanArtifact,
    pub rag_used: bool,
    pub risk_used: bool,
    pub timings_ms: Value,
    pub target_latency_ms: u64,
    pub within_latency_budget: bool,
    pub router_metadata: Value,
    pub disclosure: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_failure: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Meta {
    pub citations: Vec<MetaCitation>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AssistantResponse {
    pub route: Route,
    pub text: String,
    pub used: Used,
    pub citations: Vec<WireCitation>,
    pub charts: Option<Value>,
    pub memory: MemoryMeta,
    pub metrics: Metrics,
    pub telemetry: Telemetry,
    pub meta: Meta,
}

pub struct QueryOrchestrator<L, V, E, R, P> {
    pub settings: std::sync::Arc<Settings>,
    pub memory: MemoryStore,
    pub retriever: HybridRetriever<L, V, E, R>,
    pub llm_gateway: LlmGateway<P>,
    pub risk_cache: RiskCache,
    pub simulator: SimulatorClient,
    pub data_version: String,
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

fn expand_queries(rag_queries: &[String], message: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut queries = Vec::new();
    for q in rag_queries {
        if seen.insert(q.to_lowercase()) {
            queries.push(q.clone());
        }
    }
    if queries.is_empty() {
        queries.push(message.to_string());
        seen.insert(message.to_lowercase());
    }
    let lower = message.to_lowercase();
    if APPLE_TERMS.iter().any(|t| lower.contains(t)) {
        for extra in APPLE_EXPANSION {
            if seen.insert(extra.to_lowercase()) {
                queries.push(extra.to_string());
            }
        }
    }
    queries
}

fn has_freshness_bias(message: &str) -> bool {
    let lower = message.to_lowercase();
    FRESHNESS_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn dedupe_key(hit: &Hit) -> (Option<String>, Option<String>, Option<String>) {
    (
        hit.metadata.source.clone(),
        hit.metadata.date.clone(),
        hit.metadata
            .filename
            .clone()
            .or_else(|| hit.metadata.original_basename.clone()),
    )
}

fn working_score(hit: &Hit) -> f32 {
    hit.combined_score.max(hit.rerank_score)
}

fn build_disclosure(rag_count: usize, risk_version: Option<&str>) -> String {
    match (rag_count > 0, risk_version) {
        (true, Some(v)) => format!("Answered by LLM with help from: Documents ({rag_count}) · Simulation v{v}"),
        (true, None) => format!("Answered by LLM with help from: Documents ({rag_count}) · Simulation (not used)"),
        (false, Some(v)) => format!("Answered by LLM with help from: Simulation v{v}"),
        (false, None) => "Answered by LLM (no external evidence used).".to_string(),
    }
}

enum RagOutcome {
    InsufficientEvidence { reason: &'static str, router_metadata: Value },
    Pack { hits: Vec<Hit>, router_metadata: Value },
    Skipped,
}

impl<L, V, E, R, P> QueryOrchestrator<L, V, E, R, P>
where
    L: LexicalIndex,
    V: VectorIndex,
    E: EmbeddingProvider,
    R: Reranker,
    P: LlmProvider,
{
    pub async fn handle_query(&self, thread_id: &str, message: &str, _meta: Option<Value>) -> AssistantResponse {
        let started = Instant::now();
        let mut timings = serde_json::Map::new();

        let t0 = Instant::now();
        let short_ctx = self.memory.get_recent_window(thread_id, self.settings.memory_token_cap);
        let long_ctx = self.memory.retrieve_long_summary(thread_id);
        let recall_turns = self.memory.vector_recall(thread_id, message, 5);
        let recalls: Vec<(String, f32)> = recall_turns
            .iter()
            .map(|(turn, score)| (format!("User: {} Assistant: {}", turn.user, turn.assistant), *score))
            .collect();
        timings.insert("memory_ms".to_string(), json!(t0.elapsed().as_millis()));

        let t1 = Instant::now();
        let plan = planner::plan(
            &self.llm_gateway,
            &self.settings.allowed_model_id,
            &short_ctx,
            &long_ctx,
            &recalls,
            message,
        )
        .await;
        timings.insert("plan_ms".to_string(), json!(t1.elapsed().as_millis()));

        let shape_hint = infer_shape_hint(message);
        let rag_required = plan.need_rag || force_rag_by_keyword(message);

        let t2 = Instant::now();
        let rag_outcome = if rag_required {
            self.run_rag_path(message, &plan.rag_queries).await
        } else {
            RagOutcome::Skipped
        };
        timings.insert("rag_ms".to_string(), json!(t2.elapsed().as_millis()));

        if let RagOutcome::InsufficientEvidence { reason, router_metadata } = rag_outcome {
            return self.insufficient_evidence_response(
                plan,
                reason,
                router_metadata,
                short_ctx,
                thread_id,
                started,
            );
        }

        let (rag_docs, router_metadata) = match rag_outcome {
            RagOutcome::Pack { hits, router_metadata } => (hits, router_metadata),
            _ => (Vec::new(), json!({})),
        };

        let t3 = Instant::now();
        let risk_result = if plan.need_risk {
            match &plan.risk_spec {
                None => None,
                Some(spec) => {
                    let spec_value = serde_json::to_value(spec).unwrap_or(Value::Null);
                    Some(
                        risk::run(
                            &self.risk_cache,
                            &self.simulator,
                            &spec_value,
                            &self.data_version,
                            self.settings.risk_max_trials,
                        )
                        .await,
                    )
                }
            }
        } else {
            None
        };
        timings.insert("risk_ms".to_string(), json!(t3.elapsed().as_millis()));

        let risk_value = risk_result.as_ref().and_then(|r| r.result.clone());
        let disclosure = build_disclosure(
            rag_docs.len(),
            risk_result.as_ref().filter(|r| r.result.is_some()).map(|r| r.version.as_str()),
        );
        let force_no_citations = rag_docs.is_empty() && rag_required;

        let t4 = Instant::now();
        let synthesis = synthesizer::synthesize(
            &self.llm_gateway,
            &self.settings.allowed_model_id,
            &SynthesisInputs {
                shape_hint,
                short_ctx: &short_ctx,
                long_ctx: &long_ctx,
                recalls: &recalls,
                rag_docs: &rag_docs,
                risk_result: risk_value.as_ref(),
                disclosure: &disclosure,
                force_no_citations,
                message,
                docs_base_url: &self.settings.docs_base_url,
            },
        )
        .await;
        timings.insert("synth_ms".to_string(), json!(t4.elapsed().as_millis()));

        let mut final_text = synthesis.text.clone();
        if !rag_docs.is_empty()
            && synthesizer::factual_claim_count(&final_text) > 2
            && synthesis.citations.len() < 2
        {
            final_text = LOW_EVIDENCE_TEXT.to_string();
        }

        self.memory.append_turn(thread_id, message, final_text.clone());
        let long_summary_updated = self.memory.maybe_update_long_summary(
            thread_id,
            self.settings.summary_update_every,
            self.settings.summary_cap_chars,
        );

        let risk_used = risk_value.is_some();
        let route = match (!rag_docs.is_empty(), risk_used) {
            (true, true) => Route::RagRisk,
            (true, false) => Route::Rag,
            (false, true) => Route::Risk,
            (false, false) => Route::LlmOnly,
        };
        let target_latency_ms = match route {
            Route::LlmOnly => self.settings.target_latency_ms.llm_only_ms,
            Route::Rag => self.settings.target_latency_ms.rag_ms,
            Route::Risk => self.settings.target_latency_ms.risk_ms,
            Route::RagRisk => self.settings.target_latency_ms.rag_risk_ms,
        };

        let doc_ids: Vec<Uuid> = {
            let mut ids: Vec<Uuid> = rag_docs.iter().map(|h| h.doc_id).collect();
            ids.dedup();
            ids
        };
        let top_two: Vec<f32> = {
            let mut scores: Vec<f32> = rag_docs.iter().map(working_score).collect();
            scores.sort_by(|a, b| b.partial_cmp(a).unwrap());
            scores
        };
        let confidence = crate::retriever::confidence_estimate(
            top_two.first().copied().unwrap_or(0.0),
            top_two.get(1).copied().unwrap_or(0.0),
        );

        let wire_citations: Vec<WireCitation> = synthesis
            .citations
            .iter()
            .map(|c| WireCitation {
                id: c.id.clone(),
                title: c.title.clone(),
                url: c.url.clone(),
            })
            .collect();
        let meta_citations: Vec<MetaCitation> = synthesis
            .citations
            .iter()
            .map(|c| MetaCitation {
                id: c.id.clone(),
                file_name: c.file_name.clone(),
                path: c.path.clone(),
                score: Some(c.score),
            })
            .collect();

        let latency_ms = started.elapsed().as_millis() as u64;
        let tokens_in = crate::model::approx_token_count(&short_ctx) as u32
            + crate::model::approx_token_count(&long_ctx) as u32
            + rag_docs.iter().map(|h| crate::model::approx_token_count(&h.text) as u32).sum::<u32>();
        let tokens_out = crate::model::approx_token_count(&final_text) as u32;
        let cost_usd = (tokens_in as f64 / 1000.0) * COST_PER_1K_INPUT_TOKENS
            + (tokens_out as f64 / 1000.0) * COST_PER_1K_OUTPUT_TOKENS;

        AssistantResponse {
            route,
            text: final_text,
            used: Used {
                doc_ids,
                confidence,
                router: router_metadata.clone(),
                risk: risk_result.as_ref().map(|r| RiskUsed {
                    signature: r.signature.clone(),
                    version: r.version.clone(),
                    vars: plan
                        .risk_spec
                        .as_ref()
                        .and_then(|s| serde_json::to_value(&s.variables).ok())
                        .unwrap_or(Value::Null),
                }),
            },
            citations: wire_citations,
            charts: synthesis.charts_spec,
            memory: MemoryMeta {
                short_tokens: crate::model::approx_token_count(&short_ctx),
                long_summary_updated,
            },
            metrics: Metrics {
                tokens_in,
                tokens_out,
                cost_usd,
                latency_ms,
            },
            telemetry: Telemetry {
                plan,
                rag_used: !rag_docs.is_empty(),
                risk_used,
                timings_ms: Value::Object(timings),
                target_latency_ms,
                within_latency_budget: latency_ms <= target_latency_ms,
                router_metadata,
                disclosure,
                model: self.settings.allowed_model_id.clone(),
                rag_failure: None,
            },
            meta: Meta { citations: meta_citations },
        }
    }

    async fn run_rag_path(&self, message: &str, plan_queries: &[String]) -> RagOutcome {
        let queries = expand_queries(plan_queries, message);
        let top_k = if word_count(message) < 8 { 12 } else { 10 };
        let freshness = has_freshness_bias(message);

        let options = RetrieveOptions {
            top_k,
            vector_top_k: self.settings.vector_top_k,
            vector_min_score: self.settings.vector_min_score,
            per_doc_cap: self.settings.per_doc_cap,
            source_tag: None,
        };

        let mut merged: HashMap<String, Hit> = HashMap::new();
        let mut index_error = false;
        for query in &queries {
            match self.retriever.retrieve(&self.settings.index_name, query, options).await {
                Ok(hits) => {
                    for hit in hits {
                        merged
                            .entry(hit.chunk_id.clone())
                            .and_modify(|existing| {
                                if hit.combined_score > existing.combined_score {
                                    *existing = hit.clone();
                                }
                            })
                            .or_insert(hit);
                    }
                }
                Err(_) => index_error = true,
            }
        }

        if index_error && merged.is_empty() {
            return RagOutcome::InsufficientEvidence {
                reason: "INDEX_NOT_READY",
                router_metadata: json!({ "queries": queries, "reason": "index_not_ready" }),
            };
        }

        let mut hits: Vec<Hit> = merged.into_values().collect();
        hits.retain(|h| h.text.chars().count() >= 300);

        if freshness {
            for hit in &mut hits {
                if let Some(date) = &hit.metadata.date {
                    if date.as_str() >= FRESHNESS_CUTOFF {
                        hit.combined_score += FRESHNESS_BONUS;
                    }
                }
            }
        }

        hits.sort_by(|a, b| working_score(b).partial_cmp(&working_score(a)).unwrap());

        let mut seen_keys = HashSet::new();
        hits.retain(|h| seen_keys.insert(dedupe_key(h)));

        if hits.is_empty() {
            return RagOutcome::InsufficientEvidence {
                reason: "NO_MATCHES",
                router_metadata: json!({ "queries": queries }),
            };
        }

        let qualifying_docs: HashSet<Uuid> = hits
            .iter()
            .filter(|h| working_score(h) >= self.settings.rag_score_threshold)
            .map(|h| h.doc_id)
            .collect();
        let max_score = hits.iter().map(working_score).fold(0.0_f32, f32::max);

        let router_metadata = json!({
            "route": "rag",
            "top_k": top_k,
            "threshold": self.settings.rag_score_threshold,
            "doc_count": qualifying_docs.len(),
            "max_score": max_score,
            "freshness_bias": freshness,
        });

        if qualifying_docs.len() < self.settings.rag_min_docs {
            return RagOutcome::InsufficientEvidence {
                reason: "LOW_CONFIDENCE",
                router_metadata,
            };
        }

        hits.truncate(self.settings.max_context_chunks);
        RagOutcome::Pack { hits, router_metadata }
    }

    fn insufficient_evidence_response(
        &self,
        plan: PlanArtifact,
        rag_failure: &'static str,
        router_metadata: Value,
        short_ctx: String,
        thread_id: &str,
        started: Instant,
    ) -> AssistantResponse {
        self.memory.append_turn(thread_id, "(query)", INSUFFICIENT_EVIDENCE_TEXT);
        let long_summary_updated = self.memory.maybe_update_long_summary(
            thread_id,
            self.settings.summary_update_every,
            self.settings.summary_cap_chars,
        );
        let latency_ms = started.elapsed().as_millis() as u64;
        let target_latency_ms = self.settings.target_latency_ms.llm_only_ms;

        AssistantResponse {
            route: Route::LlmOnly,
            text: INSUFFICIENT_EVIDENCE_TEXT.to_string(),
            used: Used::default(),
            citations: Vec::new(),
            charts: None,
            memory: MemoryMeta {
                short_tokens: crate::model::approx_token_count(&short_ctx),
                long_summary_updated,
            },
            metrics: Metrics::default(),
            telemetry: Telemetry {
                plan,
                rag_used: false,
                risk_used: false,
                timings_ms: json!({}),
                target_latency_ms,
                within_latency_budget: latency_ms <= target_latency_ms,
                router_metadata,
                disclosure: "Answered by LLM (no external evidence used).".to_string(),
                model: self.settings.allowed_model_id.clone(),
                rag_failure: Some(rag_failure.to_string()),
            },
            meta: Meta { citations: Vec::new() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disclosure_variants_match_the_three_documented_forms() {
        assert_eq!(
            build_disclosure(2, Some("v1")),
            "Answered by LLM with help from: Documents (2) · Simulation v1"
        );
        assert_eq!(
            build_disclosure(2, None),
            "Answered by LLM with help from: Documents (2) · Simulation (not used)"
        );
        assert_eq!(build_disclosure(0, None), "Answered by LLM (no external evidence used).");
    }

    #[test]
    fn apple_terms_trigger_query_expansion() {
        let expanded = expand_queries(&[], "what happened to aapl this quarter");
        assert!(expanded.len() > 1);
    }

    #[test]
    fn freshness_keywords_are_detected() {
        assert!(has_freshness_bias("what's the latest revenue figure"));
        assert!(!has_freshness_bias("define operating margin"));
    }
}
