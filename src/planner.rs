//! Query planner: decides `needRag` / `needRisk` / sub-queries from the
//! conversation context, with a strict-JSON LLM call and deterministic
//! keyword-based post-processing.

use regex::Regex;
use serde_json::Value;

use crate::llm::{ChatRequest, LlmGateway, LlmProvider};
use crate::model::PlanArtifact;

const PLANNER_SYSTEM_PROMPT: &str = "You are a retrieval planner. Reply with strict JSON only: \
{\"needRag\":bool,\"needRisk\":bool,\"ragQueries\":[string],\"riskSpec\":object|null,\"expected\":[string],\"confidence\":number}.";

static DEFINITIONAL: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
static SIMULATION_KEYWORDS: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn definitional_pattern() -> &'static Regex {
    DEFINITIONAL.get_or_init(|| Regex::new(r"(?i)^\s*(what is|define|explain)\b").unwrap())
}

fn simulation_keyword_pattern() -> &'static Regex {
    SIMULATION_KEYWORDS.get_or_init(|| {
        Regex::new(r"(?i)\b(monte carlo|simulate|simulation|probability distribution|n paths)\b").unwrap()
    })
}

pub fn build_planner_prompt(
    short_ctx: &str,
    long_summary: &str,
    recalls: &[(String, f32)],
    message: &str,
) -> String {
    let recall_lines: Vec<String> = recalls
        .iter()
        .take(5)
        .map(|(text, score)| format!("- ({score:.3}) {text}"))
        .collect();
    format!(
        "Recent context:\n{short_ctx}\n\nLong summary:\n{long_summary}\n\nRelevant recalls:\n{}\n\nUser message:\n{message}",
        recall_lines.join("\n")
    )
}

/// Builds a plan via the LLM, falling back to the all-false default on any
/// JSON/validation failure, then applies the definitional/simulation
/// keyword post-processing.
pub async fn plan<P: LlmProvider>(
    gateway: &LlmGateway<P>,
    model: &str,
    short_ctx: &str,
    long_summary: &str,
    recalls: &[(String, f32)],
    message: &str,
) -> PlanArtifact {
    let prompt = build_planner_prompt(short_ctx, long_summary, recalls, message);
    let request = ChatRequest {
        model: model.to_string(),
        system: Some(PLANNER_SYSTEM_PROMPT.to_string()),
        prompt,
        temperature: 0.0,
        max_tokens: 400,
        force_json: true,
    };

    let plan = match gateway.complete(&request).await {
        Ok(response) => parse_plan(&response.text).unwrap_or_else(PlanArtifact::default_no_evidence),
        Err(_) => PlanArtifact::default_no_evidence(),
    };

    apply_keyword_overrides(plan.clamp_confidence(), message)
}

fn parse_plan(text: &str) -> Option<PlanArtifact> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    serde_json::from_value(value).ok()
}

fn apply_keyword_overrides(mut plan: PlanArtifact, message: &str) -> PlanArtifact {
    let is_definitional = definitional_pattern().is_match(message);
    let has_simulation_keyword = simulation_keyword_pattern().is_match(message);

    if has_simulation_keyword {
        plan.need_risk = true;
    } else if is_definitional {
        plan.need_risk = false;
    }
    plan
}

/// Finite keyword list that forces the RAG path regardless of the planner's
/// own `needRag` verdict.
const FORCE_RAG_KEYWORDS: &[&str] = &[
    "company", "financial", "revenue", "earnings", "kpi", "metric", "news", "policy",
    "regulation", "legal", "lawsuit", "launch", "product", "guidance", "since", "trend",
];

pub fn force_rag_by_keyword(message: &str) -> bool {
    let lower = message.to_lowercase();
    FORCE_RAG_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeProvider;

    #[tokio::test]
    async fn falls_back_to_default_on_invalid_json() {
        let gateway = LlmGateway::new(
            FakeProvider {
                fixed_text: "not json".to_string(),
            },
            "gpt-4o-mini",
        );
        let plan = plan(&gateway, "gpt-4o-mini", "", "", &[], "What is revenue?").await;
        assert!(!plan.need_rag);
        assert!(!plan.need_risk);
        assert_eq!(plan.confidence, 0.0);
    }

    #[tokio::test]
    async fn simulation_keyword_forces_risk_even_for_definitional_phrasing() {
        let gateway = LlmGateway::new(
            FakeProvider {
                fixed_text: serde_json::json!({
                    "needRag": false, "needRisk": false, "ragQueries": [],
                    "riskSpec": null, "expected": [], "confidence": 0.5
                })
                .to_string(),
            },
            "gpt-4o-mini",
        );
        let plan = plan(
            &gateway,
            "gpt-4o-mini",
            "",
            "",
            &[],
            "what is the probability distribution via monte carlo simulate",
        )
        .await;
        assert!(plan.need_risk);
    }

    #[tokio::test]
    async fn definitional_query_forces_need_risk_false() {
        let gateway = LlmGateway::new(
            FakeProvider {
                fixed_text: serde_json::json!({
                    "needRag": false, "needRisk": true, "ragQueries": [],
                    "riskSpec": null, "expected": [], "confidence": 0.5
                })
                .to_string(),
            },
            "gpt-4o-mini",
        );
        let plan = plan(&gateway, "gpt-4o-mini", "", "", &[], "define operating margin").await;
        assert!(!plan.need_risk);
    }

    #[test]
    fn force_rag_matches_finite_keyword_list() {
        assert!(force_rag_by_keyword("what were Q3 earnings"));
        assert!(!force_rag_by_keyword("hello there"));
    }
}
