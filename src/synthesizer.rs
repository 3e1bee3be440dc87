//! Evidence-gated answer synthesis: shape-hint inference, strict-JSON LLM
//! call, citation resolution, and salvage-on-parse-failure handling.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use urlencoding::encode;

use crate::llm::{ChatRequest, LlmGateway, LlmProvider};
use crate::retriever::Hit;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeHint {
    Paragraphs(u32),
    Bullets(Option<u32>),
    Sentences(u32),
    Note,
    Table,
    Summary,
}

impl Default for ShapeHint {
    fn default() -> Self {
        ShapeHint::Paragraphs(2)
    }
}

static PARAGRAPHS: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
static BULLETS: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
static SENTENCES: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

pub fn infer_shape_hint(message: &str) -> ShapeHint {
    let lower = message.to_lowercase();
    let paragraphs = PARAGRAPHS.get_or_init(|| Regex::new(r"(\d+)\s*paragraphs?").unwrap());
    let bullets = BULLETS.get_or_init(|| Regex::new(r"(\d+)?\s*bullets?").unwrap());
    let sentences = SENTENCES.get_or_init(|| Regex::new(r"(\d+)\s*sentences?").unwrap());

    if let Some(caps) = paragraphs.captures(&lower) {
        let n = caps[1].parse().unwrap_or(2);
        return ShapeHint::Paragraphs(n);
    }
    if let Some(caps) = sentences.captures(&lower) {
        let n = caps[1].parse().unwrap_or(3);
        return ShapeHint::Sentences(n);
    }
    if bullets.is_match(&lower) {
        let n = bullets
            .captures(&lower)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        return ShapeHint::Bullets(n);
    }
    if lower.contains("table") {
        return ShapeHint::Table;
    }
    if lower.contains("summary") || lower.contains("summarize") {
        return ShapeHint::Summary;
    }
    if lower.contains("note") {
        return ShapeHint::Note;
    }
    ShapeHint::default()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawSynthesis {
    pub text: String,
    #[serde(default)]
    pub citations: Vec<RawCitation>,
    #[serde(rename = "chartsSpec", default)]
    pub charts_spec: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawCitation {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolvedCitation {
    pub id: String,
    pub title: String,
    pub url: String,
    pub file_name: Option<String>,
    pub path: Option<String>,
    pub score: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct SynthesisResult {
    pub text: String,
    pub citations: Vec<ResolvedCitation>,
    pub charts_spec: Option<Value>,
}

pub struct SynthesisInputs<'a> {
    pub shape_hint: ShapeHint,
    pub short_ctx: &'a str,
    pub long_ctx: &'a str,
    pub recalls: &'a [(String, f32)],
    pub rag_docs: &'a [Hit],
    pub risk_result: Option<&'a Value>,
    pub disclosure: &'a str,
    pub force_no_citations: bool,
    pub message: &'a str,
    pub docs_base_url: &'a str,
}

fn instruction_block(shape: ShapeHint, force_no_citations: bool, has_evidence: bool) -> String {
    let shape_line = match shape {
        ShapeHint::Paragraphs(n) => format!("{n} paragraphs"),
        ShapeHint::Bullets(Some(n)) => format!("{n} bullets"),
        ShapeHint::Bullets(None) => "bullets".to_string(),
        ShapeHint::Sentences(n) => format!("{n} sentences"),
        ShapeHint::Note => "a short note".to_string(),
        ShapeHint::Table => "a table".to_string(),
        ShapeHint::Summary => "a summary".to_string(),
    };

    let mut block = format!(
        "Answer in {shape_line}. Use a single narrative voice. Do not mention the planner or \
         retrieval mode. Do not add canned executive sections unless explicitly requested. \
         Include numbers and dates where known. Respond as strict JSON: \
         {{\"text\":string,\"citations\":[{{\"id\":string,\"title\":string}}],\"chartsSpec\":object|null}}."
    );

    if has_evidence && !force_no_citations {
        block.push_str(
            " Every factual sentence longer than 12 words that cites numbers, dates, or names \
             must include a [^docId] marker. Include an Executive Summary (at most 5 bullets), \
             an Evidence Table (at least 3 distinct source rows with a score column), 2-3 quotes \
             with inline citations, a Citations list, and a final router-metadata line.",
        );
    }
    block
}

pub async fn synthesize<P: LlmProvider>(
    gateway: &LlmGateway<P>,
    model: &str,
    inputs: &SynthesisInputs<'_>,
) -> SynthesisResult {
    let has_evidence = !inputs.rag_docs.is_empty();
    let instructions = instruction_block(inputs.shape_hint, inputs.force_no_citations, has_evidence);

    let recall_lines: Vec<String> = inputs
        .recalls
        .iter()
        .map(|(text, score)| format!("- ({score:.3}) {text}"))
        .collect();
    let doc_lines: Vec<String> = inputs
        .rag_docs
        .iter()
        .map(|hit| format!("[{}] {}", hit.chunk_id, hit.text))
        .collect();
    let risk_line = inputs
        .risk_result
        .map(|r| r.to_string())
        .unwrap_or_else(|| "none".to_string());

    let prompt = format!(
        "{instructions}\n\nShort context:\n{}\n\nLong summary:\n{}\n\nRecalls:\n{}\n\nEvidence:\n{}\n\nRisk result:\n{risk_line}\n\nDisclosure: {}\n\nUser message:\n{}",
        inputs.short_ctx,
        inputs.long_ctx,
        recall_lines.join("\n"),
        doc_lines.join("\n"),
        inputs.disclosure,
        inputs.message,
    );

    let request = ChatRequest {
        model: model.to_string(),
        system: None,
        prompt,
        temperature: 0.2,
        max_tokens: 900,
        force_json: true,
    };

    match gateway.complete(&request).await {
        Ok(response) => match serde_json::from_str::<RawSynthesis>(response.text.trim()) {
            Ok(raw) => resolve(raw, inputs.rag_docs, inputs.docs_base_url),
            Err(_) => salvage(&response.text, inputs.rag_docs, inputs.docs_base_url),
        },
        Err(_) => SynthesisResult {
            text: "I'm having trouble reaching the model right now. Please try again.".to_string(),
            citations: Vec::new(),
            charts_spec: None,
        },
    }
}

fn citation_marker_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[\^([^\]]+)\]").unwrap())
}

fn resolve(raw: RawSynthesis, docs: &[Hit], docs_base_url: &str) -> SynthesisResult {
    let resolved: Vec<ResolvedCitation> = raw
        .citations
        .iter()
        .filter_map(|c| resolve_one(&c.id, docs, docs_base_url))
        .collect();
    let text = rewrite_markers(&raw.text, &resolved);
    SynthesisResult {
        text,
        citations: resolved,
        charts_spec: raw.charts_spec,
    }
}

/// On JSON parse failure: find inline `[^id]` references in the raw text,
/// resolve what we can, and return the trimmed raw text with those
/// citations.
fn salvage(raw_text: &str, docs: &[Hit], docs_base_url: &str) -> SynthesisResult {
    let ids: Vec<String> = citation_marker_pattern()
        .captures_iter(raw_text)
        .map(|c| c[1].to_string())
        .collect();
    let resolved: Vec<ResolvedCitation> = ids
        .iter()
        .filter_map(|id| resolve_one(id, docs, docs_base_url))
        .collect();
    SynthesisResult {
        text: raw_text.trim().to_string(),
        citations: resolved,
        charts_spec: None,
    }
}

fn resolve_one(id: &str, docs: &[Hit], docs_base_url: &str) -> Option<ResolvedCitation> {
    let hit = docs.iter().find(|h| h.chunk_id == id)?;
    let title = hit
        .metadata
        .filename
        .clone()
        .or_else(|| hit.metadata.original_basename.clone())
        .unwrap_or_else(|| id.to_string());
    let path = hit.metadata.path.clone();
    let url = match &path {
        Some(p) => format!("{docs_base_url}/{}", encode(p)),
        None => docs_base_url.to_string(),
    };
    Some(ResolvedCitation {
        id: id.to_string(),
        title,
        url,
        file_name: hit.metadata.filename.clone(),
        path,
        score: hit.rerank_score.max(hit.combined_score),
    })
}

fn rewrite_markers(text: &str, citations: &[ResolvedCitation]) -> String {
    citation_marker_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let id = &caps[1];
            match citations.iter().find(|c| c.id == id) {
                Some(c) => format!("[{}]({})", c.title, c.url),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Number of non-empty sentences that contain a digit or one of the
/// finite financial keywords.
pub fn factual_claim_count(text: &str) -> usize {
    let keywords = ["percent", "increase", "decrease", "roi", "margin"];
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let lower = s.to_lowercase();
            s.chars().any(|c| c.is_ascii_digit()) || keywords.iter().any(|kw| lower.contains(kw))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_hint_defaults_to_two_paragraphs() {
        assert_eq!(infer_shape_hint("tell me about revenue"), ShapeHint::Paragraphs(2));
    }

    #[test]
    fn shape_hint_picks_up_explicit_bullet_count() {
        assert_eq!(infer_shape_hint("give me 4 bullets"), ShapeHint::Bullets(Some(4)));
    }

    #[test]
    fn factual_claim_count_matches_digits_and_keywords() {
        let text = "Revenue grew 12%. The sky is blue. Margin improved significantly.";
        assert_eq!(factual_claim_count(text), 2);
    }

    #[test]
    fn salvage_extracts_inline_markers_on_parse_failure() {
        let docs = vec![Hit {
            chunk_id: "abc".to_string(),
            doc_id: uuid::Uuid::new_v4(),
            text: "text".to_string(),
            metadata: crate::metadata::MetadataBag {
                filename: Some("report.pdf".to_string()),
                ..Default::default()
            },
            score_bm25: 0.0,
            score_vector: 0.0,
            combined_score: 0.5,
            rerank_score: 0.6,
        }];
        let result = salvage("Revenue grew [^abc] last year", &docs, "https://docs.internal");
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].title, "report.pdf");
    }
}
