//! PII detection/redaction and data-quality checks for the `pii_dq` stage.
//!
//! PII actions are applied end-to-start over detected spans so earlier
//! offsets stay valid; REDACT is a fixed mask (idempotent), HASH is a
//! SHA-256 hex digest of the original span (not idempotent — hashing a hash
//! again produces a different value).

use std::collections::HashMap;

use regex::Regex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PiiAction {
    Allow,
    Redact,
    Hash,
    Fail,
    Reject,
}

impl PiiAction {
    pub fn from_str(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "redact" => Self::Redact,
            "hash" => Self::Hash,
            "fail" => Self::Fail,
            "reject" => Self::Reject,
            _ => Self::Allow,
        }
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Fail | Self::Reject)
    }
}

#[derive(Clone, Debug)]
pub struct PiiSpan {
    pub start: usize,
    pub end: usize,
    pub entity_type: &'static str,
}

/// Regex-backed stand-in for a full NLP entity analyzer (presidio-style).
/// Each pattern is tried independently, so two recognizers can emit spans
/// over the same byte range; `apply_pii` resolves those before replacing.
pub struct PiiAnalyzer {
    patterns: Vec<(&'static str, Regex)>,
}

impl Default for PiiAnalyzer {
    fn default() -> Self {
        Self {
            patterns: vec![
                (
                    "EMAIL_ADDRESS",
                    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
                ),
                (
                    "PHONE_NUMBER",
                    Regex::new(r"\+?\d[\d\-. ()]{8,}\d").unwrap(),
                ),
                (
                    "US_SSN",
                    Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
                ),
                (
                    "CREDIT_CARD",
                    Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap(),
                ),
            ],
        }
    }
}

impl PiiAnalyzer {
    /// Returns `None` if analysis is unavailable (e.g. language resources
    /// missing) — callers treat that as "return input unchanged, empty
    /// report" per the stage contract.
    pub fn analyze(&self, text: &str) -> Option<Vec<PiiSpan>> {
        let mut spans = Vec::new();
        for (entity_type, pattern) in &self.patterns {
            for m in pattern.find_iter(text) {
                spans.push(PiiSpan {
                    start: m.start(),
                    end: m.end(),
                    entity_type,
                });
            }
        }
        Some(spans)
    }
}

/// Action -> entity_type policy, with a `DEFAULT` fallback key.
#[derive(Clone, Debug)]
pub struct PiiPolicy {
    pub per_entity: HashMap<String, PiiAction>,
    pub default: PiiAction,
}

impl Default for PiiPolicy {
    fn default() -> Self {
        Self {
            per_entity: HashMap::new(),
            default: PiiAction::Redact,
        }
    }
}

impl PiiPolicy {
    pub fn action_for(&self, entity_type: &str, global_override: Option<PiiAction>) -> PiiAction {
        if let Some(forced) = global_override {
            return forced;
        }
        self.per_entity
            .get(entity_type)
            .copied()
            .unwrap_or(self.default)
    }
}

pub struct PiiOutcome {
    pub text: String,
    /// entity_type -> count, plus `_total` and `_action` aggregates.
    pub report: Map<String, Value>,
    pub blocked: bool,
}

/// Applies `policy` (or `global_override` if set) to every span the analyzer
/// found, end-to-start, and builds the report the `pii_dq` stage persists.
pub fn apply_pii(
    text: &str,
    analyzer: &PiiAnalyzer,
    policy: &PiiPolicy,
    global_override: Option<PiiAction>,
    mask: &str,
) -> PiiOutcome {
    let Some(spans) = analyzer.analyze(text) else {
        return PiiOutcome {
            text: text.to_string(),
            report: Map::new(),
            blocked: false,
        };
    };

    // Different recognizers can match the same byte range (e.g. a digit run
    // matching both PHONE_NUMBER and CREDIT_CARD). Keep the first recognizer
    // to claim a range and drop any later span that overlaps it, so the
    // end-to-start replacement loop below never sees overlapping ranges.
    let mut spans: Vec<PiiSpan> = {
        let mut kept: Vec<PiiSpan> = Vec::new();
        for span in spans {
            let overlaps = kept
                .iter()
                .any(|k| span.start < k.end && k.start < span.end);
            if !overlaps {
                kept.push(span);
            }
        }
        kept
    };

    spans.sort_by(|a, b| b.start.cmp(&a.start));

    let mut counts: HashMap<&'static str, u64> = HashMap::new();
    let mut blocked = false;
    let mut applied_actions: Vec<&'static str> = Vec::new();
    let mut out = text.to_string();

    for span in &spans {
        let action = policy.action_for(span.entity_type, global_override);
        *counts.entry(span.entity_type).or_insert(0) += 1;
        if action.is_blocking() {
            blocked = true;
            continue;
        }
        let replacement = match action {
            PiiAction::Redact => mask.to_string(),
            PiiAction::Hash => {
                let mut hasher = Sha256::new();
                hasher.update(&out[span.start..span.end]);
                hex::encode(hasher.finalize())
            }
            PiiAction::Allow | PiiAction::Fail | PiiAction::Reject => continue,
        };
        out.replace_range(span.start..span.end, &replacement);
        applied_actions.push(match action {
            PiiAction::Redact => "redact",
            PiiAction::Hash => "hash",
            _ => "allow",
        });
    }

    let mut report = Map::new();
    let total: u64 = counts.values().sum();
    for (entity_type, count) in counts {
        report.insert(entity_type.to_string(), json!(count));
    }
    report.insert("_total".to_string(), json!(total));
    let action_label = applied_actions.first().copied().unwrap_or("none");
    report.insert("_action".to_string(), json!(action_label));

    PiiOutcome {
        text: out,
        report,
        blocked,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DqCheck {
    NotEmpty,
    LanguageDetect,
    OcrConfMin,
}

impl DqCheck {
    fn key(self) -> &'static str {
        match self {
            Self::NotEmpty => "not_empty",
            Self::LanguageDetect => "language_detect",
            Self::OcrConfMin => "ocr_conf_min",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DqOptions {
    pub language_detect: bool,
    pub ocr_confidence: Option<f32>,
    pub ocr_conf_min: f32,
    pub skip: Vec<String>,
}

/// Runs the declarative checks and returns `(all_passed, report)`. Checks in
/// `skip` are forced-pass regardless of their actual outcome.
pub fn run_dq(text: &str, lang: Option<&str>, options: &DqOptions) -> (bool, Map<String, Value>) {
    let mut report = Map::new();
    let mut all_passed = true;

    let mut record = |check: DqCheck, passed: bool, report: &mut Map<String, Value>| {
        let forced = options.skip.iter().any(|s| s == check.key());
        let result = forced || passed;
        report.insert(check.key().to_string(), json!(result));
        result
    };

    let not_empty = !text.trim().is_empty();
    all_passed &= record(DqCheck::NotEmpty, not_empty, &mut report);

    if options.language_detect {
        let lang_ok = matches!(lang, Some("en") | Some("auto") | None);
        all_passed &= record(DqCheck::LanguageDetect, lang_ok, &mut report);
    } else {
        report.insert(DqCheck::LanguageDetect.key().to_string(), json!(true));
    }

    let ocr_ok = match options.ocr_confidence {
        Some(conf) => conf >= options.ocr_conf_min,
        None => true,
    };
    all_passed &= record(DqCheck::OcrConfMin, ocr_ok, &mut report);

    report.insert("_checked_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    (all_passed, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_is_a_fixed_point() {
        let analyzer = PiiAnalyzer::default();
        let policy = PiiPolicy::default();
        let once = apply_pii("Contact: a@b.com", &analyzer, &policy, Some(PiiAction::Redact), "[X]");
        let twice = apply_pii(&once.text, &analyzer, &policy, Some(PiiAction::Redact), "[X]");
        assert_eq!(once.text, twice.text);
        assert_eq!(once.report.get("_total"), Some(&json!(1)));
    }

    #[test]
    fn hash_is_not_idempotent() {
        let analyzer = PiiAnalyzer::default();
        let policy = PiiPolicy::default();
        let once = apply_pii("Contact: a@b.com", &analyzer, &policy, Some(PiiAction::Hash), "[X]");
        let twice = apply_pii(&once.text, &analyzer, &policy, Some(PiiAction::Hash), "[X]");
        assert_ne!(once.text, twice.text);
    }

    #[test]
    fn reject_blocks_without_mutating_text_elsewhere() {
        let analyzer = PiiAnalyzer::default();
        let policy = PiiPolicy::default();
        let outcome = apply_pii(
            "Contact: a@b.com",
            &analyzer,
            &policy,
            Some(PiiAction::Reject),
            "[X]",
        );
        assert!(outcome.blocked);
    }

    #[test]
    fn dq_skip_forces_pass() {
        let options = DqOptions {
            language_detect: false,
            ocr_confidence: Some(0.1),
            ocr_conf_min: 0.9,
            skip: vec!["ocr_conf_min".to_string()],
        };
        let (passed, report) = run_dq("hello world", Some("en"), &options);
        assert!(passed);
        assert_eq!(report.get("ocr_conf_min"), Some(&json!(true)));
    }

    #[test]
    fn empty_text_fails_not_empty() {
        let options = DqOptions::default();
        let (passed, report) = run_dq("   ", None, &options);
        assert!(!passed);
        assert_eq!(report.get("not_empty"), Some(&json!(false)));
    }
}
