//! Monte-Carlo risk cache + client.
//!
//! `signature(spec) = SHA256(canonical_json({spec, data_version}))`. The
//! cache is a process-local map; `run` never throws — HTTP and payload
//! failures are folded into `RiskResult.error` so the orchestrator can
//! proceed without risk rather than failing the whole request.

use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::model::RiskResult;

/// Serializes keys in sorted order so identical logical content always
/// hashes the same regardless of map insertion order.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted = Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    sorted.insert(key.clone(), sort(&map[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

pub fn signature(spec: &Value, data_version: &str) -> String {
    let payload = json!({ "spec": spec, "data_version": data_version });
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&payload));
    hex::encode(hasher.finalize())
}

/// Parses `trials` leniently: numbers, numeric strings, and currency-ish
/// strings with stripped symbols/commas; clamps to `[100, max_trials]`.
pub fn bound_trials(trials: Option<&Value>, max_trials: u32) -> u32 {
    let parsed = match trials {
        Some(Value::Number(n)) => n.as_f64().map(|f| f as i64),
        Some(Value::String(s)) => {
            let cleaned: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '-').collect();
            cleaned.parse::<i64>().ok()
        }
        _ => None,
    };
    let value = parsed.unwrap_or(100).max(0) as u32;
    value.clamp(100, max_trials.max(100))
}

#[derive(Clone, Debug)]
pub struct SimulatorRequest {
    pub revenue: f64,
    pub operating_margin: f64,
    pub sigma: f64,
    pub trials: u32,
}

/// Maps the planner's riskSpec to simulator inputs, defaulting missing or
/// malformed fields (warning, never failing).
pub fn build_simulator_request(spec: &Value, max_trials: u32) -> (SimulatorRequest, Vec<String>) {
    let mut warnings = Vec::new();
    let variables = spec.get("variables").cloned().unwrap_or(Value::Null);

    let revenue = variables
        .get("revenue")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| {
            warnings.push("revenue missing or malformed, defaulting to 1_000_000".to_string());
            1_000_000.0
        });
    let operating_margin = variables
        .get("operating_margin")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| {
            warnings.push("operating_margin missing or malformed, defaulting to 0.15".to_string());
            0.15
        });
    let sigma = variables.get("sigma").and_then(Value::as_f64).unwrap_or(0.2);
    let trials = bound_trials(spec.get("trials"), max_trials);

    (
        SimulatorRequest {
            revenue,
            operating_margin,
            sigma,
            trials,
        },
        warnings,
    )
}

/// Process-local cache: per-key reads/writes guarded by the same map lock,
/// which is cheap enough here that a true in-flight coalescer isn't needed —
/// the signature already makes redundant compute safe.
pub struct RiskCache {
    entries: RwLock<FxHashMap<String, Value>>,
}

impl Default for RiskCache {
    fn default() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }
}

impl RiskCache {
    pub fn read(&self, signature: &str) -> Option<Value> {
        self.entries.read().get(signature).cloned()
    }

    pub fn store(&self, signature: &str, result: Value) {
        self.entries.write().insert(signature.to_string(), result);
    }
}

pub struct SimulatorClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl SimulatorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    async fn invoke(&self, request: &SimulatorRequest) -> Result<Value, &'static str> {
        let response = self
            .client
            .post(format!("{}/simulate", self.base_url))
            .timeout(self.timeout)
            .json(&json!({
                "revenue": request.revenue,
                "operating_margin": request.operating_margin,
                "sigma": request.sigma,
                "trials": request.trials,
            }))
            .send()
            .await
            .map_err(|_| "simulation_http_error")?;
        let body = response.json::<Value>().await.map_err(|_| "simulation_invalid_payload")?;
        if !body.is_object() {
            return Err("simulation_failed");
        }
        Ok(body)
    }
}

/// Runs the risk pipeline against `cache`: signature, cache hit, else bound
/// trials and invoke the simulator, storing on success. Never returns `Err`;
/// failures are folded into `RiskResult.error`.
pub async fn run(
    cache: &RiskCache,
    client: &SimulatorClient,
    spec: &Value,
    data_version: &str,
    max_trials: u32,
) -> RiskResult {
    let sig = signature(spec, data_version);
    if let Some(cached) = cache.read(&sig) {
        return RiskResult {
            signature: sig,
            result: Some(cached),
            version: data_version.to_string(),
            cache_hit: true,
            error: None,
        };
    }

    let (request, _warnings) = build_simulator_request(spec, max_trials);
    match client.invoke(&request).await {
        Ok(result) => {
            cache.store(&sig, result.clone());
            RiskResult {
                signature: sig,
                result: Some(result),
                version: data_version.to_string(),
                cache_hit: false,
                error: None,
            }
        }
        Err(reason) => RiskResult {
            signature: sig,
            result: None,
            version: data_version.to_string(),
            cache_hit: false,
            error: Some(reason.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_regardless_of_key_order() {
        let a = json!({ "variables": { "revenue": 1, "trials": 200 } });
        let b = json!({ "trials": 200, "variables": { "revenue": 1 } });
        assert_eq!(signature(&a, "v1"), signature(&b, "v1"));
    }

    #[test]
    fn bound_trials_clamps_to_range() {
        assert_eq!(bound_trials(Some(&json!(5)), 50_000), 100);
        assert_eq!(bound_trials(Some(&json!(500_000)), 50_000), 50_000);
        assert_eq!(bound_trials(Some(&json!("1,000 trials")), 50_000), 1000);
    }

    #[test]
    fn bound_trials_defaults_when_missing() {
        assert_eq!(bound_trials(None, 50_000), 100);
    }

    #[test]
    fn cache_hit_reuses_stored_result() {
        let cache = RiskCache::default();
        cache.store("sig1", json!({ "p50": 1.0 }));
        assert_eq!(cache.read("sig1"), Some(json!({ "p50": 1.0 })));
        assert_eq!(cache.read("missing"), None);
    }
}
