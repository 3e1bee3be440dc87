//! Dynamic metadata bag used by manifests, canonical payloads, and chunks.
//!
//! Generalizes the predecessor codebase's `MapMerge` reducer (a shallow JSON
//! map merge applied to a node's "extra" channel) into a typed accessor set
//! for the known keys this system actually reads (`path`, `raw_path`,
//! `object`, `object_suffix`, `filename`, `original_basename`, `date`,
//! `source`, `label`, `file_name`) plus a passthrough "extra" bucket for
//! everything else, so the source-to-sink merge semantics of the chunk_embed
//! stage (merge manifest metadata with canonical metadata, strip path-like
//! fields, then re-set them from the authoritative object key) are expressible
//! without losing caller-supplied custom fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::json_ext::{deep_merge, MergeStrategy};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataBag {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_basename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const PATH_LIKE_KEYS: &[&str] = &[
    "path",
    "raw_path",
    "object",
    "object_suffix",
    "filename",
    "original_basename",
    "file_name",
];

impl MetadataBag {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Merge `other` on top of `self`: known keys are overwritten when
    /// present on `other`; the extra bucket is deep-merged (right wins).
    pub fn merge(&mut self, other: &MetadataBag) {
        macro_rules! take_if_some {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take_if_some!(path);
        take_if_some!(raw_path);
        take_if_some!(object);
        take_if_some!(object_suffix);
        take_if_some!(filename);
        take_if_some!(original_basename);
        take_if_some!(date);
        take_if_some!(source);
        take_if_some!(label);
        take_if_some!(file_name);

        if !other.extra.is_empty() {
            let merged = deep_merge(
                &Value::Object(self.extra.clone()),
                &Value::Object(other.extra.clone()),
                MergeStrategy::DeepMerge,
            )
            .unwrap_or_else(|_| Value::Object(self.extra.clone()));
            if let Value::Object(map) = merged {
                self.extra = map;
            }
        }
    }

    /// Strip all path-like fields, typically before re-deriving them from
    /// the authoritative object key during the chunk_embed stage.
    pub fn strip_paths(&mut self) {
        self.path = None;
        self.raw_path = None;
        self.object = None;
        self.object_suffix = None;
        self.filename = None;
        self.original_basename = None;
        self.file_name = None;
        for key in PATH_LIKE_KEYS {
            self.extra.remove(*key);
        }
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    pub fn get_extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_known_fields_and_deep_merges_extra() {
        let mut base = MetadataBag {
            filename: Some("a.txt".into()),
            ..Default::default()
        };
        base.set_extra("tags", json!(["x"]));

        let mut incoming = MetadataBag {
            filename: Some("b.txt".into()),
            date: Some("2024-01-01".into()),
            ..Default::default()
        };
        incoming.set_extra("owner", json!("alice"));

        base.merge(&incoming);
        assert_eq!(base.filename.as_deref(), Some("b.txt"));
        assert_eq!(base.date.as_deref(), Some("2024-01-01"));
        assert_eq!(base.get_extra("owner"), Some(&json!("alice")));
        assert_eq!(base.get_extra("tags"), Some(&json!(["x"])));
    }

    #[test]
    fn strip_paths_clears_typed_and_extra_path_keys() {
        let mut bag = MetadataBag {
            object: Some("tenant/landing/id/raw/x.txt".into()),
            ..Default::default()
        };
        bag.set_extra("path", json!("stale"));
        bag.strip_paths();
        assert!(bag.object.is_none());
        assert!(bag.get_extra("path").is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let mut bag = MetadataBag {
            source: Some("sp500".into()),
            ..Default::default()
        };
        bag.set_extra("custom", json!(42));
        let value = bag.to_value();
        let parsed = MetadataBag::from_value(value);
        assert_eq!(parsed.source.as_deref(), Some("sp500"));
        assert_eq!(parsed.get_extra("custom"), Some(&json!(42)));
    }
}
