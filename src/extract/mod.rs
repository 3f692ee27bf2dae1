//! Extraction and normalization of intercepted payloads.
//!
//! Extractors are pure functions from a response body to normalized fields
//! and records. They never fail: malformed sub-fields degrade to neutral
//! defaults, and an unknown endpoint yields an empty extraction.

mod endpoints;
mod field;
mod metrics;

pub use field::Field;
pub use metrics::{derive_cost_metrics, round2, safe_div};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind stamped on the merged per-entity profile record.
pub const PROFILE_KIND: &str = "profile";
/// Natural key of the merged per-entity profile record.
pub const PROFILE_KEY: &str = "profile";

/// A record an extractor produced, before it is tied to an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub kind: String,
    pub natural_key: String,
    pub fields: Map<String, Value>,
}

/// Normalized record ready for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub kind: String,
    pub external_key: String,
    pub natural_key: String,
    pub fields: Map<String, Value>,
}

impl ExtractedRecord {
    pub fn from_draft(external_key: impl Into<String>, draft: RecordDraft) -> Self {
        Self {
            kind: draft.kind,
            external_key: external_key.into(),
            natural_key: draft.natural_key,
            fields: draft.fields,
        }
    }
}

/// Output of one extractor run.
///
/// `fields` merge into the entity's profile record; `records` are separate
/// rows with their own natural keys (notes, messages).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: Map<String, Value>,
    pub records: Vec<RecordDraft>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.records.is_empty()
    }
}

/// Endpoint ids with a built-in extractor.
pub const KNOWN_ENDPOINTS: &[&str] = &[
    "blogger",
    "notes_rate",
    "fans_summary",
    "fans_profile",
    "notes_detail",
    "data_summary",
    "message_list",
];

pub fn has_extractor(endpoint: &str) -> bool {
    KNOWN_ENDPOINTS.contains(&endpoint)
}

/// Run the extractor registered for `endpoint` over a response body.
pub fn extract(endpoint: &str, payload: &Value) -> Extraction {
    let data = envelope_data(payload);
    match endpoint {
        "blogger" => endpoints::blogger(data),
        "notes_rate" => endpoints::notes_rate(data),
        "fans_summary" => endpoints::fans_summary(data),
        "fans_profile" => endpoints::fans_profile(data),
        "notes_detail" => endpoints::notes_detail(data),
        "data_summary" => endpoints::data_summary(data),
        "message_list" => endpoints::message_list(data),
        other => {
            tracing::debug!("No extractor for endpoint {}", other);
            Extraction::default()
        }
    }
}

/// The `data` member of a `{code, msg, data}` envelope, or the body itself.
fn envelope_data(payload: &Value) -> Field<'_> {
    let root = Field::of(payload);
    if root.get("data").is_present() {
        root.get("data")
    } else if payload.get("code").is_some() {
        // Enveloped but no data: nothing to extract.
        Field::missing()
    } else {
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_endpoint_is_empty() {
        assert!(!has_extractor("nope"));
        assert!(extract("nope", &json!({"data": {"x": 1}})).is_empty());
    }

    #[test]
    fn test_envelope_without_data_is_empty() {
        let out = extract("fans_summary", &json!({"code": 0, "msg": "ok"}));
        // fields still carry neutral defaults
        assert_eq!(out.fields["active_fans_ratio"], json!(0.0));
    }

    #[test]
    fn test_null_price_info_gives_neutral_prices() {
        let out = extract("blogger", &json!({"price_info": null}));
        assert_eq!(out.fields["graphic_price"], json!(0.0));
        assert_eq!(out.fields["video_price"], json!(0.0));
        assert_eq!(out.fields["nickname"], json!(""));
        assert_eq!(out.fields["fans_count"], json!(0));
    }
}
