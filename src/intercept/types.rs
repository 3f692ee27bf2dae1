//! Endpoint patterns and intercepted responses.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// How a response reveals which entity it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeySource {
    /// The response carries no key; it belongs to whatever entity is active.
    #[default]
    None,
    /// `?userId=...`
    QueryParam { name: String },
    /// The path segment following `segment`, e.g. `/blogger/{id}`.
    PathAfter { segment: String },
    /// A JSON pointer into the body, e.g. `/data/userId`.
    PayloadPointer { pointer: String },
}

/// A background call worth intercepting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPattern {
    /// Also selects the extractor.
    pub id: String,
    /// Matches when any fragment is a substring of the URL.
    pub fragments: Vec<String>,
    #[serde(default)]
    pub key_source: KeySource,
}

impl EndpointPattern {
    pub fn new(id: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fragments: vec![fragment.into()],
            key_source: KeySource::None,
        }
    }

    pub fn keyed_by(mut self, key_source: KeySource) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn matches(&self, url: &str) -> bool {
        self.fragments
            .iter()
            .any(|fragment| !fragment.is_empty() && url.contains(fragment.as_str()))
    }

    /// The entity key this response carries, if the pattern defines one.
    pub fn derive_key(&self, url: &str, payload: &serde_json::Value) -> Option<String> {
        match &self.key_source {
            KeySource::None => None,
            KeySource::QueryParam { name } => url::Url::parse(url).ok().and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == name.as_str())
                    .map(|(_, v)| v.into_owned())
            }),
            KeySource::PathAfter { segment } => {
                let path = url::Url::parse(url)
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|_| url.split('?').next().unwrap_or_default().to_string());
                let start = path.find(segment.as_str())? + segment.len();
                path[start..]
                    .trim_start_matches('/')
                    .split('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            }
            KeySource::PayloadPointer { pointer } => match payload.pointer(pointer)? {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
        }
    }
}

/// A matched, parsed response ready for dispatch.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub endpoint: String,
    pub url: String,
    pub status: u16,
    pub request_id: String,
    pub payload: serde_json::Value,
    /// Entity key derived from the response; None if the pattern has none.
    pub correlated_key: Option<String>,
    pub arrived_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_sources() {
        let url = "https://pgy.xiaohongshu.com/api/solar/cooperator/user/blogger/5f00abc?x=1";
        let by_path = EndpointPattern::new("blogger", "cooperator/user/blogger/").keyed_by(
            KeySource::PathAfter {
                segment: "/blogger/".to_string(),
            },
        );
        assert!(by_path.matches(url));
        assert_eq!(by_path.derive_key(url, &json!({})), Some("5f00abc".to_string()));

        let by_query = EndpointPattern::new("notes_rate", "notes_rate").keyed_by(KeySource::QueryParam {
            name: "userId".to_string(),
        });
        assert_eq!(
            by_query.derive_key(
                "https://pgy.xiaohongshu.com/api/solar/kol/data_v3/notes_rate?userId=u1&business=0",
                &json!({})
            ),
            Some("u1".to_string())
        );
        assert_eq!(by_query.derive_key("https://x.test/notes_rate", &json!({})), None);

        let by_pointer = EndpointPattern::new("fans", "fans").keyed_by(KeySource::PayloadPointer {
            pointer: "/data/userId".to_string(),
        });
        assert_eq!(
            by_pointer.derive_key("https://x.test/fans", &json!({"data": {"userId": 7}})),
            Some("7".to_string())
        );
    }

    #[test]
    fn test_key_source_config_format() {
        let pattern: EndpointPattern = toml::from_str(
            r#"
            id = "blogger"
            fragments = ["cooperator/user/blogger/"]
            key_source = { kind = "path_after", segment = "/blogger/" }
            "#,
        )
        .unwrap();
        assert_eq!(
            pattern.key_source,
            KeySource::PathAfter {
                segment: "/blogger/".to_string()
            }
        );
    }
}
