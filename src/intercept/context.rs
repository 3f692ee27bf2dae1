//! Single-entity scope for response correlation.
//!
//! Only one entity is active at a time. `begin` resets everything, so a
//! response that belongs to the previous entity can never leak into the next
//! one: keyed responses are checked against the active key, and unkeyed ones
//! must have arrived after `begin`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::types::InterceptedResponse;
use crate::extract::{self, ExtractedRecord, RecordDraft, PROFILE_KEY, PROFILE_KIND};
use crate::orchestrator::WorkItem;

struct ActiveEntity {
    key: String,
    started_at: Instant,
    phase: Option<String>,
    processed: HashSet<String>,
    fired: BTreeMap<String, usize>,
    profile: Map<String, Value>,
    records: Vec<RecordDraft>,
    rejected: usize,
}

impl ActiveEntity {
    fn new(key: String) -> Self {
        Self {
            key,
            started_at: Instant::now(),
            phase: None,
            processed: HashSet::new(),
            fired: BTreeMap::new(),
            profile: Map::new(),
            records: Vec::new(),
            rejected: 0,
        }
    }
}

/// Everything collected for one entity.
#[derive(Debug, Clone, Default)]
pub struct EntityHarvest {
    pub external_key: String,
    /// Merged profile fields, with derived metrics applied.
    pub profile: Map<String, Value>,
    pub records: Vec<ExtractedRecord>,
    pub fired_endpoints: BTreeSet<String>,
    pub rejected: usize,
}

impl EntityHarvest {
    pub fn is_empty(&self) -> bool {
        self.profile.is_empty() && self.records.is_empty()
    }

    /// All records for the store, the merged profile first.
    pub fn into_records(self) -> Vec<ExtractedRecord> {
        let mut out = Vec::with_capacity(self.records.len() + 1);
        if !self.profile.is_empty() {
            out.push(ExtractedRecord {
                kind: PROFILE_KIND.to_string(),
                external_key: self.external_key.clone(),
                natural_key: PROFILE_KEY.to_string(),
                fields: self.profile,
            });
        }
        out.extend(self.records);
        out
    }
}

#[derive(Default)]
pub struct EntityContext {
    active: Option<ActiveEntity>,
    /// Endpoints whose fields take the phase prefix; None means all.
    phased_endpoints: Option<BTreeSet<String>>,
}

impl EntityContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict phase prefixing to `endpoints`. Survives `begin`.
    pub fn with_phased_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phased_endpoints = Some(endpoints.into_iter().map(Into::into).collect());
        self
    }

    /// Start work on `item`, discarding any state from the previous entity.
    pub fn begin(&mut self, item: &WorkItem) {
        self.begin_key(item.external_key.clone());
    }

    pub fn begin_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        if let Some(previous) = self.active.take() {
            if !previous.profile.is_empty() || !previous.records.is_empty() {
                debug!("Discarding unfinished state for {}", previous.key);
            }
        }
        debug!("Begin entity {}", key);
        self.active = Some(ActiveEntity::new(key));
    }

    pub fn current_key(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.key.as_str())
    }

    /// Label for the current UI phase; profile fields merged while a phase is
    /// set are stored as `{phase}_{field}`.
    pub fn set_phase(&mut self, phase: Option<String>) {
        if let Some(active) = self.active.as_mut() {
            active.phase = phase.filter(|p| !p.is_empty());
        }
    }

    /// Whether `response` belongs to the active entity. Does not record it.
    pub fn admits(&self, response: &InterceptedResponse) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        if active.processed.contains(&response.request_id) {
            return false;
        }
        match response.correlated_key.as_deref() {
            Some(key) => key == active.key,
            None => response.arrived_at >= active.started_at,
        }
    }

    /// Accept `response` for the active entity, or reject (and log) it.
    pub fn accept(&mut self, response: &InterceptedResponse) -> bool {
        if self.admits(response) {
            if let Some(active) = self.active.as_mut() {
                active.processed.insert(response.request_id.clone());
            }
            return true;
        }
        if let Some(active) = self.active.as_mut() {
            active.rejected += 1;
            warn!(
                key = %active.key,
                endpoint = %response.endpoint,
                "Rejected response correlated to {:?}",
                response.correlated_key
            );
        }
        false
    }

    pub fn mark_fired(&mut self, endpoint: &str) {
        if let Some(active) = self.active.as_mut() {
            *active.fired.entry(endpoint.to_string()).or_insert(0) += 1;
        }
    }

    pub fn fired_endpoints(&self) -> BTreeSet<String> {
        self.active
            .as_ref()
            .map(|a| a.fired.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// How many responses for `endpoint` were dispatched for this entity.
    pub fn fire_count(&self, endpoint: &str) -> usize {
        self.active
            .as_ref()
            .and_then(|a| a.fired.get(endpoint).copied())
            .unwrap_or(0)
    }

    /// Merge profile-style fields into the entity row.
    pub fn merge_fields(&mut self, fields: Map<String, Value>) {
        self.merge_into_profile(fields, true);
    }

    /// Merge fields produced by `endpoint`; the phase prefix applies only if
    /// the endpoint is phased.
    pub fn merge_endpoint_fields(&mut self, endpoint: &str, fields: Map<String, Value>) {
        let phased = self
            .phased_endpoints
            .as_ref()
            .map(|set| set.contains(endpoint))
            .unwrap_or(true);
        self.merge_into_profile(fields, phased);
    }

    fn merge_into_profile(&mut self, fields: Map<String, Value>, phased: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for (name, value) in fields {
            let name = match &active.phase {
                Some(phase) if phased => format!("{}_{}", phase, name),
                _ => name,
            };
            active.profile.insert(name, value);
        }
    }

    /// Add list-style records. A later record with the same natural key
    /// replaces the earlier one.
    pub fn push_records(&mut self, records: Vec<RecordDraft>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for record in records {
            match active
                .records
                .iter_mut()
                .find(|r| r.natural_key == record.natural_key)
            {
                Some(existing) => *existing = record,
                None => active.records.push(record),
            }
        }
    }

    pub fn has_data(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| !a.profile.is_empty() || !a.records.is_empty())
            .unwrap_or(false)
    }

    /// Close the active entity and hand back what it collected.
    pub fn finish(&mut self) -> Option<EntityHarvest> {
        let active = self.active.take()?;
        let mut profile = active.profile;
        if !profile.is_empty() {
            extract::derive_cost_metrics(&mut profile);
        }
        let key = active.key;
        Some(EntityHarvest {
            records: active
                .records
                .into_iter()
                .map(|draft| ExtractedRecord::from_draft(key.clone(), draft))
                .collect(),
            external_key: key,
            profile,
            fired_endpoints: active.fired.into_keys().collect(),
            rejected: active.rejected,
        })
    }

    /// Take the list records gathered so far without ending the entity.
    /// Used by listings, which persist page by page.
    pub fn drain_records(&mut self) -> Vec<ExtractedRecord> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let key = active.key.clone();
        active
            .records
            .drain(..)
            .map(|draft| ExtractedRecord::from_draft(key.clone(), draft))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn response(request_id: &str, key: Option<&str>, arrived_at: Instant) -> InterceptedResponse {
        InterceptedResponse {
            endpoint: "blogger".to_string(),
            url: "https://x.test/api".to_string(),
            status: 200,
            request_id: request_id.to_string(),
            payload: json!({}),
            correlated_key: key.map(str::to_string),
            arrived_at,
        }
    }

    fn item(key: &str) -> WorkItem {
        WorkItem {
            id: 1,
            external_key: key.to_string(),
            target_url: format!("https://x.test/{}", key),
            label: None,
            attempts: 0,
        }
    }

    #[test]
    fn test_foreign_keys_rejected() {
        let mut ctx = EntityContext::new();
        ctx.begin(&item("U1"));
        assert_eq!(ctx.current_key(), Some("U1"));

        let now = Instant::now();
        assert!(ctx.accept(&response("r1", Some("U1"), now)));
        assert!(!ctx.accept(&response("r2", Some("U2"), now)));
        let harvest = ctx.finish().unwrap();
        assert_eq!(harvest.rejected, 1);
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let mut ctx = EntityContext::new();
        ctx.begin_key("U1");
        let now = Instant::now();
        assert!(ctx.accept(&response("r1", None, now)));
        assert!(!ctx.accept(&response("r1", None, now)));
    }

    #[test]
    fn test_unkeyed_response_from_before_begin_is_fenced() {
        let mut ctx = EntityContext::new();
        let stale = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        ctx.begin_key("U2");
        assert!(!ctx.accept(&response("old", None, stale)));
        assert!(ctx.accept(&response("new", None, Instant::now())));
    }

    #[test]
    fn test_begin_resets_state() {
        let mut ctx = EntityContext::new();
        ctx.begin_key("A");
        ctx.merge_fields(json!({"nickname": "a"}).as_object().cloned().unwrap());
        ctx.mark_fired("blogger");
        let now = Instant::now();
        assert!(ctx.accept(&response("r1", None, now)));

        ctx.begin_key("B");
        assert!(!ctx.has_data());
        assert!(ctx.fired_endpoints().is_empty());
        // request ids are scoped to the entity
        assert!(ctx.accept(&response("r1", Some("B"), now)));
    }

    #[test]
    fn test_phase_prefix_and_metrics_at_finish() {
        let mut ctx = EntityContext::new();
        ctx.begin_key("U1");
        ctx.set_phase(Some("daily".to_string()));
        ctx.merge_fields(
            json!({"exposure_median": 1000, "read_median": 100, "engage_median": 10})
                .as_object()
                .cloned()
                .unwrap(),
        );
        ctx.set_phase(None);
        // price arrives after the medians; order must not matter
        ctx.merge_fields(
            json!({"graphic_price": 2000.0, "video_price": 3000.0})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let harvest = ctx.finish().unwrap();
        assert_eq!(harvest.profile["daily_cpm"], json!(2000.0));
        assert_eq!(harvest.profile["daily_cpc"], json!(20.0));
        assert_eq!(harvest.profile["daily_cpe"], json!(200.0));

        let records = harvest.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].natural_key, PROFILE_KEY);
        assert_eq!(records[0].external_key, "U1");
    }

    #[test]
    fn test_phase_applies_only_to_phased_endpoints() {
        let mut ctx = EntityContext::new().with_phased_endpoints(["notes_rate"]);
        ctx.begin_key("U1");
        ctx.set_phase(Some("coop".to_string()));
        let fields = |v: i64| json!({"read_median": v}).as_object().cloned().unwrap();
        ctx.merge_endpoint_fields("notes_rate", fields(5));
        ctx.merge_endpoint_fields("data_summary", fields(9));
        ctx.mark_fired("notes_rate");
        ctx.mark_fired("notes_rate");
        assert_eq!(ctx.fire_count("notes_rate"), 2);
        assert_eq!(ctx.fire_count("blogger"), 0);

        let harvest = ctx.finish().unwrap();
        assert_eq!(harvest.profile["coop_read_median"], json!(5));
        assert_eq!(harvest.profile["read_median"], json!(9));
    }

    #[test]
    fn test_push_records_replaces_same_key() {
        let mut ctx = EntityContext::new();
        ctx.begin_key("L");
        let draft = |likes: i64| RecordDraft {
            kind: "note".to_string(),
            natural_key: "note:1".to_string(),
            fields: json!({"like_count": likes}).as_object().cloned().unwrap(),
        };
        ctx.push_records(vec![draft(1)]);
        ctx.push_records(vec![draft(2)]);
        let drained = ctx.drain_records();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].fields["like_count"], json!(2));
        assert!(ctx.drain_records().is_empty());
        assert_eq!(ctx.current_key(), Some("L"));
    }
}
