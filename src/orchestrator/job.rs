//! Job definitions: what to open, what to intercept, which controls to click.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::intercept::{EndpointPattern, EntityContext, KeySource, ResponseRouter};

/// Placeholder replaced by the work item's external key in `url_template`.
pub const KEY_PLACEHOLDER: &str = "{key}";

pub const PGY_DETAIL_JOB: &str = "pgy-detail";
pub const PGY_MESSAGES_JOB: &str = "pgy-messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One page per work item.
    Detail,
    /// One page, paged with the next control.
    Listing,
}

/// A UI control clicked after the page loaded, to make the page issue more
/// background calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiStep {
    pub name: String,
    pub selector: String,
    /// Phase label for fields merged while this step collects.
    #[serde(default)]
    pub phase: Option<String>,
    /// Endpoints that must fire again before the step counts as done.
    #[serde(default)]
    pub expect: Vec<String>,
    /// How long to wait for the control to show up.
    #[serde(default = "default_step_wait_ms")]
    pub wait_ms: u64,
    /// Collection window after the click; falls back to the job's
    /// `step_timeout_ms`.
    #[serde(default)]
    pub collect_timeout_ms: Option<u64>,
    /// A missing control fails the item instead of being skipped.
    #[serde(default)]
    pub required: bool,
}

fn default_step_wait_ms() -> u64 {
    5_000
}

impl UiStep {
    pub fn new(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: selector.into(),
            phase: None,
            expect: Vec::new(),
            wait_ms: default_step_wait_ms(),
            collect_timeout_ms: None,
            required: false,
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn expect(mut self, endpoint: impl Into<String>) -> Self {
        self.expect.push(endpoint.into());
        self
    }

    pub fn collect_for(mut self, millis: u64) -> Self {
        self.collect_timeout_ms = Some(millis);
        self
    }
}

/// Response collection timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectConfig {
    pub nav_timeout_ms: u64,
    /// Collection window after the page load.
    pub collect_timeout_ms: u64,
    /// Default collection window after a UI step.
    pub step_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            nav_timeout_ms: 30_000,
            collect_timeout_ms: 30_000,
            step_timeout_ms: 15_000,
            poll_interval_ms: 500,
        }
    }
}

impl CollectConfig {
    pub fn nav_timeout(&self) -> Duration {
        Duration::from_millis(self.nav_timeout_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.collect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn step_timeout(&self, step: &UiStep) -> Duration {
        Duration::from_millis(step.collect_timeout_ms.unwrap_or(self.step_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub kind: JobKind,
    /// Page to open; `{key}` is replaced by the item's key for detail jobs.
    pub url_template: String,
    pub endpoints: Vec<EndpointPattern>,
    #[serde(default)]
    pub steps: Vec<UiStep>,
    /// All of these firing means the item succeeded in full.
    #[serde(default)]
    pub expected_endpoints: Vec<String>,
    /// Endpoints the page load must produce before the UI steps run.
    /// Empty means the whole collection window is waited out.
    #[serde(default)]
    pub load_expect: Vec<String>,
    /// Phase label used while collecting the initial page load.
    #[serde(default)]
    pub load_phase: Option<String>,
    /// Endpoints whose fields take the phase prefix. Unset means all.
    #[serde(default)]
    pub phased_endpoints: Option<Vec<String>>,
    /// Next-page control, listing jobs only.
    #[serde(default)]
    pub next_selector: Option<String>,
    /// External key listing records are stored under; defaults to the job name.
    #[serde(default)]
    pub listing_key: Option<String>,
    /// Store "no data" items as failed.
    #[serde(default)]
    pub no_data_is_failure: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    1_000
}

fn pattern(id: &str, fragment: &str, key_source: KeySource) -> EndpointPattern {
    EndpointPattern::new(id, fragment).keyed_by(key_source)
}

fn user_id_param() -> KeySource {
    KeySource::QueryParam {
        name: "userId".to_string(),
    }
}

impl JobConfig {
    /// Creator detail page on the pgy marketplace.
    pub fn pgy_detail() -> Self {
        Self {
            kind: JobKind::Detail,
            url_template: "https://pgy.xiaohongshu.com/solar/pre-trade/blogger-detail/{key}"
                .to_string(),
            endpoints: vec![
                pattern(
                    "blogger",
                    "api/solar/cooperator/user/blogger/",
                    KeySource::PathAfter {
                        segment: "/blogger/".to_string(),
                    },
                ),
                pattern("notes_rate", "api/solar/kol/data_v3/notes_rate", user_id_param()),
                pattern("fans_summary", "kol/data_v3/fans_summary", user_id_param()),
                pattern(
                    "fans_profile",
                    "/fans_profile",
                    KeySource::PathAfter {
                        segment: "/kol/data/".to_string(),
                    },
                ),
                pattern("notes_detail", "kol/data_v2/notes_detail", user_id_param()),
                pattern("data_summary", "kol/data_v3/data_summary", user_id_param()),
            ],
            steps: vec![
                UiStep::new("dismiss-notice", "button >> text=已读").collect_for(1_000),
                UiStep::new("next-step", "button >> text=下一步").collect_for(2_000),
                UiStep::new("by-cost", ".d-spinner-container button >> text=按成本")
                    .expect("data_summary"),
                UiStep::new("coop-notes", ".d-spinner-nested-loading button >> text=合作笔记")
                    .phase("coop")
                    .expect("notes_rate"),
                UiStep::new("all-notes", ".d-spinner-nested-loading button >> text=图文＋视频")
                    .phase("coop")
                    .expect("notes_rate"),
            ],
            expected_endpoints: [
                "blogger",
                "notes_rate",
                "fans_summary",
                "fans_profile",
                "notes_detail",
                "data_summary",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            load_expect: ["blogger", "notes_rate", "fans_summary", "fans_profile", "notes_detail"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            load_phase: Some("daily".to_string()),
            phased_endpoints: Some(vec!["notes_rate".to_string()]),
            next_selector: None,
            listing_key: None,
            no_data_is_failure: false,
            batch_size: default_batch_size(),
        }
    }

    /// Notification list on the pgy marketplace.
    pub fn pgy_messages() -> Self {
        Self {
            kind: JobKind::Listing,
            url_template: "https://pgy.xiaohongshu.com/solar/infra/notification-list".to_string(),
            endpoints: vec![pattern(
                "message_list",
                "api/adsmessage/solar/message/list",
                KeySource::None,
            )],
            steps: Vec::new(),
            expected_endpoints: vec!["message_list".to_string()],
            load_expect: Vec::new(),
            load_phase: None,
            phased_endpoints: None,
            next_selector: Some(
                "div.d-pagination.notice_pagination div.d-pagination-page:has(span svg path[d='M19 12L31 24L19 36'])"
                    .to_string(),
            ),
            listing_key: Some("notifications".to_string()),
            no_data_is_failure: false,
            batch_size: default_batch_size(),
        }
    }
}

/// Built-in jobs, overridable by name in the config file.
pub fn default_jobs() -> BTreeMap<String, JobConfig> {
    let mut jobs = BTreeMap::new();
    jobs.insert(PGY_DETAIL_JOB.to_string(), JobConfig::pgy_detail());
    jobs.insert(PGY_MESSAGES_JOB.to_string(), JobConfig::pgy_messages());
    jobs
}

/// A job ready to run: its config plus the router built from it.
pub struct Job {
    pub name: String,
    pub config: JobConfig,
    router: ResponseRouter,
}

impl Job {
    pub fn new(name: impl Into<String>, config: JobConfig) -> Self {
        let router = ResponseRouter::with_extractors(config.endpoints.clone());
        Self {
            name: name.into(),
            config,
            router,
        }
    }

    pub fn router(&self) -> &ResponseRouter {
        &self.router
    }

    pub fn entity_context(&self) -> EntityContext {
        match &self.config.phased_endpoints {
            Some(endpoints) => EntityContext::new().with_phased_endpoints(endpoints.iter().cloned()),
            None => EntityContext::new(),
        }
    }

    pub fn target_url(&self, external_key: &str) -> String {
        self.config.url_template.replace(KEY_PLACEHOLDER, external_key)
    }

    pub fn listing_key(&self) -> &str {
        self.config.listing_key.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_substitutes_key() {
        let job = Job::new(PGY_DETAIL_JOB, JobConfig::pgy_detail());
        assert_eq!(
            job.target_url("5f00abc"),
            "https://pgy.xiaohongshu.com/solar/pre-trade/blogger-detail/5f00abc"
        );
        assert_eq!(job.router().patterns().count(), 6);
    }

    #[test]
    fn test_builtin_jobs_only_use_known_extractors() {
        for (name, config) in default_jobs() {
            for pattern in &config.endpoints {
                assert!(
                    crate::extract::has_extractor(&pattern.id),
                    "{} uses {}",
                    name,
                    pattern.id
                );
            }
        }
    }

    #[test]
    fn test_listing_key_defaults_to_job_name() {
        let mut config = JobConfig::pgy_messages();
        assert_eq!(Job::new("m", config.clone()).listing_key(), "notifications");
        config.listing_key = None;
        assert_eq!(Job::new("m", config).listing_key(), "m");
    }

    #[test]
    fn test_job_config_from_toml() {
        let config: JobConfig = toml::from_str(
            r#"
            kind = "detail"
            url_template = "https://site.test/creator/{key}"
            expected_endpoints = ["profile"]

            [[endpoints]]
            id = "blogger"
            fragments = ["/api/creator/"]
            key_source = { kind = "path_after", segment = "/creator/" }

            [[steps]]
            name = "stats"
            selector = "button >> text=Stats"
            expect = ["blogger"]
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, JobKind::Detail);
        assert_eq!(config.batch_size, 1_000);
        assert_eq!(config.steps[0].wait_ms, 5_000);
        assert!(!config.steps[0].required);
    }
}
