//! Configuration for kolharvest using the prefer crate for discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::browser::BrowserEngineConfig;
use crate::error::{Result, ScrapeError};
use crate::orchestrator::{default_jobs, CollectConfig, Job, JobConfig};
use crate::pagination::PaginationPolicy;
use crate::rate_limit::RateLimitConfig;
use crate::repository::DbContext;
use crate::session::SessionConfig;

/// Default database filename inside the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "kolharvest.db";

/// Default session cookie file inside the data directory.
pub const DEFAULT_SESSION_FILENAME: &str = "session.json";

/// Where things live on disk.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database_filename: String,
    /// Overrides data_dir/database_filename when set. Set via DATABASE_URL.
    pub database_url: Option<String>,
    /// Session file; defaults to `session.json` in the data directory.
    pub session_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        // Local data dir -> Home dir -> Current dir
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kolharvest");

        Self {
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            session_file: None,
        }
    }
}

impl Settings {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Get the database URL, constructing from path if not explicitly set.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite:{}", self.database_path().display()),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    pub fn session_path(&self) -> PathBuf {
        self.session_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_SESSION_FILENAME))
    }

    /// Check if the database appears to be initialized.
    pub fn database_exists(&self) -> bool {
        self.database_url.is_some() || self.database_path().exists()
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.session_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn create_db_context(&self) -> DbContext {
        DbContext::from_url(&self.database_url())
    }
}

/// Config file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory; relative paths resolve against the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename inside the data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    pub browser: BrowserEngineConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub pagination: PaginationPolicy,
    pub collect: CollectConfig,
    /// Jobs by name; entries replace the built-in job of the same name.
    pub jobs: BTreeMap<String, JobConfig>,
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Falls back to defaults when no config file is found or it fails to parse.
    pub async fn load() -> Self {
        match prefer::load("kolharvest").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Ignoring config file {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// The format follows the file extension; anything unknown is read as JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ScrapeError::Config(format!("Failed to parse TOML config: {}", e)))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| ScrapeError::Config(format!("Failed to parse YAML config: {}", e)))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| ScrapeError::Config(format!("Failed to parse JSON config: {}", e)))?,
        };
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// `~` is expanded; other relative paths are joined onto `base_dir`.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref session_file) = self.session_file {
            settings.session_file = Some(self.resolve_path(session_file, base_dir));
        }
    }

    /// Built-in jobs overlaid with the configured ones.
    pub fn all_jobs(&self) -> BTreeMap<String, JobConfig> {
        let mut jobs = default_jobs();
        for (name, job) in &self.jobs {
            jobs.insert(name.clone(), job.clone());
        }
        jobs
    }

    pub fn job(&self, name: &str) -> Result<Job> {
        let mut jobs = self.all_jobs();
        match jobs.remove(name) {
            Some(config) => Ok(Job::new(name, config)),
            None => Err(ScrapeError::Config(format!(
                "unknown job '{}' (known: {})",
                name,
                jobs.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory (--data flag).
    pub data: Option<PathBuf>,
}

/// Find a config file in the data directory.
fn find_config_in_dir(data_dir: &Path) -> Option<PathBuf> {
    let extensions = ["toml", "yaml", "yml", "json"];
    let basenames = ["kolharvest", "config"];

    for basename in basenames {
        for ext in extensions {
            let path = data_dir.join(format!("{}.{}", basename, ext));
            if path.exists() {
                return Some(path);
            }
        }
    }
    None
}

async fn load_file_config(options: &LoadOptions, data_dir: Option<&Path>) -> Result<Config> {
    // Priority 1: Explicit --config flag
    if let Some(ref config_path) = options.config_path {
        return Config::load_from_path(config_path).await;
    }

    // Priority 2: Config inside the data dir
    if let Some(config_path) = data_dir.and_then(find_config_in_dir) {
        tracing::debug!("Found config in data dir: {}", config_path.display());
        return Config::load_from_path(&config_path).await;
    }

    // Priority 3: Auto-discover via prefer
    Ok(Config::load().await)
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Load settings and config. Precedence, lowest first: defaults, config
/// file, environment (`KOLHARVEST_DATA_DIR`, `DATABASE_URL`), `--data`.
pub async fn load_settings_with_options(options: LoadOptions) -> Result<(Settings, Config)> {
    let data_override = options
        .data
        .clone()
        .or_else(|| env_override("KOLHARVEST_DATA_DIR").map(PathBuf::from));

    let config = load_file_config(&options, data_override.as_deref()).await?;

    let mut settings = Settings::default();
    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_to_settings(&mut settings, &base_dir);

    if let Some(data_dir) = data_override {
        settings.data_dir = data_dir;
    }
    if let Some(database_url) = env_override("DATABASE_URL") {
        tracing::debug!("Using DATABASE_URL from environment: {}", database_url);
        settings.database_url = Some(database_url);
    }

    Ok((settings, config))
}
