//! Service Configuration
//!
//! Closed configuration records loaded from a JSON file, with environment
//! overrides for secrets. Unknown keys are rejected at load so typos surface
//! immediately instead of silently defaulting.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::error::{AppError, AppResult};
use crate::utils::paths;

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, mutating endpoints require `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8700,
            bearer_token: None,
        }
    }
}

/// Filesystem layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Root under which per-task workspaces are created
    pub workspace_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    /// Directory the rule catalog loads from
    pub rules_dir: Option<PathBuf>,
    /// Optional code checkout mounted for rules with `needs_code`
    pub code_repo_path: Option<PathBuf>,
    /// Days failed-task snapshots are kept before cleanup
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            database_path: None,
            rules_dir: None,
            code_repo_path: None,
            retention_days: 7,
        }
    }
}

/// Worker pool and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    /// Number of concurrent analysis workers
    pub workers: usize,
    /// Non-terminal tasks untouched for longer than this are failed on restart
    pub stale_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            stale_after_secs: 600,
        }
    }
}

/// Resource ceilings for materialization and pre-extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    /// Reject any single archive entry larger than this
    pub max_entry_bytes: u64,
    /// Cap on total uncompressed bytes per task
    pub max_total_bytes: u64,
    /// Matching lines collected per pre-extract pattern
    pub max_matches_per_pattern: usize,
    /// Soft deadline per pre-extract pattern
    pub pattern_deadline_secs: u64,
    /// Per-artifact fetch deadline
    pub artifact_timeout_secs: u64,
    /// Per-artifact decrypt+extract deadline
    pub extract_timeout_secs: u64,
    /// Agent stdout capture ceiling; overflow is truncated with a marker
    pub stdout_cap_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_entry_bytes: 512 * 1024 * 1024,
            max_total_bytes: 2 * 1024 * 1024 * 1024,
            max_matches_per_pattern: 200,
            pattern_deadline_secs: 30,
            artifact_timeout_secs: 300,
            extract_timeout_secs: 300,
            stdout_cap_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Per-provider agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// CLI binary name; defaults to the provider's conventional binary
    pub binary: Option<String>,
    pub model: String,
    pub timeout_secs: Option<u64>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            model: String::new(),
            timeout_secs: None,
            max_turns: None,
            allowed_tools: Vec::new(),
        }
    }
}

/// Agent selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentsConfig {
    /// Global default provider
    pub default: String,
    pub timeout_secs: u64,
    pub max_turns: u32,
    pub providers: BTreeMap<String, ProviderConfig>,
    /// rule id → provider name routes, consulted before the default
    pub routing: BTreeMap<String, String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert("claude_code".to_string(), ProviderConfig::default());
        providers.insert(
            "codex".to_string(),
            ProviderConfig {
                enabled: false,
                ..ProviderConfig::default()
            },
        );
        Self {
            default: "claude_code".to_string(),
            timeout_secs: 300,
            max_turns: 25,
            providers,
            routing: BTreeMap::new(),
        }
    }
}

/// Materializer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MaterializerConfig {
    /// File suffix of proprietary encrypted bundles handed to the codec
    pub encrypted_suffix: String,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            encrypted_suffix: ".enc".to_string(),
        }
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NotifyConfig {
    /// Corporate chat incoming-webhook URL used by issue escalation
    pub chat_webhook_url: Option<String>,
    /// HMAC secret for the chat webhook (env: CASEWORKER_CHAT_SECRET)
    pub chat_webhook_secret: Option<String>,
    /// Project tracker API base URL for follow-up comments
    pub tracker_api_url: Option<String>,
    /// Tracker API token (env: CASEWORKER_TRACKER_TOKEN)
    pub tracker_api_token: Option<String>,
    /// Shared secret verifying inbound tracker webhooks
    pub tracker_webhook_secret: Option<String>,
    /// Mention token that triggers analysis from a tracker comment
    pub tracker_mention: Option<String>,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub limits: LimitsConfig,
    pub agents: AgentsConfig,
    pub materializer: MaterializerConfig,
    pub notify: NotifyConfig,
}

impl AppConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue.workers == 0 {
            return Err("queue.workers must be at least 1".to_string());
        }
        if self.storage.retention_days < 7 {
            return Err("storage.retention_days must be at least 7".to_string());
        }
        if self.agents.default.is_empty() {
            return Err("agents.default must not be empty".to_string());
        }
        if self.limits.max_entry_bytes == 0 || self.limits.max_total_bytes == 0 {
            return Err("limits: byte ceilings must be positive".to_string());
        }
        Ok(())
    }

    /// Resolved workspace root (config override or the home default).
    pub fn workspace_root(&self) -> AppResult<PathBuf> {
        match &self.storage.workspace_root {
            Some(p) => Ok(p.clone()),
            None => paths::workspaces_dir(),
        }
    }

    /// Resolved rules directory.
    pub fn rules_dir(&self) -> AppResult<PathBuf> {
        match &self.storage.rules_dir {
            Some(p) => Ok(p.clone()),
            None => paths::rules_dir(),
        }
    }

    /// Resolved database file path.
    pub fn database_path(&self) -> AppResult<PathBuf> {
        match &self.storage.database_path {
            Some(p) => Ok(p.clone()),
            None => paths::database_path(),
        }
    }

    /// Pull secret values from the environment, overriding file contents.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CASEWORKER_BEARER_TOKEN") {
            self.server.bearer_token = Some(v);
        }
        if let Ok(v) = std::env::var("CASEWORKER_CHAT_SECRET") {
            self.notify.chat_webhook_secret = Some(v);
        }
        if let Ok(v) = std::env::var("CASEWORKER_TRACKER_TOKEN") {
            self.notify.tracker_api_token = Some(v);
        }
        if let Ok(v) = std::env::var("CASEWORKER_TRACKER_SECRET") {
            self.notify.tracker_webhook_secret = Some(v);
        }
    }
}

/// Runtime-tunable subset, applied via the settings API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub workers: Option<usize>,
    pub default_agent: Option<String>,
    pub agent_timeout_secs: Option<u64>,
    pub max_turns: Option<u32>,
    pub routing: Option<BTreeMap<String, String>>,
}

/// Configuration service: loads on startup, persists updates.
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigService {
    /// Load existing config or write defaults to disk.
    pub fn new() -> AppResult<Self> {
        paths::ensure_dir(&paths::data_dir()?)?;
        Self::with_path(paths::config_path()?)
    }

    /// Load from an explicit path (tests, alternate deployments).
    pub fn with_path(config_path: PathBuf) -> AppResult<Self> {
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            let default_config = AppConfig::default();
            Self::save_to_file(&config_path, &default_config)?;
            default_config
        };
        config.apply_env_overrides();
        Ok(Self {
            config_path,
            config,
        })
    }

    fn load_from_file(path: &Path) -> AppResult<AppConfig> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| AppError::config(format!("{}: {}", path.display(), e)))?;
        config.validate().map_err(AppError::validation)?;
        Ok(config)
    }

    fn save_to_file(path: &Path, config: &AppConfig) -> AppResult<()> {
        config.validate().map_err(AppError::validation)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the current configuration
    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    /// Get a clone of the current configuration
    pub fn get_clone(&self) -> AppConfig {
        self.config.clone()
    }

    /// Apply a partial update and persist.
    pub fn update(&mut self, update: ConfigUpdate) -> AppResult<AppConfig> {
        if let Some(workers) = update.workers {
            self.config.queue.workers = workers;
        }
        if let Some(agent) = update.default_agent {
            self.config.agents.default = agent;
        }
        if let Some(timeout) = update.agent_timeout_secs {
            self.config.agents.timeout_secs = timeout;
        }
        if let Some(turns) = update.max_turns {
            self.config.agents.max_turns = turns;
        }
        if let Some(routing) = update.routing {
            self.config.agents.routing = routing;
        }
        Self::save_to_file(&self.config_path, &self.config)?;
        Ok(self.config.clone())
    }

    /// Check if the config service is healthy
    pub fn is_healthy(&self) -> bool {
        self.config.validate().is_ok()
    }
}
