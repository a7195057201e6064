// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates workspace credentials and fills sensible defaults for timing and history knobs
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest page size the remote history methods accept.
const MAX_HISTORY_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, rename = "workspace")]
    pub workspaces: Vec<WorkspaceConfig>,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    pub api_token: String,
    /// Browser session cookies, sent alongside `xoxc` tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_cookies: Option<String>,
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

// Custom Debug impl to redact credentials
impl std::fmt::Debug for WorkspaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceConfig")
            .field("name", &self.name)
            .field("api_token", &"[REDACTED]")
            .field("api_cookies", &self.api_cookies.as_ref().map(|_| "[REDACTED]"))
            .field("network_timeout_secs", &self.network_timeout_secs)
            .field("ping_interval_secs", &self.ping_interval_secs)
            .finish()
    }
}

impl WorkspaceConfig {
    pub fn new(name: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_token: api_token.into(),
            api_cookies: None,
            network_timeout_secs: default_network_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Show thread replies inline in the conversation.
    #[serde(default = "default_true")]
    pub display_thread_replies: bool,
    /// Delay between unread backfills after a reconnect.
    #[serde(default = "default_unread_pacing_ms")]
    pub unread_pacing_ms: u64,
    /// Same, when thread replies are fetched too.
    #[serde(default = "default_thread_unread_pacing_ms")]
    pub thread_unread_pacing_ms: u64,
    /// `limit` sent with every paginated history request.
    #[serde(default = "default_history_page_limit")]
    pub history_page_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            display_thread_replies: default_true(),
            unread_pacing_ms: default_unread_pacing_ms(),
            thread_unread_pacing_ms: default_thread_unread_pacing_ms(),
            history_page_limit: default_history_page_limit(),
        }
    }
}

impl HistoryConfig {
    /// Pause between two unread backfills.
    pub fn unread_pacing(&self) -> Duration {
        if self.display_thread_replies {
            Duration::from_millis(self.thread_unread_pacing_ms)
        } else {
            Duration::from_millis(self.unread_pacing_ms)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait used for a 429 without a usable `Retry-After` header.
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_retry_after_secs: default_retry_after_secs(),
        }
    }
}

impl HttpConfig {
    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_network_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    5
}

fn default_unread_pacing_ms() -> u64 {
    1000
}

fn default_thread_unread_pacing_ms() -> u64 {
    20_000
}

fn default_history_page_limit() -> usize {
    MAX_HISTORY_PAGE_LIMIT
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_after_secs() -> u64 {
    5
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} must be a boolean, got: {}", key, val),
    }
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. SLACKLINE_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/slackline/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("SLACKLINE_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration with environment variable overrides.
    /// Searches: SLACKLINE_CONFIG_PATH env var, ./config.toml, then ~/.config/slackline/config.toml
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                Self::from_file(&config_path)?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("SLACK_TOKEN") {
            match self.workspaces.first_mut() {
                Some(workspace) => workspace.api_token = val,
                None => self.workspaces.push(WorkspaceConfig::new("default", val)),
            }
            // Clear from environment to prevent exposure via /proc or ps
            std::env::remove_var("SLACK_TOKEN");
        }
        if let Ok(val) = std::env::var("SLACKLINE_NETWORK_TIMEOUT") {
            let secs: u64 = val.parse().with_context(|| {
                format!("SLACKLINE_NETWORK_TIMEOUT must be a number of seconds, got: {}", val)
            })?;
            for workspace in &mut self.workspaces {
                workspace.network_timeout_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("SLACKLINE_DISPLAY_THREAD_REPLIES") {
            self.history.display_thread_replies = parse_bool("SLACKLINE_DISPLAY_THREAD_REPLIES", &val)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for workspace in &self.workspaces {
            if workspace.name.trim().is_empty() {
                anyhow::bail!("workspace.name must not be empty");
            }
            if !names.insert(workspace.name.as_str()) {
                anyhow::bail!("workspace '{}' is configured twice", workspace.name);
            }
            if workspace.api_token.trim().is_empty() {
                anyhow::bail!(
                    "workspace '{}' has no api_token (set in config.toml or SLACK_TOKEN env var)",
                    workspace.name
                );
            }
            if workspace.network_timeout_secs == 0 {
                anyhow::bail!("workspace '{}': network_timeout_secs must be positive", workspace.name);
            }
            if workspace.ping_interval_secs == 0 {
                anyhow::bail!("workspace '{}': ping_interval_secs must be positive", workspace.name);
            }
        }
        if !(1..=MAX_HISTORY_PAGE_LIMIT).contains(&self.history.history_page_limit) {
            anyhow::bail!(
                "history.history_page_limit must be between 1 and {}, got {}",
                MAX_HISTORY_PAGE_LIMIT,
                self.history.history_page_limit
            );
        }
        Ok(())
    }

    pub fn workspace(&self, name: &str) -> Option<&WorkspaceConfig> {
        self.workspaces.iter().find(|w| w.name == name)
    }
}
