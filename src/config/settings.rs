use super::{expand_tilde, home_dir, ConfigError, GLOBAL_STATE_DIR};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const WORKER_BIN_ENV: &str = "POCKETCLAW_WORKER_BIN";
pub const TRANSPORT_API_BASE_ENV: &str = "POCKETCLAW_TRANSPORT_API_BASE";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    pub transport: TransportConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_account_sid_env")]
    pub account_sid_env: String,
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    pub from: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_binary")]
    pub binary: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_activity_throttle_ms")]
    pub activity_throttle_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: default_worker_binary(),
            model: None,
            extra_args: Vec::new(),
            system_prompt: None,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            activity_throttle_ms: default_activity_throttle_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub default_directory: Option<PathBuf>,
    #[serde(default)]
    pub scratch_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_janitor_interval_seconds")]
    pub janitor_interval_seconds: u64,
    #[serde(default = "default_processed_retention_days")]
    pub processed_retention_days: u64,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval_seconds(),
            janitor_interval_seconds: default_janitor_interval_seconds(),
            processed_retention_days: default_processed_retention_days(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_window")]
    pub window: usize,
    #[serde(default = "default_prompt_turns")]
    pub prompt_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window: default_history_window(),
            prompt_turns: default_prompt_turns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_gated_phrases")]
    pub gated_phrases: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_approval_ttl_seconds(),
            gated_phrases: default_gated_phrases(),
        }
    }
}

fn default_account_sid_env() -> String {
    "TWILIO_ACCOUNT_SID".to_string()
}

fn default_auth_token_env() -> String {
    "TWILIO_AUTH_TOKEN".to_string()
}

fn default_max_message_len() -> usize {
    1500
}

fn default_worker_binary() -> String {
    "claude".to_string()
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_activity_throttle_ms() -> u64 {
    1000
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_janitor_interval_seconds() -> u64 {
    3600
}

fn default_processed_retention_days() -> u64 {
    7
}

fn default_shutdown_timeout_seconds() -> u64 {
    5
}

fn default_history_window() -> usize {
    20
}

fn default_prompt_turns() -> usize {
    10
}

fn default_approval_ttl_seconds() -> u64 {
    600
}

fn default_gated_phrases() -> Vec<String> {
    vec![
        "rm -rf".to_string(),
        "git push --force".to_string(),
        "drop table".to_string(),
    ]
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(binary) = std::env::var(WORKER_BIN_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            self.worker.binary = binary;
        }
        if let Some(base) = std::env::var(TRANSPORT_API_BASE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            self.transport.api_base = Some(base);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.whitelist.is_empty() {
            return Err(ConfigError::Settings(
                "`whitelist` must list at least one sender".to_string(),
            ));
        }
        for entry in &self.whitelist {
            if !entry.chars().any(|ch| ch.is_ascii_digit()) {
                return Err(ConfigError::Settings(format!(
                    "whitelist entry `{entry}` contains no digits"
                )));
            }
        }
        if self.transport.from.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`transport.from` must be non-empty".to_string(),
            ));
        }
        if self.transport.max_message_len < 160 {
            return Err(ConfigError::Settings(
                "`transport.max_message_len` must be >= 160".to_string(),
            ));
        }
        if self.worker.binary.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`worker.binary` must be non-empty".to_string(),
            ));
        }
        if self.worker.timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "`worker.timeout_seconds` must be > 0".to_string(),
            ));
        }
        if self.polling.interval_seconds == 0 {
            return Err(ConfigError::Settings(
                "`polling.interval_seconds` must be > 0".to_string(),
            ));
        }
        if self.polling.janitor_interval_seconds == 0 {
            return Err(ConfigError::Settings(
                "`polling.janitor_interval_seconds` must be > 0".to_string(),
            ));
        }
        if self.history.window == 0 {
            return Err(ConfigError::Settings(
                "`history.window` must be > 0".to_string(),
            ));
        }
        if self.approval.ttl_seconds == 0 {
            return Err(ConfigError::Settings(
                "`approval.ttl_seconds` must be > 0".to_string(),
            ));
        }
        for (label, path) in [
            ("workspace.default_directory", &self.workspace.default_directory),
            ("workspace.scratch_directory", &self.workspace.scratch_directory),
            ("state_root", &self.state_root),
        ] {
            if let Some(path) = path {
                let raw = path.to_string_lossy();
                if !path.is_absolute() && !raw.starts_with('~') {
                    return Err(ConfigError::Settings(format!(
                        "`{label}` must be absolute or start with `~`"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, ConfigError> {
        let home = home_dir()?;
        Ok(match &self.state_root {
            Some(path) => expand_tilde(path, &home),
            None => home.join(GLOBAL_STATE_DIR),
        })
    }

    pub fn resolve_default_directory(&self) -> Result<PathBuf, ConfigError> {
        let home = home_dir()?;
        Ok(match &self.workspace.default_directory {
            Some(path) => expand_tilde(path, &home),
            None => home,
        })
    }

    pub fn resolve_scratch_directory(&self) -> Result<PathBuf, ConfigError> {
        let home = home_dir()?;
        Ok(match &self.workspace.scratch_directory {
            Some(path) => expand_tilde(path, &home),
            None => std::env::temp_dir().join("pocketclaw"),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_seconds)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.polling.janitor_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.shutdown_timeout_seconds)
    }

    pub fn processed_retention_ms(&self) -> i64 {
        (self.polling.processed_retention_days as i64).saturating_mul(24 * 60 * 60 * 1000)
    }

    pub fn approval_ttl_ms(&self) -> i64 {
        (self.approval.ttl_seconds as i64).saturating_mul(1000)
    }

    /// Message that receives startup, crash, and recovery notices.
    pub fn operator_address(&self) -> Option<&str> {
        self.operator
            .as_deref()
            .or_else(|| self.whitelist.first().map(String::as_str))
    }
}
