//! Bridge configuration loaded from `config.json`.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::telegram::DEFAULT_API_BASE_URL;

pub const CONFIG_ENV: &str = "PANE_RELAY_CONFIG";
pub const BOT_TOKEN_ENV: &str = "PANE_RELAY_BOT_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bot API token. `$PANE_RELAY_BOT_TOKEN` takes precedence.
    #[serde(default)]
    pub bot_token: String,

    /// Forum supergroup that hosts one topic per session.
    pub group_chat_id: i64,

    /// The only Telegram user whose replies are injected.
    pub user_id: i64,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Where the registry, pid file and logs live. Defaults to the directory
    /// holding the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: BridgeConfig = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.apply_token_override(std::env::var(BOT_TOKEN_ENV).ok());
        if config.bot_token.trim().is_empty() {
            bail!(
                "no bot token: set `bot_token` in {} or {}",
                path.display(),
                BOT_TOKEN_ENV
            );
        }
        Ok(config)
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.bot_token = token.trim().to_string();
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn runtime_paths(&self, config_path: &Path) -> RuntimePaths {
        let state_dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => config_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        RuntimePaths::new(state_dir)
    }
}

/// `--config`, then `$PANE_RELAY_CONFIG`, then the per-user config directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir().context("could not determine the user config directory")?;
    Ok(dir.join("pane-relay").join("config.json"))
}

/// Files the bridge keeps in its state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub state_dir: PathBuf,
    pub registry: PathBuf,
    pub daemon_pid: PathBuf,
    pub daemon_lock: PathBuf,
    pub daemon_log: PathBuf,
    pub hooks_log: PathBuf,
}

impl RuntimePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            registry: state_dir.join("sessions.json"),
            daemon_pid: state_dir.join("daemon.pid"),
            daemon_lock: state_dir.join("daemon.lock"),
            daemon_log: state_dir.join("daemon.log"),
            hooks_log: state_dir.join("hooks.log"),
            state_dir,
        }
    }

    pub fn ensure_state_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("failed to create {}", self.state_dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::{BridgeConfig, RuntimePaths};

    fn parse(body: &str) -> BridgeConfig {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let config = parse(r#"{"bot_token":"t","group_chat_id":-100,"user_id":7}"#);
        assert_eq!(config.poll_timeout(), Duration::from_secs(30));
        assert_eq!(config.lock_timeout(), Duration::from_millis(5000));
        assert_eq!(config.api_base_url, "https://api.telegram.org");
        assert_eq!(config.log_level, "info");
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn missing_required_ids_fail() {
        assert!(serde_json::from_str::<BridgeConfig>(r#"{"bot_token":"t"}"#).is_err());
    }

    #[test]
    fn env_token_overrides_file_token() {
        let mut config = parse(r#"{"bot_token":"file","group_chat_id":-1,"user_id":1}"#);
        config.apply_token_override(Some("  ".into()));
        assert_eq!(config.bot_token, "file");
        config.apply_token_override(Some("env".into()));
        assert_eq!(config.bot_token, "env");
    }

    #[test]
    fn load_rejects_missing_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"group_chat_id":-1,"user_id":1}"#).unwrap();
        if std::env::var_os(super::BOT_TOKEN_ENV).is_none() {
            assert!(BridgeConfig::load(&path).is_err());
        }
    }

    #[test]
    fn state_dir_defaults_to_config_directory() {
        let config = parse(r#"{"bot_token":"t","group_chat_id":-1,"user_id":1}"#);
        let paths = config.runtime_paths(Path::new("/etc/pane-relay/config.json"));
        assert_eq!(paths, RuntimePaths::new("/etc/pane-relay"));
        assert_eq!(
            paths.registry,
            Path::new("/etc/pane-relay/sessions.json")
        );

        let config = parse(
            r#"{"bot_token":"t","group_chat_id":-1,"user_id":1,"state_dir":"/var/lib/relay"}"#,
        );
        let paths = config.runtime_paths(Path::new("/etc/pane-relay/config.json"));
        assert_eq!(paths.daemon_pid, Path::new("/var/lib/relay/daemon.pid"));
    }
}
