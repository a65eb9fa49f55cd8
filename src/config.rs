//! Configuration loading
//!
//! Secrets come from environment variables; runtime-tunable settings come
//! from a YAML file that can be reloaded without restarting the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Microsoft Graph application credentials (client-credentials flow).
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl GraphConfig {
    pub fn authority(&self) -> String {
        format!("https://login.microsoftonline.com/{}", self.tenant_id)
    }
}

/// Relay connection settings for the webhook listener.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// e.g. "myrelay.servicebus.windows.net"
    pub namespace: String,
    /// Hybrid connection name, e.g. "webhooks"
    pub connection_name: String,
    pub key_name: String,
    pub key: String,
}

impl RelayConfig {
    /// The public HTTPS address Graph delivers notifications to.
    pub fn webhook_url(&self) -> String {
        format!("https://{}/{}", self.namespace, self.connection_name)
    }
}

/// Summarizer (LLM) credentials.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

/// Runtime settings from config.yaml. Every field has a default so a
/// missing file means "defaults", not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub polling_interval_minutes: u64,
    pub lookback_hours: i64,
    pub pilot_mode_enabled: bool,
    pub max_concurrent_jobs: usize,
    pub job_timeout_minutes: u64,
    pub minimum_meeting_duration_minutes: i64,
    pub worker_heartbeat_interval_seconds: u64,
    pub email_enabled: bool,
    pub teams_chat_enabled: bool,
    pub email_from: Option<String>,
    pub alert_email_enabled: bool,
    pub alert_email_recipients: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            polling_interval_minutes: 5,
            lookback_hours: 48,
            pilot_mode_enabled: true,
            max_concurrent_jobs: 5,
            job_timeout_minutes: 10,
            minimum_meeting_duration_minutes: 5,
            worker_heartbeat_interval_seconds: 30,
            email_enabled: true,
            teams_chat_enabled: true,
            email_from: None,
            alert_email_enabled: true,
            alert_email_recipients: Vec::new(),
        }
    }
}

/// Process-wide configuration: secrets loaded once from the environment,
/// runtime settings behind a lock so they can be hot-reloaded.
pub struct Config {
    pub graph: GraphConfig,
    pub relay: RelayConfig,
    pub summarizer: SummarizerConfig,
    pub db_path: String,
    settings_path: PathBuf,
    settings: RwLock<AppSettings>,
}

impl Config {
    /// Load secrets from the environment and settings from `config.yaml`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let graph = GraphConfig {
            tenant_id: require_env("GRAPH_TENANT_ID")?,
            client_id: require_env("GRAPH_CLIENT_ID")?,
            client_secret: require_env("GRAPH_CLIENT_SECRET")?,
        };

        let relay = RelayConfig {
            namespace: require_env("RELAY_NAMESPACE")?,
            connection_name: std::env::var("RELAY_CONNECTION_NAME")
                .unwrap_or_else(|_| "webhooks".to_string()),
            key_name: std::env::var("RELAY_KEY_NAME")
                .unwrap_or_else(|_| "RootManageSharedAccessKey".to_string()),
            key: require_env("RELAY_KEY")?,
        };

        let summarizer = SummarizerConfig {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: std::env::var("SUMMARIZER_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            max_tokens: std::env::var("SUMMARIZER_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
        };

        let db_path = std::env::var("SCRIBE_DB_PATH").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.meeting-scribe/scribe.db")
        });

        let settings_path = std::env::var("SCRIBE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"));

        let settings = load_settings(&settings_path)?;

        Ok(Self {
            graph,
            relay,
            summarizer,
            db_path,
            settings_path,
            settings: RwLock::new(settings),
        })
    }

    /// Snapshot of the current runtime settings.
    pub fn settings(&self) -> AppSettings {
        self.settings.read().unwrap().clone()
    }

    /// Re-read config.yaml. Missing file resets to defaults.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let fresh = load_settings(&self.settings_path)?;
        *self.settings.write().unwrap() = fresh;
        Ok(())
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnv(name)),
    }
}

fn load_settings(path: &Path) -> Result<AppSettings, ConfigError> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_missing() {
        let settings = load_settings(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(settings.polling_interval_minutes, 5);
        assert_eq!(settings.max_concurrent_jobs, 5);
        assert!(settings.pilot_mode_enabled);
    }

    #[test]
    fn test_partial_yaml_uses_defaults_for_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_jobs: 8\nlookback_hours: 24").unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.max_concurrent_jobs, 8);
        assert_eq!(settings.lookback_hours, 24);
        // untouched fields keep defaults
        assert_eq!(settings.job_timeout_minutes, 10);
        assert!(settings.email_enabled);
    }

    #[test]
    fn test_alert_recipients_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "alert_email_recipients:\n  - ops@example.com\n  - admin@example.com"
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.alert_email_recipients.len(), 2);
    }
}
