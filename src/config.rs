use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sessions::{LegacySession, Session};

/// Top-level config, loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Where the session and instance documents live.
    pub data_dir: Option<PathBuf>,
    /// Label sent as the session's friendly name on login.
    pub client_label: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
    /// Session written by an older single-instance client, adopted once.
    pub legacy_session: Option<LegacySessionConfig>,
}

/// Timeouts for probe, login, and configuration requests.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl HttpConfig {
    /// Build the HTTP client shared by the probe, the authenticator, and the
    /// transport.
    pub fn client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
    }
}

/// The `[legacy_session]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacySessionConfig {
    pub instance_url: String,
    pub session_id: String,
    pub token: String,
    pub user_id: String,
}

impl LegacySessionConfig {
    /// A session that was in use by the old client counts as validated.
    pub fn to_legacy(&self) -> LegacySession {
        LegacySession {
            instance_url: self.instance_url.clone(),
            session: Session {
                session_id: self.session_id.clone(),
                token: self.token.clone(),
                user_id: self.user_id.clone(),
                valid: true,
            },
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // The legacy section carries a token.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Configured data directory, else the platform data dir.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Configured client label, else one naming this machine.
    pub fn resolve_client_label(&self) -> String {
        self.client_label
            .clone()
            .unwrap_or_else(|| format!("chatfed ({})", resolve_hostname()))
    }
}

/// `<config_dir>/chatfed/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatfed")
        .join("config.toml")
}

/// `<data_dir>/chatfed`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatfed")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if a file that may hold tokens is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "{} is world-readable (mode {:o}). \
             It may contain tokens -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

/// System hostname, or "unknown".
pub fn resolve_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
