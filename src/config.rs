// Engine configuration and process-wide credential defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::executor::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIMIT, DEFAULT_PORT};

const DEFAULT_KEY_FILE: &str = "~/.ssh/id_rsa";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Settings read from a YAML file, then overridden by CLI flags and
/// environment variables
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Username when a request names none
    pub ssh_username: Option<String>,
    /// Password used when a request carries no credential
    pub ssh_password: Option<String>,
    /// Inline default private key
    pub ssh_key: Option<String>,
    /// Default private key file (`~` is expanded)
    pub ssh_key_file: Option<PathBuf>,
    /// SSH agent socket; enables agent authentication when set
    pub ssh_auth_sock: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub default_limit: Option<usize>,
    pub tunnel_port: Option<u16>,
}

impl EngineConfig {
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content, path)
    }

    /// Apply values from `other` where they are set
    pub fn merge(mut self, other: EngineConfig) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            ssh_username,
            ssh_password,
            ssh_key,
            ssh_key_file,
            ssh_auth_sock,
            connect_timeout_secs,
            default_limit,
            tunnel_port
        );
        self
    }
}

/// Defaults resolved once at start-up and passed into request handling
#[derive(Clone)]
pub struct RuntimeDefaults {
    pub username: String,
    pub password: Option<Zeroizing<String>>,
    pub private_key: Option<Zeroizing<String>>,
    pub agent: bool,
    pub connect_timeout: Duration,
    pub limit: usize,
    pub tunnel_port: u16,
}

impl std::fmt::Debug for RuntimeDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDefaults")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("agent", &self.agent)
            .field("connect_timeout", &self.connect_timeout)
            .field("limit", &self.limit)
            .field("tunnel_port", &self.tunnel_port)
            .finish()
    }
}

impl RuntimeDefaults {
    pub fn resolve(config: &EngineConfig) -> Self {
        let username = config
            .ssh_username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        RuntimeDefaults {
            username,
            password: config.ssh_password.clone().map(Zeroizing::new),
            private_key: default_private_key(config),
            agent: config.ssh_auth_sock.as_deref().is_some_and(|s| !s.is_empty()),
            connect_timeout: config
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            limit: config.default_limit.unwrap_or(DEFAULT_LIMIT),
            tunnel_port: config.tunnel_port.unwrap_or(DEFAULT_PORT),
        }
    }
}

/// Inline key text wins; otherwise the key file if it exists
fn default_private_key(config: &EngineConfig) -> Option<Zeroizing<String>> {
    if let Some(key) = config.ssh_key.as_ref().filter(|k| !k.trim().is_empty()) {
        return Some(Zeroizing::new(key.clone()));
    }

    let path = match &config.ssh_key_file {
        Some(path) => expand_tilde(path),
        None => expand_tilde(Path::new(DEFAULT_KEY_FILE)),
    };
    if !path.exists() {
        debug!(path = %path.display(), "no default private key");
        return None;
    }

    match std::fs::read_to_string(&path) {
        Ok(key) => Some(Zeroizing::new(key)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read default private key");
            None
        }
    }
}

/// Replace a leading `~` with the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Simple home directory lookup
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}
