// Error taxonomy for remote execution

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Which connection of a (possibly tunnelled) host a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// The intermediate jump host
    Tunnel,
    /// The host the commands are meant for
    Target,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Tunnel => write!(f, "tunnel"),
            Stage::Target => write!(f, "target"),
        }
    }
}

/// Coarse classification of an [`ExecError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Timeout,
    Transport,
    Forward,
    Internal,
}

/// A per-host failure. Always attached to that host's result, never
/// propagated out of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecError {
    /// Credentials were rejected
    #[error("authentication failed for {username}@{host} ({stage}): {message}")]
    Authentication {
        stage: Stage,
        host: String,
        username: String,
        message: String,
    },

    /// The handshake did not complete in time
    #[error("timed out after {} connecting to {host} ({stage})", format_timeout(.timeout_ms))]
    Timeout {
        stage: Stage,
        host: String,
        timeout_ms: u64,
    },

    /// DNS, refused, reset, or any other network failure
    #[error("transport error on {host} ({stage}): {message}")]
    Transport {
        stage: Stage,
        host: String,
        message: String,
    },

    /// The tunnel host could not open a path to the target
    #[error("tunnel {tunnel} could not forward to {target}: {message}")]
    Forward {
        tunnel: String,
        target: String,
        message: String,
    },

    /// The host worker itself failed (panic, scheduler shut down)
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Authentication { .. } => ErrorKind::Authentication,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::Transport { .. } => ErrorKind::Transport,
            ExecError::Forward { .. } => ErrorKind::Forward,
            ExecError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The stage a connection-level failure happened in, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExecError::Authentication { stage, .. }
            | ExecError::Timeout { stage, .. }
            | ExecError::Transport { stage, .. } => Some(*stage),
            ExecError::Forward { .. } => Some(Stage::Tunnel),
            ExecError::Internal { .. } => None,
        }
    }

    pub fn transport(stage: Stage, host: impl Into<String>, message: impl fmt::Display) -> Self {
        ExecError::Transport {
            stage,
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(stage: Stage, host: impl Into<String>, timeout: Duration) -> Self {
        ExecError::Timeout {
            stage,
            host: host.into(),
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        ExecError::Internal {
            message: message.to_string(),
        }
    }

    /// Short hint shown next to the error in the text report
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ExecError::Authentication { .. } => {
                Some("Check the username, password or private key for this host")
            }
            ExecError::Timeout { .. } => Some("Check network connectivity and firewall rules"),
            ExecError::Transport { .. } => {
                Some("Ensure the SSH service is running and the address resolves")
            }
            ExecError::Forward { .. } => {
                Some("Ensure the tunnel host can reach the target and allows TCP forwarding")
            }
            ExecError::Internal { .. } => None,
        }
    }
}

fn format_timeout(ms: &u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

/// A malformed batch request. Returned before any host work begins.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no hosts defined to connect to in host or hosts")]
    NoHosts,

    #[error("concurrency limit must be a positive integer, got {0}")]
    InvalidLimit(String),

    #[error("failed to read private key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_stage() {
        let err = ExecError::timeout(Stage::Tunnel, "jump", Duration::from_secs(20));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.stage(), Some(Stage::Tunnel));

        let err = ExecError::Forward {
            tunnel: "jump".to_string(),
            target: "db1:22".to_string(),
            message: "connect failed".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Forward);
        assert_eq!(err.stage(), Some(Stage::Tunnel));
        assert_eq!(ExecError::internal("boom").stage(), None);
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = ExecError::transport(Stage::Target, "web1", "connection refused");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "transport");
        assert_eq!(value["stage"], "target");
        assert_eq!(value["host"], "web1");
        assert_eq!(value["message"], "connection refused");
    }

    #[test]
    fn test_display_mentions_host_and_stage() {
        let err = ExecError::Authentication {
            stage: Stage::Target,
            host: "web1".to_string(),
            username: "deploy".to_string(),
            message: "publickey denied".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("deploy@web1"));
        assert!(text.contains("target"));
    }

    #[test]
    fn test_timeout_keeps_sub_second_precision() {
        let err = ExecError::timeout(Stage::Target, "web1", Duration::from_millis(250));
        assert_eq!(
            err,
            ExecError::Timeout {
                stage: Stage::Target,
                host: "web1".to_string(),
                timeout_ms: 250,
            }
        );
        assert!(err.to_string().starts_with("timed out after 250ms"));

        let err = ExecError::timeout(Stage::Target, "web1", Duration::from_secs(20));
        assert!(err.to_string().starts_with("timed out after 20s"));
        assert_eq!(serde_json::to_value(&err).unwrap()["timeout_ms"], 20000);
    }
}
