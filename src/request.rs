// Normalising a raw caller payload into a validated batch request

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::config::RuntimeDefaults;
use crate::executor::{
    BatchRequest, CommandSource, Credentials, SessionOptions, TunnelHost, DEFAULT_PORT,
};
use crate::output::errors::RequestError;

/// A field that may be given as one string or a list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// A limit sent as a number or as numeric text
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LimitValue {
    Number(i64),
    Text(String),
}

/// The request as a caller sends it, every field optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawRequest {
    pub host: Option<OneOrMany>,
    pub hosts: Option<OneOrMany>,
    pub command: Option<OneOrMany>,
    pub commands: Option<OneOrMany>,
    pub script: Option<OneOrMany>,
    pub limit: Option<LimitValue>,
    pub port: Option<u16>,
    pub tunnel: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Inline private key text
    pub private_key: Option<String>,
    /// Path of an uploaded private key
    pub private_key_file: Option<PathBuf>,
    pub agent_forward: Option<bool>,
}

impl RawRequest {
    /// Validate and resolve against the start-up defaults
    pub fn into_batch(self, defaults: &RuntimeDefaults) -> Result<BatchRequest, RequestError> {
        let hosts = parse_hosts(self.hosts.as_ref().or(self.host.as_ref()))?;
        let commands = resolve_commands([self.command, self.commands, self.script]);
        let limit = parse_limit(self.limit.as_ref(), defaults.limit)?;

        let (username, credentials) = resolve_credentials(
            &CredentialFields {
                username: self.username,
                password: self.password,
                private_key_file: self.private_key_file,
                private_key: self.private_key,
            },
            defaults,
        )?;

        let mut options = SessionOptions::new(username, credentials)
            .with_agent(defaults.agent)
            .with_connect_timeout(defaults.connect_timeout);
        if let Some(tunnel) = self.tunnel.filter(|t| !t.trim().is_empty()) {
            options = options
                .with_tunnel(TunnelHost::new(tunnel.trim()).with_port(defaults.tunnel_port))
                .with_agent_forwarding(defaults.agent);
        }
        if let Some(forward) = self.agent_forward {
            options = options.with_agent_forwarding(forward);
        }

        Ok(BatchRequest::new(hosts, commands, options)
            .with_limit(limit)
            .with_port(self.port.unwrap_or(DEFAULT_PORT)))
    }
}

/// Host list from text (comma separated) or an array. Entries are trimmed
/// and empty entries dropped; duplicates are kept.
pub fn parse_hosts(source: Option<&OneOrMany>) -> Result<Vec<String>, RequestError> {
    let hosts: Vec<String> = match source {
        Some(OneOrMany::One(text)) => text.split(',').map(|h| h.trim().to_string()).collect(),
        Some(OneOrMany::Many(list)) => list.iter().map(|h| h.trim().to_string()).collect(),
        None => Vec::new(),
    };
    let hosts: Vec<String> = hosts.into_iter().filter(|h| !h.is_empty()).collect();

    if hosts.is_empty() {
        return Err(RequestError::NoHosts);
    }
    Ok(hosts)
}

/// The first present source wins; text is split into lines
pub fn resolve_commands<const N: usize>(sources: [Option<OneOrMany>; N]) -> Vec<String> {
    sources
        .into_iter()
        .flatten()
        .next()
        .map(|source| match source {
            OneOrMany::One(text) => CommandSource::Text(text),
            OneOrMany::Many(list) => CommandSource::List(list),
        })
        .map(CommandSource::into_commands)
        .unwrap_or_default()
}

/// Numbers and numeric text must be positive. Anything else that is not a
/// number falls back to the default.
fn parse_limit(value: Option<&LimitValue>, default: usize) -> Result<usize, RequestError> {
    let number = match value {
        None => return Ok(default),
        Some(LimitValue::Number(n)) => *n,
        Some(LimitValue::Text(text)) => match text.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                if !text.trim().is_empty() {
                    warn!(limit = %text, default, "ignoring non-numeric limit");
                }
                return Ok(default);
            }
        },
    };

    match usize::try_from(number) {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(RequestError::InvalidLimit(number.to_string())),
    }
}

/// Credential fields of a request
#[derive(Debug, Default)]
pub struct CredentialFields {
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub private_key: Option<String>,
}

/// Pick the credential, first match wins: request password, uploaded key
/// file, inline key text, default password, default private key, agent.
/// With none of these each host fails authentication on its own.
pub fn resolve_credentials(
    fields: &CredentialFields,
    defaults: &RuntimeDefaults,
) -> Result<(String, Credentials), RequestError> {
    let username = fields
        .username
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| defaults.username.clone());

    let present = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());

    let credentials = if let Some(password) = present(&fields.password) {
        Credentials::password(password)
    } else if let Some(path) = &fields.private_key_file {
        let key = std::fs::read_to_string(path).map_err(|source| RequestError::KeyFile {
            path: path.clone(),
            source,
        })?;
        Credentials::private_key(key)
    } else if let Some(key) = present(&fields.private_key) {
        Credentials::private_key(key)
    } else if let Some(password) = &defaults.password {
        Credentials::Password(password.clone())
    } else if let Some(key) = &defaults.private_key {
        Credentials::PrivateKey(key.clone())
    } else if defaults.agent {
        Credentials::Agent
    } else {
        Credentials::Missing
    };

    Ok((username, credentials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use zeroize::Zeroizing;

    fn defaults() -> RuntimeDefaults {
        RuntimeDefaults {
            username: "svc".to_string(),
            password: None,
            private_key: Some(Zeroizing::new("default-key".to_string())),
            agent: false,
            connect_timeout: Duration::from_secs(20),
            limit: 5,
            tunnel_port: 22,
        }
    }

    fn parse(json: &str) -> RawRequest {
        serde_json::from_str(json).unwrap()
    }

    fn key_text(credentials: &Credentials) -> Option<&str> {
        match credentials {
            Credentials::PrivateKey(key) => Some(key.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_hosts_from_comma_text() {
        let hosts = parse_hosts(Some(&OneOrMany::One(" web1, web2 ,,web1".to_string()))).unwrap();
        assert_eq!(hosts, vec!["web1", "web2", "web1"]);
    }

    #[test]
    fn test_no_hosts_is_request_error() {
        assert!(matches!(parse_hosts(None), Err(RequestError::NoHosts)));
        assert!(matches!(
            parse_hosts(Some(&OneOrMany::One(" , ".to_string()))),
            Err(RequestError::NoHosts)
        ));
    }

    #[test]
    fn test_hosts_field_beats_host() {
        let batch = parse(r#"{"host": "a", "hosts": ["b", "c"], "command": "uptime"}"#)
            .into_batch(&defaults())
            .unwrap();
        assert_eq!(batch.hosts, vec!["b", "c"]);
    }

    #[test]
    fn test_first_command_source_wins() {
        let commands = resolve_commands([
            None,
            Some(OneOrMany::Many(vec!["a".to_string(), "b".to_string()])),
            Some(OneOrMany::One("ignored".to_string())),
        ]);
        assert_eq!(commands, vec!["a", "b"]);

        let commands = resolve_commands([None, None, Some(OneOrMany::One("x\r\ny\n".to_string()))]);
        assert_eq!(commands, vec!["x", "y"]);

        assert!(resolve_commands::<3>([None, None, None]).is_empty());
    }

    #[test]
    fn test_limit_parsing() {
        assert_eq!(parse_limit(None, 5).unwrap(), 5);
        assert_eq!(parse_limit(Some(&LimitValue::Number(8)), 5).unwrap(), 8);
        assert_eq!(parse_limit(Some(&LimitValue::Text("3".to_string())), 5).unwrap(), 3);
        assert!(matches!(
            parse_limit(Some(&LimitValue::Number(0)), 5),
            Err(RequestError::InvalidLimit(_))
        ));
        assert!(matches!(
            parse_limit(Some(&LimitValue::Text("-2".to_string())), 5),
            Err(RequestError::InvalidLimit(_))
        ));
    }

    #[test]
    fn test_non_numeric_limit_uses_default() {
        assert_eq!(parse_limit(Some(&LimitValue::Text("many".to_string())), 5).unwrap(), 5);
        assert_eq!(parse_limit(Some(&LimitValue::Text(" ".to_string())), 7).unwrap(), 7);

        let batch = parse(r#"{"hosts": "web1", "command": "uptime", "limit": "lots"}"#)
            .into_batch(&defaults())
            .unwrap();
        assert_eq!(batch.limit, 5);
    }

    #[test]
    fn test_password_beats_everything() {
        let fields = CredentialFields {
            password: Some("pw".to_string()),
            private_key: Some("inline".to_string()),
            ..Default::default()
        };
        let (user, creds) = resolve_credentials(&fields, &defaults()).unwrap();
        assert_eq!(user, "svc");
        assert!(matches!(creds, Credentials::Password(ref p) if p.as_str() == "pw"));
    }

    #[test]
    fn test_uploaded_key_beats_inline_key() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "uploaded-key").unwrap();
        let fields = CredentialFields {
            username: Some("ops".to_string()),
            private_key_file: Some(file.path().to_path_buf()),
            private_key: Some("inline".to_string()),
            ..Default::default()
        };
        let (user, creds) = resolve_credentials(&fields, &defaults()).unwrap();
        assert_eq!(user, "ops");
        assert_eq!(key_text(&creds), Some("uploaded-key"));
    }

    #[test]
    fn test_missing_uploaded_key_is_error() {
        let fields = CredentialFields {
            private_key_file: Some(PathBuf::from("/nonexistent/upload")),
            ..Default::default()
        };
        assert!(matches!(
            resolve_credentials(&fields, &defaults()),
            Err(RequestError::KeyFile { .. })
        ));
    }

    #[test]
    fn test_default_password_beats_default_key() {
        let mut defaults = defaults();
        defaults.password = Some(Zeroizing::new("default-pw".to_string()));
        let (_, creds) = resolve_credentials(&CredentialFields::default(), &defaults).unwrap();
        assert!(matches!(creds, Credentials::Password(ref p) if p.as_str() == "default-pw"));
    }

    #[test]
    fn test_falls_back_to_default_key_then_agent() {
        let (_, creds) = resolve_credentials(&CredentialFields::default(), &defaults()).unwrap();
        assert_eq!(key_text(&creds), Some("default-key"));

        let mut defaults = defaults();
        defaults.private_key = None;
        defaults.agent = true;
        let (_, creds) = resolve_credentials(&CredentialFields::default(), &defaults).unwrap();
        assert!(matches!(creds, Credentials::Agent));
    }

    #[test]
    fn test_full_request() {
        let batch = parse(
            r#"{
                "hosts": "web1,web2",
                "script": "cd /srv\r\n./deploy.sh\r\n",
                "limit": "2",
                "tunnel": "bastion",
                "username": "deploy",
                "password": "pw"
            }"#,
        )
        .into_batch(&defaults())
        .unwrap();

        assert_eq!(batch.hosts, vec!["web1", "web2"]);
        assert_eq!(batch.commands, vec!["cd /srv", "./deploy.sh"]);
        assert_eq!(batch.limit, 2);
        assert_eq!(batch.port, 22);
        assert_eq!(batch.options.username, "deploy");
        assert_eq!(batch.options.tunnel, Some(TunnelHost::new("bastion")));
    }

    #[test]
    fn test_no_credentials_still_builds_batch() {
        let mut defaults = defaults();
        defaults.private_key = None;

        let (_, creds) = resolve_credentials(&CredentialFields::default(), &defaults).unwrap();
        assert!(matches!(creds, Credentials::Missing));

        let batch = parse(r#"{"hosts": "web1,web2", "command": "uptime"}"#)
            .into_batch(&defaults)
            .unwrap();
        assert_eq!(batch.hosts, vec!["web1", "web2"]);
        assert!(matches!(batch.options.credentials, Credentials::Missing));
    }

    #[test]
    fn test_request_without_hosts_fails() {
        let err = parse(r#"{"command": "uptime"}"#).into_batch(&defaults()).unwrap_err();
        assert!(matches!(err, RequestError::NoHosts));
    }
}
