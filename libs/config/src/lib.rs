use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::Recents;

/// console config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    /// server urls tried in order by the client library
    pub servers: Vec<String>,
    /// false while `servers` is only the built-in default
    pub servers_explicit: bool,
    /// client name reported to the server
    pub name: String,
    pub auth: AuthConfig,
    pub tls_ca_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub connect_retry_max: u32,
    /// used by `req` when the caller does not supply a timeout
    pub request_timeout: Duration,
    pub stats_interval: Duration,
    pub event_channel_size: usize,
    pub log_capacity: usize,
    pub recents: Recents,
    /// file the config was loaded from, if any
    pub path: Option<PathBuf>,
}

/// where credentials come from, before they are loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub creds_file: Option<PathBuf>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<wire::Auth> for AuthConfig {
    fn from(auth: wire::Auth) -> Self {
        Self {
            creds_file: auth.creds_file,
            token: auth.token,
            username: auth.username,
            password: auth.password,
        }
    }
}

impl TryFrom<wire::Config> for ConsoleConfig {
    type Error = anyhow::Error;
    fn try_from(cfg: wire::Config) -> Result<Self> {
        let servers_explicit = cfg.servers.is_some();
        let servers = match cfg.servers {
            Some(list) => list
                .into_vec()
                .into_iter()
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>(),
            None => vec![wire::DEFAULT_SERVER.to_owned()],
        };
        if servers.is_empty() {
            bail!("at least one server url is required");
        }
        if cfg.event_channel_size == 0 {
            bail!("event_channel_size must be greater than zero");
        }
        if cfg.log_capacity == 0 {
            bail!("log_capacity must be greater than zero");
        }
        if cfg.recents.urls == 0 || cfg.recents.subjects == 0 {
            bail!("recents limits must be greater than zero");
        }
        if cfg.auth.username.is_some() != cfg.auth.password.is_some() {
            bail!("auth requires both 'username' and 'password' or neither");
        }

        Ok(Self {
            servers,
            servers_explicit,
            name: cfg.name,
            auth: cfg.auth.into(),
            tls_ca_path: cfg.tls_ca_path,
            connect_timeout: cfg.connect_timeout,
            connect_retry_max: cfg.connect_retry_max,
            request_timeout: cfg.request_timeout,
            stats_interval: cfg.stats_interval,
            event_channel_size: cfg.event_channel_size,
            log_capacity: cfg.log_capacity,
            recents: cfg.recents,
            path: None,
        })
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            servers: vec![wire::DEFAULT_SERVER.to_owned()],
            servers_explicit: false,
            name: wire::default_name(),
            auth: AuthConfig::default(),
            tls_ca_path: None,
            connect_timeout: wire::default_connect_timeout(),
            connect_retry_max: 0,
            request_timeout: wire::default_request_timeout(),
            stats_interval: wire::default_stats_interval(),
            event_channel_size: wire::default_event_channel_size(),
            log_capacity: wire::default_log_capacity(),
            recents: wire::Recents::default(),
            path: None,
        }
    }
}

impl ConsoleConfig {
    /// reads the config file and decodes it first as JSON, then YAML, erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        debug!(?config);
        Ok(config)
    }

    /// Decode from yaml
    pub fn yaml<S: AsRef<str>>(input: S) -> Result<Self> {
        Self::try_from(serde_yaml::from_str::<wire::Config>(input.as_ref())?)
    }

    /// Decode from json
    pub fn json<S: AsRef<str>>(input: S) -> Result<Self> {
        Self::try_from(serde_json::from_str::<wire::Config>(input.as_ref())?)
    }

    /// Attempts to decode input as json, then yaml, and if both fail will return Err
    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        match Self::json(input.as_ref()) {
            Ok(r) => Ok(r),
            Err(_err) => Self::yaml(input.as_ref()),
        }
    }

    /// replace the server list with a single url
    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.servers = vec![url.into()];
        self.servers_explicit = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default() {
        let cfg = ConsoleConfig::default();
        assert_eq!(cfg.servers, vec![wire::DEFAULT_SERVER]);
        assert!(!cfg.servers_explicit);
        assert_eq!(cfg.stats_interval, Duration::from_secs(2));
        assert_eq!(cfg.recents.urls, 5);
        assert_eq!(cfg.recents.subjects, 10);
        assert_eq!(cfg.auth, AuthConfig::default());
        assert!(cfg.path.is_none());
    }

    #[test]
    fn test_json_then_yaml() {
        let json = ConsoleConfig::new(r#"{"servers": "nats://json:4222"}"#).unwrap();
        assert_eq!(json.servers, vec!["nats://json:4222"]);
        assert!(json.servers_explicit);

        let yaml = ConsoleConfig::new("servers:\n  - nats://yaml:4222\nname: ops\n").unwrap();
        assert_eq!(yaml.servers, vec!["nats://yaml:4222"]);
        assert_eq!(yaml.name, "ops");
    }

    #[test]
    fn test_empty_servers_rejected() {
        let err = ConsoleConfig::new(r#"{"servers": []}"#).unwrap_err();
        assert!(err.to_string().contains("server"));
    }

    #[test]
    fn test_partial_user_password_rejected() {
        assert!(ConsoleConfig::new(r#"{"auth": {"username": "admin"}}"#).is_err());
        let cfg =
            ConsoleConfig::new(r#"{"auth": {"username": "admin", "password": "pw"}}"#).unwrap();
        assert_eq!(cfg.auth.username.as_deref(), Some("admin"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(ConsoleConfig::new(r#"{"event_channel_size": 0}"#).is_err());
        assert!(ConsoleConfig::new(r#"{"recents": {"urls": 0}}"#).is_err());
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "servers: nats://file:4222\nrequest_timeout: 250ms").unwrap();
        let cfg = ConsoleConfig::parse(file.path()).unwrap();
        assert_eq!(cfg.servers, vec!["nats://file:4222"]);
        assert_eq!(cfg.request_timeout, Duration::from_millis(250));
        assert_eq!(cfg.path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_parse_missing_file() {
        let err = ConsoleConfig::parse("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to find config"));
    }

    #[test]
    fn test_with_server() {
        let cfg = ConsoleConfig::default().with_server("nats://other:4222");
        assert_eq!(cfg.servers, vec!["nats://other:4222"]);
        assert!(cfg.servers_explicit);
    }

    #[test]
    fn test_servers_default_is_not_explicit() {
        let cfg = ConsoleConfig::new(r#"{"name": "ops"}"#).unwrap();
        assert_eq!(cfg.servers, vec![wire::DEFAULT_SERVER]);
        assert!(!cfg.servers_explicit);

        let cfg = ConsoleConfig::new(r#"{"servers": ["nats://a:4222", "nats://b:4222"]}"#).unwrap();
        assert_eq!(cfg.servers, vec!["nats://a:4222", "nats://b:4222"]);
        assert!(cfg.servers_explicit);
    }
}
