//! Credential resolution.
//!
//! Exactly one auth source is applied to a connection, chosen in the order
//! credentials payload, token, user/password.

use async_nats::ConnectOptions;
use config::AuthConfig;
use tracing::debug;

use crate::error::{ConsoleError, ConsoleResult};

/// Marker every NATS user `.creds` file starts its JWT section with.
pub const CREDS_MARKER: &str = "-----BEGIN NATS USER JWT-----";

/// Credentials supplied for one connect call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Contents of a `.creds` file.
    pub creds: Option<String>,
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("creds", &self.creds.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The auth mode that will be applied to the connection.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Creds(String),
    Token(String),
    UserPassword { user: String, password: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mode())
    }
}

impl Auth {
    /// Short name of the auth mode, safe to log.
    pub fn mode(&self) -> &'static str {
        match self {
            Auth::None => "none",
            Auth::Creds(_) => "creds",
            Auth::Token(_) => "token",
            Auth::UserPassword { .. } => "user_password",
        }
    }

    /// Apply this auth mode to connect options.
    pub fn apply(&self, opts: ConnectOptions) -> ConsoleResult<ConnectOptions> {
        Ok(match self {
            Auth::None => opts,
            Auth::Creds(creds) => opts
                .credentials(creds)
                .map_err(|e| ConsoleError::Auth(format!("unusable credentials: {e}")))?,
            Auth::Token(token) => opts.token(token.clone()),
            Auth::UserPassword { user, password } => {
                opts.user_and_password(user.clone(), password.clone())
            }
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Credentials {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn with_user_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Read configured credential sources, loading the creds file if one is set.
    pub async fn load(auth: &AuthConfig) -> ConsoleResult<Self> {
        let creds = match &auth.creds_file {
            Some(path) => {
                debug!(path = %path.display(), "reading credentials file");
                Some(tokio::fs::read_to_string(path).await.map_err(|e| {
                    ConsoleError::Auth(format!(
                        "failed to read credentials file '{}': {e}",
                        path.display()
                    ))
                })?)
            }
            None => None,
        };
        Ok(Self {
            creds,
            token: auth.token.clone(),
            user: auth.username.clone(),
            password: auth.password.clone(),
        })
    }

    /// Fill any source not set here from `fallback`.
    pub fn or(self, fallback: Credentials) -> Self {
        Self {
            creds: self.creds.or(fallback.creds),
            token: self.token.or(fallback.token),
            user: self.user.or(fallback.user),
            password: self.password.or(fallback.password),
        }
    }

    /// Pick the auth mode, in precedence order creds, token, user/password.
    pub fn resolve(&self) -> ConsoleResult<Auth> {
        if let Some(creds) = non_empty(&self.creds) {
            if !creds.contains(CREDS_MARKER) {
                return Err(ConsoleError::Auth(
                    "credentials payload has no NATS user JWT section".into(),
                ));
            }
            return Ok(Auth::Creds(creds.to_owned()));
        }
        if let Some(token) = non_empty(&self.token) {
            return Ok(Auth::Token(token.to_owned()));
        }
        match (non_empty(&self.user), self.password.as_deref()) {
            (Some(user), Some(password)) => Ok(Auth::UserPassword {
                user: user.to_owned(),
                password: password.to_owned(),
            }),
            (Some(_), None) => Err(ConsoleError::Auth("user given without a password".into())),
            (None, _) => Ok(Auth::None),
        }
    }
}
