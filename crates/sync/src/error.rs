#![forbid(unsafe_code)]

use crate::auth::AuthError;
use crate::remote::RemoteError;
use std::path::PathBuf;
use tk_storage::StoreError;

/// Why a mutation stopped being sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Conflict,
    TransientNetwork,
    Auth,
    ExhaustedRetries,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::TransientNetwork => "transient_network",
            Self::Auth => "auth",
            Self::ExhaustedRetries => "exhausted_retries",
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_yaml::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "config io ({}): {source}", path.display()),
            Self::Parse(err) => write!(f, "config parse: {err}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Parse(value)
    }
}

#[derive(Debug)]
pub enum SyncError {
    /// The local store failed mid-cycle; the cycle was aborted.
    Unavailable(StoreError),
    Store(StoreError),
    Remote(RemoteError),
    Auth(AuthError),
    Config(ConfigError),
    InvalidInput(&'static str),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(err) => write!(f, "local store unavailable: {err}"),
            Self::Store(err) => write!(f, "store: {err}"),
            Self::Remote(err) => write!(f, "remote: {err}"),
            Self::Auth(err) => write!(f, "auth: {err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unavailable(err) | Self::Store(err) => Some(err),
            Self::Remote(err) => Some(err),
            Self::Auth(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::InvalidInput(_) => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<RemoteError> for SyncError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}

impl From<AuthError> for SyncError {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

impl From<ConfigError> for SyncError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}
