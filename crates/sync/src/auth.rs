#![forbid(unsafe_code)]

use std::sync::Mutex;

/// Bearer token handed to the remote on every request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No session; the user has to sign in again.
    SignedOut,
    /// The refresh endpoint could not be reached.
    Unavailable(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignedOut => write!(f, "signed out"),
            Self::Unavailable(msg) => write!(f, "credential refresh unavailable: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Supplies credentials; the engine refreshes at most once per rejected request.
pub trait AuthProvider: Send + Sync {
    fn current_credential(&self) -> Result<Credential, AuthError>;
    fn refresh_credential(&self) -> Result<Credential, AuthError>;
}

/// Fixed token with an optional replacement handed out on refresh.
#[derive(Debug)]
pub struct StaticAuth {
    current: Mutex<Option<Credential>>,
    refreshed: Option<Credential>,
}

impl StaticAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(Some(Credential::bearer(token))),
            refreshed: None,
        }
    }

    pub fn signed_out() -> Self {
        Self {
            current: Mutex::new(None),
            refreshed: None,
        }
    }

    pub fn with_refresh(mut self, token: impl Into<String>) -> Self {
        self.refreshed = Some(Credential::bearer(token));
        self
    }
}

impl AuthProvider for StaticAuth {
    fn current_credential(&self) -> Result<Credential, AuthError> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.clone().ok_or(AuthError::SignedOut)
    }

    fn refresh_credential(&self) -> Result<Credential, AuthError> {
        let next = self.refreshed.clone().ok_or(AuthError::SignedOut)?;
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = Some(next.clone());
        Ok(next)
    }
}
