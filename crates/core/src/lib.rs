#![forbid(unsafe_code)]

pub mod backoff;
pub mod merge;
pub mod model;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use merge::{
    ConflictPolicy, FieldClass, FieldRule, MergeInput, MergeOutcome, Side, merge_fields,
};
pub use model::*;

pub mod ids {
    use serde::{Deserialize, Serialize};

    const MAX_CLIENT_ID_LEN: usize = 128;

    /// Locally generated, permanent identity of an entity. Doubles as the idempotency key for
    /// Create.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct ClientId(String);

    impl ClientId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, ClientIdError> {
            let value = value.into();
            validate_client_id(&value)?;
            Ok(Self(value))
        }

        pub fn generate() -> Self {
            Self(uuid::Uuid::new_v4().to_string())
        }
    }

    impl std::fmt::Display for ClientId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl TryFrom<String> for ClientId {
        type Error = ClientIdError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::try_new(value)
        }
    }

    impl From<ClientId> for String {
        fn from(value: ClientId) -> Self {
            value.0
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum ClientIdError {
        Empty,
        TooLong,
        InvalidChar { ch: char, index: usize },
    }

    impl ClientIdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "client_id must not be empty",
                Self::TooLong => "client_id is too long",
                Self::InvalidChar { .. } => "client_id may only contain [A-Za-z0-9._:-]",
            }
        }
    }

    impl std::fmt::Display for ClientIdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::InvalidChar { ch, index } => {
                    write!(f, "{} (got {ch:?} at {index})", self.message())
                }
                _ => f.write_str(self.message()),
            }
        }
    }

    impl std::error::Error for ClientIdError {}

    fn validate_client_id(value: &str) -> Result<(), ClientIdError> {
        if value.is_empty() {
            return Err(ClientIdError::Empty);
        }
        if value.len() > MAX_CLIENT_ID_LEN {
            return Err(ClientIdError::TooLong);
        }
        for (index, ch) in value.chars().enumerate() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-') {
                continue;
            }
            return Err(ClientIdError::InvalidChar { ch, index });
        }
        Ok(())
    }

    /// Identity assigned by the server on the first acknowledged Create.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ServerId(String);

    impl ServerId {
        pub fn new(value: impl Into<String>) -> Self {
            Self(value.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl std::fmt::Display for ServerId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConflictId(String);

    impl ConflictId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, ConflictIdError> {
            let value = value.into();
            validate_conflict_id(&value)?;
            Ok(Self(value))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum ConflictIdError {
        Empty,
        InvalidFormat,
    }

    impl ConflictIdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "conflict_id must not be empty",
                Self::InvalidFormat => "conflict_id must match CONFLICT-[0-9a-f]{32}",
            }
        }
    }

    fn validate_conflict_id(value: &str) -> Result<(), ConflictIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ConflictIdError::Empty);
        }
        let Some(hex) = trimmed.strip_prefix("CONFLICT-") else {
            return Err(ConflictIdError::InvalidFormat);
        };
        if hex.len() != 32 {
            return Err(ConflictIdError::InvalidFormat);
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ConflictIdError::InvalidFormat);
        }
        Ok(())
    }

}
