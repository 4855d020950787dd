#![forbid(unsafe_code)]

mod http;
mod memory;
mod wire;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, PushLogEntry};

use crate::auth::Credential;
use tk_core::ids::{ClientId, ServerId};
use tk_core::{EntityFields, EntityKind, Mutation, Operation, RemoteEntity, ServerAck};

/// One outbox entry as sent to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushRequest {
    pub kind: EntityKind,
    pub operation: Operation,
    pub client_id: ClientId,
    pub server_id: Option<ServerId>,
    /// Local version of the entity when the request was built.
    pub version: i64,
    /// Server version the mutation was written against; `None` for a create.
    pub expected_version: Option<i64>,
    pub fields: EntityFields,
    pub idempotency_key: String,
}

impl PushRequest {
    /// Creates are keyed by `client_id` alone so a replay finds the first result.
    pub fn for_mutation(mutation: &Mutation, server_id: Option<ServerId>, version: i64) -> Self {
        let idempotency_key = match mutation.operation {
            Operation::Create => mutation.client_id.as_str().to_string(),
            Operation::Update | Operation::Delete => {
                format!("{}:{}", mutation.client_id.as_str(), mutation.seq)
            }
        };
        Self {
            kind: mutation.kind,
            operation: mutation.operation,
            client_id: mutation.client_id.clone(),
            server_id,
            version,
            expected_version: mutation.base_version,
            fields: mutation.payload.clone(),
            idempotency_key,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub entities: Vec<RemoteEntity>,
    /// Opaque token for the next `list_changes` call.
    pub checkpoint: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Conflict,
    Validation,
    Auth,
    Transient,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteError {
    VersionConflict { server_version: Option<i64> },
    Validation(String),
    Unauthorized(String),
    Unavailable(String),
    Timeout,
    Connection(String),
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::VersionConflict { .. } => FailureClass::Conflict,
            Self::Validation(_) => FailureClass::Validation,
            Self::Unauthorized(_) => FailureClass::Auth,
            Self::Unavailable(_) | Self::Timeout | Self::Connection(_) => FailureClass::Transient,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionConflict {
                server_version: Some(version),
            } => write!(f, "version conflict (server at {version})"),
            Self::VersionConflict {
                server_version: None,
            } => write!(f, "version conflict"),
            Self::Validation(msg) => write!(f, "rejected: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Unavailable(msg) => write!(f, "server unavailable: {msg}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// The task server. Implementations must treat a repeated create with a known `client_id` as a
/// no-op that returns the existing entity. A create leaves the entity at
/// `CREATED_SERVER_VERSION`; a replay acknowledges whatever version it has reached since.
pub trait RemoteClient: Send + Sync {
    fn push(&self, credential: &Credential, request: &PushRequest)
    -> Result<ServerAck, RemoteError>;

    /// Server's current copy, tombstones included; `None` if it never existed.
    fn fetch(
        &self,
        credential: &Credential,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, RemoteError>;

    /// Changes after `since`, or a full listing when there is no checkpoint yet.
    fn list_changes(
        &self,
        credential: &Credential,
        kind: EntityKind,
        since: Option<&str>,
    ) -> Result<ChangeBatch, RemoteError>;
}

impl<T: RemoteClient + ?Sized> RemoteClient for std::sync::Arc<T> {
    fn push(
        &self,
        credential: &Credential,
        request: &PushRequest,
    ) -> Result<ServerAck, RemoteError> {
        (**self).push(credential, request)
    }

    fn fetch(
        &self,
        credential: &Credential,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, RemoteError> {
        (**self).fetch(credential, kind, client_id)
    }

    fn list_changes(
        &self,
        credential: &Credential,
        kind: EntityKind,
        since: Option<&str>,
    ) -> Result<ChangeBatch, RemoteError> {
        (**self).list_changes(credential, kind, since)
    }
}
