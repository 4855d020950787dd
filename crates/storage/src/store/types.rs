#![forbid(unsafe_code)]

use tk_core::ids::{ClientId, ConflictId, ServerId};
use tk_core::{EntityFields, EntityKind, EntityRecord, Mutation, RemoteEntity};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Removed,
}

/// Sent to subscribers after a transaction commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeNotice {
    pub client_id: ClientId,
    pub kind: EntityKind,
    pub change: ChangeKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub updated_at_ms: i64,
}

/// What the resolver saw when it gave up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictDetail {
    pub local: EntityFields,
    pub local_deleted: bool,
    /// `None` when the server no longer has the entity.
    pub remote: Option<RemoteEntity>,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub kind: EntityKind,
    pub client_id: ClientId,
    pub seq: i64,
    pub detail: ConflictDetail,
    pub created_at_ms: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: usize,
    pub in_flight: usize,
    pub conflicted: usize,
    pub failed: usize,
}

impl OutboxStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.conflicted + self.failed
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PullApplied {
    pub applied: usize,
    pub removed: usize,
    pub deferred: usize,
    pub unchanged: usize,
}

/// An optimistic local write, committed together with its outbox entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalEdit {
    Create {
        client_id: ClientId,
        fields: EntityFields,
    },
    Update {
        client_id: ClientId,
        fields: EntityFields,
    },
    Delete {
        client_id: ClientId,
    },
}

impl LocalEdit {
    pub fn client_id(&self) -> &ClientId {
        match self {
            LocalEdit::Create { client_id, .. }
            | LocalEdit::Update { client_id, .. }
            | LocalEdit::Delete { client_id } => client_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Enqueued {
        record: EntityRecord,
        mutation: Mutation,
    },
    /// A delete of a never-sent create: record and queue entries dropped locally.
    Purged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckOutcome {
    /// `None` once an acknowledged delete removed the record.
    pub record: Option<EntityRecord>,
    pub applied_deferred: bool,
}

/// A decision produced by conflict resolution, applied atomically by the outbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Send `fields` as an update against the server copy's version.
    Merged {
        fields: EntityFields,
        remote: RemoteEntity,
    },
    /// Take the server copy (a remote tombstone removes the record).
    AcceptRemote(RemoteEntity),
    /// Keep the local delete and send it again against the refreshed version.
    ResendDelete {
        server_id: ServerId,
        server_version: i64,
    },
    /// The server no longer has the entity and the local copy goes too.
    DropLocal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub record: Option<EntityRecord>,
    pub mutation: Option<Mutation>,
}
