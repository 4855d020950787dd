#![forbid(unsafe_code)]

use super::fields::{EntityFields, EntityKind};
use crate::ids::{ClientId, ServerId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    PendingSync,
    Conflicted,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::PendingSync => "pending_sync",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(SyncStatus::Synced),
            "pending_sync" => Some(SyncStatus::PendingSync),
            "conflicted" => Some(SyncStatus::Conflicted),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Statuses that `list_pending` reports.
    pub fn is_pending(self) -> bool {
        matches!(self, SyncStatus::PendingSync | SyncStatus::Conflicted)
    }

    /// Conflicted and Failed survive further local edits until the user acts.
    pub fn after_local_edit(self) -> Self {
        match self {
            SyncStatus::Conflicted | SyncStatus::Failed => self,
            SyncStatus::Synced | SyncStatus::PendingSync => SyncStatus::PendingSync,
        }
    }
}

/// Versioned local copy of a task or category.
///
/// `version` counts every change applied to this copy (local commits and server results alike).
/// `server_version` is the last server version observed for the entity and is what an outgoing
/// mutation claims as its base. `synced_fields` is the last field set known to be on the server;
/// the conflict merge uses it as the common ancestor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityRecord {
    pub client_id: ClientId,
    pub server_id: Option<ServerId>,
    pub version: i64,
    pub server_version: Option<i64>,
    pub sync_status: SyncStatus,
    pub deleted: bool,
    pub fields: EntityFields,
    pub synced_fields: Option<EntityFields>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub synced_at_ms: Option<i64>,
}

impl EntityRecord {
    pub fn new_local(client_id: ClientId, fields: EntityFields, now_ms: i64) -> Self {
        Self {
            client_id,
            server_id: None,
            version: 1,
            server_version: None,
            sync_status: SyncStatus::PendingSync,
            deleted: false,
            fields,
            synced_fields: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            synced_at_ms: None,
        }
    }

    /// A record materialized from a server copy that has no local counterpart.
    pub fn from_remote(remote: &RemoteEntity, now_ms: i64) -> Self {
        Self {
            client_id: remote.client_id.clone(),
            server_id: Some(remote.server_id.clone()),
            version: 1,
            server_version: Some(remote.version),
            sync_status: SyncStatus::Synced,
            deleted: false,
            fields: remote.fields.clone(),
            synced_fields: Some(remote.fields.clone()),
            created_at_ms: now_ms,
            updated_at_ms: remote.updated_at_ms,
            synced_at_ms: Some(now_ms),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.fields.kind()
    }

    pub fn is_visible(&self) -> bool {
        !self.deleted
    }

    /// Optimistic local write: new fields, bumped version.
    pub fn apply_local_edit(&mut self, fields: EntityFields, now_ms: i64) {
        self.fields = fields;
        self.version += 1;
        self.sync_status = self.sync_status.after_local_edit();
        self.updated_at_ms = now_ms;
    }

    pub fn apply_local_delete(&mut self, now_ms: i64) {
        self.deleted = true;
        self.version += 1;
        self.sync_status = self.sync_status.after_local_edit();
        self.updated_at_ms = now_ms;
    }

    /// Server copy overwrites the local one.
    pub fn overwrite_from_remote(&mut self, remote: &RemoteEntity, now_ms: i64) {
        self.server_id = Some(remote.server_id.clone());
        self.server_version = Some(remote.version);
        self.fields = remote.fields.clone();
        self.synced_fields = Some(remote.fields.clone());
        self.deleted = false;
        self.version += 1;
        self.sync_status = SyncStatus::Synced;
        self.updated_at_ms = remote.updated_at_ms;
        self.synced_at_ms = Some(now_ms);
    }
}

/// The server's authoritative copy of an entity, as returned by pull and conflict fetches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub client_id: ClientId,
    pub server_id: ServerId,
    pub version: i64,
    pub fields: EntityFields,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at_ms: i64,
}

impl RemoteEntity {
    pub fn kind(&self) -> EntityKind {
        self.fields.kind()
    }
}

/// Server version of an entity right after the create that made it.
pub const CREATED_SERVER_VERSION: i64 = 1;

/// Server acknowledgement of an applied mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAck {
    pub server_id: ServerId,
    pub version: i64,
    pub updated_at_ms: i64,
}
