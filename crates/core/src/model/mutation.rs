#![forbid(unsafe_code)]

use super::fields::{EntityFields, EntityKind};
use crate::ids::ClientId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    Conflicted,
    Failed,
}

impl MutationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::Conflicted => "conflicted",
            MutationState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MutationState::Pending),
            "conflicted" => Some(MutationState::Conflicted),
            "failed" => Some(MutationState::Failed),
            _ => None,
        }
    }
}

/// Outbox entry. `payload` is always a full snapshot of the entity's fields at enqueue time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub seq: i64,
    pub kind: EntityKind,
    pub client_id: ClientId,
    pub operation: Operation,
    pub payload: EntityFields,
    pub base_version: Option<i64>,
    pub state: MutationState,
    pub in_flight: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub last_attempt_at_ms: Option<i64>,
    pub next_eligible_at_ms: i64,
}

impl Mutation {
    /// Eligible for sending, ignoring per-entity ordering (which needs the whole queue).
    pub fn is_eligible(&self, now_ms: i64) -> bool {
        self.state == MutationState::Pending
            && !self.in_flight
            && self.next_eligible_at_ms <= now_ms
    }

    /// Cannot have been applied by the server: never attempted, or turned away on a first
    /// attempt that no timeout preceded.
    pub fn never_reached_server(&self) -> bool {
        if self.in_flight {
            return false;
        }
        self.last_attempt_at_ms.is_none()
            || (self.state == MutationState::Failed && self.retry_count == 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMutation {
    pub kind: EntityKind,
    pub client_id: ClientId,
    pub operation: Operation,
    pub payload: EntityFields,
    pub base_version: Option<i64>,
    pub created_at_ms: i64,
}

impl NewMutation {
    pub fn into_mutation(self, seq: i64) -> Mutation {
        Mutation {
            seq,
            kind: self.kind,
            client_id: self.client_id,
            operation: self.operation,
            payload: self.payload,
            base_version: self.base_version,
            state: MutationState::Pending,
            in_flight: false,
            retry_count: 0,
            last_error: None,
            created_at_ms: self.created_at_ms,
            last_attempt_at_ms: None,
            next_eligible_at_ms: self.created_at_ms,
        }
    }
}
