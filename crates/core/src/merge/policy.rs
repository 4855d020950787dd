#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Groups of fields that share a tie-break rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldClass {
    /// Task status, progress and completion time.
    Status,
    /// Title, description, notes and category name.
    Text,
    /// Priority, due date, category reference, color and sort order.
    Scalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    ServerWins,
    ClientWins,
    /// Side with the later `updated_at_ms`. Equal timestamps are left for the user.
    LatestWins,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictPolicy {
    pub status: FieldRule,
    pub text: FieldRule,
    pub scalar: FieldRule,
    /// Local delete against remote edit, or local edit against remote delete.
    pub on_delete: FieldRule,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            status: FieldRule::ServerWins,
            text: FieldRule::LatestWins,
            scalar: FieldRule::ServerWins,
            on_delete: FieldRule::Manual,
        }
    }
}

impl ConflictPolicy {
    pub fn rule_for(&self, class: FieldClass) -> FieldRule {
        match class {
            FieldClass::Status => self.status,
            FieldClass::Text => self.text,
            FieldClass::Scalar => self.scalar,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl FieldRule {
    /// `None` means the rule cannot decide and the user has to.
    pub fn winner(self, local_updated_at_ms: i64, remote_updated_at_ms: i64) -> Option<Side> {
        match self {
            FieldRule::ServerWins => Some(Side::Remote),
            FieldRule::ClientWins => Some(Side::Local),
            FieldRule::LatestWins => match local_updated_at_ms.cmp(&remote_updated_at_ms) {
                std::cmp::Ordering::Greater => Some(Side::Local),
                std::cmp::Ordering::Less => Some(Side::Remote),
                std::cmp::Ordering::Equal => None,
            },
            FieldRule::Manual => None,
        }
    }
}
