#![forbid(unsafe_code)]

//! Turns a rejected push plus the server's current copy into a resolution or a manual conflict.

use tk_core::{
    ConflictPolicy, EntityRecord, MergeInput, MergeOutcome, RemoteEntity, Side, merge_fields,
};
use tk_storage::{ConflictDetail, Resolution};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Resolved(Resolution),
    Manual(ConflictDetail),
}

/// How a resolved conflict is counted in cycle reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionKind {
    /// Local changes survive and go out again.
    Merged,
    /// The server copy replaced the local one.
    Accepted,
}

impl ResolutionKind {
    pub fn of(resolution: &Resolution) -> Self {
        match resolution {
            Resolution::Merged { fields, remote } if *fields == remote.fields => Self::Accepted,
            Resolution::Merged { .. } | Resolution::ResendDelete { .. } => Self::Merged,
            Resolution::AcceptRemote(_) | Resolution::DropLocal => Self::Accepted,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// `remote` is the server copy fetched after the rejection; `None` if the server never had
    /// the entity.
    pub fn resolve(&self, local: &EntityRecord, remote: Option<&RemoteEntity>) -> Decision {
        let remote_live = remote.filter(|remote| !remote.deleted);
        match (local.deleted, remote_live) {
            (true, None) => match remote {
                Some(tombstone) => Decision::Resolved(Resolution::AcceptRemote(tombstone.clone())),
                None => Decision::Resolved(Resolution::DropLocal),
            },
            (false, None) => self.local_edit_remote_delete(local, remote),
            (true, Some(remote)) => self.local_delete_remote_edit(local, remote),
            (false, Some(remote)) => self.merge(local, remote),
        }
    }

    fn local_edit_remote_delete(
        &self,
        local: &EntityRecord,
        remote: Option<&RemoteEntity>,
    ) -> Decision {
        let remote_ts = remote.map_or(i64::MIN, |r| r.updated_at_ms);
        match self.policy.on_delete.winner(local.updated_at_ms, remote_ts) {
            Some(Side::Remote) => match remote {
                Some(tombstone) => Decision::Resolved(Resolution::AcceptRemote(tombstone.clone())),
                None => Decision::Resolved(Resolution::DropLocal),
            },
            // A delete on the server is not undone by a local edit; the user decides.
            _ => Decision::Manual(detail(local, remote, vec!["deleted".to_string()])),
        }
    }

    fn local_delete_remote_edit(&self, local: &EntityRecord, remote: &RemoteEntity) -> Decision {
        match self
            .policy
            .on_delete
            .winner(local.updated_at_ms, remote.updated_at_ms)
        {
            Some(Side::Local) => Decision::Resolved(Resolution::ResendDelete {
                server_id: remote.server_id.clone(),
                server_version: remote.version,
            }),
            Some(Side::Remote) => Decision::Resolved(Resolution::AcceptRemote(remote.clone())),
            None => Decision::Manual(detail(local, Some(remote), vec!["deleted".to_string()])),
        }
    }

    fn merge(&self, local: &EntityRecord, remote: &RemoteEntity) -> Decision {
        let outcome = merge_fields(
            &self.policy,
            MergeInput {
                base: local.synced_fields.as_ref(),
                local: &local.fields,
                local_updated_at_ms: local.updated_at_ms,
                remote: &remote.fields,
                remote_updated_at_ms: remote.updated_at_ms,
            },
        );
        match outcome {
            MergeOutcome::Merged(fields) => Decision::Resolved(Resolution::Merged {
                fields,
                remote: remote.clone(),
            }),
            MergeOutcome::Unresolved(names) => Decision::Manual(detail(
                local,
                Some(remote),
                names.into_iter().map(str::to_string).collect(),
            )),
        }
    }
}

fn detail(
    local: &EntityRecord,
    remote: Option<&RemoteEntity>,
    fields: Vec<String>,
) -> ConflictDetail {
    ConflictDetail {
        local: local.fields.clone(),
        local_deleted: local.deleted,
        remote: remote.cloned(),
        fields,
    }
}

#[cfg(test)]
mod tests;
