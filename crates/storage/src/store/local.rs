#![forbid(unsafe_code)]

use super::{
    Backend, ChangeKind, ChangeNotice, PullApplied, StoreError, StoreTx, UserProfile,
    checkpoint_key,
};
use std::sync::mpsc::Receiver;
use tk_core::ids::ClientId;
use tk_core::{EntityKind, EntityRecord, RemoteEntity};

/// Versioned record storage as seen by the UI and the pull phase.
pub trait LocalStore {
    /// Visible record only; tombstones read as absent.
    fn get(&self, client_id: &ClientId) -> Result<Option<EntityRecord>, StoreError>;
    fn get_including_deleted(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<EntityRecord>, StoreError>;
    fn upsert(&mut self, record: EntityRecord) -> Result<(), StoreError>;
    fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError>;
    /// PendingSync and Conflicted records, tombstones included, in creation order.
    fn list_pending(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError>;
    fn apply_pull_batch(
        &mut self,
        kind: EntityKind,
        batch: &[RemoteEntity],
        checkpoint: Option<&str>,
        now_ms: i64,
    ) -> Result<PullApplied, StoreError>;
    fn checkpoint(&self, kind: EntityKind) -> Result<Option<String>, StoreError>;
    fn set_user(&mut self, user: UserProfile) -> Result<(), StoreError>;
    fn current_user(&self) -> Result<Option<UserProfile>, StoreError>;
    fn subscribe(&mut self) -> Receiver<ChangeNotice>;
}

impl<B: Backend> LocalStore for B {
    fn get(&self, client_id: &ClientId) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self
            .get_including_deleted(client_id)?
            .filter(EntityRecord::is_visible))
    }

    fn get_including_deleted(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.read(|r| r.record(client_id))
    }

    fn upsert(&mut self, record: EntityRecord) -> Result<(), StoreError> {
        self.transact(|tx| {
            tx.put_record(&record)?;
            tx.notify(notice(&record, ChangeKind::Upserted));
            Ok(())
        })
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let mut records = self.read(|r| r.records(kind))?;
        records.retain(EntityRecord::is_visible);
        Ok(records)
    }

    fn list_pending(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let mut records = self.read(|r| r.records(kind))?;
        records.retain(|record| record.sync_status.is_pending());
        Ok(records)
    }

    fn apply_pull_batch(
        &mut self,
        kind: EntityKind,
        batch: &[RemoteEntity],
        checkpoint: Option<&str>,
        now_ms: i64,
    ) -> Result<PullApplied, StoreError> {
        if batch.iter().any(|remote| remote.kind() != kind) {
            return Err(StoreError::InvalidInput("pull batch contains another entity kind"));
        }
        self.transact(|tx| {
            let mut applied = PullApplied::default();
            for remote in batch {
                apply_remote_tx(tx, remote, now_ms, &mut applied)?;
            }
            if let Some(checkpoint) = checkpoint {
                tx.set_setting(&checkpoint_key(kind), checkpoint)?;
            }
            Ok(applied)
        })
    }

    fn checkpoint(&self, kind: EntityKind) -> Result<Option<String>, StoreError> {
        self.read(|r| r.setting(&checkpoint_key(kind)))
    }

    fn set_user(&mut self, user: UserProfile) -> Result<(), StoreError> {
        self.transact(|tx| tx.put_user(&user))
    }

    fn current_user(&self) -> Result<Option<UserProfile>, StoreError> {
        self.read(|r| r.user())
    }

    fn subscribe(&mut self) -> Receiver<ChangeNotice> {
        self.watch()
    }
}

pub(crate) fn notice(record: &EntityRecord, change: ChangeKind) -> ChangeNotice {
    ChangeNotice {
        client_id: record.client_id.clone(),
        kind: record.kind(),
        change,
    }
}

fn apply_remote_tx(
    tx: &mut dyn StoreTx,
    remote: &RemoteEntity,
    now_ms: i64,
    applied: &mut PullApplied,
) -> Result<(), StoreError> {
    // Anything still queued for the entity means a local edit is unresolved: park the copy.
    if !tx.mutations_for(&remote.client_id)?.is_empty() {
        let newer = match tx.deferred(&remote.client_id)? {
            Some(existing) => remote.version > existing.version,
            None => true,
        };
        if newer {
            tx.put_deferred(remote, now_ms)?;
        }
        applied.deferred += 1;
        return Ok(());
    }

    let local = tx.record(&remote.client_id)?;
    if remote.deleted {
        tx.delete_deferred(&remote.client_id)?;
        match local {
            Some(local) => {
                tx.delete_record(&local.client_id)?;
                tx.notify(notice(&local, ChangeKind::Removed));
                applied.removed += 1;
            }
            None => applied.unchanged += 1,
        }
        return Ok(());
    }

    let record = match local {
        Some(local)
            if local.sync_status == tk_core::SyncStatus::Synced
                && local.server_version.is_some_and(|v| v >= remote.version) =>
        {
            applied.unchanged += 1;
            return Ok(());
        }
        Some(mut local) => {
            local.overwrite_from_remote(remote, now_ms);
            local
        }
        None => EntityRecord::from_remote(remote, now_ms),
    };
    tx.put_record(&record)?;
    tx.delete_deferred(&record.client_id)?;
    tx.notify(notice(&record, ChangeKind::Upserted));
    applied.applied += 1;
    Ok(())
}
