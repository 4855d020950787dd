#![forbid(unsafe_code)]

use super::local::notice;
use super::{
    AckOutcome, Backend, ChangeKind, CommitOutcome, ConflictDetail, ConflictRecord, LocalEdit,
    OutboxStats, Resolution, ResolutionOutcome, StoreError, StoreTx,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tk_core::ids::{ClientId, ConflictId};
use tk_core::{
    BackoffPolicy, EntityKind, EntityRecord, Mutation, MutationState, NewMutation, Operation,
    RemoteEntity, RetryDecision, ServerAck, SyncStatus,
};

/// Durable, ordered queue of mutations awaiting delivery.
///
/// Every operation runs in one backend transaction together with the record update it implies.
pub trait Outbox {
    fn commit_local_edit(
        &mut self,
        edit: LocalEdit,
        now_ms: i64,
    ) -> Result<CommitOutcome, StoreError>;

    fn enqueue(&mut self, mutation: NewMutation) -> Result<Mutation, StoreError>;

    /// Oldest sendable mutation: not in flight, past its backoff gate and first in its entity's
    /// queue.
    fn next_eligible(
        &self,
        kind: Option<EntityKind>,
        now_ms: i64,
    ) -> Result<Option<Mutation>, StoreError>;

    /// `next_eligible`, skipping the given entities.
    fn next_eligible_excluding(
        &self,
        kind: Option<EntityKind>,
        now_ms: i64,
        exclude: &BTreeSet<ClientId>,
    ) -> Result<Option<Mutation>, StoreError>;

    fn begin_attempt(&mut self, seq: i64, now_ms: i64) -> Result<Mutation, StoreError>;
    fn release_attempt(&mut self, seq: i64) -> Result<(), StoreError>;

    /// Removes the entry and records the server's result on the entity.
    fn acknowledge(
        &mut self,
        seq: i64,
        ack: &ServerAck,
        now_ms: i64,
    ) -> Result<AckOutcome, StoreError>;

    fn requeue_with_backoff(
        &mut self,
        seq: i64,
        error: &str,
        policy: &BackoffPolicy,
        now_ms: i64,
    ) -> Result<RetryDecision, StoreError>;

    fn mark_failed(&mut self, seq: i64, reason: &str) -> Result<(), StoreError>;

    fn mark_conflicted(
        &mut self,
        seq: i64,
        detail: ConflictDetail,
        now_ms: i64,
    ) -> Result<ConflictRecord, StoreError>;

    /// Replaces every queued mutation of the entity with the outcome of a resolution.
    fn apply_resolution(
        &mut self,
        client_id: &ClientId,
        resolution: Resolution,
        now_ms: i64,
    ) -> Result<ResolutionOutcome, StoreError>;

    /// Failed entries of the entity go back to Pending with a fresh retry budget.
    fn retry_failed(&mut self, client_id: &ClientId, now_ms: i64) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<OutboxStats, StoreError>;
    fn conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError>;
    fn queued(&self, client_id: &ClientId) -> Result<Vec<Mutation>, StoreError>;
    fn deferred_remote(&self, client_id: &ClientId) -> Result<Option<RemoteEntity>, StoreError>;
}

impl<B: Backend> Outbox for B {
    fn commit_local_edit(
        &mut self,
        edit: LocalEdit,
        now_ms: i64,
    ) -> Result<CommitOutcome, StoreError> {
        self.transact(|tx| commit_local_edit_tx(tx, edit, now_ms))
    }

    fn enqueue(&mut self, mutation: NewMutation) -> Result<Mutation, StoreError> {
        self.transact(|tx| tx.insert_mutation(mutation))
    }

    fn next_eligible(
        &self,
        kind: Option<EntityKind>,
        now_ms: i64,
    ) -> Result<Option<Mutation>, StoreError> {
        self.next_eligible_excluding(kind, now_ms, &BTreeSet::new())
    }

    fn next_eligible_excluding(
        &self,
        kind: Option<EntityKind>,
        now_ms: i64,
        exclude: &BTreeSet<ClientId>,
    ) -> Result<Option<Mutation>, StoreError> {
        self.read(|r| {
            let mut seen = BTreeSet::new();
            for mutation in r.mutations()? {
                // Only the head of each entity's queue may go out.
                if !seen.insert(mutation.client_id.clone()) {
                    continue;
                }
                if exclude.contains(&mutation.client_id) {
                    continue;
                }
                if kind.is_some_and(|kind| kind != mutation.kind) {
                    continue;
                }
                if mutation.is_eligible(now_ms) {
                    return Ok(Some(mutation));
                }
            }
            Ok(None)
        })
    }

    fn begin_attempt(&mut self, seq: i64, now_ms: i64) -> Result<Mutation, StoreError> {
        self.transact(|tx| {
            let mut mutation = mutation_tx(tx, seq)?;
            if mutation.in_flight {
                return Err(StoreError::InvalidInput("mutation is already in flight"));
            }
            mutation.in_flight = true;
            mutation.last_attempt_at_ms = Some(now_ms);
            tx.update_mutation(&mutation)?;
            Ok(mutation)
        })
    }

    fn release_attempt(&mut self, seq: i64) -> Result<(), StoreError> {
        self.transact(|tx| {
            let mut mutation = mutation_tx(tx, seq)?;
            mutation.in_flight = false;
            tx.update_mutation(&mutation)
        })
    }

    fn acknowledge(
        &mut self,
        seq: i64,
        ack: &ServerAck,
        now_ms: i64,
    ) -> Result<AckOutcome, StoreError> {
        self.transact(|tx| acknowledge_tx(tx, seq, ack, now_ms))
    }

    fn requeue_with_backoff(
        &mut self,
        seq: i64,
        error: &str,
        policy: &BackoffPolicy,
        now_ms: i64,
    ) -> Result<RetryDecision, StoreError> {
        self.transact(|tx| {
            let mut mutation = mutation_tx(tx, seq)?;
            mutation.in_flight = false;
            mutation.retry_count = mutation.retry_count.saturating_add(1);
            mutation.last_error = Some(error.to_string());
            let decision = policy.after_failure(mutation.retry_count, now_ms);
            match decision {
                RetryDecision::RetryAt(at_ms) => {
                    mutation.next_eligible_at_ms = at_ms;
                    tx.update_mutation(&mutation)?;
                }
                RetryDecision::Exhausted => {
                    mutation.state = MutationState::Failed;
                    tx.update_mutation(&mutation)?;
                    set_entity_status_tx(tx, &mutation.client_id, SyncStatus::Failed)?;
                }
            }
            Ok(decision)
        })
    }

    fn mark_failed(&mut self, seq: i64, reason: &str) -> Result<(), StoreError> {
        self.transact(|tx| {
            let mut mutation = mutation_tx(tx, seq)?;
            mutation.in_flight = false;
            mutation.state = MutationState::Failed;
            mutation.last_error = Some(reason.to_string());
            tx.update_mutation(&mutation)?;
            set_entity_status_tx(tx, &mutation.client_id, SyncStatus::Failed)
        })
    }

    fn mark_conflicted(
        &mut self,
        seq: i64,
        detail: ConflictDetail,
        now_ms: i64,
    ) -> Result<ConflictRecord, StoreError> {
        self.transact(|tx| {
            let mut mutation = mutation_tx(tx, seq)?;
            mutation.in_flight = false;
            mutation.state = MutationState::Conflicted;
            mutation.last_error = Some(format!("conflict on {}", detail.fields.join(", ")));
            tx.update_mutation(&mutation)?;
            set_entity_status_tx(tx, &mutation.client_id, SyncStatus::Conflicted)?;

            let conflict = ConflictRecord {
                conflict_id: conflict_id_for(&mutation.client_id, seq, now_ms)?,
                kind: mutation.kind,
                client_id: mutation.client_id.clone(),
                seq,
                detail,
                created_at_ms: now_ms,
            };
            tx.delete_conflicts(&mutation.client_id)?;
            tx.put_conflict(&conflict)?;
            Ok(conflict)
        })
    }

    fn apply_resolution(
        &mut self,
        client_id: &ClientId,
        resolution: Resolution,
        now_ms: i64,
    ) -> Result<ResolutionOutcome, StoreError> {
        self.transact(|tx| apply_resolution_tx(tx, client_id, resolution, now_ms))
    }

    fn retry_failed(&mut self, client_id: &ClientId, now_ms: i64) -> Result<usize, StoreError> {
        self.transact(|tx| {
            let queued = tx.mutations_for(client_id)?;
            if queued.is_empty() && tx.record(client_id)?.is_none() {
                return Err(StoreError::UnknownId);
            }
            let mut reset = 0;
            for mut mutation in queued.iter().cloned() {
                if mutation.state != MutationState::Failed {
                    continue;
                }
                mutation.state = MutationState::Pending;
                mutation.retry_count = 0;
                mutation.last_error = None;
                mutation.next_eligible_at_ms = now_ms;
                tx.update_mutation(&mutation)?;
                reset += 1;
            }
            if reset > 0 {
                let still_conflicted = queued
                    .iter()
                    .any(|m| m.state == MutationState::Conflicted);
                let status = if still_conflicted {
                    SyncStatus::Conflicted
                } else {
                    SyncStatus::PendingSync
                };
                set_entity_status_tx(tx, client_id, status)?;
            }
            Ok(reset)
        })
    }

    fn stats(&self) -> Result<OutboxStats, StoreError> {
        self.read(|r| {
            let mut stats = OutboxStats::default();
            for mutation in r.mutations()? {
                if mutation.in_flight {
                    stats.in_flight += 1;
                    continue;
                }
                match mutation.state {
                    MutationState::Pending => stats.pending += 1,
                    MutationState::Conflicted => stats.conflicted += 1,
                    MutationState::Failed => stats.failed += 1,
                }
            }
            Ok(stats)
        })
    }

    fn conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError> {
        self.read(|r| r.conflicts())
    }

    fn queued(&self, client_id: &ClientId) -> Result<Vec<Mutation>, StoreError> {
        self.read(|r| r.mutations_for(client_id))
    }

    fn deferred_remote(&self, client_id: &ClientId) -> Result<Option<RemoteEntity>, StoreError> {
        self.read(|r| r.deferred(client_id))
    }
}

fn mutation_tx(tx: &dyn StoreTx, seq: i64) -> Result<Mutation, StoreError> {
    tx.mutation(seq)?.ok_or(StoreError::UnknownMutation(seq))
}

fn set_entity_status_tx(
    tx: &mut dyn StoreTx,
    client_id: &ClientId,
    status: SyncStatus,
) -> Result<(), StoreError> {
    let Some(mut record) = tx.record(client_id)? else {
        return Ok(());
    };
    if record.sync_status == status {
        return Ok(());
    }
    record.sync_status = status;
    tx.put_record(&record)?;
    tx.notify(notice(&record, ChangeKind::Upserted));
    Ok(())
}

fn commit_local_edit_tx(
    tx: &mut dyn StoreTx,
    edit: LocalEdit,
    now_ms: i64,
) -> Result<CommitOutcome, StoreError> {
    match edit {
        LocalEdit::Create { client_id, fields } => {
            fields
                .validate()
                .map_err(|err| StoreError::InvalidInput(err.message()))?;
            if tx.record(&client_id)?.is_some() {
                return Err(StoreError::InvalidInput("client_id already exists"));
            }
            let record = EntityRecord::new_local(client_id.clone(), fields.clone(), now_ms);
            tx.put_record(&record)?;
            let mutation = tx.insert_mutation(NewMutation {
                kind: record.kind(),
                client_id,
                operation: Operation::Create,
                payload: fields,
                base_version: None,
                created_at_ms: now_ms,
            })?;
            tx.notify(notice(&record, ChangeKind::Upserted));
            Ok(CommitOutcome::Enqueued { record, mutation })
        }
        LocalEdit::Update { client_id, fields } => {
            fields
                .validate()
                .map_err(|err| StoreError::InvalidInput(err.message()))?;
            let mut record = visible_record_tx(tx, &client_id)?;
            if record.kind() != fields.kind() {
                return Err(StoreError::InvalidInput("entity kind cannot change"));
            }
            record.apply_local_edit(fields.clone(), now_ms);
            tx.put_record(&record)?;
            let mutation = tx.insert_mutation(NewMutation {
                kind: record.kind(),
                client_id,
                operation: Operation::Update,
                payload: fields,
                base_version: record.server_version,
                created_at_ms: now_ms,
            })?;
            tx.notify(notice(&record, ChangeKind::Upserted));
            Ok(CommitOutcome::Enqueued { record, mutation })
        }
        LocalEdit::Delete { client_id } => {
            let mut record = visible_record_tx(tx, &client_id)?;
            let queued = tx.mutations_for(&client_id)?;
            // Nothing to delete on the server: drop the entity and its queue here.
            let local_only = record.server_id.is_none()
                && queued.iter().all(Mutation::never_reached_server);
            if local_only {
                for mutation in &queued {
                    tx.delete_mutation(mutation.seq)?;
                }
                tx.delete_record(&client_id)?;
                tx.delete_deferred(&client_id)?;
                tx.delete_conflicts(&client_id)?;
                tx.notify(notice(&record, ChangeKind::Removed));
                return Ok(CommitOutcome::Purged);
            }

            record.apply_local_delete(now_ms);
            tx.put_record(&record)?;
            let mutation = tx.insert_mutation(NewMutation {
                kind: record.kind(),
                client_id,
                operation: Operation::Delete,
                payload: record.fields.clone(),
                base_version: record.server_version,
                created_at_ms: now_ms,
            })?;
            tx.notify(notice(&record, ChangeKind::Removed));
            Ok(CommitOutcome::Enqueued { record, mutation })
        }
    }
}

fn visible_record_tx(tx: &dyn StoreTx, client_id: &ClientId) -> Result<EntityRecord, StoreError> {
    match tx.record(client_id)? {
        Some(record) if record.is_visible() => Ok(record),
        _ => Err(StoreError::UnknownId),
    }
}

fn acknowledge_tx(
    tx: &mut dyn StoreTx,
    seq: i64,
    ack: &ServerAck,
    now_ms: i64,
) -> Result<AckOutcome, StoreError> {
    let mutation = mutation_tx(tx, seq)?;
    tx.delete_mutation(seq)?;

    let Some(mut record) = tx.record(&mutation.client_id)? else {
        return Ok(AckOutcome {
            record: None,
            applied_deferred: false,
        });
    };

    if mutation.operation == Operation::Delete {
        tx.delete_record(&record.client_id)?;
        tx.delete_deferred(&record.client_id)?;
        tx.delete_conflicts(&record.client_id)?;
        for rest in tx.mutations_for(&record.client_id)? {
            tx.delete_mutation(rest.seq)?;
        }
        tx.notify(notice(&record, ChangeKind::Removed));
        return Ok(AckOutcome {
            record: None,
            applied_deferred: false,
        });
    }

    record.server_id = Some(ack.server_id.clone());
    record.server_version = Some(ack.version);
    record.synced_fields = Some(mutation.payload.clone());
    record.version += 1;
    record.synced_at_ms = Some(now_ms);

    let remaining = tx.mutations_for(&record.client_id)?;
    for mut rest in remaining.iter().cloned() {
        rest.base_version = Some(ack.version);
        tx.update_mutation(&rest)?;
    }
    if !remaining.is_empty() {
        tx.put_record(&record)?;
        tx.notify(notice(&record, ChangeKind::Upserted));
        return Ok(AckOutcome {
            record: Some(record),
            applied_deferred: false,
        });
    }

    record.sync_status = SyncStatus::Synced;
    let mut applied_deferred = false;
    if let Some(deferred) = tx.deferred(&record.client_id)? {
        tx.delete_deferred(&record.client_id)?;
        if deferred.version > ack.version {
            applied_deferred = true;
            if deferred.deleted {
                tx.delete_record(&record.client_id)?;
                tx.notify(notice(&record, ChangeKind::Removed));
                return Ok(AckOutcome {
                    record: None,
                    applied_deferred,
                });
            }
            record.overwrite_from_remote(&deferred, now_ms);
        }
    }
    tx.put_record(&record)?;
    tx.notify(notice(&record, ChangeKind::Upserted));
    Ok(AckOutcome {
        record: Some(record),
        applied_deferred,
    })
}

fn apply_resolution_tx(
    tx: &mut dyn StoreTx,
    client_id: &ClientId,
    resolution: Resolution,
    now_ms: i64,
) -> Result<ResolutionOutcome, StoreError> {
    let queued = tx.mutations_for(client_id)?;
    if queued.iter().any(|m| m.in_flight) {
        return Err(StoreError::InvalidInput("entity has a mutation in flight"));
    }
    let mut record = tx.record(client_id)?.ok_or(StoreError::UnknownId)?;
    for mutation in &queued {
        tx.delete_mutation(mutation.seq)?;
    }
    tx.delete_conflicts(client_id)?;
    tx.delete_deferred(client_id)?;

    match resolution {
        Resolution::Merged { fields, remote } => {
            fields
                .validate()
                .map_err(|err| StoreError::InvalidInput(err.message()))?;
            if fields.kind() != record.kind() || remote.kind() != record.kind() {
                return Err(StoreError::InvalidInput("entity kind cannot change"));
            }
            record.server_id = Some(remote.server_id.clone());
            record.server_version = Some(remote.version);
            record.synced_fields = Some(remote.fields.clone());
            record.deleted = false;
            record.version += 1;
            record.updated_at_ms = now_ms;

            if fields == remote.fields {
                record.fields = fields;
                record.sync_status = SyncStatus::Synced;
                record.synced_at_ms = Some(now_ms);
                tx.put_record(&record)?;
                tx.notify(notice(&record, ChangeKind::Upserted));
                return Ok(ResolutionOutcome {
                    record: Some(record),
                    mutation: None,
                });
            }

            record.fields = fields.clone();
            record.sync_status = SyncStatus::PendingSync;
            tx.put_record(&record)?;
            let mutation = tx.insert_mutation(NewMutation {
                kind: record.kind(),
                client_id: client_id.clone(),
                operation: Operation::Update,
                payload: fields,
                base_version: Some(remote.version),
                created_at_ms: now_ms,
            })?;
            tx.notify(notice(&record, ChangeKind::Upserted));
            Ok(ResolutionOutcome {
                record: Some(record),
                mutation: Some(mutation),
            })
        }
        Resolution::AcceptRemote(remote) => {
            if remote.deleted {
                tx.delete_record(client_id)?;
                tx.notify(notice(&record, ChangeKind::Removed));
                return Ok(ResolutionOutcome {
                    record: None,
                    mutation: None,
                });
            }
            record.overwrite_from_remote(&remote, now_ms);
            tx.put_record(&record)?;
            tx.notify(notice(&record, ChangeKind::Upserted));
            Ok(ResolutionOutcome {
                record: Some(record),
                mutation: None,
            })
        }
        Resolution::ResendDelete {
            server_id,
            server_version,
        } => {
            record.server_id = Some(server_id);
            record.server_version = Some(server_version);
            record.deleted = true;
            record.version += 1;
            record.sync_status = SyncStatus::PendingSync;
            record.updated_at_ms = now_ms;
            tx.put_record(&record)?;
            let mutation = tx.insert_mutation(NewMutation {
                kind: record.kind(),
                client_id: client_id.clone(),
                operation: Operation::Delete,
                payload: record.fields.clone(),
                base_version: Some(server_version),
                created_at_ms: now_ms,
            })?;
            tx.notify(notice(&record, ChangeKind::Removed));
            Ok(ResolutionOutcome {
                record: Some(record),
                mutation: Some(mutation),
            })
        }
        Resolution::DropLocal => {
            tx.delete_record(client_id)?;
            tx.notify(notice(&record, ChangeKind::Removed));
            Ok(ResolutionOutcome {
                record: None,
                mutation: None,
            })
        }
    }
}

fn conflict_id_for(client_id: &ClientId, seq: i64, now_ms: i64) -> Result<ConflictId, StoreError> {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(seq.to_le_bytes());
    hasher.update(now_ms.to_le_bytes());
    let digest = hasher.finalize();

    let mut id = String::from("CONFLICT-");
    for byte in &digest[..16] {
        id.push_str(&format!("{byte:02x}"));
    }
    ConflictId::try_new(id).map_err(|_| StoreError::InvalidInput("invalid conflict id"))
}
