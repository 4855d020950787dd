#![forbid(unsafe_code)]

use super::{CycleReport, MutationFailure, SyncEngine};
use crate::auth::AuthProvider;
use crate::clock::ts_ms_to_rfc3339;
use crate::conflict::{Decision, ResolutionKind};
use crate::error::FailureKind;
use crate::lease::Lease;
use crate::remote::{FailureClass, PushRequest, RemoteClient, RemoteError};
use std::collections::{BTreeMap, BTreeSet};
use tk_core::ids::ClientId;
use tk_core::{CREATED_SERVER_VERSION, Mutation, Operation, RetryDecision, ServerAck};
use tk_storage::{Backend, LocalStore, Outbox, StoreError};

/// A mutation marked in flight, with the lease that keeps its entity to this request.
struct Claim<'a> {
    mutation: Mutation,
    request: PushRequest,
    _lease: Lease<'a>,
}

type Sent = (Result<ServerAck, RemoteError>, bool);

#[derive(Default)]
struct PushScope {
    /// Entities not to be claimed again in this cycle.
    excluded: BTreeSet<ClientId>,
    conflict_rounds: BTreeMap<ClientId, u32>,
}

impl<S, R, A> SyncEngine<S, R, A>
where
    S: Backend + Send,
    R: RemoteClient,
    A: AuthProvider,
{
    pub(super) fn push_phase(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        let mut scope = PushScope::default();
        loop {
            if self.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let wave = self.claim_wave(&mut scope)?;
            if wave.is_empty() {
                return Ok(());
            }
            let sent = self.send_wave(&wave);
            self.settle_wave(wave, sent, report, &mut scope)?;
        }
    }

    /// Marks up to `max_in_flight` eligible mutations in flight, at most one per entity.
    fn claim_wave(&self, scope: &mut PushScope) -> Result<Vec<Claim<'_>>, StoreError> {
        let now_ms = self.now_ms();
        let mut store = self.lock_store()?;
        let mut wave = Vec::new();
        if let Err(err) = self.claim_into(&mut store, now_ms, scope, &mut wave) {
            for claim in &wave {
                let _ = store.release_attempt(claim.mutation.seq);
            }
            return Err(err);
        }
        Ok(wave)
    }

    fn claim_into<'a>(
        &'a self,
        store: &mut S,
        now_ms: i64,
        scope: &mut PushScope,
        wave: &mut Vec<Claim<'a>>,
    ) -> Result<(), StoreError> {
        while wave.len() < self.config.max_in_flight {
            let Some(next) = store.next_eligible_excluding(None, now_ms, &scope.excluded)? else {
                break;
            };
            let Some(lease) = self.leases.try_acquire(&next.client_id) else {
                // Held by a manual resolution; leave the entity for the next cycle.
                scope.excluded.insert(next.client_id);
                continue;
            };
            let record = store.get_including_deleted(&next.client_id)?;
            let mutation = store.begin_attempt(next.seq, now_ms)?;
            let (server_id, version) = record
                .map(|record| (record.server_id, record.version))
                .unwrap_or((None, 0));
            let request = PushRequest::for_mutation(&mutation, server_id, version);
            wave.push(Claim {
                mutation,
                request,
                _lease: lease,
            });
        }
        Ok(())
    }

    /// Sends a wave concurrently. The store is not locked while requests are outstanding.
    fn send_wave(&self, wave: &[Claim<'_>]) -> Vec<Sent> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .iter()
                .map(|claim| {
                    scope.spawn(move || {
                        self.call_remote(|credential| self.remote.push(credential, &claim.request))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        let err = RemoteError::Unavailable("push worker panicked".to_string());
                        (Err(err), false)
                    })
                })
                .collect()
        })
    }

    fn settle_wave(
        &self,
        wave: Vec<Claim<'_>>,
        sent: Vec<Sent>,
        report: &mut CycleReport,
        scope: &mut PushScope,
    ) -> Result<(), StoreError> {
        let mut aborted = None;
        for (claim, (outcome, refreshed)) in wave.into_iter().zip(sent) {
            if refreshed {
                report.auth_refreshes += 1;
            }
            let seq = claim.mutation.seq;
            if aborted.is_none() {
                match self.settle(&claim, outcome, report, scope) {
                    Ok(()) => continue,
                    Err(err) => aborted = Some(err),
                }
            }
            // The store failed: leave the entry pending for the next cycle.
            if let Ok(mut store) = self.lock_store() {
                let _ = store.release_attempt(seq);
            }
        }
        match aborted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn settle(
        &self,
        claim: &Claim<'_>,
        outcome: Result<ServerAck, RemoteError>,
        report: &mut CycleReport,
        scope: &mut PushScope,
    ) -> Result<(), StoreError> {
        let mutation = &claim.mutation;
        let err = match outcome {
            Ok(ack)
                if mutation.operation == Operation::Create
                    && ack.version > CREATED_SERVER_VERSION =>
            {
                return self.settle_replayed_create(mutation, ack, report);
            }
            Ok(ack) => {
                let now_ms = self.now_ms();
                let acked = self.lock_store()?.acknowledge(mutation.seq, &ack, now_ms)?;
                report.pushed += 1;
                if acked.applied_deferred {
                    report.deferred_applied += 1;
                }
                tracing::debug!(
                    seq = mutation.seq,
                    client_id = mutation.client_id.as_str(),
                    operation = mutation.operation.as_str(),
                    server_version = ack.version,
                    "mutation acknowledged"
                );
                return Ok(());
            }
            Err(err) => err,
        };

        match err.class() {
            FailureClass::Transient => self.requeue(mutation, &err.to_string(), report),
            FailureClass::Validation => {
                self.fail(mutation, FailureKind::Validation, &err.to_string(), report)
            }
            FailureClass::Auth => self.fail(mutation, FailureKind::Auth, &err.to_string(), report),
            FailureClass::Conflict => self.settle_conflict(mutation, report, scope),
        }
    }

    fn requeue(
        &self,
        mutation: &Mutation,
        error: &str,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let now_ms = self.now_ms();
        let decision =
            self.lock_store()?
                .requeue_with_backoff(mutation.seq, error, &self.config.backoff, now_ms)?;
        let retry_count = mutation.retry_count.saturating_add(1);
        match decision {
            RetryDecision::RetryAt(at_ms) => {
                report.requeued += 1;
                tracing::debug!(
                    seq = mutation.seq,
                    client_id = mutation.client_id.as_str(),
                    retry_count,
                    next_attempt_at = %ts_ms_to_rfc3339(at_ms),
                    error,
                    "mutation requeued"
                );
            }
            RetryDecision::Exhausted => {
                tracing::warn!(
                    seq = mutation.seq,
                    client_id = mutation.client_id.as_str(),
                    retry_count,
                    error,
                    "retries exhausted; mutation failed"
                );
                report.failures.push(failure(mutation, FailureKind::ExhaustedRetries, error));
            }
        }
        Ok(())
    }

    fn fail(
        &self,
        mutation: &Mutation,
        kind: FailureKind,
        reason: &str,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        self.lock_store()?.mark_failed(mutation.seq, reason)?;
        tracing::warn!(
            seq = mutation.seq,
            client_id = mutation.client_id.as_str(),
            failure = kind.as_str(),
            reason,
            "mutation failed permanently"
        );
        report.failures.push(failure(mutation, kind, reason));
        Ok(())
    }

    /// The create was already applied and the entity has moved on since. Acknowledge the create
    /// at the version it produced, then take the server's copy like a pulled one: it replaces an
    /// idle record, or waits behind queued edits whose stale base routes them to the resolver.
    fn settle_replayed_create(
        &self,
        mutation: &Mutation,
        ack: ServerAck,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let (fetched, refreshed) = self.call_remote(|credential| {
            self.remote
                .fetch(credential, mutation.kind, &mutation.client_id)
        });
        if refreshed {
            report.auth_refreshes += 1;
        }
        let remote = match fetched {
            Ok(remote) => remote,
            Err(err) => {
                let reason = format!("replayed create lookup failed: {err}");
                return self.lookup_failed(mutation, &err, &reason, report);
            }
        };

        let created = ServerAck {
            version: CREATED_SERVER_VERSION,
            ..ack
        };
        let now_ms = self.now_ms();
        let mut store = self.lock_store()?;
        let acked = store.acknowledge(mutation.seq, &created, now_ms)?;
        report.pushed += 1;
        if acked.applied_deferred {
            report.deferred_applied += 1;
        }
        if let Some(remote) = &remote {
            let applied = store.apply_pull_batch(
                mutation.kind,
                std::slice::from_ref(remote),
                None,
                now_ms,
            )?;
            report.record_pull(applied);
        }
        tracing::debug!(
            seq = mutation.seq,
            client_id = mutation.client_id.as_str(),
            server_version = remote.as_ref().map(|remote| remote.version),
            "replayed create acknowledged"
        );
        Ok(())
    }

    fn lookup_failed(
        &self,
        mutation: &Mutation,
        err: &RemoteError,
        reason: &str,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        match err.class() {
            FailureClass::Transient => self.requeue(mutation, reason, report),
            FailureClass::Auth => self.fail(mutation, FailureKind::Auth, reason, report),
            FailureClass::Validation | FailureClass::Conflict => {
                self.fail(mutation, FailureKind::Validation, reason, report)
            }
        }
    }

    /// The server rejected the assumed version: look at its copy and let the resolver decide.
    fn settle_conflict(
        &self,
        mutation: &Mutation,
        report: &mut CycleReport,
        scope: &mut PushScope,
    ) -> Result<(), StoreError> {
        let rounds = scope
            .conflict_rounds
            .entry(mutation.client_id.clone())
            .or_insert(0);
        *rounds += 1;
        if *rounds > self.config.max_conflict_rounds {
            // The server keeps moving; try again next cycle.
            self.lock_store()?.release_attempt(mutation.seq)?;
            scope.excluded.insert(mutation.client_id.clone());
            tracing::debug!(
                seq = mutation.seq,
                client_id = mutation.client_id.as_str(),
                "conflict repeated; deferring entity to the next cycle"
            );
            return Ok(());
        }

        let (fetched, refreshed) = self.call_remote(|credential| {
            self.remote
                .fetch(credential, mutation.kind, &mutation.client_id)
        });
        if refreshed {
            report.auth_refreshes += 1;
        }
        let remote = match fetched {
            Ok(remote) => remote,
            Err(err) => {
                let reason = format!("conflict lookup failed: {err}");
                return self.lookup_failed(mutation, &err, &reason, report);
            }
        };

        let now_ms = self.now_ms();
        let mut store = self.lock_store()?;
        // Local edits made while the request was out are part of what gets merged.
        let Some(record) = store.get_including_deleted(&mutation.client_id)? else {
            store.release_attempt(mutation.seq)?;
            return Ok(());
        };

        match self.resolver.resolve(&record, remote.as_ref()) {
            Decision::Resolved(resolution) => {
                let kind = ResolutionKind::of(&resolution);
                store.release_attempt(mutation.seq)?;
                let outcome = store.apply_resolution(&mutation.client_id, resolution, now_ms)?;
                match kind {
                    ResolutionKind::Merged => report.conflicts_merged += 1,
                    ResolutionKind::Accepted => report.conflicts_accepted += 1,
                }
                tracing::debug!(
                    seq = mutation.seq,
                    client_id = mutation.client_id.as_str(),
                    resolution = ?kind,
                    resent = outcome.mutation.is_some(),
                    "conflict resolved"
                );
            }
            Decision::Manual(detail) => {
                let fields = detail.fields.clone();
                let conflict = store.mark_conflicted(mutation.seq, detail, now_ms)?;
                report.conflicts_manual += 1;
                tracing::warn!(
                    seq = mutation.seq,
                    client_id = mutation.client_id.as_str(),
                    conflict_id = conflict.conflict_id.as_str(),
                    fields = ?fields,
                    "conflict needs manual resolution"
                );
            }
        }
        Ok(())
    }
}

fn failure(mutation: &Mutation, kind: FailureKind, message: &str) -> MutationFailure {
    MutationFailure {
        seq: mutation.seq,
        client_id: mutation.client_id.clone(),
        kind,
        message: message.to_string(),
    }
}
