#![forbid(unsafe_code)]

//! Sync engine: the composition root that owns the store, the remote and the auth collaborator
//! and runs push/pull cycles over them.

mod pull;
mod push;
mod report;

pub use report::{CycleReport, MutationFailure, PullFailure, SyncState};

use crate::auth::{AuthError, AuthProvider, Credential};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::SyncError;
use crate::lease::LeaseTable;
use crate::remote::{FailureClass, RemoteClient, RemoteError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use tk_core::ids::ClientId;
use tk_core::{EntityFields, EntityKind, EntityRecord, RemoteEntity, SyncStatus};
use tk_storage::{
    Backend, ChangeNotice, CommitOutcome, ConflictRecord, LocalEdit, LocalStore, Outbox,
    Resolution, ResolutionOutcome, StoreError,
};

#[derive(Debug, Default)]
struct CycleGate {
    running: bool,
    follow_up: bool,
}

pub struct SyncEngine<S, R, A> {
    store: Mutex<S>,
    remote: R,
    auth: A,
    config: SyncConfig,
    resolver: ConflictResolver,
    clock: Arc<dyn Clock>,
    leases: LeaseTable,
    gate: Mutex<CycleGate>,
    cancelled: AtomicBool,
    last_report: Mutex<Option<CycleReport>>,
}

impl<S, R, A> SyncEngine<S, R, A>
where
    S: Backend + Send,
    R: RemoteClient,
    A: AuthProvider,
{
    pub fn new(store: S, remote: R, auth: A, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            store: Mutex::new(store),
            remote,
            auth,
            resolver: ConflictResolver::new(config.conflict),
            config,
            clock: Arc::new(SystemClock),
            leases: LeaseTable::default(),
            gate: Mutex::new(CycleGate::default()),
            cancelled: AtomicBool::new(false),
            last_report: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, S>, StoreError> {
        self.store.lock().map_err(|_| StoreError::Busy)
    }

    fn lock_gate(&self) -> MutexGuard<'_, CycleGate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` against the store while no sync transaction is in progress.
    pub fn with_store<T>(
        &self,
        f: impl FnOnce(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, SyncError> {
        let mut store = self.lock_store()?;
        Ok(f(&mut store)?)
    }

    pub fn get(&self, client_id: &ClientId) -> Result<Option<EntityRecord>, SyncError> {
        Ok(self.lock_store()?.get(client_id)?)
    }

    pub fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, SyncError> {
        Ok(self.lock_store()?.list(kind)?)
    }

    /// Optimistic local write: the record and its outbox entry commit together. Never waits on
    /// the network, even while the entity has a request out.
    pub fn enqueue_mutation(&self, edit: LocalEdit) -> Result<CommitOutcome, SyncError> {
        let now_ms = self.now_ms();
        let outcome = self.lock_store()?.commit_local_edit(edit, now_ms)?;
        match &outcome {
            CommitOutcome::Enqueued { mutation, .. } => tracing::debug!(
                seq = mutation.seq,
                client_id = mutation.client_id.as_str(),
                operation = mutation.operation.as_str(),
                "mutation enqueued"
            ),
            CommitOutcome::Purged => tracing::debug!("unsent entity purged locally"),
        }
        Ok(outcome)
    }

    /// Runs push then pull. A call that arrives while a cycle runs returns at once with a
    /// `coalesced` report and makes the running cycle go around exactly once more.
    pub fn run_sync_cycle(&self) -> Result<CycleReport, SyncError> {
        {
            let mut gate = self.lock_gate();
            if gate.running {
                gate.follow_up = true;
                tracing::debug!("sync cycle already running; follow-up scheduled");
                return Ok(CycleReport::coalesced(self.now_ms()));
            }
            gate.running = true;
            gate.follow_up = false;
        }
        self.cancelled.store(false, Ordering::SeqCst);

        loop {
            let result = self.cycle_once();
            let mut gate = self.lock_gate();
            match result {
                Ok(report) => {
                    *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(report.clone());
                    if gate.follow_up && !self.is_cancelled() {
                        gate.follow_up = false;
                        continue;
                    }
                    gate.running = false;
                    gate.follow_up = false;
                    return Ok(report);
                }
                Err(err) => {
                    gate.running = false;
                    gate.follow_up = false;
                    return Err(err);
                }
            }
        }
    }

    fn cycle_once(&self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::started(self.now_ms());
        tracing::info!(started_at = %report.started_at(), "sync cycle started");

        let mut phases = self.push_phase(&mut report);
        if phases.is_ok() && !report.cancelled {
            phases = self.pull_phase(&mut report);
        }
        if let Err(err) = phases {
            tracing::error!(error = %err, "sync cycle aborted");
            return Err(SyncError::Unavailable(err));
        }

        report.finished_at_ms = self.now_ms();
        tracing::info!(
            pushed = report.pushed,
            requeued = report.requeued,
            failed = report.failures.len(),
            conflicts_merged = report.conflicts_merged,
            conflicts_accepted = report.conflicts_accepted,
            conflicts_manual = report.conflicts_manual,
            pulled = report.pulled,
            removed = report.removed,
            deferred = report.deferred,
            pull_errors = report.pull_errors.len(),
            cancelled = report.cancelled,
            "sync cycle finished"
        );
        Ok(report)
    }

    pub fn current_sync_state(&self) -> Result<SyncState, SyncError> {
        let (outbox, open_conflicts) = {
            let store = self.lock_store()?;
            (store.stats()?, store.conflicts()?.len())
        };
        let last_cycle = self
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(SyncState {
            cycle_running: self.lock_gate().running,
            outbox,
            open_conflicts,
            last_cycle,
        })
    }

    /// Puts the entity's Failed mutations back in line with a fresh retry budget.
    pub fn retry_failed(&self, client_id: &ClientId) -> Result<usize, SyncError> {
        let now_ms = self.now_ms();
        let reset = self.lock_store()?.retry_failed(client_id, now_ms)?;
        tracing::info!(client_id = client_id.as_str(), reset, "failed mutations re-enqueued");
        Ok(reset)
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>, SyncError> {
        Ok(self.lock_store()?.conflicts()?)
    }

    /// Settles a Conflicted entity with the user's field set, sent against the server's current
    /// version.
    pub fn resolve_conflict(
        &self,
        client_id: &ClientId,
        fields: EntityFields,
    ) -> Result<ResolutionOutcome, SyncError> {
        let _lease = self
            .leases
            .try_acquire(client_id)
            .ok_or(SyncError::InvalidInput("entity is being synced"))?;
        let record = self.conflicted_record(client_id)?;
        let remote = self
            .fetch_remote(record.kind(), client_id)?
            .filter(|remote| !remote.deleted)
            .ok_or(SyncError::InvalidInput(
                "entity was deleted on the server; accept the remote state instead",
            ))?;

        let now_ms = self.now_ms();
        let outcome = self.lock_store()?.apply_resolution(
            client_id,
            Resolution::Merged { fields, remote },
            now_ms,
        )?;
        tracing::info!(
            client_id = client_id.as_str(),
            resent = outcome.mutation.is_some(),
            "conflict resolved manually"
        );
        Ok(outcome)
    }

    /// Drops local changes of a Conflicted entity in favour of the server copy.
    pub fn accept_remote(&self, client_id: &ClientId) -> Result<ResolutionOutcome, SyncError> {
        let _lease = self
            .leases
            .try_acquire(client_id)
            .ok_or(SyncError::InvalidInput("entity is being synced"))?;
        let record = self.conflicted_record(client_id)?;
        let resolution = match self.fetch_remote(record.kind(), client_id)? {
            Some(remote) => Resolution::AcceptRemote(remote),
            None => Resolution::DropLocal,
        };

        let now_ms = self.now_ms();
        let outcome = self
            .lock_store()?
            .apply_resolution(client_id, resolution, now_ms)?;
        tracing::info!(client_id = client_id.as_str(), "local changes discarded");
        Ok(outcome)
    }

    fn conflicted_record(&self, client_id: &ClientId) -> Result<EntityRecord, SyncError> {
        let record = self
            .lock_store()?
            .get_including_deleted(client_id)?
            .ok_or(SyncError::Store(StoreError::UnknownId))?;
        if record.sync_status != SyncStatus::Conflicted {
            return Err(SyncError::InvalidInput("entity has no open conflict"));
        }
        Ok(record)
    }

    /// Stops new requests in the running cycle; requests already sent complete and are applied.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.lock_gate().follow_up = false;
        tracing::info!("sync cancellation requested");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Committed record changes, from local writes and sync alike.
    pub fn subscribe(&self) -> Result<Receiver<ChangeNotice>, SyncError> {
        Ok(self.lock_store()?.subscribe())
    }

    fn fetch_remote(
        &self,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, SyncError> {
        let (result, _) =
            self.call_remote(|credential| self.remote.fetch(credential, kind, client_id));
        Ok(result?)
    }

    /// One call with the current credential; an authorization failure gets a single refresh
    /// and retry. The flag reports whether a refresh happened.
    fn call_remote<T>(
        &self,
        call: impl Fn(&Credential) -> Result<T, RemoteError>,
    ) -> (Result<T, RemoteError>, bool) {
        let first = self
            .auth
            .current_credential()
            .map_err(auth_failure)
            .and_then(|credential| call(&credential));
        match first {
            Err(err) if err.class() == FailureClass::Auth => {
                tracing::debug!(error = %err, "refreshing credential");
                let second = self
                    .auth
                    .refresh_credential()
                    .map_err(auth_failure)
                    .and_then(|credential| call(&credential));
                (second, true)
            }
            other => (other, false),
        }
    }
}

fn auth_failure(err: AuthError) -> RemoteError {
    match err {
        AuthError::SignedOut => RemoteError::Unauthorized(err.to_string()),
        AuthError::Unavailable(msg) => RemoteError::Unavailable(msg),
    }
}
