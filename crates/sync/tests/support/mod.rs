#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tk_core::ids::ClientId;
use tk_core::{
    CategoryFields, EntityFields, EntityKind, EntityRecord, Operation, RemoteEntity, ServerAck,
    SyncStatus, TaskFields, TaskPriority, TaskStatus,
};
use tk_storage::{
    Backend, ChangeNotice, CommitOutcome, LocalEdit, LocalStore, MemoryStore, Outbox,
    SqliteStore, StoreError, StoreRead, StoreTx,
};
use tk_sync::{
    ChangeBatch, Credential, CycleReport, FailureKind, ManualClock, MemoryRemote, PushRequest,
    RemoteClient, RemoteError, StaticAuth, SyncConfig, SyncEngine,
};

pub(crate) const START_MS: i64 = 1_700_000_000_000;

pub(crate) fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("tk_sync_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn id(value: &str) -> ClientId {
    ClientId::try_new(value).expect("client id")
}

pub(crate) fn task(title: &str) -> EntityFields {
    EntityFields::Task(TaskFields::titled(title))
}

pub(crate) fn task_with(title: &str, edit: impl FnOnce(&mut TaskFields)) -> EntityFields {
    let mut fields = TaskFields::titled(title);
    edit(&mut fields);
    EntityFields::Task(fields)
}

pub(crate) fn category(name: &str) -> EntityFields {
    EntityFields::Category(CategoryFields {
        name: name.to_string(),
        color: "#6366F1".to_string(),
        sort_order: 0,
    })
}

pub(crate) fn task_fields(record: &EntityRecord) -> &TaskFields {
    record.fields.as_task().expect("task fields")
}

pub(crate) fn remote_title(entity: &RemoteEntity) -> &str {
    &entity.fields.as_task().expect("task fields").title
}

/// Engine over the given store with a shared manual clock and an in-process server.
pub(crate) struct Harness<S: Backend + Send, R: RemoteClient = Arc<MemoryRemote>> {
    pub engine: SyncEngine<S, R, StaticAuth>,
    pub remote: Arc<MemoryRemote>,
    pub clock: ManualClock,
}

pub(crate) fn memory_harness() -> Harness<MemoryStore> {
    harness(MemoryStore::new(), SyncConfig::default())
}

pub(crate) fn sqlite_harness(test_name: &str) -> Harness<SqliteStore> {
    let store = SqliteStore::open(temp_dir(test_name)).expect("open store");
    harness(store, SyncConfig::default())
}

pub(crate) fn harness<S: Backend + Send>(store: S, config: SyncConfig) -> Harness<S> {
    harness_with_auth(store, config, StaticAuth::new("token"))
}

pub(crate) fn harness_with_auth<S: Backend + Send>(
    store: S,
    config: SyncConfig,
    auth: StaticAuth,
) -> Harness<S> {
    let clock = ManualClock::new(START_MS);
    let remote = Arc::new(MemoryRemote::with_clock(Arc::new(clock.clone())));
    let engine = SyncEngine::new(store, Arc::clone(&remote), auth, config)
        .expect("engine")
        .with_clock(Arc::new(clock.clone()));
    Harness {
        engine,
        remote,
        clock,
    }
}

/// Engine whose remote is a wrapper around the shared in-process server.
pub(crate) fn wrapped_harness<R: RemoteClient>(
    config: SyncConfig,
    wrap: impl FnOnce(Arc<MemoryRemote>) -> R,
) -> Harness<MemoryStore, R> {
    let clock = ManualClock::new(START_MS);
    let remote = Arc::new(MemoryRemote::with_clock(Arc::new(clock.clone())));
    let engine = SyncEngine::new(
        MemoryStore::new(),
        wrap(Arc::clone(&remote)),
        StaticAuth::new("token"),
        config,
    )
    .expect("engine")
    .with_clock(Arc::new(clock.clone()));
    Harness {
        engine,
        remote,
        clock,
    }
}

impl<S: Backend + Send, R: RemoteClient> Harness<S, R> {
    pub(crate) fn create(&self, client: &str, fields: EntityFields) -> i64 {
        match self
            .engine
            .enqueue_mutation(LocalEdit::Create {
                client_id: id(client),
                fields,
            })
            .expect("create")
        {
            CommitOutcome::Enqueued { mutation, .. } => mutation.seq,
            CommitOutcome::Purged => panic!("create cannot purge"),
        }
    }

    pub(crate) fn update(&self, client: &str, fields: EntityFields) {
        self.engine
            .enqueue_mutation(LocalEdit::Update {
                client_id: id(client),
                fields,
            })
            .expect("update");
    }

    pub(crate) fn delete(&self, client: &str) -> CommitOutcome {
        self.engine
            .enqueue_mutation(LocalEdit::Delete {
                client_id: id(client),
            })
            .expect("delete")
    }

    pub(crate) fn sync(&self) -> CycleReport {
        self.engine.run_sync_cycle().expect("sync cycle")
    }

    /// Cycles until the outbox holds nothing sendable, stepping past backoff gates.
    pub(crate) fn sync_until_quiet(&self, max_cycles: usize) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            let report = self.sync();
            reports.push(report);
            let stats = self.engine.current_sync_state().expect("state").outbox;
            if stats.pending == 0 && stats.in_flight == 0 {
                break;
            }
            self.clock.advance(120_000);
        }
        reports
    }

    pub(crate) fn record(&self, client: &str) -> Option<EntityRecord> {
        self.engine
            .with_store(|store| store.get_including_deleted(&id(client)))
            .expect("read record")
    }

    pub(crate) fn title(&self, client: &str) -> String {
        let record = self.record(client).expect("record");
        task_fields(&record).title.clone()
    }

    pub(crate) fn status(&self, client: &str) -> SyncStatus {
        self.record(client).expect("record").sync_status
    }

    /// Edits a task on the server as another device would.
    pub(crate) fn server_edit_task(
        &self,
        client: &str,
        edit: impl FnOnce(&mut TaskFields),
    ) -> RemoteEntity {
        self.remote
            .server_edit(&id(client), |fields| {
                if let EntityFields::Task(task) = fields {
                    edit(task);
                }
            })
            .expect("server entity")
    }

    pub(crate) fn server_task(&self, client: &str) -> TaskFields {
        let entity = self.remote.entity(&id(client)).expect("server entity");
        entity.fields.as_task().expect("task fields").clone()
    }
}

/// Remote whose first push (or first fetch) blocks until released, so a cycle can be caught
/// mid-flight.
pub(crate) struct GatedRemote {
    inner: Arc<MemoryRemote>,
    gate_fetch: bool,
    entered: Mutex<Option<Sender<()>>>,
    release: Mutex<Option<Receiver<()>>>,
    pub lists: AtomicUsize,
}

impl GatedRemote {
    pub(crate) fn new(inner: Arc<MemoryRemote>) -> (Self, Receiver<()>, Sender<()>) {
        Self::gated(inner, false)
    }

    pub(crate) fn on_fetch(inner: Arc<MemoryRemote>) -> (Self, Receiver<()>, Sender<()>) {
        Self::gated(inner, true)
    }

    fn gated(inner: Arc<MemoryRemote>, gate_fetch: bool) -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let remote = Self {
            inner,
            gate_fetch,
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
            lists: AtomicUsize::new(0),
        };
        (remote, entered_rx, release_tx)
    }

    fn wait_at_gate(&self) {
        let entered = self.entered.lock().expect("gate lock").take();
        if let Some(entered) = entered {
            let release = self.release.lock().expect("gate lock").take();
            entered.send(()).expect("signal entered");
            if let Some(release) = release {
                release
                    .recv_timeout(Duration::from_secs(10))
                    .expect("released");
            }
        }
    }
}

impl RemoteClient for GatedRemote {
    fn push(
        &self,
        credential: &Credential,
        request: &PushRequest,
    ) -> Result<ServerAck, RemoteError> {
        if !self.gate_fetch {
            self.wait_at_gate();
        }
        self.inner.push(credential, request)
    }

    fn fetch(
        &self,
        credential: &Credential,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, RemoteError> {
        if self.gate_fetch {
            self.wait_at_gate();
        }
        self.inner.fetch(credential, kind, client_id)
    }

    fn list_changes(
        &self,
        credential: &Credential,
        kind: EntityKind,
        since: Option<&str>,
    ) -> Result<ChangeBatch, RemoteError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list_changes(credential, kind, since)
    }
}

/// Remote that records the highest number of pushes outstanding at once.
pub(crate) struct SlowRemote {
    inner: Arc<MemoryRemote>,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowRemote {
    pub(crate) fn new(inner: Arc<MemoryRemote>) -> Self {
        Self {
            inner,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl RemoteClient for SlowRemote {
    fn push(
        &self,
        credential: &Credential,
        request: &PushRequest,
    ) -> Result<ServerAck, RemoteError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        let result = self.inner.push(credential, request);
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn fetch(
        &self,
        credential: &Credential,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, RemoteError> {
        self.inner.fetch(credential, kind, client_id)
    }

    fn list_changes(
        &self,
        credential: &Credential,
        kind: EntityKind,
        since: Option<&str>,
    ) -> Result<ChangeBatch, RemoteError> {
        self.inner.list_changes(credential, kind, since)
    }
}

/// In-memory store whose writes can be made to fail, standing in for a full or vanished disk.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    pub failing: Arc<AtomicBool>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Backend for FlakyStore {
    fn read<T>(
        &self,
        f: impl FnOnce(&dyn StoreRead) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.inner.read(f)
    }

    fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
        }
        self.inner.transact(f)
    }

    fn watch(&mut self) -> Receiver<ChangeNotice> {
        self.inner.watch()
    }
}

pub(crate) fn drain_notices(notices: &Receiver<ChangeNotice>) -> Vec<ChangeNotice> {
    notices.try_iter().collect()
}

// Scenarios shared by the in-memory and SQLite suites.

pub(crate) fn offline_create_reaches_server_once<S: Backend + Send>(h: &Harness<S>) {
    h.remote.set_offline(true);
    h.create("t1", task("Buy milk"));
    let report = h.sync();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.pushed, 0);
    assert_eq!(report.pull_errors.len(), 2);
    assert_eq!(h.status("t1"), SyncStatus::PendingSync);

    h.remote.set_offline(false);
    assert_eq!(h.sync().pushed, 0, "still inside the backoff window");
    h.clock.advance(1_000);
    let report = h.sync();
    assert_eq!(report.pushed, 1);
    assert!(report.is_clean());

    let live = h.remote.live_entities(EntityKind::Task);
    assert_eq!(live.len(), 1);
    let record = h.record("t1").expect("record");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_id, Some(live[0].server_id.clone()));
    assert_eq!(record.server_version, Some(1));
    assert_eq!(h.remote.push_log().len(), 1);
}

pub(crate) fn offline_edits_apply_in_order<S: Backend + Send>(h: &Harness<S>) {
    h.create("t1", task("draft"));
    h.sync();

    h.remote.set_offline(true);
    h.update("t1", task("first"));
    h.update("t1", task("second"));
    assert_eq!(h.sync().requeued, 1);

    h.remote.set_offline(false);
    h.clock.advance(1_000);
    let report = h.sync();
    assert_eq!(report.pushed, 2);

    let sent: Vec<_> = h
        .remote
        .push_log()
        .iter()
        .map(|entry| (entry.operation, entry.expected_version))
        .collect();
    assert_eq!(
        sent,
        vec![
            (Operation::Create, None),
            (Operation::Update, Some(1)),
            (Operation::Update, Some(2)),
        ]
    );
    assert_eq!(h.server_task("t1").title, "second");
    assert_eq!(h.title("t1"), "second");
    let record = h.record("t1").expect("record");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_version, Some(3));
}

pub(crate) fn status_conflict_takes_server_value<S: Backend + Send>(h: &Harness<S>) {
    h.create("t1", task("report"));
    h.sync();
    h.server_edit_task("t1", |task| task.status = TaskStatus::Completed);
    h.update(
        "t1",
        task_with("report", |task| task.status = TaskStatus::InProgress),
    );

    let report = h.sync();
    assert_eq!(report.conflicts_accepted, 1);
    assert_eq!(report.conflicts_manual, 0);
    assert_eq!(report.pushed, 0);

    let record = h.record("t1").expect("record");
    assert_eq!(task_fields(&record).status, TaskStatus::Completed);
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_version, Some(2));
    assert_eq!(h.remote.entity(&id("t1")).expect("entity").version, 2);
    assert!(h.engine.conflicts().expect("conflicts").is_empty());
}

pub(crate) fn disjoint_edits_merge_and_resend<S: Backend + Send>(h: &Harness<S>) {
    h.create("t1", task("plan"));
    h.sync();
    h.server_edit_task("t1", |task| task.notes = Some("from web".to_string()));
    h.update("t1", task("plan v2"));

    let report = h.sync();
    assert_eq!(report.conflicts_merged, 1);
    assert_eq!(report.pushed, 1);

    let server = h.server_task("t1");
    assert_eq!(server.title, "plan v2");
    assert_eq!(server.notes.as_deref(), Some("from web"));
    assert_eq!(h.remote.entity(&id("t1")).expect("entity").version, 3);

    let record = h.record("t1").expect("record");
    assert_eq!(task_fields(&record), &server);
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_version, Some(3));
}

pub(crate) fn transient_failures_exhaust_then_recover<S: Backend + Send>(h: &Harness<S>) {
    h.create("t1", task("flaky"));
    h.remote
        .fail_pushes((0..3).map(|_| RemoteError::Unavailable("http 503".to_string())));

    assert_eq!(h.sync().requeued, 1);
    h.clock.advance(1_000);
    assert_eq!(h.sync().requeued, 1);
    h.clock.advance(2_000);
    let report = h.sync();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::ExhaustedRetries);
    assert_eq!(h.status("t1"), SyncStatus::Failed);

    h.clock.advance(600_000);
    assert_eq!(h.sync().pushed, 0);
    assert_eq!(h.remote.push_log().len(), 3, "no fourth attempt");

    assert_eq!(h.engine.retry_failed(&id("t1")).expect("retry"), 1);
    assert_eq!(h.status("t1"), SyncStatus::PendingSync);
    assert_eq!(h.sync().pushed, 1);
    assert_eq!(h.status("t1"), SyncStatus::Synced);
    assert_eq!(h.remote.live_entities(EntityKind::Task).len(), 1);
}

pub(crate) fn pulled_copy_waits_for_pending_edit<S: Backend + Send>(h: &Harness<S>) {
    h.create("t1", task("shared"));
    h.sync();
    h.server_edit_task("t1", |task| task.notes = Some("from web".to_string()));
    h.update(
        "t1",
        task_with("shared", |task| task.priority = TaskPriority::High),
    );
    h.remote.fail_pushes([RemoteError::Timeout]);

    let report = h.sync();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.deferred, 1);
    let record = h.record("t1").expect("record");
    assert_eq!(task_fields(&record).notes, None);
    assert_eq!(task_fields(&record).priority, TaskPriority::High);
    assert_eq!(record.sync_status, SyncStatus::PendingSync);
    let parked = h
        .engine
        .with_store(|store| store.deferred_remote(&id("t1")))
        .expect("deferred");
    assert_eq!(parked.map(|remote| remote.version), Some(2));

    h.clock.advance(1_000);
    let report = h.sync();
    assert_eq!(report.conflicts_merged, 1);
    assert_eq!(report.pushed, 1);

    let record = h.record("t1").expect("record");
    assert_eq!(task_fields(&record).notes.as_deref(), Some("from web"));
    assert_eq!(task_fields(&record).priority, TaskPriority::High);
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(h.server_task("t1").priority, TaskPriority::High);
    let parked = h
        .engine
        .with_store(|store| store.deferred_remote(&id("t1")))
        .expect("deferred");
    assert!(parked.is_none());
}
