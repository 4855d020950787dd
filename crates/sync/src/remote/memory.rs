#![forbid(unsafe_code)]

use super::{ChangeBatch, PushRequest, RemoteClient, RemoteError};
use crate::auth::Credential;
use crate::clock::{Clock, SystemClock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tk_core::ids::{ClientId, ServerId};
use tk_core::{
    CREATED_SERVER_VERSION, EntityFields, EntityKind, Operation, RemoteEntity, ServerAck,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushLogEntry {
    pub client_id: ClientId,
    pub operation: Operation,
    pub expected_version: Option<i64>,
    pub idempotency_key: String,
    pub applied: bool,
}

#[derive(Clone, Debug)]
struct Stored {
    entity: RemoteEntity,
    change_seq: u64,
}

#[derive(Debug, Default)]
struct ServerState {
    entities: BTreeMap<ClientId, Stored>,
    next_server_id: u64,
    change_seq: u64,
    push_failures: VecDeque<RemoteError>,
    list_failures: VecDeque<RemoteError>,
    dropped_responses: usize,
    /// Results of applied updates and deletes, by idempotency key.
    replays: BTreeMap<String, ServerAck>,
    offline: bool,
    required_token: Option<String>,
    log: Vec<PushLogEntry>,
}

impl ServerState {
    fn gate(&self, credential: &Credential) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Connection("network unreachable".to_string()));
        }
        match &self.required_token {
            Some(token) if token != credential.token() => {
                Err(RemoteError::Unauthorized("token expired".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn bump(&mut self) -> u64 {
        self.change_seq += 1;
        self.change_seq
    }

    fn insert(&mut self, client_id: ClientId, fields: EntityFields, now_ms: i64) -> RemoteEntity {
        self.next_server_id += 1;
        let entity = RemoteEntity {
            client_id: client_id.clone(),
            server_id: ServerId::new(format!("srv-{}", self.next_server_id)),
            version: CREATED_SERVER_VERSION,
            fields,
            deleted: false,
            updated_at_ms: now_ms,
        };
        let change_seq = self.bump();
        self.entities.insert(
            client_id,
            Stored {
                entity: entity.clone(),
                change_seq,
            },
        );
        entity
    }

    fn modify(
        &mut self,
        client_id: &ClientId,
        now_ms: i64,
        edit: impl FnOnce(&mut RemoteEntity),
    ) -> Option<RemoteEntity> {
        let change_seq = self.bump();
        let stored = self.entities.get_mut(client_id)?;
        edit(&mut stored.entity);
        stored.entity.version += 1;
        stored.entity.updated_at_ms = now_ms;
        stored.change_seq = change_seq;
        Some(stored.entity.clone())
    }

    fn apply(&mut self, request: &PushRequest, now_ms: i64) -> Result<ServerAck, RemoteError> {
        request
            .fields
            .validate()
            .map_err(|err| RemoteError::Validation(err.message().to_string()))?;

        if request.operation == Operation::Create {
            let entity = match self.entities.get(&request.client_id) {
                Some(stored) => stored.entity.clone(),
                None => self.insert(request.client_id.clone(), request.fields.clone(), now_ms),
            };
            return Ok(ack(&entity));
        }

        if let Some(ack) = self.replays.get(&request.idempotency_key) {
            return Ok(ack.clone());
        }
        let Some(current) = self.entities.get(&request.client_id).map(|s| s.entity.clone()) else {
            return Err(RemoteError::VersionConflict {
                server_version: None,
            });
        };
        if current.kind() != request.kind {
            return Err(RemoteError::Validation("entity kind mismatch".to_string()));
        }
        if request.operation == Operation::Delete && current.deleted {
            return Ok(ack(&current));
        }
        if current.deleted || request.expected_version != Some(current.version) {
            return Err(RemoteError::VersionConflict {
                server_version: Some(current.version),
            });
        }

        let updated = match request.operation {
            Operation::Update => {
                let fields = request.fields.clone();
                self.modify(&request.client_id, now_ms, |entity| entity.fields = fields)
            }
            _ => self.modify(&request.client_id, now_ms, |entity| entity.deleted = true),
        };
        let ack = updated.map(|entity| ack(&entity)).ok_or(RemoteError::VersionConflict {
            server_version: None,
        })?;
        self.replays
            .insert(request.idempotency_key.clone(), ack.clone());
        Ok(ack)
    }
}

fn ack(entity: &RemoteEntity) -> ServerAck {
    ServerAck {
        server_id: entity.server_id.clone(),
        version: entity.version,
        updated_at_ms: entity.updated_at_ms,
    }
}

/// In-process task server: enforces versions, honors create idempotency, keeps tombstones and a
/// change log, and can be told to fail.
pub struct MemoryRemote {
    state: Mutex<ServerState>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next pushes fail with these errors, in order, without touching server state.
    pub fn fail_pushes(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().push_failures.extend(errors);
    }

    pub fn fail_next_list(&self, error: RemoteError) {
        self.lock().list_failures.push_back(error);
    }

    /// The next `count` pushes are applied but answered with a timeout.
    pub fn drop_responses(&self, count: usize) {
        self.lock().dropped_responses += count;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn require_token(&self, token: impl Into<String>) {
        self.lock().required_token = Some(token.into());
    }

    pub fn push_log(&self) -> Vec<PushLogEntry> {
        self.lock().log.clone()
    }

    pub fn entity(&self, client_id: &ClientId) -> Option<RemoteEntity> {
        self.lock()
            .entities
            .get(client_id)
            .map(|stored| stored.entity.clone())
    }

    pub fn live_entities(&self, kind: EntityKind) -> Vec<RemoteEntity> {
        self.lock()
            .entities
            .values()
            .filter(|stored| stored.entity.kind() == kind && !stored.entity.deleted)
            .map(|stored| stored.entity.clone())
            .collect()
    }

    /// Creates an entity as another device would.
    pub fn server_create(&self, client_id: ClientId, fields: EntityFields) -> RemoteEntity {
        let now_ms = self.clock.now_ms();
        self.lock().insert(client_id, fields, now_ms)
    }

    /// Edits an entity as another device would.
    pub fn server_edit(
        &self,
        client_id: &ClientId,
        edit: impl FnOnce(&mut EntityFields),
    ) -> Option<RemoteEntity> {
        let now_ms = self.clock.now_ms();
        self.lock()
            .modify(client_id, now_ms, |entity| edit(&mut entity.fields))
    }

    pub fn server_delete(&self, client_id: &ClientId) -> Option<RemoteEntity> {
        let now_ms = self.clock.now_ms();
        self.lock()
            .modify(client_id, now_ms, |entity| entity.deleted = true)
    }
}

impl RemoteClient for MemoryRemote {
    fn push(
        &self,
        credential: &Credential,
        request: &PushRequest,
    ) -> Result<ServerAck, RemoteError> {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        state.gate(credential)?;

        let mut entry = PushLogEntry {
            client_id: request.client_id.clone(),
            operation: request.operation,
            expected_version: request.expected_version,
            idempotency_key: request.idempotency_key.clone(),
            applied: false,
        };
        if let Some(error) = state.push_failures.pop_front() {
            state.log.push(entry);
            return Err(error);
        }

        let result = state.apply(request, now_ms);
        entry.applied = result.is_ok();
        state.log.push(entry);
        if result.is_ok() && state.dropped_responses > 0 {
            state.dropped_responses -= 1;
            return Err(RemoteError::Timeout);
        }
        result
    }

    fn fetch(
        &self,
        credential: &Credential,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, RemoteError> {
        let state = self.lock();
        state.gate(credential)?;
        Ok(state
            .entities
            .get(client_id)
            .filter(|stored| stored.entity.kind() == kind)
            .map(|stored| stored.entity.clone()))
    }

    fn list_changes(
        &self,
        credential: &Credential,
        kind: EntityKind,
        since: Option<&str>,
    ) -> Result<ChangeBatch, RemoteError> {
        let mut state = self.lock();
        state.gate(credential)?;
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }

        let since = match since {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| RemoteError::Validation("malformed checkpoint".to_string()))?,
            ),
            None => None,
        };
        let mut changed: Vec<&Stored> = state
            .entities
            .values()
            .filter(|stored| stored.entity.kind() == kind)
            .filter(|stored| match since {
                Some(since) => stored.change_seq > since,
                None => !stored.entity.deleted,
            })
            .collect();
        changed.sort_by_key(|stored| stored.change_seq);

        Ok(ChangeBatch {
            entities: changed.into_iter().map(|s| s.entity.clone()).collect(),
            checkpoint: Some(state.change_seq.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tk_core::TaskFields;

    fn id(value: &str) -> ClientId {
        ClientId::try_new(value).expect("client id")
    }

    fn create(client: &str, title: &str) -> PushRequest {
        PushRequest {
            kind: EntityKind::Task,
            operation: Operation::Create,
            client_id: id(client),
            server_id: None,
            version: 1,
            expected_version: None,
            fields: EntityFields::Task(TaskFields::titled(title)),
            idempotency_key: client.to_string(),
        }
    }

    #[test]
    fn repeated_create_returns_the_first_entity() {
        let remote = MemoryRemote::new();
        let cred = Credential::bearer("t");
        let first = remote.push(&cred, &create("c1", "a")).expect("first");
        let second = remote.push(&cred, &create("c1", "b")).expect("replay");
        assert_eq!(first, second);
        let live = remote.live_entities(EntityKind::Task);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].fields, EntityFields::Task(TaskFields::titled("a")));
    }

    #[test]
    fn stale_update_is_a_version_conflict() {
        let remote = MemoryRemote::with_clock(Arc::new(ManualClock::new(5)));
        let cred = Credential::bearer("t");
        remote.push(&cred, &create("c1", "a")).expect("create");
        remote.server_edit(&id("c1"), |fields| {
            if let EntityFields::Task(task) = fields {
                task.title = "server".to_string();
            }
        });

        let mut update = create("c1", "local");
        update.operation = Operation::Update;
        update.expected_version = Some(1);
        assert_eq!(
            remote.push(&cred, &update),
            Err(RemoteError::VersionConflict {
                server_version: Some(2)
            })
        );
        update.expected_version = Some(2);
        let ack = remote.push(&cred, &update).expect("update");
        assert_eq!(ack.version, 3);
        assert_eq!(ack.updated_at_ms, 5);
    }

    #[test]
    fn replayed_update_returns_the_recorded_result() {
        let remote = MemoryRemote::new();
        let cred = Credential::bearer("t");
        remote.push(&cred, &create("c1", "a")).expect("create");

        let mut update = create("c1", "b");
        update.operation = Operation::Update;
        update.expected_version = Some(1);
        update.idempotency_key = "c1:2".to_string();
        let first = remote.push(&cred, &update).expect("update");
        let replay = remote.push(&cred, &update).expect("replay");
        assert_eq!(first, replay);
        assert_eq!(remote.entity(&id("c1")).expect("entity").version, 2);
    }

    #[test]
    fn changes_since_checkpoint_include_tombstones() {
        let remote = MemoryRemote::new();
        let cred = Credential::bearer("t");
        remote.push(&cred, &create("c1", "a")).expect("c1");
        remote.push(&cred, &create("c2", "b")).expect("c2");

        let full = remote
            .list_changes(&cred, EntityKind::Task, None)
            .expect("full");
        assert_eq!(full.entities.len(), 2);
        let checkpoint = full.checkpoint.expect("checkpoint");

        remote.server_delete(&id("c1"));
        let delta = remote
            .list_changes(&cred, EntityKind::Task, Some(&checkpoint))
            .expect("delta");
        assert_eq!(delta.entities.len(), 1);
        assert!(delta.entities[0].deleted);
        assert!(
            remote
                .list_changes(&cred, EntityKind::Category, None)
                .expect("categories")
                .entities
                .is_empty()
        );
    }

    #[test]
    fn injected_failures_and_dropped_responses() {
        let remote = MemoryRemote::new();
        let cred = Credential::bearer("t");
        remote.fail_pushes([RemoteError::Timeout]);
        assert_eq!(remote.push(&cred, &create("c1", "a")), Err(RemoteError::Timeout));
        assert!(remote.entity(&id("c1")).is_none());

        remote.drop_responses(1);
        assert_eq!(remote.push(&cred, &create("c1", "a")), Err(RemoteError::Timeout));
        assert!(remote.entity(&id("c1")).is_some());

        let log = remote.push_log();
        assert_eq!(log.len(), 2);
        assert!(!log[0].applied);
        assert!(log[1].applied);
    }

    #[test]
    fn token_and_reachability_gates() {
        let remote = MemoryRemote::new();
        remote.require_token("fresh");
        assert!(matches!(
            remote.push(&Credential::bearer("stale"), &create("c1", "a")),
            Err(RemoteError::Unauthorized(_))
        ));
        remote.set_offline(true);
        assert!(matches!(
            remote.push(&Credential::bearer("fresh"), &create("c1", "a")),
            Err(RemoteError::Connection(_))
        ));
        assert!(remote.push_log().is_empty());
    }
}
