#![forbid(unsafe_code)]

use super::notify::Notifier;
use super::{
    Backend, ChangeNotice, ConflictRecord, StoreError, StoreRead, StoreTx, UserProfile,
};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use tk_core::ids::ClientId;
use tk_core::{EntityKind, EntityRecord, Mutation, NewMutation, RemoteEntity};

/// Non-durable backend. A transaction works on a clone of the state and swaps it in on commit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: MemoryState,
    notifier: Notifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    next_row: i64,
    records: BTreeMap<ClientId, (i64, EntityRecord)>,
    last_seq: i64,
    mutations: BTreeMap<i64, Mutation>,
    settings: BTreeMap<String, String>,
    deferred: BTreeMap<ClientId, RemoteEntity>,
    conflicts: Vec<ConflictRecord>,
    user: Option<UserProfile>,
    notices: Vec<ChangeNotice>,
}

impl Backend for MemoryStore {
    fn read<T>(
        &self,
        f: impl FnOnce(&dyn StoreRead) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        f(&self.state)
    }

    fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut work = self.state.clone();
        let out = f(&mut work)?;
        let notices = std::mem::take(&mut work.notices);
        self.state = work;
        self.notifier.dispatch(notices);
        Ok(out)
    }

    fn watch(&mut self) -> Receiver<ChangeNotice> {
        self.notifier.subscribe()
    }
}

impl StoreRead for MemoryState {
    fn record(&self, client_id: &ClientId) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self.records.get(client_id).map(|(_, record)| record.clone()))
    }

    fn records(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let mut rows: Vec<&(i64, EntityRecord)> = self
            .records
            .values()
            .filter(|(_, record)| record.kind() == kind)
            .collect();
        rows.sort_by_key(|(row, record)| (record.created_at_ms, *row));
        Ok(rows.into_iter().map(|(_, record)| record.clone()).collect())
    }

    fn mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        Ok(self.mutations.values().cloned().collect())
    }

    fn mutation(&self, seq: i64) -> Result<Option<Mutation>, StoreError> {
        Ok(self.mutations.get(&seq).cloned())
    }

    fn mutations_for(&self, client_id: &ClientId) -> Result<Vec<Mutation>, StoreError> {
        Ok(self
            .mutations
            .values()
            .filter(|m| &m.client_id == client_id)
            .cloned()
            .collect())
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.settings.get(key).cloned())
    }

    fn deferred(&self, client_id: &ClientId) -> Result<Option<RemoteEntity>, StoreError> {
        Ok(self.deferred.get(client_id).cloned())
    }

    fn conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError> {
        Ok(self.conflicts.clone())
    }

    fn user(&self) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.user.clone())
    }
}

impl StoreTx for MemoryState {
    fn put_record(&mut self, record: &EntityRecord) -> Result<(), StoreError> {
        if let Some((_, existing)) = self.records.get_mut(&record.client_id) {
            *existing = record.clone();
            return Ok(());
        }
        self.next_row += 1;
        self.records
            .insert(record.client_id.clone(), (self.next_row, record.clone()));
        Ok(())
    }

    fn delete_record(&mut self, client_id: &ClientId) -> Result<(), StoreError> {
        self.records.remove(client_id);
        Ok(())
    }

    fn insert_mutation(&mut self, mutation: NewMutation) -> Result<Mutation, StoreError> {
        self.last_seq += 1;
        let mutation = mutation.into_mutation(self.last_seq);
        self.mutations.insert(mutation.seq, mutation.clone());
        Ok(mutation)
    }

    fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        let Some(slot) = self.mutations.get_mut(&mutation.seq) else {
            return Err(StoreError::UnknownMutation(mutation.seq));
        };
        *slot = mutation.clone();
        Ok(())
    }

    fn delete_mutation(&mut self, seq: i64) -> Result<(), StoreError> {
        self.mutations.remove(&seq);
        Ok(())
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn put_deferred(&mut self, remote: &RemoteEntity, _now_ms: i64) -> Result<(), StoreError> {
        self.deferred.insert(remote.client_id.clone(), remote.clone());
        Ok(())
    }

    fn delete_deferred(&mut self, client_id: &ClientId) -> Result<(), StoreError> {
        self.deferred.remove(client_id);
        Ok(())
    }

    fn put_conflict(&mut self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        self.conflicts
            .retain(|c| c.conflict_id != conflict.conflict_id);
        self.conflicts.push(conflict.clone());
        Ok(())
    }

    fn delete_conflicts(&mut self, client_id: &ClientId) -> Result<(), StoreError> {
        self.conflicts.retain(|c| &c.client_id != client_id);
        Ok(())
    }

    fn put_user(&mut self, user: &UserProfile) -> Result<(), StoreError> {
        self.user = Some(user.clone());
        Ok(())
    }

    fn notify(&mut self, notice: ChangeNotice) {
        self.notices.push(notice);
    }
}
