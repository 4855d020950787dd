#![forbid(unsafe_code)]

mod error;
mod local;
mod memory;
mod notify;
mod outbox;
mod sqlite;
mod types;

pub use error::StoreError;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use outbox::Outbox;
pub use sqlite::SqliteStore;
pub use types::*;

use std::sync::mpsc::Receiver;
use tk_core::ids::ClientId;
use tk_core::{EntityKind, EntityRecord, Mutation, NewMutation, RemoteEntity};

/// Reads available both inside and outside a transaction.
pub trait StoreRead {
    /// Any record with this client id, tombstones included.
    fn record(&self, client_id: &ClientId) -> Result<Option<EntityRecord>, StoreError>;
    /// All records of a kind, tombstones included, in creation order.
    fn records(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError>;
    /// The whole outbox in sequence order.
    fn mutations(&self) -> Result<Vec<Mutation>, StoreError>;
    fn mutation(&self, seq: i64) -> Result<Option<Mutation>, StoreError>;
    fn mutations_for(&self, client_id: &ClientId) -> Result<Vec<Mutation>, StoreError>;
    fn setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn deferred(&self, client_id: &ClientId) -> Result<Option<RemoteEntity>, StoreError>;
    fn conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError>;
    fn user(&self) -> Result<Option<UserProfile>, StoreError>;
}

/// Writes inside one backend transaction. Nothing is visible to readers or subscribers until
/// the transaction commits.
pub trait StoreTx: StoreRead {
    fn put_record(&mut self, record: &EntityRecord) -> Result<(), StoreError>;
    fn delete_record(&mut self, client_id: &ClientId) -> Result<(), StoreError>;
    /// Appends with a sequence number greater than any ever issued.
    fn insert_mutation(&mut self, mutation: NewMutation) -> Result<Mutation, StoreError>;
    fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError>;
    fn delete_mutation(&mut self, seq: i64) -> Result<(), StoreError>;
    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn put_deferred(&mut self, remote: &RemoteEntity, now_ms: i64) -> Result<(), StoreError>;
    fn delete_deferred(&mut self, client_id: &ClientId) -> Result<(), StoreError>;
    fn put_conflict(&mut self, conflict: &ConflictRecord) -> Result<(), StoreError>;
    fn delete_conflicts(&mut self, client_id: &ClientId) -> Result<(), StoreError>;
    fn put_user(&mut self, user: &UserProfile) -> Result<(), StoreError>;
    fn notify(&mut self, notice: ChangeNotice);
}

/// A durable or in-memory home for records and the outbox.
///
/// `transact` commits when the closure returns `Ok` and discards every write when it returns
/// `Err`. `LocalStore` and `Outbox` are implemented once on top of this.
pub trait Backend {
    fn read<T>(
        &self,
        f: impl FnOnce(&dyn StoreRead) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    fn watch(&mut self) -> Receiver<ChangeNotice>;
}

pub(crate) fn checkpoint_key(kind: EntityKind) -> String {
    format!("pull_checkpoint:{}", kind.as_str())
}
