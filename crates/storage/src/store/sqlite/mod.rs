#![forbid(unsafe_code)]

mod schema;
mod tx;

use super::notify::Notifier;
use super::{Backend, ChangeNotice, StoreError, StoreRead, StoreTx};
use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tx::SqliteTx;

const DB_FILE_NAME: &str = "taskin_sync.db";

/// Durable backend on a single SQLite file in WAL mode.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    notifier: Notifier,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        schema::preflight_gate(&conn)?;
        schema::install_schema(&conn)?;
        let reclaimed = schema::reclaim_in_flight(&conn)?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reclaimed in-flight outbox entries left by a previous run");
        }

        Ok(Self {
            conn,
            storage_dir,
            notifier: Notifier::default(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

impl Backend for SqliteStore {
    fn read<T>(
        &self,
        f: impl FnOnce(&dyn StoreRead) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        f(&SqliteTx::new(&self.conn))
    }

    fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut work = SqliteTx::new(&tx);
        let out = f(&mut work)?;
        let notices = work.into_notices();
        tx.commit()?;
        self.notifier.dispatch(notices);
        Ok(out)
    }

    fn watch(&mut self) -> Receiver<ChangeNotice> {
        self.notifier.subscribe()
    }
}
