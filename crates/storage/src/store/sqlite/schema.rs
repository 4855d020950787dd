#![forbid(unsafe_code)]

use crate::StoreError;
use rusqlite::{Connection, OptionalExtension, params};

pub(super) const SCHEMA_VERSION: i64 = 1;

const SQL: &str = r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
          id TEXT PRIMARY KEY,
          email TEXT UNIQUE NOT NULL,
          name TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS categories (
          id INTEGER PRIMARY KEY,
          client_id TEXT UNIQUE NOT NULL,
          server_id TEXT,
          version INTEGER NOT NULL,
          server_version INTEGER,
          sync_status TEXT NOT NULL,
          deleted INTEGER NOT NULL DEFAULT 0,
          name TEXT NOT NULL,
          color TEXT NOT NULL,
          sort_order INTEGER NOT NULL DEFAULT 0,
          synced_fields TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          synced_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS tasks (
          id INTEGER PRIMARY KEY,
          client_id TEXT UNIQUE NOT NULL,
          server_id TEXT,
          version INTEGER NOT NULL,
          server_version INTEGER,
          sync_status TEXT NOT NULL,
          deleted INTEGER NOT NULL DEFAULT 0,
          title TEXT NOT NULL,
          description TEXT,
          notes TEXT,
          priority TEXT NOT NULL,
          status TEXT NOT NULL,
          due_date_ms INTEGER,
          category_id TEXT,
          progress_percentage INTEGER NOT NULL DEFAULT 0,
          completed_at_ms INTEGER,
          synced_fields TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          synced_at_ms INTEGER
        );

        -- AUTOINCREMENT: sequence numbers are never reused, even after the tail is acknowledged.
        CREATE TABLE IF NOT EXISTS sync_queue (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          entity_type TEXT NOT NULL,
          entity_id TEXT NOT NULL,
          operation TEXT NOT NULL,
          data TEXT NOT NULL,
          base_version INTEGER,
          state TEXT NOT NULL,
          in_flight INTEGER NOT NULL DEFAULT 0,
          retry_count INTEGER NOT NULL DEFAULT 0,
          last_error TEXT,
          created_at_ms INTEGER NOT NULL,
          attempted_at_ms INTEGER,
          next_eligible_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS deferred_remote (
          client_id TEXT PRIMARY KEY,
          entity_type TEXT NOT NULL,
          data TEXT NOT NULL,
          received_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_conflicts (
          conflict_id TEXT PRIMARY KEY,
          client_id TEXT NOT NULL,
          entity_type TEXT NOT NULL,
          seq INTEGER NOT NULL,
          local TEXT NOT NULL,
          local_deleted INTEGER NOT NULL DEFAULT 0,
          remote TEXT,
          fields TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_id, id);
        CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at_ms, id);
        CREATE INDEX IF NOT EXISTS idx_categories_created ON categories(created_at_ms, id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_client ON sync_conflicts(client_id);
"#;

/// Refuse to open a database written by an incompatible schema.
pub(super) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let has_meta = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !has_meta {
        return Ok(());
    }

    let version = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match version.as_deref().map(str::parse::<i64>) {
        None => Ok(()),
        Some(Ok(v)) if v == SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
    }
}

pub(super) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SQL)?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES ('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// A crash mid-push leaves `in_flight` set; nothing is in flight right after open.
pub(super) fn reclaim_in_flight(conn: &Connection) -> Result<usize, StoreError> {
    Ok(conn.execute("UPDATE sync_queue SET in_flight=0 WHERE in_flight=1", [])?)
}
