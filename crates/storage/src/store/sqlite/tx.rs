#![forbid(unsafe_code)]

use crate::{
    ChangeNotice, ConflictDetail, ConflictRecord, StoreError, StoreRead, StoreTx, UserProfile,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tk_core::ids::{ClientId, ConflictId, ServerId};
use tk_core::{
    CategoryFields, EntityFields, EntityKind, EntityRecord, Mutation, MutationState, NewMutation,
    Operation, RemoteEntity, SyncStatus, TaskFields, TaskPriority, TaskStatus,
};

const TASK_COLUMNS: &str = "client_id, server_id, version, server_version, sync_status, deleted, \
     title, description, notes, priority, status, due_date_ms, category_id, progress_percentage, \
     completed_at_ms, synced_fields, created_at_ms, updated_at_ms, synced_at_ms";

const CATEGORY_COLUMNS: &str = "client_id, server_id, version, server_version, sync_status, \
     deleted, name, color, sort_order, synced_fields, created_at_ms, updated_at_ms, synced_at_ms";

const MUTATION_COLUMNS: &str = "id, entity_type, entity_id, operation, data, base_version, state, \
     in_flight, retry_count, last_error, created_at_ms, attempted_at_ms, next_eligible_at_ms";

const CONFLICT_COLUMNS: &str =
    "conflict_id, client_id, entity_type, seq, local, local_deleted, remote, fields, created_at_ms";

/// Reads and writes against one connection; inside `Backend::transact` the connection is the
/// open transaction.
pub(super) struct SqliteTx<'a> {
    conn: &'a Connection,
    notices: Vec<ChangeNotice>,
}

impl<'a> SqliteTx<'a> {
    pub(super) fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            notices: Vec::new(),
        }
    }

    pub(super) fn into_notices(self) -> Vec<ChangeNotice> {
        self.notices
    }

    fn query_records(
        &self,
        kind: EntityKind,
        filter: &str,
        param: Option<&str>,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let (table, columns) = match kind {
            EntityKind::Task => ("tasks", TASK_COLUMNS),
            EntityKind::Category => ("categories", CATEGORY_COLUMNS),
        };
        let sql = format!("SELECT {columns} FROM {table} {filter} ORDER BY created_at_ms ASC, id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = match param {
            Some(param) => stmt.query(params![param])?,
            None => stmt.query([])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(match kind {
                EntityKind::Task => read_task_row(row)?,
                EntityKind::Category => read_category_row(row)?,
            });
        }
        Ok(out)
    }

    fn query_mutations(
        &self,
        filter: &str,
        param: Option<&dyn rusqlite::ToSql>,
    ) -> Result<Vec<Mutation>, StoreError> {
        let sql = format!("SELECT {MUTATION_COLUMNS} FROM sync_queue {filter} ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = match param {
            Some(param) => stmt.query([param])?,
            None => stmt.query([])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_mutation_row(row)?);
        }
        Ok(out)
    }
}

impl StoreRead for SqliteTx<'_> {
    fn record(&self, client_id: &ClientId) -> Result<Option<EntityRecord>, StoreError> {
        for kind in EntityKind::ALL {
            let mut found =
                self.query_records(kind, "WHERE client_id=?1", Some(client_id.as_str()))?;
            if let Some(record) = found.pop() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn records(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        self.query_records(kind, "", None)
    }

    fn mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        self.query_mutations("", None)
    }

    fn mutation(&self, seq: i64) -> Result<Option<Mutation>, StoreError> {
        Ok(self.query_mutations("WHERE id=?1", Some(&seq))?.pop())
    }

    fn mutations_for(&self, client_id: &ClientId) -> Result<Vec<Mutation>, StoreError> {
        self.query_mutations("WHERE entity_id=?1", Some(&client_id.as_str()))
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key=?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    fn deferred(&self, client_id: &ClientId) -> Result<Option<RemoteEntity>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT data FROM deferred_remote WHERE client_id=?1",
                params![client_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts ORDER BY created_at_ms ASC, conflict_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_conflict_row(row)?);
        }
        Ok(out)
    }

    fn user(&self) -> Result<Option<UserProfile>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT u.id, u.email, u.name, u.updated_at_ms \
                 FROM users u JOIN settings s ON s.key='current_user' AND s.value=u.id",
                [],
                |row| {
                    Ok(UserProfile {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        updated_at_ms: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }
}

impl StoreTx for SqliteTx<'_> {
    fn put_record(&mut self, record: &EntityRecord) -> Result<(), StoreError> {
        let synced_fields = record
            .synced_fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        match &record.fields {
            EntityFields::Task(task) => {
                self.conn.execute(
                    &format!(
                        "INSERT INTO tasks({TASK_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
                         ON CONFLICT(client_id) DO UPDATE SET \
                           server_id=excluded.server_id, version=excluded.version, \
                           server_version=excluded.server_version, sync_status=excluded.sync_status, \
                           deleted=excluded.deleted, title=excluded.title, \
                           description=excluded.description, notes=excluded.notes, \
                           priority=excluded.priority, status=excluded.status, \
                           due_date_ms=excluded.due_date_ms, category_id=excluded.category_id, \
                           progress_percentage=excluded.progress_percentage, \
                           completed_at_ms=excluded.completed_at_ms, \
                           synced_fields=excluded.synced_fields, updated_at_ms=excluded.updated_at_ms, \
                           synced_at_ms=excluded.synced_at_ms"
                    ),
                    params![
                        record.client_id.as_str(),
                        record.server_id.as_ref().map(ServerId::as_str),
                        record.version,
                        record.server_version,
                        record.sync_status.as_str(),
                        record.deleted,
                        task.title,
                        task.description,
                        task.notes,
                        task.priority.as_str(),
                        task.status.as_str(),
                        task.due_date_ms,
                        task.category_id.as_ref().map(ClientId::as_str),
                        i64::from(task.progress_percentage),
                        task.completed_at_ms,
                        synced_fields,
                        record.created_at_ms,
                        record.updated_at_ms,
                        record.synced_at_ms,
                    ],
                )?;
            }
            EntityFields::Category(category) => {
                self.conn.execute(
                    &format!(
                        "INSERT INTO categories({CATEGORY_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                         ON CONFLICT(client_id) DO UPDATE SET \
                           server_id=excluded.server_id, version=excluded.version, \
                           server_version=excluded.server_version, sync_status=excluded.sync_status, \
                           deleted=excluded.deleted, name=excluded.name, color=excluded.color, \
                           sort_order=excluded.sort_order, synced_fields=excluded.synced_fields, \
                           updated_at_ms=excluded.updated_at_ms, synced_at_ms=excluded.synced_at_ms"
                    ),
                    params![
                        record.client_id.as_str(),
                        record.server_id.as_ref().map(ServerId::as_str),
                        record.version,
                        record.server_version,
                        record.sync_status.as_str(),
                        record.deleted,
                        category.name,
                        category.color,
                        category.sort_order,
                        synced_fields,
                        record.created_at_ms,
                        record.updated_at_ms,
                        record.synced_at_ms,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn delete_record(&mut self, client_id: &ClientId) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM tasks WHERE client_id=?1", params![client_id.as_str()])?;
        self.conn.execute(
            "DELETE FROM categories WHERE client_id=?1",
            params![client_id.as_str()],
        )?;
        Ok(())
    }

    fn insert_mutation(&mut self, mutation: NewMutation) -> Result<Mutation, StoreError> {
        let data = serde_json::to_string(&mutation.payload)?;
        self.conn.execute(
            "INSERT INTO sync_queue(entity_type, entity_id, operation, data, base_version, state, \
               in_flight, retry_count, last_error, created_at_ms, attempted_at_ms, next_eligible_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL, ?7, NULL, ?7)",
            params![
                mutation.kind.as_str(),
                mutation.client_id.as_str(),
                mutation.operation.as_str(),
                data,
                mutation.base_version,
                MutationState::Pending.as_str(),
                mutation.created_at_ms,
            ],
        )?;
        let seq = self.conn.last_insert_rowid();
        Ok(mutation.into_mutation(seq))
    }

    fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        let data = serde_json::to_string(&mutation.payload)?;
        let changed = self.conn.execute(
            "UPDATE sync_queue SET operation=?2, data=?3, base_version=?4, state=?5, in_flight=?6, \
               retry_count=?7, last_error=?8, attempted_at_ms=?9, next_eligible_at_ms=?10 \
             WHERE id=?1",
            params![
                mutation.seq,
                mutation.operation.as_str(),
                data,
                mutation.base_version,
                mutation.state.as_str(),
                mutation.in_flight,
                mutation.retry_count,
                mutation.last_error,
                mutation.last_attempt_at_ms,
                mutation.next_eligible_at_ms,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownMutation(mutation.seq));
        }
        Ok(())
    }

    fn delete_mutation(&mut self, seq: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM sync_queue WHERE id=?1", params![seq])?;
        Ok(())
    }

    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn put_deferred(&mut self, remote: &RemoteEntity, now_ms: i64) -> Result<(), StoreError> {
        let data = serde_json::to_string(remote)?;
        self.conn.execute(
            "INSERT INTO deferred_remote(client_id, entity_type, data, received_at_ms) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(client_id) DO UPDATE SET entity_type=excluded.entity_type, \
               data=excluded.data, received_at_ms=excluded.received_at_ms",
            params![
                remote.client_id.as_str(),
                remote.kind().as_str(),
                data,
                now_ms
            ],
        )?;
        Ok(())
    }

    fn delete_deferred(&mut self, client_id: &ClientId) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM deferred_remote WHERE client_id=?1",
            params![client_id.as_str()],
        )?;
        Ok(())
    }

    fn put_conflict(&mut self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        let local = serde_json::to_string(&conflict.detail.local)?;
        let remote = conflict
            .detail
            .remote
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let fields = serde_json::to_string(&conflict.detail.fields)?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_conflicts({CONFLICT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                conflict.conflict_id.as_str(),
                conflict.client_id.as_str(),
                conflict.kind.as_str(),
                conflict.seq,
                local,
                conflict.detail.local_deleted,
                remote,
                fields,
                conflict.created_at_ms,
            ],
        )?;
        Ok(())
    }

    fn delete_conflicts(&mut self, client_id: &ClientId) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM sync_conflicts WHERE client_id=?1",
            params![client_id.as_str()],
        )?;
        Ok(())
    }

    fn put_user(&mut self, user: &UserProfile) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO users(id, email, name, updated_at_ms) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET email=excluded.email, name=excluded.name, \
               updated_at_ms=excluded.updated_at_ms",
            params![user.user_id, user.email, user.name, user.updated_at_ms],
        )?;
        self.set_setting("current_user", &user.user_id)
    }

    fn notify(&mut self, notice: ChangeNotice) {
        self.notices.push(notice);
    }
}

fn parse_client_id(raw: String) -> Result<ClientId, StoreError> {
    ClientId::try_new(raw).map_err(|_| StoreError::InvalidInput("invalid client_id row"))
}

fn parse_synced_fields(raw: Option<String>) -> Result<Option<EntityFields>, StoreError> {
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Columns shared by both record tables, in `*_COLUMNS` order around the domain fields.
fn read_record(
    row: &Row<'_>,
    fields: EntityFields,
    tail: usize,
) -> Result<EntityRecord, StoreError> {
    let sync_status = SyncStatus::parse(&row.get::<_, String>(4)?)
        .ok_or(StoreError::InvalidInput("invalid sync_status row"))?;
    Ok(EntityRecord {
        client_id: parse_client_id(row.get(0)?)?,
        server_id: row.get::<_, Option<String>>(1)?.map(ServerId::new),
        version: row.get(2)?,
        server_version: row.get(3)?,
        sync_status,
        deleted: row.get(5)?,
        fields,
        synced_fields: parse_synced_fields(row.get(tail)?)?,
        created_at_ms: row.get(tail + 1)?,
        updated_at_ms: row.get(tail + 2)?,
        synced_at_ms: row.get(tail + 3)?,
    })
}

fn read_task_row(row: &Row<'_>) -> Result<EntityRecord, StoreError> {
    let priority = TaskPriority::parse(&row.get::<_, String>(9)?)
        .ok_or(StoreError::InvalidInput("invalid task priority row"))?;
    let status = TaskStatus::parse(&row.get::<_, String>(10)?)
        .ok_or(StoreError::InvalidInput("invalid task status row"))?;
    let progress_percentage = u8::try_from(row.get::<_, i64>(13)?)
        .map_err(|_| StoreError::InvalidInput("invalid task progress row"))?;
    let task = TaskFields {
        title: row.get(6)?,
        description: row.get(7)?,
        notes: row.get(8)?,
        priority,
        status,
        due_date_ms: row.get(11)?,
        category_id: row
            .get::<_, Option<String>>(12)?
            .map(parse_client_id)
            .transpose()?,
        progress_percentage,
        completed_at_ms: row.get(14)?,
    };
    read_record(row, EntityFields::Task(task), 15)
}

fn read_category_row(row: &Row<'_>) -> Result<EntityRecord, StoreError> {
    let category = CategoryFields {
        name: row.get(6)?,
        color: row.get(7)?,
        sort_order: row.get(8)?,
    };
    read_record(row, EntityFields::Category(category), 9)
}

fn read_mutation_row(row: &Row<'_>) -> Result<Mutation, StoreError> {
    let kind = EntityKind::parse(&row.get::<_, String>(1)?)
        .ok_or(StoreError::InvalidInput("invalid sync_queue entity_type"))?;
    let operation = Operation::parse(&row.get::<_, String>(3)?)
        .ok_or(StoreError::InvalidInput("invalid sync_queue operation"))?;
    let state = MutationState::parse(&row.get::<_, String>(6)?)
        .ok_or(StoreError::InvalidInput("invalid sync_queue state"))?;
    let payload: EntityFields = serde_json::from_str(&row.get::<_, String>(4)?)?;
    let retry_count = u32::try_from(row.get::<_, i64>(8)?)
        .map_err(|_| StoreError::InvalidInput("invalid sync_queue retry_count"))?;
    Ok(Mutation {
        seq: row.get(0)?,
        kind,
        client_id: parse_client_id(row.get(2)?)?,
        operation,
        payload,
        base_version: row.get(5)?,
        state,
        in_flight: row.get(7)?,
        retry_count,
        last_error: row.get(9)?,
        created_at_ms: row.get(10)?,
        last_attempt_at_ms: row.get(11)?,
        next_eligible_at_ms: row.get(12)?,
    })
}

fn read_conflict_row(row: &Row<'_>) -> Result<ConflictRecord, StoreError> {
    let conflict_id = ConflictId::try_new(row.get::<_, String>(0)?)
        .map_err(|_| StoreError::InvalidInput("invalid conflict_id row"))?;
    let kind = EntityKind::parse(&row.get::<_, String>(2)?)
        .ok_or(StoreError::InvalidInput("invalid sync_conflicts entity_type"))?;
    let remote = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok(ConflictRecord {
        conflict_id,
        kind,
        client_id: parse_client_id(row.get(1)?)?,
        seq: row.get(3)?,
        detail: ConflictDetail {
            local: serde_json::from_str(&row.get::<_, String>(4)?)?,
            local_deleted: row.get(5)?,
            remote,
            fields: serde_json::from_str(&row.get::<_, String>(7)?)?,
        },
        created_at_ms: row.get(8)?,
    })
}
