use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context as _, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use taskboard_core::{
    append_position, plan_move, renumber_without, BucketEntry, Context, ContextId, ContextPatch,
    DomainError, Entity, Note, NoteId, PositionWrite, Task, TaskId, TaskPatch, TaskStatus, UserId,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contexts (
  context_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  name TEXT NOT NULL,
  icon TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (user_id, name)
);

CREATE TABLE IF NOT EXISTS tasks (
  task_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  context_id TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT,
  status TEXT NOT NULL CHECK (status IN ('backlog','in-progress','done')),
  position INTEGER NOT NULL CHECK (position >= 0),
  created_at TEXT NOT NULL,
  completion_date TEXT,
  FOREIGN KEY (context_id) REFERENCES contexts(context_id)
);

CREATE TABLE IF NOT EXISTS task_notes (
  note_id TEXT PRIMARY KEY,
  task_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (task_id) REFERENCES tasks(task_id)
);

CREATE TABLE IF NOT EXISTS user_preferences (
  user_id TEXT PRIMARY KEY,
  selected_context_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_contexts_user ON contexts(user_id);
CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);
CREATE INDEX IF NOT EXISTS idx_tasks_context ON tasks(context_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_bucket ON tasks(user_id, context_id, status);
CREATE INDEX IF NOT EXISTS idx_task_notes_task ON task_notes(task_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed taskboard store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create a context for the caller. `(user, name)` must be unique.
    ///
    /// # Errors
    /// Returns [`DomainError::DuplicateName`] when the caller already has a
    /// context with the same name, or an error when persistence fails.
    pub fn create_context(
        &mut self,
        caller: UserId,
        name: &str,
        icon: Option<&str>,
    ) -> Result<Context> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        if context_name_taken(&tx, caller, name, None)? {
            return Err(DomainError::DuplicateName(name.to_string()).into());
        }

        let context = Context {
            context_id: ContextId::new(),
            user_id: caller,
            name: name.to_string(),
            icon: icon.map(str::to_string),
            created_at: OffsetDateTime::now_utc(),
        };
        tx.execute(
            "INSERT INTO contexts(context_id, user_id, name, icon, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                context.context_id.to_string(),
                context.user_id.to_string(),
                context.name,
                context.icon,
                rfc3339(context.created_at)?,
            ],
        )
        .context("failed to insert context")?;

        tx.commit().context("failed to commit context insert")?;
        Ok(context)
    }

    /// List the caller's contexts, most recently created first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_contexts(&self, caller: UserId) -> Result<Vec<Context>> {
        let mut stmt = self.conn.prepare(
            "SELECT context_id, user_id, name, icon, created_at
             FROM contexts
             WHERE user_id = ?1
             ORDER BY created_at DESC, context_id DESC",
        )?;
        let rows = stmt.query_map(params![caller.to_string()], context_from_row)?;

        let mut contexts = Vec::new();
        for row in rows {
            contexts.push(decode(row?)?);
        }
        Ok(contexts)
    }

    /// Apply a partial update to one of the caller's contexts.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, [`DomainError::DuplicateName`] when renaming onto an existing
    /// name, or an error when persistence fails.
    pub fn update_context(
        &mut self,
        caller: UserId,
        context_id: ContextId,
        patch: &ContextPatch,
    ) -> Result<Context> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut context = get_context_owned(&tx, caller, context_id)?;

        if let Some(name) = &patch.name {
            if name != &context.name && context_name_taken(&tx, caller, name, Some(context_id))? {
                return Err(DomainError::DuplicateName(name.clone()).into());
            }
            context.name = name.clone();
        }
        if let Some(icon) = &patch.icon {
            context.icon = Some(icon.clone());
        }

        tx.execute(
            "UPDATE contexts SET name = ?2, icon = ?3 WHERE context_id = ?1",
            params![context.context_id.to_string(), context.name, context.icon],
        )
        .context("failed to update context")?;

        tx.commit().context("failed to commit context update")?;
        Ok(context)
    }

    /// Remove one of the caller's contexts. Blocked while tasks reference it.
    /// If the removed context was selected, the selection moves to the most
    /// recently created survivor (or clears), creating the preference row on
    /// demand.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, [`DomainError::ContextHasTasks`] while tasks reference the
    /// context, or an error when persistence fails.
    pub fn remove_context(&mut self, caller: UserId, context_id: ContextId) -> Result<ContextId> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let context = get_context_owned(&tx, caller, context_id)?;

        let has_tasks: i64 = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE context_id = ?1)",
            params![context.context_id.to_string()],
            |row| row.get(0),
        )?;
        if has_tasks == 1 {
            return Err(DomainError::ContextHasTasks.into());
        }

        let preference = load_preference(&tx, caller)?;
        let was_selected =
            preference.as_ref().is_some_and(|selected| *selected == Some(context_id));

        tx.execute(
            "DELETE FROM contexts WHERE context_id = ?1",
            params![context.context_id.to_string()],
        )
        .context("failed to delete context")?;

        if was_selected {
            let replacement: Option<String> = tx
                .query_row(
                    "SELECT context_id FROM contexts
                     WHERE user_id = ?1
                     ORDER BY created_at DESC, context_id DESC
                     LIMIT 1",
                    params![caller.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            upsert_selected_context(&tx, caller, replacement.as_deref())?;
        }

        tx.commit().context("failed to commit context removal")?;
        Ok(context_id)
    }

    /// Resolve the caller's active context: the selected one if it still
    /// exists, otherwise the most recently created, otherwise `None`. Never
    /// errors on an empty account.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn active_context(&self, caller: UserId) -> Result<Option<Context>> {
        let contexts = self.list_contexts(caller)?;
        if contexts.is_empty() {
            return Ok(None);
        }

        if let Some(Some(selected)) = load_preference(&self.conn, caller)? {
            if let Some(context) =
                contexts.iter().find(|context| context.context_id == selected)
            {
                return Ok(Some(context.clone()));
            }
        }

        Ok(contexts.into_iter().next())
    }

    /// Record the caller's selected context; `None` clears the selection.
    /// The preference row is created on first use.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] when a
    /// non-null id does not resolve to one of the caller's contexts, or an
    /// error when persistence fails.
    pub fn set_selected_context(
        &mut self,
        caller: UserId,
        selection: Option<ContextId>,
    ) -> Result<Option<ContextId>> {
        if let Some(context_id) = selection {
            get_context_owned(&self.conn, caller, context_id)?;
        }

        let selected = selection.map(|context_id| context_id.to_string());
        upsert_selected_context(&self.conn, caller, selected.as_deref())?;
        Ok(selection)
    }

    /// Create a task at the end of its `(user, context, status)` bucket.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] when the
    /// context does not resolve to one of the caller's, or an error when
    /// persistence fails.
    pub fn create_task(
        &mut self,
        caller: UserId,
        context_id: ContextId,
        title: &str,
        description: Option<&str>,
        status: TaskStatus,
        completion_date: Option<OffsetDateTime>,
    ) -> Result<Task> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        get_context_owned(&tx, caller, context_id)?;

        let bucket = load_bucket(&tx, caller, context_id, status)?;
        let task = Task {
            task_id: TaskId::new(),
            user_id: caller,
            context_id,
            title: title.to_string(),
            description: description.map(str::to_string),
            status,
            position: append_position(&bucket),
            created_at: OffsetDateTime::now_utc(),
            completion_date,
        };

        tx.execute(
            "INSERT INTO tasks(
                task_id, user_id, context_id, title, description,
                status, position, created_at, completion_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.task_id.to_string(),
                task.user_id.to_string(),
                task.context_id.to_string(),
                task.title,
                task.description,
                task.status.as_str(),
                task.position,
                rfc3339(task.created_at)?,
                task.completion_date.map(rfc3339).transpose()?,
            ],
        )
        .context("failed to insert task")?;

        tx.commit().context("failed to commit task insert")?;
        Ok(task)
    }

    /// List the caller's tasks. With a context the result is that context's
    /// tasks sorted by bucket position; without one it is every task the
    /// caller owns, sorted by creation time (positions are not comparable
    /// across buckets).
    ///
    /// # Errors
    /// Returns ownership errors for an explicitly named context, or an error
    /// when rows cannot be read or decoded.
    pub fn list_tasks(&self, caller: UserId, context_id: Option<ContextId>) -> Result<Vec<Task>> {
        if let Some(context_id) = context_id {
            get_context_owned(&self.conn, caller, context_id)?;
            let mut stmt = self.conn.prepare(
                "SELECT task_id, user_id, context_id, title, description,
                        status, position, created_at, completion_date
                 FROM tasks
                 WHERE user_id = ?1 AND context_id = ?2
                 ORDER BY position ASC, task_id ASC",
            )?;
            let rows = stmt
                .query_map(params![caller.to_string(), context_id.to_string()], task_from_row)?;
            return collect_decoded(rows);
        }

        let mut stmt = self.conn.prepare(
            "SELECT task_id, user_id, context_id, title, description,
                    status, position, created_at, completion_date
             FROM tasks
             WHERE user_id = ?1
             ORDER BY created_at ASC, task_id ASC",
        )?;
        let rows = stmt.query_map(params![caller.to_string()], task_from_row)?;
        collect_decoded(rows)
    }

    /// List the caller's tasks with one status across all contexts. No
    /// position ordering is promised here.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tasks_by_status(&self, caller: UserId, status: TaskStatus) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, user_id, context_id, title, description,
                    status, position, created_at, completion_date
             FROM tasks
             WHERE status = ?1 AND user_id = ?2
             ORDER BY created_at ASC, task_id ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str(), caller.to_string()], task_from_row)?;
        collect_decoded(rows)
    }

    /// Move a task to `new_status` at `new_index` within the destination
    /// bucket, restoring dense `0..n-1` positions in both affected buckets.
    /// All writes commit as one transaction; an index past the end appends.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, or an error when persistence fails.
    pub fn update_task_status(
        &mut self,
        caller: UserId,
        task_id: TaskId,
        new_status: TaskStatus,
        new_index: usize,
    ) -> Result<Task> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut task = get_task_owned(&tx, caller, task_id)?;

        let crosses_buckets = task.status != new_status;
        let source = load_bucket(&tx, caller, task.context_id, task.status)?;
        let destination = if crosses_buckets {
            load_bucket(&tx, caller, task.context_id, new_status)?
        } else {
            source.clone()
        };

        let plan = plan_move(&source, &destination, task_id, new_index, crosses_buckets);
        apply_position_writes(&tx, &plan.source_writes)?;
        apply_position_writes(&tx, &plan.destination_writes)?;
        tx.execute(
            "UPDATE tasks SET status = ?2, position = ?3 WHERE task_id = ?1",
            params![task_id.to_string(), new_status.as_str(), plan.moved.position],
        )
        .context("failed to update moved task")?;

        tx.commit().context("failed to commit task move")?;

        task.status = new_status;
        task.position = plan.moved.position;
        Ok(task)
    }

    /// Apply a partial update to a task's non-ordering fields.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, or an error when persistence fails.
    pub fn update_task(
        &mut self,
        caller: UserId,
        task_id: TaskId,
        patch: &TaskPatch,
    ) -> Result<Task> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut task = get_task_owned(&tx, caller, task_id)?;

        if let Some(title) = &patch.title {
            task.title = title.clone();
        }
        if let Some(description) = &patch.description {
            task.description = Some(description.clone());
        }
        task.completion_date = patch.completion_date.apply(task.completion_date);

        tx.execute(
            "UPDATE tasks SET title = ?2, description = ?3, completion_date = ?4
             WHERE task_id = ?1",
            params![
                task.task_id.to_string(),
                task.title,
                task.description,
                task.completion_date.map(rfc3339).transpose()?,
            ],
        )
        .context("failed to update task")?;

        tx.commit().context("failed to commit task update")?;
        Ok(task)
    }

    /// Remove a task, cascading its notes and densely renumbering the
    /// vacated bucket, all in one transaction.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, or an error when persistence fails.
    pub fn remove_task(&mut self, caller: UserId, task_id: TaskId) -> Result<TaskId> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let task = get_task_owned(&tx, caller, task_id)?;

        tx.execute("DELETE FROM task_notes WHERE task_id = ?1", params![task_id.to_string()])
            .context("failed to cascade task notes")?;
        tx.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id.to_string()])
            .context("failed to delete task")?;

        let bucket = load_bucket(&tx, caller, task.context_id, task.status)?;
        apply_position_writes(&tx, &renumber_without(&bucket, task_id))?;

        tx.commit().context("failed to commit task removal")?;
        Ok(task_id)
    }

    /// Attach a note to one of the caller's tasks.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] when
    /// the task does not resolve to one of the caller's, or an error when
    /// persistence fails.
    pub fn create_note(&mut self, caller: UserId, task_id: TaskId, content: &str) -> Result<Note> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        get_task_owned(&tx, caller, task_id)?;

        let note = Note {
            note_id: NoteId::new(),
            user_id: caller,
            task_id,
            content: content.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        tx.execute(
            "INSERT INTO task_notes(note_id, task_id, user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                note.note_id.to_string(),
                note.task_id.to_string(),
                note.user_id.to_string(),
                note.content,
                rfc3339(note.created_at)?,
            ],
        )
        .context("failed to insert note")?;

        tx.commit().context("failed to commit note insert")?;
        Ok(note)
    }

    /// List a task's notes in creation order (oldest first).
    ///
    /// # Errors
    /// Returns ownership errors for the task, or an error when rows cannot be
    /// read or decoded.
    pub fn list_notes_by_task(&self, caller: UserId, task_id: TaskId) -> Result<Vec<Note>> {
        get_task_owned(&self.conn, caller, task_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT note_id, task_id, user_id, content, created_at
             FROM task_notes
             WHERE task_id = ?1
             ORDER BY created_at ASC, note_id ASC",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], note_from_row)?;
        collect_decoded(rows)
    }

    /// Replace a note's content.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, or an error when persistence fails.
    pub fn update_note(&mut self, caller: UserId, note_id: NoteId, content: &str) -> Result<Note> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut note = get_note_owned(&tx, caller, note_id)?;

        note.content = content.to_string();
        tx.execute(
            "UPDATE task_notes SET content = ?2 WHERE note_id = ?1",
            params![note.note_id.to_string(), note.content],
        )
        .context("failed to update note")?;

        tx.commit().context("failed to commit note update")?;
        Ok(note)
    }

    /// Remove one note.
    ///
    /// # Errors
    /// Returns [`DomainError::NotFound`] / [`DomainError::Forbidden`] for bad
    /// targets, or an error when persistence fails.
    pub fn remove_note(&mut self, caller: UserId, note_id: NoteId) -> Result<NoteId> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        get_note_owned(&tx, caller, note_id)?;

        tx.execute("DELETE FROM task_notes WHERE note_id = ?1", params![note_id.to_string()])
            .context("failed to delete note")?;

        tx.commit().context("failed to commit note removal")?;
        Ok(note_id)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn context_name_taken(
    conn: &Connection,
    caller: UserId,
    name: &str,
    exclude: Option<ContextId>,
) -> Result<bool> {
    let taken: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM contexts
            WHERE user_id = ?1 AND name = ?2 AND context_id != ?3
         )",
        params![
            caller.to_string(),
            name,
            exclude.map(|context_id| context_id.to_string()).unwrap_or_default(),
        ],
        |row| row.get(0),
    )?;
    Ok(taken == 1)
}

fn get_context_owned(conn: &Connection, caller: UserId, context_id: ContextId) -> Result<Context> {
    let mut stmt = conn.prepare(
        "SELECT context_id, user_id, name, icon, created_at
         FROM contexts WHERE context_id = ?1",
    )?;
    let context = stmt
        .query_row(params![context_id.to_string()], context_from_row)
        .optional()?
        .ok_or(DomainError::NotFound(Entity::Context))
        .map_err(anyhow::Error::from)
        .and_then(decode)?;

    if context.user_id != caller {
        return Err(DomainError::Forbidden(Entity::Context).into());
    }
    Ok(context)
}

fn get_task_owned(conn: &Connection, caller: UserId, task_id: TaskId) -> Result<Task> {
    let mut stmt = conn.prepare(
        "SELECT task_id, user_id, context_id, title, description,
                status, position, created_at, completion_date
         FROM tasks WHERE task_id = ?1",
    )?;
    let task = stmt
        .query_row(params![task_id.to_string()], task_from_row)
        .optional()?
        .ok_or(DomainError::NotFound(Entity::Task))
        .map_err(anyhow::Error::from)
        .and_then(decode)?;

    if task.user_id != caller {
        return Err(DomainError::Forbidden(Entity::Task).into());
    }
    Ok(task)
}

fn get_note_owned(conn: &Connection, caller: UserId, note_id: NoteId) -> Result<Note> {
    let mut stmt = conn.prepare(
        "SELECT note_id, task_id, user_id, content, created_at
         FROM task_notes WHERE note_id = ?1",
    )?;
    let note = stmt
        .query_row(params![note_id.to_string()], note_from_row)
        .optional()?
        .ok_or(DomainError::NotFound(Entity::Note))
        .map_err(anyhow::Error::from)
        .and_then(decode)?;

    if note.user_id != caller {
        return Err(DomainError::Forbidden(Entity::Note).into());
    }
    Ok(note)
}

fn load_bucket(
    conn: &Connection,
    caller: UserId,
    context_id: ContextId,
    status: TaskStatus,
) -> Result<Vec<BucketEntry>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, position FROM tasks
         WHERE user_id = ?1 AND context_id = ?2 AND status = ?3",
    )?;
    let rows = stmt.query_map(
        params![caller.to_string(), context_id.to_string(), status.as_str()],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
    )?;

    let mut entries = Vec::new();
    for row in rows {
        let (raw_id, position) = row?;
        entries.push(BucketEntry { task_id: parse_id(&raw_id)?, position });
    }
    Ok(entries)
}

fn apply_position_writes(conn: &Connection, writes: &[PositionWrite]) -> Result<()> {
    for write in writes {
        conn.execute(
            "UPDATE tasks SET position = ?2 WHERE task_id = ?1",
            params![write.task_id.to_string(), write.position],
        )
        .context("failed to write task position")?;
    }
    Ok(())
}

fn load_preference(conn: &Connection, caller: UserId) -> Result<Option<Option<ContextId>>> {
    let selected: Option<Option<String>> = conn
        .query_row(
            "SELECT selected_context_id FROM user_preferences WHERE user_id = ?1",
            params![caller.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    match selected {
        None => Ok(None),
        Some(None) => Ok(Some(None)),
        Some(Some(raw)) => Ok(Some(Some(parse_id(&raw)?))),
    }
}

fn upsert_selected_context(conn: &Connection, caller: UserId, selected: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO user_preferences(user_id, selected_context_id) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET selected_context_id = excluded.selected_context_id",
        params![caller.to_string(), selected],
    )
    .context("failed to upsert selected context")?;
    Ok(())
}

/// Raw row shapes deferred out of `rusqlite` closures so ULID/timestamp
/// decoding can report through `anyhow` instead of `rusqlite::Error`.
struct RawContext {
    context_id: String,
    user_id: String,
    name: String,
    icon: Option<String>,
    created_at: String,
}

struct RawTask {
    task_id: String,
    user_id: String,
    context_id: String,
    title: String,
    description: Option<String>,
    status: String,
    position: i64,
    created_at: String,
    completion_date: Option<String>,
}

struct RawNote {
    note_id: String,
    task_id: String,
    user_id: String,
    content: String,
    created_at: String,
}

trait Decode {
    type Output;

    fn decode(self) -> Result<Self::Output>;
}

fn decode<T: Decode>(raw: T) -> Result<T::Output> {
    raw.decode()
}

fn collect_decoded<T, I>(rows: I) -> Result<Vec<T::Output>>
where
    T: Decode,
    I: Iterator<Item = rusqlite::Result<T>>,
{
    let mut values = Vec::new();
    for row in rows {
        values.push(row?.decode()?);
    }
    Ok(values)
}

impl Decode for RawContext {
    type Output = Context;

    fn decode(self) -> Result<Context> {
        Ok(Context {
            context_id: parse_id(&self.context_id)?,
            user_id: parse_id(&self.user_id)?,
            name: self.name,
            icon: self.icon,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

impl Decode for RawTask {
    type Output = Task;

    fn decode(self) -> Result<Task> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown task status: {}", self.status))?;
        Ok(Task {
            task_id: parse_id(&self.task_id)?,
            user_id: parse_id(&self.user_id)?,
            context_id: parse_id(&self.context_id)?,
            title: self.title,
            description: self.description,
            status,
            position: self.position,
            created_at: parse_rfc3339(&self.created_at)?,
            completion_date: self
                .completion_date
                .as_deref()
                .map(parse_rfc3339)
                .transpose()?,
        })
    }
}

impl Decode for RawNote {
    type Output = Note;

    fn decode(self) -> Result<Note> {
        Ok(Note {
            note_id: parse_id(&self.note_id)?,
            task_id: parse_id(&self.task_id)?,
            user_id: parse_id(&self.user_id)?,
            content: self.content,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn context_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawContext> {
    Ok(RawContext {
        context_id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        context_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: row.get(5)?,
        position: row.get(6)?,
        created_at: row.get(7)?,
        completion_date: row.get(8)?,
    })
}

fn note_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNote> {
    Ok(RawNote {
        note_id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = ulid::DecodeError>,
{
    T::from_str(raw).map_err(|err| anyhow!("invalid ULID `{raw}` in store: {err}"))
}

fn rfc3339(timestamp: OffsetDateTime) -> Result<String> {
    timestamp.format(&Rfc3339).context("failed to format timestamp")
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("invalid timestamp in store: {raw}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}
