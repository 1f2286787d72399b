use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use taskboard_core::{
    Context, ContextId, ContextPatch, Note, NoteId, Task, TaskId, TaskPatch, TaskStatus, UserId,
};
use taskboard_store_sqlite::{SchemaStatus, SqliteStore};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateContextRequest {
    pub name: String,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateContextRequest {
    pub context_id: ContextId,
    #[serde(flatten)]
    pub patch: ContextPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectContextRequest {
    pub context_id: Option<ContextId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTaskRequest {
    pub context_id: ContextId,
    pub title: String,
    pub description: Option<String>,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completion_date: Option<OffsetDateTime>,
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Backlog
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveTaskRequest {
    pub task_id: TaskId,
    pub new_status: TaskStatus,
    pub new_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateTaskRequest {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub patch: TaskPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateNoteRequest {
    pub task_id: TaskId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateNoteRequest {
    pub note_id: NoteId,
    pub content: String,
}

/// Thin facade over the SQLite store. Each call opens the database and
/// brings the schema up to date, so callers never hold long-lived handles.
#[derive(Debug, Clone)]
pub struct TaskboardApi {
    db_path: PathBuf,
}

impl TaskboardApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create a context for the caller.
    ///
    /// # Errors
    /// Returns an error when the name is already taken or persistence fails.
    pub fn create_context(&self, caller: UserId, input: CreateContextRequest) -> Result<Context> {
        let mut store = self.open_migrated()?;
        store.create_context(caller, &input.name, input.icon.as_deref())
    }

    /// List the caller's contexts, most recently created first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_contexts(&self, caller: UserId) -> Result<Vec<Context>> {
        let store = self.open_migrated()?;
        store.list_contexts(caller)
    }

    /// Apply a partial update to one of the caller's contexts.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign contexts, duplicate names, or
    /// persistence failures.
    pub fn update_context(&self, caller: UserId, input: UpdateContextRequest) -> Result<Context> {
        let mut store = self.open_migrated()?;
        store.update_context(caller, input.context_id, &input.patch)
    }

    /// Remove one of the caller's contexts.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign contexts, contexts that still
    /// hold tasks, or persistence failures.
    pub fn remove_context(&self, caller: UserId, context_id: ContextId) -> Result<ContextId> {
        let mut store = self.open_migrated()?;
        store.remove_context(caller, context_id)
    }

    /// Resolve the caller's active context, if any. An anonymous caller
    /// resolves to `None` rather than an error.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn active_context(&self, caller: Option<UserId>) -> Result<Option<Context>> {
        let Some(caller) = caller else {
            return Ok(None);
        };
        let store = self.open_migrated()?;
        store.active_context(caller)
    }

    /// Record the caller's selected context; `None` clears the selection.
    ///
    /// # Errors
    /// Returns an error when a non-null id does not resolve to one of the
    /// caller's contexts, or persistence fails.
    pub fn select_context(
        &self,
        caller: UserId,
        input: SelectContextRequest,
    ) -> Result<Option<ContextId>> {
        let mut store = self.open_migrated()?;
        store.set_selected_context(caller, input.context_id)
    }

    /// Create a task at the end of its status bucket.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign contexts, or persistence
    /// failures.
    pub fn create_task(&self, caller: UserId, input: CreateTaskRequest) -> Result<Task> {
        let mut store = self.open_migrated()?;
        store.create_task(
            caller,
            input.context_id,
            &input.title,
            input.description.as_deref(),
            input.status,
            input.completion_date,
        )
    }

    /// List the caller's tasks, optionally scoped to one context.
    ///
    /// # Errors
    /// Returns ownership errors for an explicitly named context, or an error
    /// when the store cannot be read.
    pub fn list_tasks(&self, caller: UserId, context_id: Option<ContextId>) -> Result<Vec<Task>> {
        let store = self.open_migrated()?;
        store.list_tasks(caller, context_id)
    }

    /// List the caller's tasks with one status across all contexts.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_tasks_by_status(&self, caller: UserId, status: TaskStatus) -> Result<Vec<Task>> {
        let store = self.open_migrated()?;
        store.list_tasks_by_status(caller, status)
    }

    /// Move a task to a new status and position within the destination
    /// bucket.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign tasks, or persistence
    /// failures.
    pub fn move_task(&self, caller: UserId, input: MoveTaskRequest) -> Result<Task> {
        let mut store = self.open_migrated()?;
        store.update_task_status(caller, input.task_id, input.new_status, input.new_index)
    }

    /// Apply a partial update to a task's non-ordering fields.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign tasks, or persistence
    /// failures.
    pub fn update_task(&self, caller: UserId, input: UpdateTaskRequest) -> Result<Task> {
        let mut store = self.open_migrated()?;
        store.update_task(caller, input.task_id, &input.patch)
    }

    /// Remove a task along with its notes.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign tasks, or persistence
    /// failures.
    pub fn remove_task(&self, caller: UserId, task_id: TaskId) -> Result<TaskId> {
        let mut store = self.open_migrated()?;
        store.remove_task(caller, task_id)
    }

    /// Attach a note to one of the caller's tasks.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign tasks, or persistence
    /// failures.
    pub fn create_note(&self, caller: UserId, input: CreateNoteRequest) -> Result<Note> {
        let mut store = self.open_migrated()?;
        store.create_note(caller, input.task_id, &input.content)
    }

    /// List a task's notes in creation order.
    ///
    /// # Errors
    /// Returns ownership errors for the task, or an error when the store
    /// cannot be read.
    pub fn list_notes_by_task(&self, caller: UserId, task_id: TaskId) -> Result<Vec<Note>> {
        let store = self.open_migrated()?;
        store.list_notes_by_task(caller, task_id)
    }

    /// Replace a note's content.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign notes, or persistence
    /// failures.
    pub fn update_note(&self, caller: UserId, input: UpdateNoteRequest) -> Result<Note> {
        let mut store = self.open_migrated()?;
        store.update_note(caller, input.note_id, &input.content)
    }

    /// Remove one note.
    ///
    /// # Errors
    /// Returns an error for unknown or foreign notes, or persistence
    /// failures.
    pub fn remove_note(&self, caller: UserId, note_id: NoteId) -> Result<NoteId> {
        let mut store = self.open_migrated()?;
        store.remove_note(caller, note_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("taskboard-api-{}.sqlite3", ulid::Ulid::new()))
    }

    #[test]
    fn api_context_task_note_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TaskboardApi::new(db_path.clone());
        let alice = UserId::new();

        let context = api.create_context(
            alice,
            CreateContextRequest { name: "Work".to_string(), icon: Some("briefcase".to_string()) },
        )?;
        let task = api.create_task(
            alice,
            CreateTaskRequest {
                context_id: context.context_id,
                title: "Write report".to_string(),
                description: None,
                status: TaskStatus::Backlog,
                completion_date: None,
            },
        )?;
        let note = api.create_note(
            alice,
            CreateNoteRequest { task_id: task.task_id, content: "Draft by Friday".to_string() },
        )?;

        let tasks = api.list_tasks(alice, Some(context.context_id))?;
        assert_eq!(tasks, vec![task.clone()]);
        let notes = api.list_notes_by_task(alice, task.task_id)?;
        assert_eq!(notes, vec![note]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_reports_dry_run_then_applies() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TaskboardApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert!(!applied.dry_run);
        assert_eq!(applied.after_version, Some(planned.target_version));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_active_context_is_none_for_anonymous_callers() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TaskboardApi::new(db_path.clone());

        assert_eq!(api.active_context(None)?, None);

        let alice = UserId::new();
        let context = api.create_context(
            alice,
            CreateContextRequest { name: "Work".to_string(), icon: None },
        )?;
        let active = api.active_context(Some(alice))?;
        assert_eq!(active.map(|context| context.context_id), Some(context.context_id));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_move_task_reaches_the_store_ordering() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TaskboardApi::new(db_path.clone());
        let alice = UserId::new();

        let context = api.create_context(
            alice,
            CreateContextRequest { name: "Work".to_string(), icon: None },
        )?;
        let first = api.create_task(
            alice,
            CreateTaskRequest {
                context_id: context.context_id,
                title: "T1".to_string(),
                description: None,
                status: TaskStatus::Backlog,
                completion_date: None,
            },
        )?;
        let second = api.create_task(
            alice,
            CreateTaskRequest {
                context_id: context.context_id,
                title: "T2".to_string(),
                description: None,
                status: TaskStatus::Backlog,
                completion_date: None,
            },
        )?;

        let moved = api.move_task(
            alice,
            MoveTaskRequest {
                task_id: second.task_id,
                new_status: TaskStatus::InProgress,
                new_index: 0,
            },
        )?;
        assert_eq!(moved.status, TaskStatus::InProgress);
        assert_eq!(moved.position, 0);

        let backlog = api.list_tasks_by_status(alice, TaskStatus::Backlog)?;
        assert_eq!(
            backlog.iter().map(|task| task.task_id).collect::<Vec<_>>(),
            vec![first.task_id]
        );
        assert_eq!(backlog[0].position, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_update_task_request_accepts_null_completion_date() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TaskboardApi::new(db_path.clone());
        let alice = UserId::new();

        let context = api.create_context(
            alice,
            CreateContextRequest { name: "Work".to_string(), icon: None },
        )?;
        let task = api.create_task(
            alice,
            CreateTaskRequest {
                context_id: context.context_id,
                title: "T".to_string(),
                description: None,
                status: TaskStatus::Done,
                completion_date: Some(OffsetDateTime::now_utc()),
            },
        )?;

        let raw = format!(
            r#"{{"task_id":"{}","completion_date":null}}"#,
            task.task_id
        );
        let request: UpdateTaskRequest = serde_json::from_str(&raw)?;
        let updated = api.update_task(alice, request)?;
        assert_eq!(updated.completion_date, None);
        assert_eq!(updated.title, "T");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
