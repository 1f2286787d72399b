use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use taskboard_core::{
    ContextId, ContextPatch, NoteId, Patch, TaskId, TaskPatch, TaskStatus, UserId,
};
use taskboard_store_sqlite::SqliteStore;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tb")]
#[command(about = "Taskboard CLI")]
struct Cli {
    #[arg(long, default_value = "./taskboard.sqlite3")]
    db: PathBuf,

    /// ULID identifying the calling user.
    #[arg(long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Note {
        #[command(subcommand)]
        command: NoteCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ContextCommand {
    Create(CreateContextArgs),
    List,
    Update(UpdateContextArgs),
    Remove(RemoveContextArgs),
    Active,
    Select(SelectContextArgs),
}

#[derive(Debug, Args)]
struct CreateContextArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    icon: Option<String>,
}

#[derive(Debug, Args)]
struct UpdateContextArgs {
    #[arg(long)]
    context_id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    icon: Option<String>,
}

#[derive(Debug, Args)]
struct RemoveContextArgs {
    #[arg(long)]
    context_id: String,
}

#[derive(Debug, Args)]
struct SelectContextArgs {
    /// Context to select; omit to clear the selection.
    #[arg(long)]
    context_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    Create(CreateTaskArgs),
    List(ListTasksArgs),
    ListByStatus(ListTasksByStatusArgs),
    Move(MoveTaskArgs),
    Update(UpdateTaskArgs),
    Remove(RemoveTaskArgs),
}

#[derive(Debug, Args)]
struct CreateTaskArgs {
    #[arg(long)]
    context_id: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_enum, default_value_t = StatusArg::Backlog)]
    status: StatusArg,
    #[arg(long)]
    completion_date: Option<String>,
}

#[derive(Debug, Args)]
struct ListTasksArgs {
    #[arg(long)]
    context_id: Option<String>,
}

#[derive(Debug, Args)]
struct ListTasksByStatusArgs {
    #[arg(long, value_enum)]
    status: StatusArg,
}

#[derive(Debug, Args)]
struct MoveTaskArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long, value_enum)]
    new_status: StatusArg,
    #[arg(long)]
    new_index: usize,
}

#[derive(Debug, Args)]
struct UpdateTaskArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, conflicts_with = "clear_completion_date")]
    completion_date: Option<String>,
    #[arg(long, default_value_t = false)]
    clear_completion_date: bool,
}

#[derive(Debug, Args)]
struct RemoveTaskArgs {
    #[arg(long)]
    task_id: String,
}

#[derive(Debug, Subcommand)]
enum NoteCommand {
    Add(AddNoteArgs),
    List(ListNotesArgs),
    Update(UpdateNoteArgs),
    Remove(RemoveNoteArgs),
}

#[derive(Debug, Args)]
struct AddNoteArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
struct ListNotesArgs {
    #[arg(long)]
    task_id: String,
}

#[derive(Debug, Args)]
struct UpdateNoteArgs {
    #[arg(long)]
    note_id: String,
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
struct RemoveNoteArgs {
    #[arg(long)]
    note_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Backlog,
    InProgress,
    Done,
}

impl StatusArg {
    fn into_status(self) -> TaskStatus {
        match self {
            Self::Backlog => TaskStatus::Backlog,
            Self::InProgress => TaskStatus::InProgress,
            Self::Done => TaskStatus::Done,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Context { command } => run_context(command, cli.user.as_deref(), &mut store),
        Command::Task { command } => run_task(*command, cli.user.as_deref(), &mut store),
        Command::Note { command } => run_note(command, cli.user.as_deref(), &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn run_context(command: ContextCommand, user: Option<&str>, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ContextCommand::Create(args) => {
            let caller = require_user(user)?;
            let context = store.create_context(caller, &args.name, args.icon.as_deref())?;
            emit_json(serde_json::to_value(&context).context("failed to serialize context")?)
        }
        ContextCommand::List => {
            let caller = require_user(user)?;
            let contexts = store.list_contexts(caller)?;
            emit_json(serde_json::json!({ "contexts": contexts }))
        }
        ContextCommand::Update(args) => {
            let caller = require_user(user)?;
            let context_id = parse_ulid::<ContextId>(&args.context_id)?;
            let patch = ContextPatch { name: args.name, icon: args.icon };
            let context = store.update_context(caller, context_id, &patch)?;
            emit_json(serde_json::to_value(&context).context("failed to serialize context")?)
        }
        ContextCommand::Remove(args) => {
            let caller = require_user(user)?;
            let context_id = parse_ulid::<ContextId>(&args.context_id)?;
            let removed = store.remove_context(caller, context_id)?;
            emit_json(serde_json::json!({ "removed_context_id": removed.to_string() }))
        }
        ContextCommand::Active => {
            // An anonymous caller gets a null active context, not an error.
            let Some(caller) = optional_user(user)? else {
                return emit_json(serde_json::json!({ "active_context": Value::Null }));
            };
            let context = store.active_context(caller)?;
            emit_json(serde_json::json!({ "active_context": context }))
        }
        ContextCommand::Select(args) => {
            let caller = require_user(user)?;
            let selection =
                args.context_id.as_deref().map(parse_ulid::<ContextId>).transpose()?;
            let selected = store.set_selected_context(caller, selection)?;
            emit_json(serde_json::json!({
                "selected_context_id": selected.map(|context_id| context_id.to_string())
            }))
        }
    }
}

fn run_task(command: TaskCommand, user: Option<&str>, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let caller = require_user(user)?;
    match command {
        TaskCommand::Create(args) => {
            let context_id = parse_ulid::<ContextId>(&args.context_id)?;
            let completion_date =
                args.completion_date.as_deref().map(parse_rfc3339_utc).transpose()?;
            let task = store.create_task(
                caller,
                context_id,
                &args.title,
                args.description.as_deref(),
                args.status.into_status(),
                completion_date,
            )?;
            emit_json(serde_json::to_value(&task).context("failed to serialize task")?)
        }
        TaskCommand::List(args) => {
            let context_id =
                args.context_id.as_deref().map(parse_ulid::<ContextId>).transpose()?;
            let tasks = store.list_tasks(caller, context_id)?;
            emit_json(serde_json::json!({ "tasks": tasks }))
        }
        TaskCommand::ListByStatus(args) => {
            let tasks = store.list_tasks_by_status(caller, args.status.into_status())?;
            emit_json(serde_json::json!({ "tasks": tasks }))
        }
        TaskCommand::Move(args) => {
            let task_id = parse_ulid::<TaskId>(&args.task_id)?;
            let task = store.update_task_status(
                caller,
                task_id,
                args.new_status.into_status(),
                args.new_index,
            )?;
            emit_json(serde_json::to_value(&task).context("failed to serialize task")?)
        }
        TaskCommand::Update(args) => {
            let task_id = parse_ulid::<TaskId>(&args.task_id)?;
            let completion_date = if args.clear_completion_date {
                Patch::Clear
            } else if let Some(raw) = args.completion_date.as_deref() {
                Patch::Set(parse_rfc3339_utc(raw)?)
            } else {
                Patch::Keep
            };
            let patch = TaskPatch {
                title: args.title,
                description: args.description,
                completion_date,
            };
            let task = store.update_task(caller, task_id, &patch)?;
            emit_json(serde_json::to_value(&task).context("failed to serialize task")?)
        }
        TaskCommand::Remove(args) => {
            let task_id = parse_ulid::<TaskId>(&args.task_id)?;
            let removed = store.remove_task(caller, task_id)?;
            emit_json(serde_json::json!({ "removed_task_id": removed.to_string() }))
        }
    }
}

fn run_note(command: NoteCommand, user: Option<&str>, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let caller = require_user(user)?;
    match command {
        NoteCommand::Add(args) => {
            let task_id = parse_ulid::<TaskId>(&args.task_id)?;
            let note = store.create_note(caller, task_id, &args.content)?;
            emit_json(serde_json::to_value(&note).context("failed to serialize note")?)
        }
        NoteCommand::List(args) => {
            let task_id = parse_ulid::<TaskId>(&args.task_id)?;
            let notes = store.list_notes_by_task(caller, task_id)?;
            emit_json(serde_json::json!({ "notes": notes }))
        }
        NoteCommand::Update(args) => {
            let note_id = parse_ulid::<NoteId>(&args.note_id)?;
            let note = store.update_note(caller, note_id, &args.content)?;
            emit_json(serde_json::to_value(&note).context("failed to serialize note")?)
        }
        NoteCommand::Remove(args) => {
            let note_id = parse_ulid::<NoteId>(&args.note_id)?;
            let removed = store.remove_note(caller, note_id)?;
            emit_json(serde_json::json!({ "removed_note_id": removed.to_string() }))
        }
    }
}

fn require_user(user: Option<&str>) -> Result<UserId> {
    let raw = user.ok_or_else(|| anyhow!("user identity required; pass --user <ULID>"))?;
    parse_ulid::<UserId>(raw)
}

fn optional_user(user: Option<&str>) -> Result<Option<UserId>> {
    user.map(parse_ulid::<UserId>).transpose()
}

fn parse_ulid<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = ulid::DecodeError>,
{
    T::from_str(value).map_err(|_| anyhow!("invalid ULID: {value}"))
}

fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_args_map_onto_wire_statuses() {
        assert_eq!(StatusArg::Backlog.into_status(), TaskStatus::Backlog);
        assert_eq!(StatusArg::InProgress.into_status(), TaskStatus::InProgress);
        assert_eq!(StatusArg::Done.into_status(), TaskStatus::Done);
    }

    #[test]
    fn unknown_user_ids_are_rejected_up_front() {
        match require_user(Some("not-a-ulid")) {
            Ok(user) => panic!("bogus user id should not parse: {user}"),
            Err(err) => assert!(err.to_string().contains("invalid ULID")),
        }
        match require_user(None) {
            Ok(user) => panic!("missing user should not resolve: {user}"),
            Err(err) => assert!(err.to_string().contains("user identity required")),
        }
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        match parse_rfc3339_utc("2024-05-01T10:00:00+02:00") {
            Ok(parsed) => panic!("offset timestamp should be rejected: {parsed}"),
            Err(err) => assert!(err.to_string().contains("UTC")),
        }
        if let Err(err) = parse_rfc3339_utc("2024-05-01T10:00:00Z") {
            panic!("UTC timestamp should parse: {err}");
        }
    }

    #[test]
    fn contract_version_is_injected_into_objects() {
        let value = with_contract_version(serde_json::json!({ "status": "ok" }));
        assert_eq!(
            value.get("contract_version").and_then(Value::as_str),
            Some(CLI_CONTRACT_VERSION)
        );
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
