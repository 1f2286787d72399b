use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use taskboard_api::{
    CreateContextRequest, CreateNoteRequest, CreateTaskRequest, MoveTaskRequest,
    SelectContextRequest, TaskboardApi, UpdateContextRequest, UpdateNoteRequest,
    UpdateTaskRequest, API_CONTRACT_VERSION,
};
use taskboard_core::{ContextId, DomainError, NoteId, TaskId, TaskStatus, UserId};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const USER_HEADER: &str = "x-taskboard-user";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: TaskboardApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveContextRequest {
    context_id: ContextId,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveTaskRequest {
    task_id: TaskId,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveNoteRequest {
    note_id: NoteId,
}

#[derive(Debug, Clone, Deserialize)]
struct ListTasksQuery {
    context_id: Option<ContextId>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "taskboard-service")]
#[command(about = "Local HTTP service for the taskboard")]
struct Args {
    #[arg(long, default_value = "./taskboard.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn service_error(status: StatusCode, message: impl Into<String>) -> ServiceError {
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: message.into(),
        status,
    }
}

/// Map API failures onto HTTP statuses. Identity and ownership failures get
/// 401/403, missing entities 404, name and referential conflicts 409, and
/// anything else is a plain 500.
fn api_error(err: &anyhow::Error) -> ServiceError {
    let status = match err.downcast_ref::<DomainError>() {
        Some(DomainError::Unauthorized) => StatusCode::UNAUTHORIZED,
        Some(DomainError::Forbidden(_)) => StatusCode::FORBIDDEN,
        Some(DomainError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(DomainError::DuplicateName(_) | DomainError::ContextHasTasks) => StatusCode::CONFLICT,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    service_error(status, err.to_string())
}

/// Resolve the calling user from the identity header, if present.
fn optional_caller(headers: &HeaderMap) -> Result<Option<UserId>, ServiceError> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    let raw = value.to_str().map_err(|_| {
        service_error(StatusCode::UNAUTHORIZED, format!("invalid {USER_HEADER} header"))
    })?;
    let user_id = UserId::from_str(raw).map_err(|_| {
        service_error(StatusCode::UNAUTHORIZED, format!("invalid {USER_HEADER} header"))
    })?;
    Ok(Some(user_id))
}

fn required_caller(headers: &HeaderMap) -> Result<UserId, ServiceError> {
    optional_caller(headers)?.ok_or_else(|| {
        service_error(StatusCode::UNAUTHORIZED, DomainError::Unauthorized.to_string())
    })
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/contexts", get(contexts_list))
        .route("/v1/contexts/create", post(contexts_create))
        .route("/v1/contexts/update", post(contexts_update))
        .route("/v1/contexts/remove", post(contexts_remove))
        .route("/v1/contexts/active", get(contexts_active))
        .route("/v1/contexts/select", post(contexts_select))
        .route("/v1/tasks", get(tasks_list))
        .route("/v1/tasks/create", post(tasks_create))
        .route("/v1/tasks/by-status/:status", get(tasks_by_status))
        .route("/v1/tasks/move", post(tasks_move))
        .route("/v1/tasks/update", post(tasks_update))
        .route("/v1/tasks/remove", post(tasks_remove))
        .route("/v1/notes/create", post(notes_create))
        .route("/v1/notes/by-task/:task_id", get(notes_by_task))
        .route("/v1/notes/update", post(notes_update))
        .route("/v1/notes/remove", post(notes_remove))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let state = ServiceState { api: TaskboardApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<taskboard_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| api_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_api::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn contexts_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateContextRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Context>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let context = state.api.create_context(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(context)))
}

async fn contexts_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<taskboard_core::Context>>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let contexts = state.api.list_contexts(caller).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(contexts)))
}

async fn contexts_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<UpdateContextRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Context>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let context = state.api.update_context(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(context)))
}

async fn contexts_remove(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<RemoveContextRequest>,
) -> Result<Json<ServiceEnvelope<ContextId>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let removed =
        state.api.remove_context(caller, request.context_id).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(removed)))
}

async fn contexts_active(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Option<taskboard_core::Context>>>, ServiceError> {
    let caller = optional_caller(&headers)?;
    let context = state.api.active_context(caller).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(context)))
}

async fn contexts_select(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<SelectContextRequest>,
) -> Result<Json<ServiceEnvelope<Option<ContextId>>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let selected = state.api.select_context(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(selected)))
}

async fn tasks_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Task>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let task = state.api.create_task(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(task)))
}

async fn tasks_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ServiceEnvelope<Vec<taskboard_core::Task>>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let tasks =
        state.api.list_tasks(caller, query.context_id).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(tasks)))
}

async fn tasks_by_status(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(status): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<taskboard_core::Task>>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| service_error(StatusCode::BAD_REQUEST, format!("unknown status: {status}")))?;
    let tasks = state.api.list_tasks_by_status(caller, status).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(tasks)))
}

async fn tasks_move(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<MoveTaskRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Task>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let task = state.api.move_task(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(task)))
}

async fn tasks_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<UpdateTaskRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Task>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let task = state.api.update_task(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(task)))
}

async fn tasks_remove(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<RemoveTaskRequest>,
) -> Result<Json<ServiceEnvelope<TaskId>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let removed = state.api.remove_task(caller, request.task_id).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(removed)))
}

async fn notes_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateNoteRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Note>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let note = state.api.create_note(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(note)))
}

async fn notes_by_task(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
) -> Result<Json<ServiceEnvelope<Vec<taskboard_core::Note>>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let notes = state.api.list_notes_by_task(caller, task_id).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(notes)))
}

async fn notes_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<UpdateNoteRequest>,
) -> Result<Json<ServiceEnvelope<taskboard_core::Note>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let note = state.api.update_note(caller, request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(note)))
}

async fn notes_remove(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<RemoveNoteRequest>,
) -> Result<Json<ServiceEnvelope<NoteId>>, ServiceError> {
    let caller = required_caller(&headers)?;
    let removed = state.api.remove_note(caller, request.note_id).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(removed)))
}
