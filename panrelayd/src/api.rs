use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ServiceError;
use crate::manager::{CoverOutcome, CreateOutcome, FolderReport, PushRequest, TaskManager};
use crate::store::{TaskRecord, TaskStatus};

/// Requests are scoped to the owner named in this header; without it they
/// run against the shared default tenant.
const OWNER_HEADER: &str = "x-owner-id";
const DEFAULT_OWNER: &str = "global";

pub struct AppState {
    pub manager: TaskManager,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/push", post(push))
        .route("/api/tasks", get(list_tasks))
        .route("/api/task/{id}/retry", post(retry_task))
        .route("/api/task/{id}", delete(delete_task))
        .route("/api/folder/check", post(check_folder))
        .route("/api/cover", post(store_cover))
        .with_state(state)
}

fn owner_from(headers: &HeaderMap) -> String {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_OWNER)
        .to_string()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Auth(_) | ServiceError::Provider(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct TaskDto {
    id: String,
    video_id: String,
    title: String,
    rename_target: String,
    folder_name: String,
    folder_id: i64,
    status: &'static str,
    progress: f64,
    retry_count: i64,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<TaskRecord> for TaskDto {
    fn from(task: TaskRecord) -> Self {
        Self {
            id: task.id,
            video_id: task.video_id,
            title: task.title,
            rename_target: task.rename_target,
            folder_name: task.folder_path,
            folder_id: task.folder_id,
            status: task.status.as_str(),
            progress: task.progress,
            retry_count: task.retry_count,
            error_message: task.error_message,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct PushBody {
    video_id: String,
    title: String,
    download_url: String,
    #[serde(default)]
    folder_name: String,
    month_folder: Option<String>,
    rename_name: Option<String>,
}

impl PushBody {
    /// Year folder and optional month folder join into one slash path.
    fn folder_path(&self) -> String {
        match self.month_folder.as_deref() {
            Some(month) if !month.trim().is_empty() => {
                format!("{}/{}", self.folder_name, month)
            }
            _ => self.folder_name.clone(),
        }
    }
}

/// A duplicate is a soft success: the request achieved its goal because
/// the file is already there or on its way.
#[derive(Debug, Serialize)]
struct PushResponse {
    success: bool,
    task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<String>,
}

async fn push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PushBody>,
) -> Result<Json<PushResponse>, ServiceError> {
    let folder_path = body.folder_path();
    let outcome = state
        .manager
        .create(PushRequest {
            owner_id: owner_from(&headers),
            video_id: body.video_id,
            title: body.title,
            download_url: body.download_url,
            folder_path,
            rename_name: body.rename_name,
        })
        .await?;
    Ok(Json(match outcome {
        CreateOutcome::Created(task) => PushResponse {
            success: true,
            task_id: Some(task.id),
            status: Some(task.status.as_str()),
            duplicate: None,
        },
        CreateOutcome::Duplicate { existing } => PushResponse {
            success: true,
            task_id: None,
            status: None,
            duplicate: Some(existing),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct TaskListResponse {
    tasks: Vec<TaskDto>,
    total: usize,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskListResponse>, ServiceError> {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::parse)
        .transpose()
        .map_err(|err| ServiceError::Invalid(err.to_string()))?;
    let tasks: Vec<TaskDto> = state
        .manager
        .list(&owner_from(&headers), status)
        .await?
        .into_iter()
        .map(TaskDto::from)
        .collect();
    Ok(Json(TaskListResponse {
        total: tasks.len(),
        tasks,
    }))
}

async fn retry_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskDto>, ServiceError> {
    let task = state.manager.retry(&owner_from(&headers), &id).await?;
    Ok(Json(task.into()))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let deleted = state.manager.delete(&owner_from(&headers), &id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
struct FolderCheckBody {
    #[serde(default)]
    folder_name: String,
    parent_dir_id: Option<i64>,
    title: Option<String>,
    video_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct FolderFileDto {
    file_id: i64,
    filename: String,
    is_dir: bool,
    size: i64,
}

#[derive(Debug, Serialize)]
struct FolderCheckResponse {
    folder_exists: bool,
    folder_id: Option<i64>,
    root_dir_id: i64,
    anchor_id: i64,
    resolved_depth: usize,
    files: Vec<FolderFileDto>,
    duplicate: Option<String>,
}

impl From<FolderReport> for FolderCheckResponse {
    fn from(report: FolderReport) -> Self {
        Self {
            folder_exists: report.folder_exists,
            folder_id: report.folder_id,
            root_dir_id: report.root_dir_id,
            anchor_id: report.anchor_id,
            resolved_depth: report.resolved_depth,
            files: report
                .files
                .into_iter()
                .map(|file| FolderFileDto {
                    file_id: file.file_id,
                    is_dir: file.is_dir(),
                    size: file.size,
                    filename: file.filename,
                })
                .collect(),
            duplicate: report.duplicate,
        }
    }
}

async fn check_folder(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FolderCheckBody>,
) -> Result<Json<FolderCheckResponse>, ServiceError> {
    let report = state
        .manager
        .check_folder(
            &owner_from(&headers),
            &body.folder_name,
            body.parent_dir_id,
            body.title.as_deref(),
            body.video_id.as_deref(),
        )
        .await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
struct CoverBody {
    video_id: String,
    /// Base64-encoded image bytes.
    cover_data: String,
}

async fn store_cover(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CoverBody>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let bytes = BASE64
        .decode(body.cover_data.as_bytes())
        .map_err(|_| ServiceError::Invalid("cover data is not valid base64".into()))?;
    let outcome = state
        .manager
        .store_cover(&owner_from(&headers), &body.video_id, bytes)
        .await?;
    let result = match outcome {
        CoverOutcome::Stored => "stored",
        CoverOutcome::Uploaded => "uploaded",
    };
    Ok(Json(json!({ "success": true, "result": result })))
}
