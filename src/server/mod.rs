//! HTTP facade.
//!
//! External commands come in as plain REST calls and are delegated to the
//! queue, the preallocator and the storage layer. Requests carry an
//! opaque requester key as a path segment; user-fatal submissions are
//! rejected into the dead queue so clients can still poll a result.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Error;
use crate::job::manager::JobManager;
use crate::job::queue::{Enqueued, JobQueue, QueueCounts};
use crate::job::{JobSpec, JobStatus, JobView, OutputFormat, TraceEntry};
use crate::metrics;
use crate::storage::{self, Storage};
use crate::vm::{PoolSnapshot, Preallocator};
use crate::vmms::VmmsDriver;

/// Shared handles every handler needs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<JobQueue>,
    pub pool: Arc<Preallocator>,
    pub manager: Arc<JobManager>,
    pub storage: Arc<Storage>,
    pub driver: Arc<dyn VmmsDriver>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/jobs", get(jobs))
        .route("/pool", get(all_pools))
        .route("/pool/:image", get(one_pool))
        .route("/open/:key", post(open))
        .route("/upload/:key/:filename", post(upload))
        .route("/addjob/:key", post(add_job))
        .route("/poll/:key/:dest", get(poll))
        .route("/prealloc/:key/:image/:count", post(prealloc))
        .route("/cancel/:key/:id", post(cancel))
        .route("/jobs/:key/:id", delete(del_job))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

// ── error plumbing ───────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "access denied")
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::AccessDenied => StatusCode::FORBIDDEN,
            Error::NoSuchJob(_) => StatusCode::NOT_FOUND,
            Error::UnknownImage(_) | Error::InvalidJob(_) | Error::InvalidPath(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn check_key(state: &AppState, key: &str) -> Result<(), ApiError> {
    if state.config.access_keys.is_empty() || state.config.access_keys.iter().any(|k| k == key) {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

// ── read-only surface ────────────────────────────────────────────────────

#[derive(Serialize)]
struct InfoResponse {
    driver: String,
    queue: QueueCounts,
    workers: usize,
    pools: Vec<PoolSnapshot>,
    run_timeout_ceiling_secs: u64,
    max_output_bytes: u64,
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        driver: state.driver.name().to_string(),
        queue: state.queue.counts().await,
        workers: state.manager.worker_count().await,
        pools: state.pool.get_all_pools().await,
        run_timeout_ceiling_secs: state.config.run_timeout_ceiling_secs,
        max_output_bytes: state.config.max_output_bytes,
    })
}

#[derive(Serialize)]
struct JobsResponse {
    live: Vec<JobView>,
    dead: Vec<JobView>,
}

async fn jobs(State(state): State<AppState>) -> Json<JobsResponse> {
    Json(JobsResponse {
        live: state.queue.live_views().await,
        dead: state.queue.dead_views().await,
    })
}

async fn all_pools(State(state): State<AppState>) -> Json<Vec<PoolSnapshot>> {
    Json(state.pool.get_all_pools().await)
}

async fn one_pool(
    State(state): State<AppState>,
    Path(image): Path<String>,
) -> Result<Json<PoolSnapshot>, ApiError> {
    state
        .pool
        .get_pool(&image)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no pool for image '{}'", image)))
}

async fn metrics_text() -> String {
    metrics::encode_metrics()
}

// ── requester surface ────────────────────────────────────────────────────

#[derive(Serialize)]
struct OpenResponse {
    files: std::collections::HashMap<String, String>,
}

async fn open(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<OpenResponse>, ApiError> {
    check_key(&state, &key)?;
    let files = state.storage.open(&key).await?;
    Ok(Json(OpenResponse { files }))
}

#[derive(Serialize)]
struct UploadResponse {
    filename: String,
    digest: String,
}

async fn upload(
    State(state): State<AppState>,
    Path((key, filename)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    check_key(&state, &key)?;
    let digest = state.storage.upload(&key, &filename, &body).await?;
    Ok(Json(UploadResponse { filename, digest }))
}

#[derive(Serialize)]
struct AddJobResponse {
    id: u64,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn add_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(mut spec): Json<JobSpec>,
) -> Result<Json<AddJobResponse>, ApiError> {
    check_key(&state, &key)?;
    if spec.access_key.is_empty() {
        spec.access_key = key.clone();
    } else if spec.access_key != key {
        return Err(ApiError::forbidden());
    }

    if let Err(reason) = validate_spec(&state, &spec).await {
        tracing::info!(%key, %reason, "job rejected");
        let id = state.queue.add_dead(spec, &reason).await;
        return Ok(Json(AddJobResponse {
            id,
            status: "rejected",
            error: Some(reason),
        }));
    }

    let fingerprint = fingerprint(&state, &spec).await?;
    match state.queue.add(spec, Some(fingerprint)).await {
        Enqueued::New(id) => {
            tracing::info!(%key, id, "job queued");
            Ok(Json(AddJobResponse {
                id,
                status: "queued",
                error: None,
            }))
        }
        Enqueued::Duplicate(id) => Ok(Json(AddJobResponse {
            id,
            status: "duplicate",
            error: None,
        })),
    }
}

#[derive(Serialize)]
struct PollResponse {
    id: u64,
    status: JobStatus,
    trace: Vec<TraceEntry>,
    /// Captured output so far: raw text or base64, per the job's spec.
    output: Option<String>,
}

async fn poll(
    State(state): State<AppState>,
    Path((key, dest)): Path<(String, String)>,
) -> Result<Json<PollResponse>, ApiError> {
    check_key(&state, &key)?;
    let job = state
        .queue
        .find_by_output(&key, &dest)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no job writes to '{}'", dest)))?;
    let view = job.view();
    let output = state
        .storage
        .read_output(&key, &dest)
        .await?
        .map(|bytes| match job.spec.output_file.format {
            OutputFormat::Raw => String::from_utf8_lossy(&bytes).into_owned(),
            OutputFormat::Base64 => BASE64.encode(bytes),
        });
    Ok(Json(PollResponse {
        id: view.id,
        status: view.status,
        trace: view.trace,
        output,
    }))
}

#[derive(Serialize)]
struct PreallocResponse {
    image: String,
    target: usize,
}

async fn prealloc(
    State(state): State<AppState>,
    Path((key, image, count)): Path<(String, String, usize)>,
) -> Result<Json<PreallocResponse>, ApiError> {
    check_key(&state, &key)?;
    let images = state.driver.images().await?;
    if !images.contains(&image) {
        return Err(Error::UnknownImage(image).into());
    }
    state.pool.update(&image, count).await?;
    Ok(Json(PreallocResponse {
        image,
        target: count,
    }))
}

#[derive(Serialize)]
struct CancelResponse {
    id: u64,
    status: &'static str,
}

async fn cancel(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, u64)>,
) -> Result<Json<CancelResponse>, ApiError> {
    check_key(&state, &key)?;
    let job = state.queue.get(id).await.ok_or(Error::NoSuchJob(id))?;
    if job.spec.access_key != key {
        return Err(ApiError::forbidden());
    }
    job.trace("cancellation requested");
    job.cancel();
    Ok(Json(CancelResponse {
        id,
        status: "cancelling",
    }))
}

#[derive(Deserialize)]
struct DelParams {
    /// 1 deletes from the dead ring, 0 (default) from the live queue.
    #[serde(default)]
    dead: u8,
}

async fn del_job(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, u64)>,
    Query(params): Query<DelParams>,
) -> Result<StatusCode, ApiError> {
    check_key(&state, &key)?;
    let job = state.queue.get(id).await.ok_or(Error::NoSuchJob(id))?;
    if job.spec.access_key != key {
        return Err(ApiError::forbidden());
    }
    if state.queue.del_job(id, params.dead == 1).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NoSuchJob(id).into())
    }
}

// ── validation & dedupe ──────────────────────────────────────────────────

/// User-fatal checks. An `Err` here sends the job straight to the dead
/// queue with the reason in its trace.
async fn validate_spec(state: &AppState, spec: &JobSpec) -> Result<(), String> {
    let images = state
        .driver
        .images()
        .await
        .map_err(|e| format!("driver error: {}", e))?;
    if !images.contains(&spec.image) {
        return Err(format!("unknown image '{}'", spec.image));
    }
    if spec.input_files.is_empty() {
        return Err("no input files".to_string());
    }
    if !spec
        .input_files
        .iter()
        .any(|file| file.dest_file == "Makefile")
    {
        return Err("input files must include a Makefile".to_string());
    }
    if !storage::valid_component(&spec.output_file.dest_path) {
        return Err(format!(
            "invalid output destination '{}'",
            spec.output_file.dest_path
        ));
    }
    if spec.timeout == 0 {
        return Err("timeout must be greater than zero".to_string());
    }
    if spec.timeout > state.config.run_timeout_ceiling_secs {
        return Err(format!(
            "timeout {}s exceeds the ceiling of {}s",
            spec.timeout, state.config.run_timeout_ceiling_secs
        ));
    }
    if spec.max_output_size == 0 || spec.max_output_size > state.config.max_output_bytes {
        return Err(format!(
            "maxOutputFileSize must be between 1 and {}",
            state.config.max_output_bytes
        ));
    }
    for file in &spec.input_files {
        if !storage::valid_component(&file.dest_file) {
            return Err(format!("invalid destination name '{}'", file.dest_file));
        }
        if !state
            .storage
            .input_exists(&spec.access_key, &file.local_file)
            .await
        {
            return Err(format!("missing input file '{}'", file.local_file));
        }
    }
    Ok(())
}

/// Dedupe fingerprint: image, ordered input digests and output
/// destination, plus the requester key when so configured.
async fn fingerprint(state: &AppState, spec: &JobSpec) -> Result<String, ApiError> {
    let mut material = Vec::new();
    material.extend_from_slice(spec.image.as_bytes());
    material.push(0);
    for file in &spec.input_files {
        let digest = state
            .storage
            .digest_of(&spec.access_key, &file.local_file)
            .await?;
        material.extend_from_slice(digest.as_bytes());
        material.push(0);
    }
    material.extend_from_slice(spec.output_file.dest_path.as_bytes());
    material.push(0);
    if state.config.dedupe_by_key {
        material.extend_from_slice(spec.access_key.as_bytes());
    }
    Ok(storage::sha256_hex(&material))
}
