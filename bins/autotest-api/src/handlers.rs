// HTTP route handlers for the Autotest API

use autotest_common::error::StoreError;
use autotest_common::queue::{self, JobAttributes, QueueName, TIMEOUT_SAFETY_FACTOR};
use autotest_common::redis;
use autotest_common::types::{JobRequest, QueuedJob, SettingsJob, SettingsRecord, TesterSpec, TesterType};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path as FsPath};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// User resolved from the `Api-Key` header
pub struct AuthUser(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let api_key = parts.headers.get("Api-Key").and_then(|v| v.to_str().ok());
        let mut conn = state.redis.clone();
        match redis::authorize_user(&mut conn, api_key).await {
            Ok(user) => {
                info!(user = %user, method = %parts.method, uri = %parts.uri, "Authorized request");
                Ok(AuthUser(user))
            }
            Err(e) => {
                if e.is_client_error() {
                    state.metrics.auth_failures.inc();
                    warn!(method = %parts.method, uri = %parts.uri, "Unauthorized request");
                }
                Err(e.into())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub user_name: String,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub credentials: Value,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub credentials: Value,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_name: String,
    pub api_key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsBody {
    #[serde(default)]
    testers: Vec<TesterSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TestRunRequest {
    pub file_urls: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub request_high_priority: bool,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    #[serde(default)]
    pub keep_alive: Option<String>,
}

fn credentials_blob(auth_type: Option<String>, credentials: Value) -> Value {
    json!({ "auth_type": auth_type, "credentials": credentials })
}

/// Reject uploaded file names that are absolute or climb out with `..`
pub fn validate_file_names(files: &[String]) -> Result<(), StoreError> {
    for name in files {
        let path = FsPath::new(name);
        if path.is_absolute() {
            return Err(StoreError::Validation(format!(
                "uploaded files cannot include an absolute path: {}",
                name
            )));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(StoreError::Validation(format!(
                ".. not allowed in uploaded file path: {}",
                name
            )));
        }
    }
    Ok(())
}

/// Build the stored record for a settings create/update request.
///
/// `installed` is the tester list recorded at install time; an empty list
/// accepts every tester kind.
pub fn build_settings_record(
    user: &str,
    update: &SettingsUpdate,
    installed: &[TesterType],
) -> Result<SettingsRecord, StoreError> {
    validate_file_names(&update.files)?;

    let body: SettingsBody = match &update.settings {
        Value::Null => SettingsBody::default(),
        other => serde_json::from_value(other.clone())
            .map_err(|e| StoreError::Validation(format!("invalid settings: {}", e)))?,
    };
    for spec in &body.testers {
        if !installed.is_empty() && !installed.contains(&spec.tester_type) {
            return Err(StoreError::Validation(format!(
                "tester type {} is not installed",
                spec.tester_type
            )));
        }
        if spec.test_data.iter().any(|g| g.timeout == 0) {
            return Err(StoreError::Validation(format!(
                "every {} test group needs a positive timeout",
                spec.tester_type
            )));
        }
    }

    let mut record = SettingsRecord::new(user);
    record.testers = body.testers;
    record.files = update.files.clone();
    record.file_url = update.file_url.clone();
    Ok(record)
}

/// Queue and per-job timeout for a test run
pub fn plan_test_run(record: &SettingsRecord, request: &TestRunRequest) -> (QueueName, u64) {
    let queue = queue::select_queue(&JobAttributes {
        file_url_count: request.file_urls.len(),
        high_priority: request.request_high_priority,
    });
    let timeout = queue::compute_timeout(record, TIMEOUT_SAFETY_FACTOR);
    (queue, timeout.as_secs())
}

async fn enqueue_settings_refresh(state: &AppState, user: &str, settings_id: u64, record: &SettingsRecord) -> ApiResult<()> {
    let mut conn = state.redis.clone();
    let job = SettingsJob {
        id: SettingsJob::job_id(settings_id),
        settings_id,
        user: user.to_string(),
        file_url: record.file_url.clone(),
        timeout_secs: state.config.settings_job_timeout_secs,
        enqueued_at: Utc::now(),
    };
    match redis::push_job(&mut conn, QueueName::Settings, &QueuedJob::Settings(job)).await {
        Ok(()) => {
            state.metrics.settings_updates.inc();
            info!(settings_id, "Settings refresh queued");
            Ok(())
        }
        Err(StoreError::AlreadyQueued(_)) => {
            // The pending refresh reads the record when it runs
            info!(settings_id, "Settings refresh already pending");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// POST /register - Create a user and its API key
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    if payload.user_name.trim().is_empty() {
        return Err(ApiError::validation("user_name must not be empty"));
    }
    let mut conn = state.redis.clone();
    let blob = credentials_blob(payload.auth_type, payload.credentials);
    let api_key = redis::register_user(&mut conn, &payload.user_name, &blob).await?;
    info!(user = %payload.user_name, "User registered");

    Ok(Json(RegisterResponse {
        user_name: payload.user_name,
        api_key,
    }))
}

/// PUT /reset_credentials - Replace the caller's credentials blob
pub async fn reset_credentials(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<CredentialsRequest>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.redis.clone();
    redis::reset_credentials(&mut conn, &user, &credentials_blob(payload.auth_type, payload.credentials)).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /schema - Settings schema recorded at install time
pub async fn schema(State(state): State<Arc<AppState>>, AuthUser(_): AuthUser) -> ApiResult<Json<Value>> {
    let mut conn = state.redis.clone();
    Ok(Json(redis::get_schema(&mut conn).await?))
}

/// POST /settings - Create a settings record and queue its first refresh
pub async fn create_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<SettingsUpdate>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.redis.clone();
    let installed = redis::installed_testers(&mut conn).await?;
    let record = build_settings_record(&user, &payload, &installed)?;

    let settings_id = redis::create_settings(&mut conn, &record).await?;
    info!(user = %user, settings_id, testers = record.testers.len(), "Settings created");
    enqueue_settings_refresh(&state, &user, settings_id, &record).await?;

    Ok(Json(json!({ "settings_id": settings_id })))
}

/// GET /settings/:settings_id - Settings without internal keys
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(settings_id): Path<u64>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.redis.clone();
    let record = redis::authorize_settings(&mut conn, &user, settings_id).await?;
    Ok(Json(record.public_view()))
}

/// PUT /settings/:settings_id - Replace settings and queue a refresh
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(settings_id): Path<u64>,
    Json(payload): Json<SettingsUpdate>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.redis.clone();
    let existing = redis::authorize_settings(&mut conn, &user, settings_id).await?;
    let installed = redis::installed_testers(&mut conn).await?;

    // Ownership never changes on update
    let mut record = build_settings_record(&existing.user, &payload, &installed)?;
    record.last_access = existing.last_access;
    redis::put_settings(&mut conn, settings_id, &record).await?;
    info!(user = %user, settings_id, testers = record.testers.len(), "Settings updated");
    enqueue_settings_refresh(&state, &user, settings_id, &record).await?;

    Ok(Json(json!({ "settings_id": settings_id })))
}

/// PUT /settings/:settings_id/test - Queue one test job per submission URL
pub async fn run_tests(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(settings_id): Path<u64>,
    Json(payload): Json<TestRunRequest>,
) -> ApiResult<Json<Value>> {
    if payload.file_urls.is_empty() {
        return Err(ApiError::validation("file_urls must not be empty"));
    }
    let mut conn = state.redis.clone();
    let record = redis::authorize_settings(&mut conn, &user, settings_id).await?;
    let (queue, timeout_secs) = plan_test_run(&record, &payload);

    let mut test_ids = Vec::with_capacity(payload.file_urls.len());
    for url in &payload.file_urls {
        let tests_id = redis::register_test_run(&mut conn, settings_id).await?;
        let job = JobRequest {
            id: tests_id.to_string(),
            settings_id,
            files_url: url.clone(),
            categories: payload.categories.clone(),
            user: user.clone(),
            env_vars: payload.env_vars.clone(),
            timeout_secs,
            queue,
            enqueued_at: Utc::now(),
        };
        redis::push_job(&mut conn, queue, &QueuedJob::Test(job)).await?;
        state.metrics.jobs_enqueued.with_label_values(&[queue.as_str()]).inc();
        test_ids.push(tests_id);
    }

    info!(
        user = %user,
        settings_id,
        queue = %queue,
        timeout_secs,
        jobs = test_ids.len(),
        "Test jobs queued"
    );
    Ok(Json(json!({ "test_ids": test_ids })))
}

/// GET /settings/:settings_id/test/:tests_id - Fetch (and by default delete) a result
pub async fn get_results(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((settings_id, tests_id)): Path<(u64, u64)>,
    Query(query): Query<ResultQuery>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.redis.clone();
    redis::authorize_settings(&mut conn, &user, settings_id).await?;
    redis::authorize_tests(&mut conn, settings_id, tests_id).await?;

    let keep_alive = query.keep_alive.as_deref() == Some("true");
    let result = redis::get_result(&mut conn, tests_id, keep_alive).await?;
    state.metrics.results_fetched.inc();
    info!(settings_id, tests_id, keep_alive, "Test result retrieved");
    Ok(Json(result))
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<String> {
    let mut conn = state.redis.clone();
    state
        .metrics
        .render(&mut conn)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))
}
