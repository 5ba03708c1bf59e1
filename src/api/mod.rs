use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::db::models::{
    fmt_ts, EmailConnection, FolderType, Provider, SyncJob, SyncStatus, SyncType,
};
use crate::db::Database;
use crate::error::SyncError;
use crate::jobs::{JobQueue, PRIORITY_USER};
use crate::providers::ProviderRegistry;
use crate::sync::{IncrementalOutcome, SyncEngine};
use crate::watch::{PushOutcome, WatchManager};

const USER_HEADER: &str = "x-user-id";
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;

/// Everything the handlers need; cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: JobQueue,
    pub engine: SyncEngine,
    pub watches: WatchManager,
    pub providers: Arc<ProviderRegistry>,
}

// --- request / response records ---
// explicit shapes at every boundary; no free-form payloads

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachConnectionRequest {
    provider: String,
    email: String,
    access_token: String,
    refresh_token: String,
    expires_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachConnectionResponse {
    connection_id: String,
    email: String,
    provider: String,
    sync_job_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatusResponse {
    id: String,
    email: String,
    provider: String,
    status: String,
    needs_reconnect: bool,
    last_synced_at: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullSyncRequest {
    connection_id: String,
    priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncrementalSyncRequest {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnDemandSyncRequest {
    connection_id: String,
    folder_type: String,
    #[serde(default)]
    full_sync: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    sync_id: String,
    already_running: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IncrementalSyncResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    requires_full_sync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_messages: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted_messages: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_messages: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OnDemandSyncResponse {
    success: bool,
    messages_synced: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncJobResponse {
    id: String,
    connection_id: String,
    provider: String,
    sync_type: String,
    status: String,
    priority: i64,
    progress: i64,
    folders_completed: i64,
    total_folders: i64,
    messages_synced: i64,
    current_folder: Option<String>,
    status_message: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    latest_history_id: Option<String>,
    worker_id: Option<String>,
}

impl SyncJobResponse {
    fn from_job(job: SyncJob) -> Self {
        Self {
            id: job.id,
            connection_id: job.connection_id,
            provider: job.provider.to_string(),
            sync_type: job.sync_type.to_string(),
            status: job.status.to_string(),
            priority: job.priority,
            progress: job.progress,
            folders_completed: job.folders_completed,
            total_folders: job.total_folders,
            messages_synced: job.messages_synced,
            current_folder: job.current_folder,
            status_message: job.status_message,
            started_at: fmt_ts(job.started_at),
            completed_at: job.completed_at.map(fmt_ts),
            latest_history_id: job.latest_history_id,
            worker_id: job.worker_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailNotification {
    history_id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_messages: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiReply = warp::reply::WithStatus<warp::reply::Json>;

fn json_reply<T: Serialize>(status: StatusCode, body: &T) -> ApiReply {
    warp::reply::with_status(warp::reply::json(body), status)
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> ApiReply {
    json_reply(
        status,
        &ErrorBody {
            error: message.into(),
        },
    )
}

fn internal_error(error: impl std::fmt::Display) -> ApiReply {
    warn!(%error, "request failed");
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Callers are authenticated upstream; the gateway forwards the verified
/// identity in x-user-id and every query filters on it.
fn auth() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::<String>(USER_HEADER)
}

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let attach = warp::path!("email-connections")
        .and(warp::post())
        .and(auth())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(attach_connection);

    let connection_status = warp::path!("email-connections" / String / "status")
        .and(warp::get())
        .and(auth())
        .and(with_state(state.clone()))
        .and_then(connection_status);

    let detach = warp::path!("email-connections" / String)
        .and(warp::delete())
        .and(auth())
        .and(with_state(state.clone()))
        .and_then(detach_connection);

    let sync_full = warp::path!("sync" / "full")
        .and(warp::post())
        .and(auth())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(start_full_sync);

    let sync_incremental = warp::path!("sync" / "incremental")
        .and(warp::post())
        .and(auth())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(run_incremental_sync);

    let sync_on_demand = warp::path!("sync" / "on-demand")
        .and(warp::post())
        .and(auth())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(run_on_demand_sync);

    let sync_status = warp::path!("sync" / "status" / String)
        .and(warp::get())
        .and(auth())
        .and(with_state(state.clone()))
        .and_then(sync_status);

    let sync_cancel = warp::path!("sync" / "cancel" / String)
        .and(warp::post())
        .and(auth())
        .and(with_state(state.clone()))
        .and_then(cancel_sync);

    let sync_history = warp::path!("sync" / "history")
        .and(warp::get())
        .and(auth())
        .and(warp::query::<HistoryQuery>())
        .and(with_state(state.clone()))
        .and_then(sync_history);

    let gmail_webhook = warp::path!("webhooks" / "gmail")
        .and(warp::post())
        .and(warp::header::optional::<String>("resource-state"))
        .and(warp::header::optional::<String>("resource-id"))
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(gmail_webhook);

    attach
        .or(connection_status)
        .or(detach)
        .or(sync_full)
        .or(sync_incremental)
        .or(sync_on_demand)
        .or(sync_status)
        .or(sync_cancel)
        .or(sync_history)
        .or(gmail_webhook)
}

pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let filter = routes(state).recover(handle_rejection);

    let (bound, server) =
        warp::serve(filter).bind_with_graceful_shutdown(addr, async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        });

    info!(%bound, "http api listening");
    server.await;
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let reply = if rejection.is_not_found() {
        error_reply(StatusCode::NOT_FOUND, "not found")
    } else if rejection.find::<warp::reject::MissingHeader>().is_some() {
        error_reply(StatusCode::UNAUTHORIZED, "missing x-user-id header")
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        error_reply(StatusCode::BAD_REQUEST, "invalid request body")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    };
    Ok(reply)
}

// --- handlers ---

async fn attach_connection(
    user_id: String,
    request: AttachConnectionRequest,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    let provider = match request.provider.parse::<Provider>() {
        Ok(provider) => provider,
        Err(message) => return Ok(error_reply(StatusCode::BAD_REQUEST, message)),
    };

    let client = match state.providers.by_provider(provider) {
        Ok(client) => client,
        Err(error) => return Ok(error_reply(StatusCode::BAD_REQUEST, error.to_string())),
    };

    // validate the handed-over token with the provider's "who am I"
    let profile = match client.profile(&request.access_token).await {
        Ok(profile) => profile,
        Err(error) => {
            return Ok(error_reply(
                StatusCode::UNAUTHORIZED,
                format!("provider rejected access token: {error}"),
            ))
        }
    };

    let token_expires_at = request
        .expires_at
        .as_deref()
        .and_then(crate::db::models::parse_ts);

    let now = chrono::Utc::now();
    let candidate = EmailConnection {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        provider,
        email: request.email.clone(),
        access_token: request.access_token.clone(),
        refresh_token: request.refresh_token.clone(),
        token_expires_at,
        latest_history_id: profile.history_id.clone(),
        last_synced_at: None,
        sync_frequency_minutes: 15,
        sync_batch_size: 50,
        sync_enabled: false,
        sync_status: SyncStatus::Idle,
        sync_in_progress: false,
        sync_error: None,
        last_sync_error_at: None,
        watch_resource_id: None,
        watch_history_id: None,
        watch_expiration: None,
        created_at: now,
    };

    let mut connection = match state.db.upsert_connection(&candidate) {
        Ok(connection) => connection,
        Err(error) => return Ok(internal_error(error)),
    };

    let sync_job_id = match state.queue.enqueue(&connection, SyncType::Full, PRIORITY_USER) {
        Ok(job) => Some(job.id),
        Err(SyncError::ConflictingJobInProgress(existing)) => Some(existing),
        Err(error) => return Ok(internal_error(error)),
    };

    if provider == Provider::Gmail {
        if let Err(error) = state.watches.install(&mut connection).await {
            // the attach still succeeds; the daily renewal pass retries
            warn!(connection = %connection.id, %error, "push watch install failed");
        }
    }

    Ok(json_reply(
        StatusCode::CREATED,
        &AttachConnectionResponse {
            connection_id: connection.id,
            email: connection.email,
            provider: provider.to_string(),
            sync_job_id,
        },
    ))
}

async fn connection_status(
    connection_id: String,
    user_id: String,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    match state.db.get_connection_for_user(&user_id, &connection_id) {
        Ok(Some(connection)) => Ok(json_reply(
            StatusCode::OK,
            &ConnectionStatusResponse {
                id: connection.id,
                email: connection.email,
                provider: connection.provider.to_string(),
                status: connection.sync_status.to_string(),
                needs_reconnect: connection.sync_status == SyncStatus::RequiresReauth,
                last_synced_at: connection.last_synced_at.map(fmt_ts),
                error: connection.sync_error,
            },
        )),
        Ok(None) => Ok(error_reply(StatusCode::NOT_FOUND, "connection not found")),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn detach_connection(
    connection_id: String,
    user_id: String,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    match state.db.delete_connection(&user_id, &connection_id) {
        Ok(0) => Ok(error_reply(StatusCode::NOT_FOUND, "connection not found")),
        Ok(_) => Ok(json_reply(
            StatusCode::OK,
            &serde_json::json!({"deleted": true}),
        )),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn start_full_sync(
    user_id: String,
    request: FullSyncRequest,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    let connection = match state
        .db
        .get_connection_for_user(&user_id, &request.connection_id)
    {
        Ok(Some(connection)) => connection,
        Ok(None) => return Ok(error_reply(StatusCode::NOT_FOUND, "connection not found")),
        Err(error) => return Ok(internal_error(error)),
    };

    let priority = request.priority.unwrap_or(PRIORITY_USER);
    match state.queue.enqueue(&connection, SyncType::Full, priority) {
        Ok(job) => Ok(json_reply(
            StatusCode::ACCEPTED,
            &EnqueueResponse {
                sync_id: job.id,
                already_running: false,
            },
        )),
        Err(SyncError::ConflictingJobInProgress(existing)) => Ok(json_reply(
            StatusCode::OK,
            &EnqueueResponse {
                sync_id: existing,
                already_running: true,
            },
        )),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn run_incremental_sync(
    user_id: String,
    request: IncrementalSyncRequest,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    let mut connection = match state
        .db
        .get_connection_for_user(&user_id, &request.connection_id)
    {
        Ok(Some(connection)) => connection,
        Ok(None) => return Ok(error_reply(StatusCode::NOT_FOUND, "connection not found")),
        Err(error) => return Ok(internal_error(error)),
    };

    match state.engine.run_incremental(&mut connection).await {
        Ok(IncrementalOutcome::Applied(stats)) => Ok(json_reply(
            StatusCode::OK,
            &IncrementalSyncResponse {
                success: true,
                requires_full_sync: None,
                new_messages: Some(stats.new_messages),
                deleted_messages: Some(stats.deleted_messages),
                updated_messages: Some(stats.updated_messages),
            },
        )),
        Ok(IncrementalOutcome::RequiresFullSync) => Ok(json_reply(
            StatusCode::OK,
            &IncrementalSyncResponse {
                success: false,
                requires_full_sync: Some(true),
                new_messages: None,
                deleted_messages: None,
                updated_messages: None,
            },
        )),
        Err(SyncError::SyncInProgress(_)) => Ok(error_reply(
            StatusCode::CONFLICT,
            "a sync is already running for this connection",
        )),
        Err(SyncError::TokenRevoked(reason)) => Ok(error_reply(
            StatusCode::UNAUTHORIZED,
            format!("provider token revoked: {reason}"),
        )),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn run_on_demand_sync(
    user_id: String,
    request: OnDemandSyncRequest,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    let folder_type = match request.folder_type.parse::<FolderType>() {
        Ok(folder_type) => folder_type,
        Err(message) => return Ok(error_reply(StatusCode::BAD_REQUEST, message)),
    };

    let mut connection = match state
        .db
        .get_connection_for_user(&user_id, &request.connection_id)
    {
        Ok(Some(connection)) => connection,
        Ok(None) => return Ok(error_reply(StatusCode::NOT_FOUND, "connection not found")),
        Err(error) => return Ok(internal_error(error)),
    };

    match state
        .engine
        .run_folder_refresh(&mut connection, folder_type, request.full_sync)
        .await
    {
        Ok(messages_synced) => Ok(json_reply(
            StatusCode::OK,
            &OnDemandSyncResponse {
                success: true,
                messages_synced,
            },
        )),
        Err(SyncError::FolderNotFound(folder)) => Ok(error_reply(
            StatusCode::NOT_FOUND,
            format!("folder not found: {folder}"),
        )),
        Err(SyncError::SyncInProgress(_)) => Ok(error_reply(
            StatusCode::CONFLICT,
            "a sync is already running for this connection",
        )),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn sync_status(
    job_id: String,
    user_id: String,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    match state.queue.get_for_user(&user_id, &job_id) {
        Ok(Some(job)) => Ok(json_reply(StatusCode::OK, &SyncJobResponse::from_job(job))),
        Ok(None) => Ok(error_reply(StatusCode::NOT_FOUND, "sync job not found")),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn cancel_sync(
    job_id: String,
    user_id: String,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    match state.queue.cancel(&user_id, &job_id) {
        Ok(cancelled) => Ok(json_reply(StatusCode::OK, &CancelResponse { cancelled })),
        Err(error) => Ok(internal_error(error)),
    }
}

async fn sync_history(
    user_id: String,
    query: HistoryQuery,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    match state.queue.recent_for_user(&user_id, limit) {
        Ok(jobs) => {
            let jobs: Vec<SyncJobResponse> =
                jobs.into_iter().map(SyncJobResponse::from_job).collect();
            Ok(json_reply(StatusCode::OK, &jobs))
        }
        Err(error) => Ok(internal_error(error)),
    }
}

/// Unauthenticated push endpoint; only `resource-state: exists` triggers
/// work, every other state is acknowledged as a no-op.
async fn gmail_webhook(
    resource_state: Option<String>,
    resource_id: Option<String>,
    notification: GmailNotification,
    state: AppState,
) -> Result<ApiReply, Infallible> {
    if resource_state.as_deref() != Some("exists") {
        return Ok(json_reply(
            StatusCode::OK,
            &WebhookResponse {
                status: "ignored".to_string(),
                new_messages: None,
            },
        ));
    }

    let Some(resource_id) = resource_id else {
        return Ok(error_reply(StatusCode::BAD_REQUEST, "missing resource-id"));
    };

    // historyId arrives as either a number or a string
    let history_id = match &notification.history_id {
        Some(serde_json::Value::String(value)) => value.clone(),
        Some(serde_json::Value::Number(value)) => value.to_string(),
        _ => String::new(),
    };

    match state.watches.handle_notification(&resource_id, &history_id).await {
        Ok(PushOutcome::Applied { new_messages }) => Ok(json_reply(
            StatusCode::OK,
            &WebhookResponse {
                status: "ok".to_string(),
                new_messages: Some(new_messages),
            },
        )),
        Ok(PushOutcome::FullSyncEnqueued) => Ok(json_reply(
            StatusCode::OK,
            &WebhookResponse {
                status: "full_sync_enqueued".to_string(),
                new_messages: None,
            },
        )),
        Ok(PushOutcome::Busy) => Ok(json_reply(
            StatusCode::OK,
            &WebhookResponse {
                status: "busy".to_string(),
                new_messages: Some(0),
            },
        )),
        Err(SyncError::ConnectionNotFound(_)) => Ok(error_reply(
            StatusCode::NOT_FOUND,
            "no connection for watch resource",
        )),
        Err(error) => Ok(internal_error(error)),
    }
}
