use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use resman_api::ErrorKind;
use resman_core::handler::{
    DequeueGangsRequest, DequeueGangsResponse, EnqueueGangsRequest, EnqueueGangsResponse,
    GetActiveTasksRequest, GetActiveTasksResponse, GetPendingTasksRequest,
    GetPendingTasksResponse, GetPlacementsRequest, GetPlacementsResponse,
    GetPreemptibleTasksRequest, GetPreemptibleTasksResponse, GetTasksByHostsRequest,
    GetTasksByHostsResponse, KillTasksRequest, KillTasksResponse, NotifyTaskUpdatesRequest,
    NotifyTaskUpdatesResponse, ServiceHandler, SetPlacementsRequest, SetPlacementsResponse,
    UpdateTasksStateRequest, UpdateTasksStateResponse,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<resman_api::Error> for AppError {
    fn from(err: resman_api::Error) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExist
            | ErrorKind::StaleAttempt
            | ErrorKind::IllegalTransition => StatusCode::CONFLICT,
            ErrorKind::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(handler: Arc<ServiceHandler>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/v1/gangs/enqueue", post(enqueue_gangs))
        .route("/api/v1/gangs/dequeue", post(dequeue_gangs))
        .route("/api/v1/placements/set", post(set_placements))
        .route("/api/v1/placements/get", post(get_placements))
        .route("/api/v1/tasks/kill", post(kill_tasks))
        .route("/api/v1/tasks/update-state", post(update_tasks_state))
        .route("/api/v1/tasks/events", post(notify_task_updates))
        .route("/api/v1/tasks/active", post(get_active_tasks))
        .route("/api/v1/tasks/pending", post(get_pending_tasks))
        .route("/api/v1/tasks/by-hosts", post(get_tasks_by_hosts))
        .route("/api/v1/tasks/preemptible", post(get_preemptible_tasks))
        .layer(CorsLayer::permissive())
        .with_state(handler)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(handler: Arc<ServiceHandler>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(handler);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("resmand listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("resmand shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\
<html><head><title>resmand</title></head><body>\
<h1>resmand</h1>\
<p>Resource manager service surface under <code>/api/v1</code>:</p>\
<ul>\
<li>POST /api/v1/gangs/enqueue | /api/v1/gangs/dequeue</li>\
<li>POST /api/v1/placements/set | /api/v1/placements/get</li>\
<li>POST /api/v1/tasks/kill | update-state | events</li>\
<li>POST /api/v1/tasks/active | pending | by-hosts | preemptible</li>\
</ul>\
</body></html>",
    )
}

async fn enqueue_gangs(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<EnqueueGangsRequest>,
) -> Json<EnqueueGangsResponse> {
    Json(handler.enqueue_gangs(request).await)
}

async fn dequeue_gangs(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<DequeueGangsRequest>,
) -> Json<DequeueGangsResponse> {
    Json(handler.dequeue_gangs(request).await)
}

async fn set_placements(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<SetPlacementsRequest>,
) -> Json<SetPlacementsResponse> {
    Json(handler.set_placements(request).await)
}

async fn get_placements(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<GetPlacementsRequest>,
) -> Json<GetPlacementsResponse> {
    Json(handler.get_placements(request).await)
}

async fn kill_tasks(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<KillTasksRequest>,
) -> Json<KillTasksResponse> {
    Json(handler.kill_tasks(request).await)
}

async fn update_tasks_state(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<UpdateTasksStateRequest>,
) -> Json<UpdateTasksStateResponse> {
    Json(handler.update_tasks_state(request).await)
}

async fn notify_task_updates(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<NotifyTaskUpdatesRequest>,
) -> Json<NotifyTaskUpdatesResponse> {
    Json(handler.notify_task_updates(request).await)
}

async fn get_active_tasks(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<GetActiveTasksRequest>,
) -> Json<GetActiveTasksResponse> {
    Json(handler.get_active_tasks(request).await)
}

async fn get_pending_tasks(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<GetPendingTasksRequest>,
) -> Result<Json<GetPendingTasksResponse>, AppError> {
    let response = handler.get_pending_tasks(request).await?;
    Ok(Json(response))
}

async fn get_tasks_by_hosts(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<GetTasksByHostsRequest>,
) -> Json<GetTasksByHostsResponse> {
    Json(handler.get_tasks_by_hosts(request).await)
}

async fn get_preemptible_tasks(
    State(handler): State<Arc<ServiceHandler>>,
    Json(request): Json<GetPreemptibleTasksRequest>,
) -> Json<GetPreemptibleTasksResponse> {
    Json(handler.get_preemptible_tasks(request).await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
