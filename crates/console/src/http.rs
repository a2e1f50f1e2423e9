use crate::state::AppState;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use orchestrator::{
    operations::target_entity, GatewayError, OperationError, OperationOutcome, QueueError,
    ReceiveOutcome,
};
use protocol::config::TargetClass;
use protocol::control::{
    ActionResponse, BulkEnqueueRequest, ConsoleEvent, EnqueueRequest, TaskActionRequest,
    TaskList, TaskQuery,
};
use protocol::task::PendingTask;
use protocol::{OperationMode, OperationRequest, OperationResponse, Params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets))
        .route("/targets/:target_id/operations", post(run_operation))
        .route("/callback/:target_id/:script_id", post(receive_callback))
        .route("/tasks", post(enqueue_task).get(list_tasks))
        .route("/tasks/bulk", post(enqueue_bulk))
        .route("/tasks/stale", get(stale_tasks))
        .route("/tasks/:id", get(get_task).delete(purge_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/fail", post(fail_task))
        .route("/tasks/:id/retry", post(retry_task))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

#[derive(Debug)]
pub(crate) struct ApiError {
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
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        let status = match &err {
            OperationError::UnknownTarget(_) => StatusCode::NOT_FOUND,
            OperationError::Gateway(GatewayError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            OperationError::Gateway(_) => StatusCode::BAD_GATEWAY,
            OperationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ if err.is_caller_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Invalid(_) => StatusCode::BAD_REQUEST,
            QueueError::Terminal { .. }
            | QueueError::InvalidTransition { .. }
            | QueueError::NotTerminal { .. }
            | QueueError::Conflict { .. } => StatusCode::CONFLICT,
            QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    // The query string of a callback carries its token.
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    let status = response.status();
    tracing::info!(
        event = "http.request",
        method = %method,
        path = %path,
        status = %status,
    );
    response
}

#[derive(Serialize)]
struct TargetView {
    id: String,
    class: TargetClass,
    desc: String,
    ssh: String,
    last_operations: BTreeMap<String, serde_json::Value>,
}

async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<TargetView>>, ApiError> {
    let mut views = Vec::new();
    for target in state.orchestrator.targets().iter() {
        let entity = target_entity(&target.id);
        let mut last_operations = BTreeMap::new();
        let keys = state
            .store
            .keys(&entity)
            .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
        for key in keys {
            let Some(script_id) = key.strip_prefix("last_operation.") else {
                continue;
            };
            if let Ok(Some(raw)) = state.store.get(&entity, &key) {
                if let Ok(value) = serde_json::from_str(&raw) {
                    last_operations.insert(script_id.to_string(), value);
                }
            }
        }
        views.push(TargetView {
            id: target.id.clone(),
            class: target.class,
            desc: target.desc.clone(),
            ssh: target.ssh.destination.clone(),
            last_operations,
        });
    }
    Ok(Json(views))
}

/// Task links are set only by the queue runner, never by API callers.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OperationBody {
    script_id: String,
    #[serde(default)]
    params: Params,
    #[serde(default)]
    mode: OperationMode,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn run_operation(
    Path(target_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<OperationBody>,
) -> Result<Json<OperationResponse>, ApiError> {
    let mut request = OperationRequest::new(&target_id, &body.script_id, body.params, body.mode);
    request.timeout_ms = body.timeout_ms;
    let response = match state.orchestrator.execute(request).await? {
        OperationOutcome::Finished(result) => OperationResponse::finished(
            &target_id,
            &body.script_id,
            result.classified_success,
            result.exit_code,
            result.raw_output,
        ),
        OperationOutcome::Dispatched(ticket) => {
            OperationResponse::dispatched(&target_id, &body.script_id, ticket.id)
        }
    };
    Ok(Json(response))
}

#[derive(Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    token: String,
    #[serde(default)]
    task: Option<String>,
}

/// Answers 200 for accepted and discarded deliveries. A deferred delivery
/// gets 503, which the remote curl retries.
async fn receive_callback(
    Path((target_id, script_id)): Path<(String, String)>,
    Query(query): Query<CallbackQuery>,
    State(state): State<AppState>,
    body: Bytes,
) -> StatusCode {
    match state
        .receiver
        .receive(
            &target_id,
            &script_id,
            query.task.as_deref(),
            &query.token,
            &body,
        )
        .await
    {
        Ok(ReceiveOutcome::Accepted { .. }) | Ok(ReceiveOutcome::Discarded) => StatusCode::OK,
        Ok(ReceiveOutcome::Deferred) => StatusCode::SERVICE_UNAVAILABLE,
        Err(err) => {
            tracing::error!(
                event = "callback.store_failed",
                target = %target_id,
                script_id = %script_id,
                error = %err,
            );
            StatusCode::OK
        }
    }
}

async fn enqueue_task(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<PendingTask>), ApiError> {
    let task = state.queue.enqueue(request)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn enqueue_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkEnqueueRequest>,
) -> Result<(StatusCode, Json<TaskList>), ApiError> {
    let tasks = state.queue.enqueue_bulk(request)?;
    Ok((StatusCode::CREATED, Json(TaskList { tasks })))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<TaskList>, ApiError> {
    Ok(Json(TaskList {
        tasks: state.queue.list(&query)?,
    }))
}

#[derive(Deserialize)]
struct StaleQuery {
    threshold: Option<String>,
}

async fn stale_tasks(
    State(state): State<AppState>,
    Query(query): Query<StaleQuery>,
) -> Result<Json<TaskList>, ApiError> {
    let threshold = match query.threshold.as_deref() {
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("threshold: {err}")))?,
        None => state.stale_after,
    };
    Ok(Json(TaskList {
        tasks: state.queue.stale(threshold)?,
    }))
}

async fn get_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PendingTask>, ApiError> {
    Ok(Json(state.queue.get(&id)?))
}

async fn complete_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PendingTask>, ApiError> {
    tracing::info!(event = "task.admin_complete", task_id = %id);
    Ok(Json(state.queue.mark_complete(&id)?))
}

async fn fail_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<TaskActionRequest>>,
) -> Result<Json<PendingTask>, ApiError> {
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "failed by operator".to_string());
    tracing::info!(event = "task.admin_fail", task_id = %id, reason = %reason);
    Ok(Json(state.queue.mark_failed(&id, &reason)?))
}

async fn retry_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<PendingTask>), ApiError> {
    let task = state.queue.retry(&id)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn purge_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, ApiError> {
    let task = state.queue.purge(&id)?;
    Ok(Json(ActionResponse {
        message: format!("task {} ({}) removed", task.id, task.state),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = state.event_tx.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_ws_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_ws_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ConsoleEvent,
) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket event");
            return Ok(());
        }
    };
    sink.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::StoreError;
    use protocol::task::TaskState;

    #[test]
    fn operation_errors_map_to_status_codes() {
        let cases = [
            (
                OperationError::UnknownTarget("srv-9".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                OperationError::Resolve(orchestrator::ResolveError::UnknownScript {
                    script_id: "x".to_string(),
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                OperationError::Gateway(GatewayError::Timeout {
                    target: "srv-1".to_string(),
                    timeout_secs: 5,
                }),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                OperationError::Gateway(GatewayError::Transport {
                    target: "srv-1".to_string(),
                    message: "refused".to_string(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                OperationError::Store(StoreError::Poisoned),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn operation_body_rejects_task_link() {
        let body: OperationBody =
            serde_json::from_str(r#"{"script_id":"soft_reboot","timeout_ms":500}"#)
                .expect("plain body");
        assert_eq!(body.timeout_ms, Some(500));
        assert!(serde_json::from_str::<OperationBody>(
            r#"{"script_id":"soft_reboot","task_id":"8f0c"}"#
        )
        .is_err());
    }

    #[test]
    fn queue_errors_map_to_status_codes() {
        assert_eq!(
            ApiError::from(QueueError::NotFound("t".to_string())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(QueueError::Terminal {
                id: "t".to_string(),
                state: TaskState::Complete,
            })
            .status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(QueueError::Invalid("empty".to_string())).status,
            StatusCode::BAD_REQUEST
        );
    }
}
