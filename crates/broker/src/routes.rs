use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ControlAck, ControlRequest, StartRequest, StartResponse, StatusReport},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};

use crate::{
    coordinator::{Broker, ControlError, StartError},
    store::StoreError,
};

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn build_router(broker: Arc<Broker>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/start", post(start_game))
        .route("/control", post(control))
        .route("/status", get(status))
        .route("/events", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(broker)
}

async fn healthz() -> &'static str {
    "ok"
}

fn api_error(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(code, message)))
}

async fn start_game(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<StartRequest>,
) -> ApiResult<StartResponse> {
    info!(
        image = %req.image_name,
        turns = req.turns,
        threads = req.threads,
        "broker: start requested"
    );
    match broker.start_game(req).await {
        Ok(outcome) => Ok(Json(StartResponse {
            success: true,
            run_id: Some(outcome.run_id),
            turns_completed: outcome.turns_completed,
            quit_early: outcome.quit_early,
            summary: Some(outcome.grid.summary()),
            saved_as: outcome.saved_as,
            error: None,
        })),
        // The run was accepted and then broke down; report how far it got.
        Err(StartError::Run(err)) => Ok(Json(StartResponse {
            success: false,
            run_id: Some(err.run_id),
            turns_completed: err.last_committed_turn,
            quit_early: false,
            summary: None,
            saved_as: None,
            error: Some(ApiError::new(ErrorCode::Unavailable, err.message)),
        })),
        Err(err) => Err(start_rejection(err)),
    }
}

fn start_rejection(err: StartError) -> (StatusCode, Json<ApiError>) {
    let message = err.to_string();
    match err {
        StartError::AlreadyRunning => api_error(StatusCode::CONFLICT, ErrorCode::Conflict, message),
        StartError::Invalid(_) => api_error(StatusCode::BAD_REQUEST, ErrorCode::Validation, message),
        StartError::NoWorkers => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Unavailable, message)
        }
        StartError::Store(StoreError::NotFound(_)) => {
            api_error(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
        }
        StartError::Store(StoreError::InvalidName(_) | StoreError::Malformed { .. }) => {
            api_error(StatusCode::BAD_REQUEST, ErrorCode::Validation, message)
        }
        StartError::Store(StoreError::Io { .. }) | StartError::Run(_) | StartError::Internal(_) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, message)
        }
    }
}

async fn control(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<ControlAck> {
    broker.control(req.kind).await.map(Json).map_err(|e| {
        warn!(kind = ?req.kind, error = %e, "broker: control command refused");
        match e {
            ControlError::NoActiveRun | ControlError::RunEnding(_) => {
                api_error(StatusCode::CONFLICT, ErrorCode::Conflict, e.to_string())
            }
            ControlError::Save(_) => {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, e.to_string())
            }
        }
    })
}

async fn status(State(broker): State<Arc<Broker>>) -> Json<StatusReport> {
    Json(broker.status())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<Broker>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(broker, socket))
}

async fn ws_connection(broker: Arc<Broker>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(broker.subscribe());

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "broker: event subscriber lagged");
                    continue;
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::BrokerConfig,
        dispatch::{DispatchError, TurnExecutor},
        store::{GridStore, MemoryStore},
    };
    use async_trait::async_trait;
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use shared::{
        domain::Grid,
        protocol::{RunState, WorkResult, WorkTask},
    };
    use tower::ServiceExt;

    struct InProcess;

    #[async_trait]
    impl TurnExecutor for InProcess {
        fn label(&self) -> &str {
            "in-process"
        }

        async fn execute_turn(&self, task: &WorkTask) -> Result<WorkResult, DispatchError> {
            Ok(engine::execute_turn(task).expect("valid task"))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl TurnExecutor for Unreachable {
        fn label(&self) -> &str {
            "unreachable"
        }

        async fn execute_turn(&self, _task: &WorkTask) -> Result<WorkResult, DispatchError> {
            Err(DispatchError::Transport {
                worker: "unreachable".into(),
                source: anyhow::anyhow!("connection refused"),
            })
        }
    }

    async fn test_app(worker: Arc<dyn TurnExecutor>) -> Router {
        let store = Arc::new(MemoryStore::new());
        let mut grid = Grid::new(5, 5).expect("grid");
        for x in 1..4 {
            grid.set(x, 2, true);
        }
        store.insert("blinker", grid).await;
        let broker = Broker::new(
            vec![worker],
            store as Arc<dyn GridStore>,
            BrokerConfig::default(),
        );
        build_router(Arc::new(broker), DEFAULT_MAX_BODY_BYTES)
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, body::Bytes) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, bytes)
    }

    fn post_json(uri: &str, payload: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn start_runs_game_and_reports_summary() {
        let app = test_app(Arc::new(InProcess)).await;
        let (status, bytes) = call(
            app,
            post_json(
                "/start",
                serde_json::json!({ "image_name": "blinker", "turns": 3, "threads": 2 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response: StartResponse = serde_json::from_slice(&bytes).expect("response");
        assert!(response.success);
        assert_eq!(response.turns_completed, 3);
        assert_eq!(response.saved_as.as_deref(), Some("5x5x3"));
        let summary = response.summary.expect("summary");
        assert_eq!(summary.alive_count, 3);
        // Odd turn count: the blinker is vertical.
        assert!(summary.alive.iter().all(|cell| cell.x == 2));
    }

    #[tokio::test]
    async fn start_rejections_map_to_status_codes() {
        let app = test_app(Arc::new(InProcess)).await;

        let (status, bytes) = call(
            app.clone(),
            post_json(
                "/start",
                serde_json::json!({ "image_name": "missing", "turns": 1, "threads": 1 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ApiError = serde_json::from_slice(&bytes).expect("error");
        assert_eq!(err.code, ErrorCode::NotFound);

        let (status, _) = call(
            app,
            post_json(
                "/start",
                serde_json::json!({ "image_name": "blinker", "turns": 1, "threads": 0 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_run_reports_last_committed_turn() {
        let app = test_app(Arc::new(Unreachable)).await;
        let (status, bytes) = call(
            app,
            post_json(
                "/start",
                serde_json::json!({ "image_name": "blinker", "turns": 5, "threads": 1 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response: StartResponse = serde_json::from_slice(&bytes).expect("response");
        assert!(!response.success);
        assert!(response.run_id.is_some());
        assert_eq!(response.turns_completed, 0);
        assert_eq!(response.error.expect("error").code, ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn control_without_run_conflicts() {
        let app = test_app(Arc::new(InProcess)).await;
        let (status, bytes) =
            call(app, post_json("/control", serde_json::json!({ "kind": "pause" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: ApiError = serde_json::from_slice(&bytes).expect("error");
        assert_eq!(err.code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn status_lists_workers_when_idle() {
        let app = test_app(Arc::new(InProcess)).await;
        let request = Request::get("/status").body(Body::empty()).expect("request");
        let (status, bytes) = call(app, request).await;
        assert_eq!(status, StatusCode::OK);

        let report: StatusReport = serde_json::from_slice(&bytes).expect("status");
        assert!(!report.running);
        assert_eq!(report.state, RunState::Idle);
        assert_eq!(report.workers.len(), 1);
        assert!(report.workers[0].live);
        assert_eq!(report.workers[0].label, "in-process");
    }
}
