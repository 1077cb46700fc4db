use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use super::types::{TaskServer, Worker, WorkerError};
use crate::client::types::{ErrorBody, HeartbeatRequest, LagResponse};
use crate::scheduler::types::Resources;
use crate::store::types::Command;
use crate::tasks::types::{DesiredState, Task};

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = match &self {
            WorkerError::OutOfSync { lag } => {
                return (StatusCode::CONFLICT, Json(LagResponse { lag: *lag })).into_response();
            }
            WorkerError::UnknownTask(_) => StatusCode::NOT_FOUND,
            WorkerError::InvalidStateTransition(_)
            | WorkerError::NoContainer(_)
            | WorkerError::Store(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WorkerError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl TaskServer {
    pub fn new(worker: Arc<Worker>, addr: SocketAddr) -> Self {
        Self { worker, addr }
    }

    async fn get_tasks(AxumState(worker): AxumState<Arc<Worker>>) -> Json<Vec<Task>> {
        Json(worker.get_tasks().await)
    }

    async fn start_task(
        AxumState(worker): AxumState<Arc<Worker>>,
        Json(task): Json<Task>,
    ) -> StatusCode {
        info!(task_id = %task.id, "Task queued to start");
        worker.add_task(task, DesiredState::Running).await;
        StatusCode::CREATED
    }

    async fn stop_task(
        AxumState(worker): AxumState<Arc<Worker>>,
        Json(task): Json<Task>,
    ) -> Result<StatusCode, WorkerError> {
        if !worker.db.lock().await.contains_key(&task.id) {
            return Err(WorkerError::UnknownTask(task.id));
        }
        info!(task_id = %task.id, "Task queued to stop");
        worker.add_task(task, DesiredState::Finished).await;
        Ok(StatusCode::ACCEPTED)
    }

    async fn get_resources(AxumState(worker): AxumState<Arc<Worker>>) -> Json<Resources> {
        Json(worker.resources().await)
    }

    async fn heartbeat(
        AxumState(worker): AxumState<Arc<Worker>>,
        Json(request): Json<HeartbeatRequest>,
    ) -> Json<LagResponse> {
        let lag = worker.heartbeat(request.last_index).await;
        Json(LagResponse { lag })
    }

    async fn commit_commands(
        AxumState(worker): AxumState<Arc<Worker>>,
        Json(commands): Json<Vec<Command>>,
    ) -> Result<StatusCode, WorkerError> {
        worker.commit_changes(commands).await?;
        Ok(StatusCode::CREATED)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/tasks", get(TaskServer::get_tasks).post(TaskServer::start_task))
            .route("/tasks/stop", post(TaskServer::stop_task))
            .route("/resources", get(TaskServer::get_resources))
            .route("/heartbeat", post(TaskServer::heartbeat))
            .route("/store/commands", post(TaskServer::commit_commands))
            .with_state(self.worker.clone())
    }

    /// Serves the worker API on `listener` until `shutdown` flips to true.
    pub async fn start_server(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(addr = %self.addr, worker_id = %self.worker.id, "Worker API listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .inspect_err(|e| warn!(error = %e, "Worker API failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpWorkerClient, WorkerClient};
    use crate::store::types::{CommandKind, WorkerEntry};
    use crate::tasks::runtime::MockRuntime;
    use crate::tasks::types::{ContainerSpec, Image};
    use crate::worker::stats::StaticMonitor;
    use crate::worker::types::{Message, MessageSink};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, header};
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send(&self, _message: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn server() -> TaskServer {
        let addr = SocketAddr::from(([127, 0, 0, 1], 7879));
        let worker = Worker::new(
            Uuid::new_v4(),
            addr,
            Arc::new(MockRuntime::new()),
            Arc::new(StaticMonitor(Resources::default())),
            Arc::new(NullSink),
        );
        TaskServer::new(Arc::new(worker), addr)
    }

    fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn set_worker(index: u64) -> Command {
        Command::new(
            index,
            CommandKind::SetWorker {
                worker_id: Uuid::new_v4(),
                worker: WorkerEntry::new(SocketAddr::from(([10, 0, 0, 1], 7879))),
            },
        )
    }

    #[tokio::test]
    async fn run_request_is_queued() {
        let server = server();
        let task = Task::new("web", ContainerSpec::new(Image::parse("nginx")));

        let response = server
            .router()
            .oneshot(post_json("/tasks", &task))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(server.worker.queue.len().await, 1);
    }

    #[tokio::test]
    async fn stop_of_unknown_task_is_not_found() {
        let server = server();
        let task = Task::new("web", ContainerSpec::new(Image::parse("nginx")));

        let response = server
            .router()
            .oneshot(post_json("/tasks/stop", &task))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(server.worker.queue.is_empty().await);
    }

    #[tokio::test]
    async fn stop_of_task_waiting_to_run_is_accepted() {
        let server = server();
        let task = Task::new("web", ContainerSpec::new(Image::parse("nginx")));

        let response = server
            .router()
            .oneshot(post_json("/tasks", &task))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = server
            .router()
            .oneshot(post_json("/tasks/stop", &task))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(server.worker.queue.len().await, 2);
    }

    #[tokio::test]
    async fn requests_sent_before_serving_are_answered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = HttpWorkerClient::new(Duration::from_secs(2), Duration::from_secs(2));
        let heartbeat = tokio::spawn(async move { client.heartbeat(addr, Some(0)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server().start_server(listener, shutdown_rx));

        assert_eq!(heartbeat.await.unwrap().unwrap(), 1);
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn heartbeat_returns_lag() {
        let server = server();
        let response = server
            .router()
            .oneshot(post_json("/heartbeat", &HeartbeatRequest { last_index: Some(4) }))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let lag: LagResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(lag.lag, 5);
    }

    #[tokio::test]
    async fn pushed_commands_are_created_or_conflict() {
        let server = server();

        let response = server
            .router()
            .oneshot(post_json("/store/commands", &vec![set_worker(0)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = server
            .router()
            .oneshot(post_json("/store/commands", &vec![set_worker(3)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let lag: LagResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(lag.lag, 3);
    }
}
