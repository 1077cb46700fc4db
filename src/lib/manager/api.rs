use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use super::types::{Manager, ManagerError, ManagerServer};
use crate::client::types::{
    ErrorBody, RegisterRequest, RegisterResponse, SubmitResponse, WorkerInfo,
};
use crate::store::types::{StoreError, WorkerId};
use crate::tasks::types::{Task, TaskId};
use crate::worker::types::Message;

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ManagerError::Store(StoreError::WorkerNotFound(_))
            | ManagerError::Store(StoreError::TaskNotFound(_)) => StatusCode::NOT_FOUND,
            ManagerError::DuplicateTask(_) => StatusCode::CONFLICT,
            ManagerError::Scheduler(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl ManagerServer {
    pub fn new(manager: Arc<Manager>, addr: SocketAddr) -> Self {
        Self { manager, addr }
    }

    async fn register_worker(
        AxumState(manager): AxumState<Arc<Manager>>,
        Json(request): Json<RegisterRequest>,
    ) -> Result<(StatusCode, Json<RegisterResponse>), ManagerError> {
        let worker_id = manager.register_worker(request.addr).await?;
        Ok((StatusCode::CREATED, Json(RegisterResponse { worker_id })))
    }

    async fn get_workers(AxumState(manager): AxumState<Arc<Manager>>) -> Json<Vec<WorkerInfo>> {
        Json(manager.list_workers().await)
    }

    async fn deregister_worker(
        AxumState(manager): AxumState<Arc<Manager>>,
        Path(worker_id): Path<WorkerId>,
    ) -> Result<StatusCode, ManagerError> {
        manager.deregister_worker(worker_id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn report(
        AxumState(manager): AxumState<Arc<Manager>>,
        Json(message): Json<Message>,
    ) -> StatusCode {
        manager.report(message).await;
        StatusCode::ACCEPTED
    }

    async fn submit_task(
        AxumState(manager): AxumState<Arc<Manager>>,
        Json(task): Json<Task>,
    ) -> Result<(StatusCode, Json<SubmitResponse>), ManagerError> {
        let task_id = manager.submit(task).await?;
        Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
    }

    async fn get_tasks(AxumState(manager): AxumState<Arc<Manager>>) -> Json<Vec<Task>> {
        Json(manager.list_tasks().await)
    }

    async fn stop_task(
        AxumState(manager): AxumState<Arc<Manager>>,
        Path(task_id): Path<TaskId>,
    ) -> Result<StatusCode, ManagerError> {
        manager.stop(task_id).await?;
        Ok(StatusCode::ACCEPTED)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/workers",
                post(ManagerServer::register_worker).get(ManagerServer::get_workers),
            )
            .route("/workers/{id}", delete(ManagerServer::deregister_worker))
            .route("/workers/messages", post(ManagerServer::report))
            .route(
                "/tasks",
                post(ManagerServer::submit_task).get(ManagerServer::get_tasks),
            )
            .route("/tasks/{id}", delete(ManagerServer::stop_task))
            .with_state(self.manager.clone())
    }

    /// Serves the manager API on `listener` until `shutdown` flips to true.
    pub async fn start_server(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(addr = %self.addr, "Manager API listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .inspect_err(|e| warn!(error = %e, "Manager API failed"))?;
        Ok(())
    }
}
