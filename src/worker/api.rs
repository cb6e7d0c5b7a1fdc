use axum::{
    Json, Router,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use super::types::Worker;
use crate::context::Context;
use crate::tasks::{State, Task, TaskEvent};

/// HTTP surface the manager uses to hand tasks to this worker and poll their records.
pub struct TaskServer {
    pub worker: Arc<Worker>,
    pub address: String,
    pub port: u16,
}

impl TaskServer {
    pub fn new(worker: Arc<Worker>, address: &str, port: u16) -> Self {
        Self {
            worker,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(&self) -> Router {
        router(self.worker.clone())
    }

    /// Serves until `ctx` is done.
    pub async fn start_server(self, ctx: Context) -> std::io::Result<()> {
        let address = format!("{}:{}", self.address, self.port);
        let listener = TcpListener::bind(&address).await?;
        info!(worker = %self.worker.name, %address, "task server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                ctx.done().await;
            })
            .await
    }
}

pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/tasks", get(get_tasks).post(start_task))
        .route("/tasks/{id}", get(get_task).delete(stop_task))
        .route("/tasks/{id}/events", get(get_task_events))
        .with_state(worker)
}

async fn get_tasks(AxumState(worker): AxumState<Arc<Worker>>) -> Json<Vec<Task>> {
    Json(worker.get_tasks())
}

async fn get_task(
    AxumState(worker): AxumState<Arc<Worker>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, (StatusCode, String)> {
    worker
        .get_task(&id)
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

async fn get_task_events(
    AxumState(worker): AxumState<Arc<Worker>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TaskEvent>>, (StatusCode, String)> {
    if worker.get_task(&id).is_none() {
        return Err(not_found(&id));
    }
    Ok(Json(worker.task_events(&id)))
}

async fn start_task(
    AxumState(worker): AxumState<Arc<Worker>>,
    Json(task_event): Json<TaskEvent>,
) -> impl IntoResponse {
    let task = task_event.task;
    info!(event_id = %task_event.id, task_id = %task.id, state = %task.state, "task received");
    worker.add_task(task.clone());
    (StatusCode::CREATED, Json(task))
}

async fn stop_task(
    AxumState(worker): AxumState<Arc<Worker>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let task = worker.get_task(&id).ok_or_else(|| not_found(&id))?;

    worker.add_task(task.with_state(State::Completed));
    info!(task_id = %id, "task queued to stop");
    Ok(StatusCode::NO_CONTENT)
}

fn not_found(id: &Uuid) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("Task with id {} not found", id))
}
