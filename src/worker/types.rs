use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::store::TaskStore;
use crate::{
    config::TaskDefaults,
    cri::{Cri, CriError},
    queue::TaskQueue,
    tasks::{State, Task},
};

pub struct Worker {
    pub name: String,
    pub(crate) queue: TaskQueue<Task>,
    pub(crate) store: TaskStore,
    pub(crate) cri: Arc<dyn Cri>,
    pub(crate) defaults: TaskDefaults,
    /// Held for a whole dispatch step so there is exactly one consumer at a time.
    pub(crate) dispatch: tokio::sync::Mutex<()>,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task {id}: invalid state transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: State, to: State },
    #[error("task {id}: unsupported requested state {state}")]
    UnsupportedState { id: Uuid, state: State },
    #[error("task {0}: container already started")]
    AlreadyStarted(Uuid),
    #[error("task {0}: container not started")]
    NotStarted(Uuid),
    #[error("task {0}: no image to run")]
    MissingImage(Uuid),
    #[error(transparent)]
    Cri(#[from] CriError),
}

impl WorkerError {
    /// An engine call failed, so a `Failed` record was committed.
    pub fn is_engine(&self) -> bool {
        matches!(self, WorkerError::Cri(e) if !e.is_validation())
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
}

/// Outcome of one successful dispatch step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub task_id: Uuid,
    pub container_id: String,
    pub action: Action,
}
