use std::{sync::Arc, time::Duration, time::SystemTime};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    store::TaskStore,
    types::{Action, RunResult, Worker, WorkerError, WorkerResult},
};
use crate::{
    config::{TaskDefaults, WorkerConfig},
    context::Context,
    cri::{Cri, RunOptions},
    queue::TaskQueue,
    tasks::{Runtime, State, Task, TaskEvent, valid_state_transition},
};

impl Worker {
    pub fn new(name: &str, cri: Arc<dyn Cri>, defaults: TaskDefaults) -> Self {
        Worker {
            name: name.to_string(),
            queue: TaskQueue::new(),
            store: TaskStore::new(),
            cri,
            defaults,
            dispatch: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &WorkerConfig, cri: Arc<dyn Cri>) -> Self {
        Self::new(&config.name, cri, config.defaults.clone())
    }

    pub fn add_task(&self, task: Task) {
        debug!(worker = %self.name, task_id = %task.id, state = %task.state, "task queued");
        self.queue.enqueue(task);
    }

    /// Dequeues one request and drives it through the engine.
    ///
    /// `Ok(None)` means the queue was empty. Validation and precondition
    /// errors leave the record untouched; engine errors commit `Failed` first.
    pub async fn run_task(&self, ctx: &Context) -> WorkerResult<Option<RunResult>> {
        let _dispatch = self.dispatch.lock().await;

        let Some(queued) = self.queue.dequeue() else {
            debug!(worker = %self.name, "no tasks in queue");
            return Ok(None);
        };

        let persisted = self.store.get_or_insert(&queued);

        if !valid_state_transition(&persisted.state, &queued.state) {
            warn!(
                task_id = %queued.id,
                from = %persisted.state,
                to = %queued.state,
                "invalid state transition"
            );
            return Err(WorkerError::InvalidTransition {
                id: queued.id,
                from: persisted.state,
                to: queued.state,
            });
        }

        match queued.state {
            State::Scheduled => {
                let mut request = queued;
                request.inherit_spec(&persisted);
                self.start(ctx, request).await.map(Some)
            }
            State::Completed => self.stop(ctx, persisted).await.map(Some),
            state => {
                warn!(task_id = %queued.id, %state, "unsupported requested state");
                Err(WorkerError::UnsupportedState {
                    id: queued.id,
                    state,
                })
            }
        }
    }

    pub async fn start_task(&self, ctx: &Context, task: Task) -> WorkerResult<RunResult> {
        let _dispatch = self.dispatch.lock().await;
        self.start(ctx, task).await
    }

    pub async fn stop_task(&self, ctx: &Context, task: Task) -> WorkerResult<RunResult> {
        let _dispatch = self.dispatch.lock().await;
        self.stop(ctx, task).await
    }

    async fn start(&self, ctx: &Context, mut task: Task) -> WorkerResult<RunResult> {
        if task.has_started() && task.state == State::Running {
            return Err(WorkerError::AlreadyStarted(task.id));
        }

        if task.image.trim().is_empty() {
            return Err(WorkerError::MissingImage(task.id));
        }

        let options = RunOptions::from_task(&task, &self.defaults);
        options.validate()?;

        info!(task_id = %task.id, image = %task.image, backend = self.cri.name(), "starting task");
        match self.cri.run(ctx, &task.image, options).await {
            Ok(container_id) => {
                task.runtime = Some(Runtime {
                    container_id: container_id.clone(),
                });
                let now = SystemTime::now();
                self.commit(task.clone(), State::Running, Some(now), None);
                info!(task_id = %task.id, %container_id, "task running");
                Ok(RunResult {
                    task_id: task.id,
                    container_id,
                    action: Action::Start,
                })
            }
            Err(e) if e.is_validation() => Err(e.into()),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "task failed to start");
                let now = SystemTime::now();
                self.commit(task, State::Failed, Some(now), Some(now));
                Err(e.into())
            }
        }
    }

    async fn stop(&self, ctx: &Context, task: Task) -> WorkerResult<RunResult> {
        let container_id = match (&task.runtime, task.start_time) {
            (Some(runtime), Some(_)) => runtime.container_id.clone(),
            _ => return Err(WorkerError::NotStarted(task.id)),
        };

        info!(task_id = %task.id, %container_id, "stopping task");
        match self.cri.stop(ctx, &container_id).await {
            Ok(()) => {
                let now = SystemTime::now();
                let id = task.id;
                self.commit(task, State::Completed, None, Some(now));
                info!(task_id = %id, %container_id, "task completed");
                Ok(RunResult {
                    task_id: id,
                    container_id,
                    action: Action::Stop,
                })
            }
            Err(e) => {
                error!(task_id = %task.id, %container_id, error = %e, "task failed to stop");
                let now = SystemTime::now();
                self.commit(task, State::Failed, Some(now), Some(now));
                Err(e.into())
            }
        }
    }

    /// The only place task state is written.
    fn commit(
        &self,
        mut task: Task,
        state: State,
        started_at: Option<SystemTime>,
        finished_at: Option<SystemTime>,
    ) -> TaskEvent {
        task.state = state;
        if let Some(started_at) = started_at {
            task.start_time = Some(started_at);
        }
        if let Some(finished_at) = finished_at {
            task.finish_time = Some(finished_at);
        }
        debug!(task_id = %task.id, %state, "committing task state");
        self.store.commit(task)
    }

    pub fn get_task(&self, id: &Uuid) -> Option<Task> {
        self.store.get(id)
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.store.list()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.store.events()
    }

    pub fn task_events(&self, id: &Uuid) -> Vec<TaskEvent> {
        self.store.events_for(id)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Hook for host/worker resource sampling; only reports bookkeeping for now.
    pub fn collect_stats(&self) {
        debug!(
            worker = %self.name,
            queued = self.queue.len(),
            tracked = self.store.len(),
            "collect stats"
        );
    }
}

/// Polls the queue until `ctx` is done, sleeping `interval` whenever it drains.
pub async fn run_tasks(worker: Arc<Worker>, ctx: Context, interval: Duration) {
    info!(worker = %worker.name, "dispatch loop started");

    while !ctx.is_done() {
        if worker.queue_len() > 0 {
            match worker.run_task(&ctx).await {
                Ok(Some(result)) => info!(
                    task_id = %result.task_id,
                    container_id = %result.container_id,
                    action = ?result.action,
                    "task dispatched"
                ),
                Ok(None) => {}
                Err(e) => error!(error = %e, "error running task"),
            }
            if worker.queue_len() > 0 {
                continue;
            }
        } else {
            debug!(worker = %worker.name, "no tasks in queue, waiting");
        }

        worker.collect_stats();

        tokio::select! {
            _ = ctx.done() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(worker = %worker.name, "dispatch loop stopped");
}
