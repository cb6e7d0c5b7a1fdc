use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use cube_worker::{
    Context, Cri, CriError, Phase, ResourceLimitation, RestartPolicy, RunOptions, Runtime, State,
    Task, TaskDefaults, Worker, WorkerError, run_tasks, worker::Action,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunBehaviour {
    Succeed,
    FailPull,
    WaitForCancel,
}

// Stub backend recording every engine call.
struct StubCri {
    run_behaviour: RunBehaviour,
    stop_fails: bool,
    run_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    stopped: Mutex<Vec<String>>,
    last_options: Mutex<Option<RunOptions>>,
    last_image: Mutex<Option<String>>,
}

impl StubCri {
    fn new(run_behaviour: RunBehaviour) -> Self {
        Self {
            run_behaviour,
            stop_fails: false,
            run_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            stopped: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
            last_image: Mutex::new(None),
        }
    }

    fn failing_stop() -> Self {
        Self {
            stop_fails: true,
            ..Self::new(RunBehaviour::Succeed)
        }
    }

    fn runs(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cri for StubCri {
    async fn run(
        &self,
        ctx: &Context,
        image: &str,
        options: RunOptions,
    ) -> Result<String, CriError> {
        let n = self.run_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_image.lock().unwrap() = Some(image.to_string());
        *self.last_options.lock().unwrap() = Some(options);
        match self.run_behaviour {
            RunBehaviour::Succeed => Ok(format!("c-{n}")),
            RunBehaviour::FailPull => Err(CriError::engine(
                Phase::Pull,
                "pull access denied for nosuchimage",
            )),
            RunBehaviour::WaitForCancel => {
                let interrupt = ctx.done().await;
                Err(CriError::interrupted(Phase::Start, interrupt))
            }
        }
    }

    async fn stop(&self, _ctx: &Context, container_id: &str) -> Result<(), CriError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.lock().unwrap().push(container_id.to_string());
        if self.stop_fails {
            return Err(CriError::engine(Phase::Remove, "removal of container is already in progress"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

fn worker_with(cri: Arc<StubCri>) -> Worker {
    Worker::new("test_worker", cri, TaskDefaults::default())
}

fn scheduled(image: &str) -> Task {
    Task::new("test-task", image).with_state(State::Scheduled)
}

fn request(id: Uuid, state: State) -> Task {
    Task {
        id,
        state,
        ..Default::default()
    }
}

#[tokio::test]
async fn empty_queue_is_a_no_op() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());

    let result = worker.run_task(&Context::background()).await.unwrap();

    assert!(result.is_none());
    assert_eq!(cri.runs(), 0);
    assert!(worker.get_tasks().is_empty());
}

#[tokio::test]
async fn successful_start_commits_running() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let task = scheduled("alpine");
    worker.add_task(task.clone());

    let result = worker
        .run_task(&Context::background())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.container_id, "c-1");
    assert_eq!(result.action, Action::Start);
    let record = worker.get_task(&task.id).unwrap();
    assert_eq!(record.state, State::Running);
    assert_eq!(record.container_id(), Some("c-1"));
    assert!(record.start_time.is_some());
    assert!(record.finish_time.is_none());

    let events = worker.task_events(&task.id);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, State::Running);
    assert_eq!(events[0].task, record);
}

#[tokio::test]
async fn failed_start_commits_failed_with_both_timestamps() {
    let cri = Arc::new(StubCri::new(RunBehaviour::FailPull));
    let worker = worker_with(cri.clone());
    let task = scheduled("nosuchimage");
    worker.add_task(task.clone());

    let err = worker.run_task(&Context::background()).await.unwrap_err();

    assert!(err.is_engine());
    assert!(matches!(
        err,
        WorkerError::Cri(CriError::Engine {
            phase: Phase::Pull,
            ..
        })
    ));
    assert!(err.to_string().contains("pull access denied"));

    let record = worker.get_task(&task.id).unwrap();
    assert_eq!(record.state, State::Failed);
    assert!(record.start_time.is_some());
    assert!(record.finish_time.is_some());
    assert!(record.runtime.is_none());
    assert_eq!(cri.runs(), 1);
}

#[tokio::test]
async fn start_on_running_task_is_rejected_without_engine_calls() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let mut task = Task::new("web", "nginx").with_state(State::Running);
    task.runtime = Some(Runtime {
        container_id: "c-9".to_string(),
    });
    task.start_time = Some(SystemTime::now());

    for _ in 0..2 {
        let err = worker
            .start_task(&Context::background(), task.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyStarted(id) if id == task.id));
    }

    assert_eq!(cri.runs(), 0);
    assert!(worker.get_task(&task.id).is_none());
}

#[tokio::test]
async fn stop_on_never_started_task_is_rejected_without_engine_calls() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let task = Task::new("web", "nginx").with_state(State::Running);

    let err = worker
        .stop_task(&Context::background(), task.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::NotStarted(id) if id == task.id));
    assert!(!err.is_engine());
    assert_eq!(cri.stops(), 0);
}

#[tokio::test]
async fn start_then_complete() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let ctx = Context::background();
    let task = scheduled("alpine");
    let id = task.id;

    worker.add_task(task);
    worker.run_task(&ctx).await.unwrap();
    let running = worker.get_task(&id).unwrap();
    assert_eq!(running.state, State::Running);

    worker.add_task(request(id, State::Completed));
    let result = worker.run_task(&ctx).await.unwrap().unwrap();

    assert_eq!(result.action, Action::Stop);
    assert_eq!(result.container_id, "c-1");
    let done = worker.get_task(&id).unwrap();
    assert_eq!(done.state, State::Completed);
    assert!(done.finish_time.is_some());
    assert_eq!(done.start_time, running.start_time);
    assert_eq!(done.container_id(), Some("c-1"));
    assert_eq!(done.image, "alpine");
    assert_eq!(*cri.stopped.lock().unwrap(), vec!["c-1".to_string()]);

    let history: Vec<State> = worker.task_events(&id).iter().map(|e| e.state).collect();
    assert_eq!(history, vec![State::Running, State::Completed]);

    // Terminal: nothing moves a completed task.
    worker.add_task(request(id, State::Scheduled));
    let err = worker.run_task(&ctx).await.unwrap_err();
    assert!(matches!(
        err,
        WorkerError::InvalidTransition {
            from: State::Completed,
            to: State::Scheduled,
            ..
        }
    ));
    assert_eq!(cri.runs(), 1);
}

#[tokio::test]
async fn invalid_transition_leaves_record_untouched() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let ctx = Context::background();
    let id = Uuid::new_v4();

    // First sighting stores the record even though Pending -> Pending is not a transition.
    worker.add_task(request(id, State::Pending));
    assert!(matches!(
        worker.run_task(&ctx).await,
        Err(WorkerError::InvalidTransition { .. })
    ));
    assert_eq!(worker.get_task(&id).unwrap().state, State::Pending);

    worker.add_task(request(id, State::Running));
    let err = worker.run_task(&ctx).await.unwrap_err();

    assert!(matches!(
        err,
        WorkerError::InvalidTransition {
            from: State::Pending,
            to: State::Running,
            ..
        }
    ));
    assert_eq!(worker.get_task(&id).unwrap().state, State::Pending);
    assert!(worker.task_events(&id).is_empty());
    assert_eq!(cri.runs() + cri.stops(), 0);
}

#[tokio::test]
async fn unsupported_target_state_is_rejected() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let ctx = Context::background();
    let task = scheduled("alpine");
    let id = task.id;
    worker.add_task(task);
    worker.run_task(&ctx).await.unwrap();

    for state in [State::Running, State::Failed] {
        worker.add_task(request(id, state));
        let err = worker.run_task(&ctx).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedState { state: s, .. } if s == state));
    }

    assert_eq!(worker.get_task(&id).unwrap().state, State::Running);
    assert_eq!(worker.task_events(&id).len(), 1);
    assert_eq!(cri.runs(), 1);
    assert_eq!(cri.stops(), 0);
}

#[tokio::test]
async fn failed_stop_commits_failed_and_reports_removal() {
    let cri = Arc::new(StubCri::failing_stop());
    let worker = worker_with(cri.clone());
    let ctx = Context::background();
    let task = scheduled("alpine");
    let id = task.id;
    worker.add_task(task);
    worker.run_task(&ctx).await.unwrap();

    worker.add_task(request(id, State::Completed));
    let err = worker.run_task(&ctx).await.unwrap_err();

    assert!(matches!(
        err,
        WorkerError::Cri(CriError::Engine {
            phase: Phase::Remove,
            ..
        })
    ));
    let record = worker.get_task(&id).unwrap();
    assert_eq!(record.state, State::Failed);
    assert!(record.start_time.is_some());
    assert!(record.finish_time.is_some());
    assert_eq!(record.container_id(), Some("c-1"));
    assert_eq!(cri.stops(), 1);
}

#[tokio::test]
async fn cancelled_start_commits_failed() {
    let cri = Arc::new(StubCri::new(RunBehaviour::WaitForCancel));
    let worker = Arc::new(worker_with(cri.clone()));
    let task = scheduled("alpine");
    let id = task.id;
    worker.add_task(task);

    let (ctx, handle) = Context::with_cancel();
    let pending = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run_task(&ctx).await })
    };
    while cri.runs() == 0 {
        tokio::task::yield_now().await;
    }
    handle.cancel();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Cri(CriError::Cancelled { phase: Phase::Start })
    ));
    let record = worker.get_task(&id).unwrap();
    assert_eq!(record.state, State::Failed);
    assert!(record.finish_time.is_some());
}

#[tokio::test]
async fn timed_out_start_commits_failed() {
    let cri = Arc::new(StubCri::new(RunBehaviour::WaitForCancel));
    let worker = worker_with(cri.clone());
    let task = scheduled("alpine");
    let id = task.id;
    worker.add_task(task);

    let ctx = Context::background().with_timeout(Duration::from_millis(20));
    let err = worker.run_task(&ctx).await.unwrap_err();

    assert!(matches!(
        err,
        WorkerError::Cri(CriError::DeadlineExceeded { .. })
    ));
    assert_eq!(worker.get_task(&id).unwrap().state, State::Failed);
}

#[tokio::test]
async fn limit_without_cpu_fails_locally() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let defaults = TaskDefaults {
        limit: ResourceLimitation::default(),
        restart_policy: RestartPolicy::No,
    };
    let worker = Worker::new("test_worker", cri.clone(), defaults);
    let mut task = scheduled("alpine");
    task.memory = Some(64 << 20);
    worker.add_task(task.clone());

    let err = worker.run_task(&Context::background()).await.unwrap_err();

    assert!(matches!(err, WorkerError::Cri(CriError::MissingCpu)));
    assert!(!err.is_engine());
    assert_eq!(cri.runs(), 0);
    assert_eq!(worker.get_task(&task.id).unwrap().state, State::Scheduled);
    assert!(worker.events().is_empty());
}

#[tokio::test]
async fn run_options_are_built_from_the_task() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let mut task = scheduled("redis");
    task.name = "cache".to_string();
    task.cpu = Some(2.0);
    task.env = vec!["MAXMEMORY=64mb".to_string()];
    task.restart_policy = Some(RestartPolicy::UnlessStopped);
    worker.add_task(task);

    worker.run_task(&Context::background()).await.unwrap();

    let options = cri.last_options.lock().unwrap().clone().unwrap();
    assert_eq!(options.title.as_deref(), Some("cache"));
    assert_eq!(options.env, vec!["MAXMEMORY=64mb".to_string()]);
    assert_eq!(options.restart_policy, Some(RestartPolicy::UnlessStopped));
    assert_eq!(options.limit.unwrap().nano_cpus().unwrap(), 2_000_000_000);
}

#[tokio::test]
async fn bare_scheduled_request_runs_the_stored_description() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let ctx = Context::background();
    let mut task = Task::new("web", "nginx");
    task.cpu = Some(1.0);
    task.env = vec!["PORT=80".to_string()];
    let id = task.id;

    worker.add_task(task);
    assert!(matches!(
        worker.run_task(&ctx).await,
        Err(WorkerError::InvalidTransition { .. })
    ));
    assert_eq!(worker.get_task(&id).unwrap().image, "nginx");

    worker.add_task(request(id, State::Scheduled));
    let result = worker.run_task(&ctx).await.unwrap().unwrap();

    assert_eq!(result.task_id, id);
    assert_eq!(cri.last_image.lock().unwrap().as_deref(), Some("nginx"));
    let options = cri.last_options.lock().unwrap().clone().unwrap();
    assert_eq!(options.title.as_deref(), Some("web"));
    assert_eq!(options.env, vec!["PORT=80".to_string()]);
    assert_eq!(options.limit.unwrap().cpu, Some(1.0));

    let record = worker.get_task(&id).unwrap();
    assert_eq!(record.state, State::Running);
    assert_eq!(record.image, "nginx");
    assert_eq!(record.name, "web");
}

#[tokio::test]
async fn scheduled_request_without_any_image_fails_locally() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let id = Uuid::new_v4();
    worker.add_task(request(id, State::Scheduled));

    let err = worker.run_task(&Context::background()).await.unwrap_err();

    assert!(matches!(err, WorkerError::MissingImage(got) if got == id));
    assert!(!err.is_engine());
    assert_eq!(cri.runs(), 0);
    assert!(worker.task_events(&id).is_empty());
}

#[tokio::test]
async fn requests_are_processed_in_queue_order() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = worker_with(cri.clone());
    let ctx = Context::background();
    let tasks: Vec<Task> = (0..3).map(|_| scheduled("alpine")).collect();
    for task in &tasks {
        worker.add_task(task.clone());
    }
    assert_eq!(worker.queue_len(), 3);

    for (i, task) in tasks.iter().enumerate() {
        let result = worker.run_task(&ctx).await.unwrap().unwrap();
        assert_eq!(result.task_id, task.id);
        assert_eq!(result.container_id, format!("c-{}", i + 1));
    }
    assert_eq!(worker.queue_len(), 0);
}

#[tokio::test]
async fn dispatch_loop_drains_queue_until_cancelled() {
    let cri = Arc::new(StubCri::new(RunBehaviour::Succeed));
    let worker = Arc::new(worker_with(cri.clone()));
    let (ctx, handle) = Context::with_cancel();
    let ids: Vec<Uuid> = (0..3)
        .map(|_| {
            let task = scheduled("alpine");
            let id = task.id;
            worker.add_task(task);
            id
        })
        .collect();

    let dispatch = tokio::spawn(run_tasks(
        worker.clone(),
        ctx,
        Duration::from_millis(10),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while worker.events().len() < ids.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    handle.cancel();
    tokio::time::timeout(Duration::from_secs(5), dispatch)
        .await
        .unwrap()
        .unwrap();

    for id in ids {
        assert_eq!(worker.get_task(&id).unwrap().state, State::Running);
    }
}
