//! Worker-side task execution: a FIFO intake queue, the task lifecycle state
//! machine, an in-memory record store, and a container runtime abstraction
//! with a Docker backend.

pub mod config;
pub mod context;
pub mod cri;
pub mod queue;
pub mod tasks;
pub mod worker;

pub use config::{ConfigError, DockerConfig, TaskDefaults, WorkerConfig};
pub use context::{CancelHandle, Context, Interrupt};
pub use cri::{Cri, CriError, DockerCri, Phase, ResourceLimitation, RunOptions};
pub use queue::TaskQueue;
pub use tasks::{Port, RestartPolicy, Runtime, State, StateError, Task, TaskEvent};
pub use worker::{RunResult, TaskServer, Worker, WorkerError, run_tasks};
