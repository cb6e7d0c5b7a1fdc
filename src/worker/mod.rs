pub mod api;
pub mod store;
pub mod types;
#[allow(clippy::module_inception)]
pub mod worker;

pub use api::TaskServer;
pub use store::TaskStore;
pub use types::{Action, RunResult, Worker, WorkerError, WorkerResult};
pub use worker::run_tasks;
