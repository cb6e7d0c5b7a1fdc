pub mod state;
pub mod types;

pub use state::{State, StateError, valid_state_transition};
pub use types::{Port, Protocol, RestartPolicy, Runtime, SpecError, Task, TaskEvent};
