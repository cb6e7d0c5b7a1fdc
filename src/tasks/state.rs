use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("unrecognized task state: {0:?}")]
    Unknown(String),
}

impl State {
    pub const ALL: [State; 5] = [
        State::Pending,
        State::Scheduled,
        State::Running,
        State::Completed,
        State::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "Pending",
            State::Scheduled => "Scheduled",
            State::Running => "Running",
            State::Completed => "Completed",
            State::Failed => "Failed",
        }
    }

    /// Case-sensitive inverse of [`State::as_str`].
    pub fn parse(s: &str) -> Result<State, StateError> {
        match s {
            "Pending" => Ok(State::Pending),
            "Scheduled" => Ok(State::Scheduled),
            "Running" => Ok(State::Running),
            "Completed" => Ok(State::Completed),
            "Failed" => Ok(State::Failed),
            other => Err(StateError::Unknown(other.to_string())),
        }
    }

    /// States reachable from `self` in one step.
    pub fn successors(&self) -> &'static [State] {
        match self {
            State::Pending => &[State::Scheduled],
            State::Scheduled => &[State::Scheduled, State::Running, State::Failed],
            State::Running => &[State::Running, State::Completed, State::Failed],
            State::Completed | State::Failed => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::parse(s)
    }
}

pub fn valid_state_transition(src: &State, dst: &State) -> bool {
    src.successors().contains(dst)
}
