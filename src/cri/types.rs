use std::{
    collections::{BTreeSet, HashMap},
    error::Error as StdError,
    fmt,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::TaskDefaults,
    context::Interrupt,
    tasks::{Port, RestartPolicy, Task},
};

/// One nanoscale CPU quota unit per 10^-9 core.
pub const NANO_CPUS_PER_CORE: f64 = 1_000_000_000.0;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Engine call that an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Pull,
    Create,
    Start,
    Stop,
    Remove,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect",
            Phase::Pull => "image pull",
            Phase::Create => "container create",
            Phase::Start => "container start",
            Phase::Stop => "container stop",
            Phase::Remove => "container remove",
        })
    }
}

#[derive(Debug, Error)]
pub enum CriError {
    #[error("cpu quota requested but no cpu share is set")]
    MissingCpu,
    #[error("invalid resource limitation: {0}")]
    InvalidLimit(String),
    #[error("{phase} failed: {source}")]
    Engine { phase: Phase, source: BoxError },
    #[error("{phase} cancelled")]
    Cancelled { phase: Phase },
    #[error("{phase} exceeded its deadline")]
    DeadlineExceeded { phase: Phase },
}

impl CriError {
    pub fn engine(phase: Phase, err: impl Into<BoxError>) -> Self {
        CriError::Engine {
            phase,
            source: err.into(),
        }
    }

    pub fn interrupted(phase: Phase, interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => CriError::Cancelled { phase },
            Interrupt::DeadlineExceeded => CriError::DeadlineExceeded { phase },
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            CriError::Engine { phase, .. }
            | CriError::Cancelled { phase }
            | CriError::DeadlineExceeded { phase } => Some(*phase),
            CriError::MissingCpu | CriError::InvalidLimit(_) => None,
        }
    }

    /// Rejected locally, before any engine call.
    pub fn is_validation(&self) -> bool {
        matches!(self, CriError::MissingCpu | CriError::InvalidLimit(_))
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            CriError::Cancelled { .. } | CriError::DeadlineExceeded { .. }
        )
    }
}

/// Resource ceiling applied at container creation. `None` means no limit requested.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimitation {
    /// Fractional cores.
    pub cpu: Option<f64>,
    /// Bytes.
    pub memory: Option<i64>,
    /// Bytes.
    pub disk: Option<i64>,
}

impl ResourceLimitation {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.disk.is_none()
    }

    /// CPU share × 10^9, the engine's nanoscale CPU quota.
    pub fn nano_cpus(&self) -> Result<i64, CriError> {
        let cpu = self.cpu.ok_or(CriError::MissingCpu)?;
        if !cpu.is_finite() || cpu <= 0.0 {
            return Err(CriError::InvalidLimit(format!("cpu share {cpu}")));
        }
        Ok((cpu * NANO_CPUS_PER_CORE) as i64)
    }

    /// A supplied limitation always derives a CPU quota, so `cpu` is required here.
    pub fn validate(&self) -> Result<(), CriError> {
        self.nano_cpus()?;
        if let Some(memory) = self.memory.filter(|m| *m <= 0) {
            return Err(CriError::InvalidLimit(format!("memory {memory} bytes")));
        }
        if let Some(disk) = self.disk.filter(|d| *d < 0) {
            return Err(CriError::InvalidLimit(format!("disk {disk} bytes")));
        }
        Ok(())
    }
}

/// Engine-neutral request for [`super::Cri::run`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunOptions {
    /// Container name; the backend generates one when unset.
    pub title: Option<String>,
    pub cmd: Vec<String>,
    /// `KEY=value` pairs, in order.
    pub env: Vec<String>,
    pub exposed_ports: BTreeSet<Port>,
    /// Container port to host port.
    pub port_bindings: HashMap<Port, String>,
    pub limit: Option<ResourceLimitation>,
    /// `no` when unset.
    pub restart_policy: Option<RestartPolicy>,
}

impl RunOptions {
    /// Maps a task's description onto a run request, filling unset fields from `defaults`.
    pub fn from_task(task: &Task, defaults: &TaskDefaults) -> Self {
        let limit = ResourceLimitation {
            cpu: task.cpu.or(defaults.limit.cpu),
            memory: task.memory.or(defaults.limit.memory),
            disk: task.disk.or(defaults.limit.disk),
        };

        RunOptions {
            title: Some(task.name.clone()).filter(|name| !name.is_empty()),
            cmd: task.cmd.clone(),
            env: task.env.clone(),
            exposed_ports: task.exposed_ports.clone(),
            port_bindings: task.port_bindings.clone(),
            limit: Some(limit).filter(|l| !l.is_empty()),
            restart_policy: Some(task.restart_policy.unwrap_or(defaults.restart_policy)),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_exposed_ports(mut self, ports: impl IntoIterator<Item = Port>) -> Self {
        self.exposed_ports = ports.into_iter().collect();
        self
    }

    pub fn with_limit(mut self, limit: ResourceLimitation) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    pub fn validate(&self) -> Result<(), CriError> {
        match &self.limit {
            Some(limit) => limit.validate(),
            None => Ok(()),
        }
    }
}
