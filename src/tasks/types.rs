use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
    time::SystemTime,
};

use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;
use uuid::Uuid;

use super::state::State;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("invalid port specification: {0:?}")]
    InvalidPort(String),
    #[error("unknown restart policy: {0:?}")]
    UnknownRestartPolicy(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// A container port in the engine's `"<number>/<protocol>"` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn tcp(number: u16) -> Self {
        Port {
            number,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Port {
            number,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol.as_str())
    }
}

impl FromStr for Port {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SpecError::InvalidPort(s.to_string());
        let (number, protocol) = match s.split_once('/') {
            Some((number, "tcp")) => (number, Protocol::Tcp),
            Some((number, "udp")) => (number, Protocol::Udp),
            Some((number, "sctp")) => (number, Protocol::Sctp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };
        let number = number.parse::<u16>().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }
        Ok(Port { number, protocol })
    }
}

impl TryFrom<String> for Port {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.to_string()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartPolicy {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            other => Err(SpecError::UnknownRestartPolicy(other.to_string())),
        }
    }
}

/// Engine-side identity of a started task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub container_id: String,
}

/// A task descriptor. Only `id` is required on the wire; everything else may be omitted.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "task_id")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub image: String,
    /// Fractional cores.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Bytes.
    #[serde(default)]
    pub memory: Option<i64>,
    /// Bytes.
    #[serde(default)]
    pub disk: Option<i64>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub exposed_ports: BTreeSet<Port>,
    /// Container port to host port.
    #[serde(default)]
    pub port_bindings: HashMap<Port, String>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    #[serde(default)]
    pub start_time: Option<SystemTime>,
    #[serde(default)]
    pub finish_time: Option<SystemTime>,
}

fn task_id<'de, D>(deserializer: D) -> Result<Uuid, D::Error>
where
    D: Deserializer<'de>,
{
    let id = Uuid::deserialize(deserializer)?;
    if id.is_nil() {
        return Err(de::Error::custom("task id must not be nil"));
    }
    Ok(id)
}

impl Task {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    pub fn container_id(&self) -> Option<&str> {
        self.runtime.as_ref().map(|r| r.container_id.as_str())
    }

    /// Fills the container description this request leaves empty from `record`.
    ///
    /// Identity, state, runtime and timestamps are left alone.
    pub fn inherit_spec(&mut self, record: &Task) {
        if self.name.is_empty() {
            self.name.clone_from(&record.name);
        }
        if self.image.is_empty() {
            self.image.clone_from(&record.image);
        }
        self.cpu = self.cpu.or(record.cpu);
        self.memory = self.memory.or(record.memory);
        self.disk = self.disk.or(record.disk);
        if self.cmd.is_empty() {
            self.cmd.clone_from(&record.cmd);
        }
        if self.env.is_empty() {
            self.env.clone_from(&record.env);
        }
        if self.exposed_ports.is_empty() {
            self.exposed_ports.clone_from(&record.exposed_ports);
        }
        if self.port_bindings.is_empty() {
            self.port_bindings.clone_from(&record.port_bindings);
        }
        self.restart_policy = self.restart_policy.or(record.restart_policy);
    }

    /// True once a start has been committed: the task holds a container and a start time.
    pub fn has_started(&self) -> bool {
        self.runtime.is_some() && self.start_time.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub state: State,
    #[serde(default = "SystemTime::now")]
    pub timestamp: SystemTime,
    pub task: Task,
}

impl TaskEvent {
    pub fn new(task: Task) -> Self {
        TaskEvent {
            id: Uuid::new_v4(),
            state: task.state,
            timestamp: SystemTime::now(),
            task,
        }
    }
}
