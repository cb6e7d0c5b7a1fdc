//! Worker configuration.
//!
//! Every default lives here and is handed to constructors explicitly, so two
//! workers in the same process can run with different settings.

use std::{str::FromStr, time::Duration};

use thiserror::Error;

use crate::{cri::ResourceLimitation, tasks::RestartPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Fallbacks applied when a task leaves a field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefaults {
    pub limit: ResourceLimitation,
    pub restart_policy: RestartPolicy,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            limit: ResourceLimitation {
                cpu: Some(0.5),
                memory: None,
                disk: None,
            },
            restart_policy: RestartPolicy::No,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerConfig {
    /// Grace period the engine waits before killing a stopping container.
    pub stop_timeout: Duration,
    /// Upper bound on container removal.
    pub remove_timeout: Duration,
    /// Forward container stdout/stderr into the worker log.
    pub forward_logs: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            remove_timeout: Duration::from_secs(30),
            forward_logs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Sleep between dispatch attempts in the poll loop.
    pub poll_interval: Duration,
    pub defaults: TaskDefaults,
    pub docker: DockerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "default_worker".to_string(),
            address: "localhost".to_string(),
            port: 8080,
            poll_interval: Duration::from_secs(5),
            defaults: TaskDefaults::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `CUBE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("CUBE_WORKER_NAME") {
            config.name = name;
        }
        if let Some(address) = lookup("CUBE_WORKER_ADDRESS") {
            config.address = address;
        }
        if let Some(port) = parse(&lookup, "CUBE_WORKER_PORT")? {
            config.port = port;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "CUBE_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(cpu) = parse::<f64, _>(&lookup, "CUBE_DEFAULT_CPU")? {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err(invalid("CUBE_DEFAULT_CPU", "must be a positive number of cores"));
            }
            config.defaults.limit.cpu = Some(cpu);
        }
        if let Some(memory) = parse::<i64, _>(&lookup, "CUBE_DEFAULT_MEMORY")? {
            if memory <= 0 {
                return Err(invalid("CUBE_DEFAULT_MEMORY", "must be a positive byte count"));
            }
            config.defaults.limit.memory = Some(memory);
        }
        if let Some(policy) = parse(&lookup, "CUBE_DEFAULT_RESTART_POLICY")? {
            config.defaults.restart_policy = policy;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "CUBE_STOP_TIMEOUT_SECS")? {
            config.docker.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "CUBE_REMOVE_TIMEOUT_SECS")? {
            config.docker.remove_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(key, &e.to_string()))
        })
        .transpose()
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
