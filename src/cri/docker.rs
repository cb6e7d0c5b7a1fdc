use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
};
use futures_util::stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Cri, CriError, Phase, RunOptions, within};
use crate::{config::DockerConfig, context::Context, tasks::RestartPolicy as TaskRestartPolicy};

const CONTAINER_LOG_TARGET: &str = "cube_worker::container";

/// Slack on top of the engine's stop grace period before the call itself is abandoned.
const STOP_MARGIN: Duration = Duration::from_secs(5);

/// [`Cri`] backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerCri {
    client: Docker,
    config: DockerConfig,
}

impl DockerCri {
    /// Uses the local socket (or `DOCKER_HOST`). No request is made until the first call.
    pub fn connect(config: DockerConfig) -> Result<Self, CriError> {
        let client =
            Docker::connect_with_local_defaults().map_err(|e| CriError::engine(Phase::Connect, e))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: DockerConfig) -> Self {
        DockerCri { client, config }
    }

    pub async fn ping(&self, ctx: &Context) -> Result<(), CriError> {
        within(ctx, Phase::Connect, self.client.ping()).await?;
        Ok(())
    }

    async fn pull_image(&self, ctx: &Context, image: &str) -> Result<(), CriError> {
        let reference = image_reference(image);
        info!(image = %reference, "pulling image");

        within(ctx, Phase::Pull, async {
            let mut stream = Box::pin(self.client.create_image(
                Some(CreateImageOptions {
                    from_image: reference.clone(),
                    ..Default::default()
                }),
                None,
                None,
            ));

            while let Some(msg) = stream.next().await {
                let info = msg?;
                if let Some(status) = info.status {
                    debug!(image = %reference, %status, "pull progress");
                }
            }
            Ok::<_, bollard::errors::Error>(())
        })
        .await?;

        info!(image = %reference, "image pulled");
        Ok(())
    }

    /// Force-removes a container that was created but never started, so the
    /// name is free for the next attempt. Runs on its own deadline because the
    /// caller's context may already be done.
    async fn discard(&self, container_id: &str) -> Result<(), CriError> {
        let ctx = Context::background().with_timeout(self.config.remove_timeout);
        within(
            &ctx,
            Phase::Remove,
            self.client.remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            ),
        )
        .await?;
        info!(%container_id, "unstarted container removed");
        Ok(())
    }

    /// Best effort: runs detached and never affects the outcome of `run`.
    fn forward_logs(&self, ctx: &Context, container_id: &str) {
        let client = self.client.clone();
        let ctx = ctx.clone();
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(client.logs(
                &container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    tail: "all".to_string(),
                    ..Default::default()
                }),
            ));

            loop {
                let next = tokio::select! {
                    _ = ctx.done() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(LogOutput::StdErr { message })) => {
                        let line = String::from_utf8_lossy(&message);
                        warn!(target: CONTAINER_LOG_TARGET, %container_id, "{}", line.trim_end());
                    }
                    Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                        let line = String::from_utf8_lossy(&message);
                        info!(target: CONTAINER_LOG_TARGET, %container_id, "{}", line.trim_end());
                    }
                    Some(Ok(LogOutput::StdIn { .. })) => {}
                    Some(Err(e)) => {
                        warn!(%container_id, error = %e, "log forwarding stopped");
                        break;
                    }
                    None => break,
                }
            }
            debug!(%container_id, "log stream closed");
        });
    }
}

#[async_trait]
impl Cri for DockerCri {
    async fn run(
        &self,
        ctx: &Context,
        image: &str,
        options: RunOptions,
    ) -> Result<String, CriError> {
        let config = container_config(image, &options)?;
        let title = options
            .title
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.pull_image(ctx, image).await?;

        let created = within(
            ctx,
            Phase::Create,
            self.client.create_container(
                Some(CreateContainerOptions {
                    name: title.clone(),
                    ..Default::default()
                }),
                config,
            ),
        )
        .await?;
        for warning in &created.warnings {
            warn!(container_id = %created.id, %warning, "engine warning on create");
        }
        info!(container_id = %created.id, %title, "container created");

        if let Err(e) = within(
            ctx,
            Phase::Start,
            self.client
                .start_container(&created.id, None::<StartContainerOptions<String>>),
        )
        .await
        {
            error!(
                container_id = %created.id,
                %title,
                error = %e,
                "container created but not started"
            );
            if let Err(cleanup) = self.discard(&created.id).await {
                error!(
                    container_id = %created.id,
                    %title,
                    error = %cleanup,
                    "could not remove unstarted container; it still holds its name"
                );
            }
            return Err(e);
        }
        info!(container_id = %created.id, %title, "container started");

        if self.config.forward_logs {
            self.forward_logs(ctx, &created.id);
        }

        Ok(created.id)
    }

    async fn stop(&self, ctx: &Context, container_id: &str) -> Result<(), CriError> {
        info!(%container_id, "stopping container");
        let stop_ctx = ctx.with_timeout(self.config.stop_timeout + STOP_MARGIN);
        within(
            &stop_ctx,
            Phase::Stop,
            self.client.stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: self.config.stop_timeout.as_secs() as i64,
                }),
            ),
        )
        .await?;

        let remove_ctx = ctx.with_timeout(self.config.remove_timeout);
        within(
            &remove_ctx,
            Phase::Remove,
            self.client.remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    ..Default::default()
                }),
            ),
        )
        .await?;

        info!(%container_id, "container stopped and removed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Untagged references get `:latest`; otherwise the engine pulls every tag.
fn image_reference(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

fn restart_policy_name(policy: TaskRestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        TaskRestartPolicy::No => RestartPolicyNameEnum::NO,
        TaskRestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        TaskRestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        TaskRestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

fn container_config(image: &str, options: &RunOptions) -> Result<Config<String>, CriError> {
    options.validate()?;

    let (nano_cpus, memory) = match &options.limit {
        Some(limit) => {
            if limit.disk.is_some() {
                debug!("disk limit is not enforced by the docker backend");
            }
            (Some(limit.nano_cpus()?), limit.memory)
        }
        None => (None, None),
    };

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = options
        .port_bindings
        .iter()
        .map(|(container_port, host_port)| {
            (
                container_port.to_string(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.clone()),
                }]),
            )
        })
        .collect();

    let host_config = HostConfig {
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy_name(options.restart_policy.unwrap_or_default())),
            maximum_retry_count: None,
        }),
        nano_cpus,
        memory,
        port_bindings: Some(port_bindings).filter(|b| !b.is_empty()),
        publish_all_ports: Some(true),
        ..Default::default()
    };

    Ok(Config {
        image: Some(image.to_string()),
        tty: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        env: Some(options.env.clone()),
        cmd: Some(options.cmd.clone()).filter(|cmd| !cmd.is_empty()),
        exposed_ports: Some(
            options
                .exposed_ports
                .iter()
                .map(|port| (port.to_string(), HashMap::new()))
                .collect(),
        ),
        host_config: Some(host_config),
        ..Default::default()
    })
}
