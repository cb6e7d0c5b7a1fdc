//! Container Runtime Interface.
//!
//! The worker only ever asks an engine to run an image or stop a container;
//! everything engine-specific lives behind [`Cri`].

pub mod docker;
pub mod types;

use std::future::Future;

use async_trait::async_trait;

pub use docker::DockerCri;
pub use types::{BoxError, CriError, NANO_CPUS_PER_CORE, Phase, ResourceLimitation, RunOptions};

use crate::context::Context;

#[async_trait]
pub trait Cri: Send + Sync {
    /// Pulls `image`, creates and starts a container from it. Returns the container id.
    async fn run(&self, ctx: &Context, image: &str, options: RunOptions)
    -> Result<String, CriError>;

    /// Stops then removes the container.
    async fn stop(&self, ctx: &Context, container_id: &str) -> Result<(), CriError>;

    fn name(&self) -> &'static str;
}

/// Runs one engine phase, aborting it as soon as `ctx` is done.
pub async fn within<T, E, F>(ctx: &Context, phase: Phase, fut: F) -> Result<T, CriError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    if let Some(interrupt) = ctx.interrupt() {
        return Err(CriError::interrupted(phase, interrupt));
    }

    tokio::select! {
        biased;
        interrupt = ctx.done() => Err(CriError::interrupted(phase, interrupt)),
        res = fut => res.map_err(|e| CriError::engine(phase, e)),
    }
}
