use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    handlers::{base_pipeline, Strategy},
    launch::LaunchSpec,
    network::CniRuntime,
    FirewardError, FirewardResult,
};

use super::{machine::BootContext, Arch, RunningInstance};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Something that turns a launch spec into a running instance.
#[async_trait]
pub trait LaunchBackend: Send + Sync {
    /// Boots `spec` following `strategy`.
    ///
    /// A failure after the pipeline is resolved is reported as [`FirewardError::Launch`] once
    /// everything already set up has been torn down.
    async fn start(
        &self,
        spec: LaunchSpec,
        strategy: &Strategy,
        cancel: &CancellationToken,
    ) -> FirewardResult<RunningInstance>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Boots hypervisors through the jailer, attached to networks through the CNI plugins.
#[derive(Debug, Clone)]
pub struct JailerBackend {
    cni: CniRuntime,
    arch: Arch,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl JailerBackend {
    /// Creates a backend for hypervisors of architecture `arch`.
    pub fn new(cni: CniRuntime, arch: Arch) -> Self {
        Self { cni, arch }
    }

    /// Returns the architecture the backend stops hypervisors for.
    pub fn arch(&self) -> Arch {
        self.arch
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LaunchBackend for JailerBackend {
    async fn start(
        &self,
        spec: LaunchSpec,
        strategy: &Strategy,
        cancel: &CancellationToken,
    ) -> FirewardResult<RunningInstance> {
        let pipeline = strategy.resolve(base_pipeline())?;
        let id = spec.id.clone();

        info!("launching {} ({} steps)", id, pipeline.len());

        let mut context = BootContext::new(spec, self.arch, self.cni.clone());
        for handler in &pipeline {
            let result = tokio::select! {
                result = context.run(handler) => result,
                _ = cancel.cancelled() => Err(FirewardError::custom(anyhow::anyhow!(
                    "launch cancelled during {}", handler
                ))),
            };

            if let Err(e) = result {
                tracing::error!("{}: {} failed: {}", id, handler, e);
                context.abort().await;
                return Err(FirewardError::launch(e));
            }
        }

        let instance = context.into_instance()?;
        info!("{} is running with pid {}", id, instance.pid());
        Ok(instance)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
