use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use crate::{config::SandboxDescriptor, launch::ScopedResources, network::NetworkAttachment};

use super::{ExitInfo, MachineControl};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How an instance was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOutcome {
    /// The guest shut down on request before the deadline.
    Gracefully,

    /// The process was killed.
    Forcefully,
}

/// The fixed facts about a running instance.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct InstanceInfo {
    /// Instance id.
    #[builder(setter(into))]
    id: String,

    /// Pid of the hypervisor.
    pid: u32,

    /// Guest IP address of the first network interface.
    #[builder(default)]
    ip: Option<String>,

    /// Host name of the first network interface.
    #[builder(default, setter(into))]
    iface_name: String,

    /// Control socket of the hypervisor.
    #[builder(setter(into))]
    socket_path: PathBuf,

    /// Sandbox the hypervisor runs in.
    sandbox: SandboxDescriptor,

    /// How long a graceful shutdown may take before the process is killed.
    graceful_timeout: Duration,
}

/// A launched instance and the handles needed to stop it.
///
/// Everything but the stop state is fixed at construction. The stop state sits behind one lock,
/// so an explicit [`stop`](RunningInstance::stop) and an external exit discovered through
/// [`cleanup`](RunningInstance::cleanup) tear the instance down exactly once.
pub struct RunningInstance {
    info: InstanceInfo,
    control: Arc<dyn MachineControl>,
    network: Arc<dyn NetworkAttachment>,
    state: Mutex<StopState>,
}

struct StopState {
    outcome: Option<StopOutcome>,
    resources: ScopedResources,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RunningInstance {
    /// Creates the handle. `resources` are released once the instance is torn down.
    pub fn new(
        info: InstanceInfo,
        control: Arc<dyn MachineControl>,
        network: Arc<dyn NetworkAttachment>,
        resources: ScopedResources,
    ) -> Self {
        Self {
            info,
            control,
            network,
            state: Mutex::new(StopState {
                outcome: None,
                resources,
            }),
        }
    }

    /// Returns the fixed facts about the instance.
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    /// Returns the instance id.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Returns the pid of the hypervisor.
    pub fn pid(&self) -> u32 {
        self.info.pid
    }

    /// Returns the guest IP address, if the instance has one.
    pub fn ip(&self) -> Option<&str> {
        self.info.ip.as_deref()
    }

    /// Returns the recorded outcome if the instance was already stopped.
    pub async fn outcome(&self) -> Option<StopOutcome> {
        self.state.lock().await.outcome
    }

    /// Stops the instance.
    ///
    /// A clean shutdown races the graceful timeout. Losing the race, failing, or being cancelled
    /// kills the process. Network detachment and resource release always follow, and their
    /// failures are only logged. Calling this again returns the first outcome with no side
    /// effects.
    pub async fn stop(&self, cancel: &CancellationToken) -> StopOutcome {
        let mut state = self.state.lock().await;
        if let Some(outcome) = state.outcome {
            return outcome;
        }

        info!(
            "stopping {} (pid {}), graceful timeout {:?}",
            self.info.id, self.info.pid, self.info.graceful_timeout
        );

        let deadline = tokio::time::Instant::now() + self.info.graceful_timeout;
        let control = Arc::clone(&self.control);
        let mut shutdown = tokio::spawn(async move { control.shutdown().await });

        let outcome = tokio::select! {
            result = &mut shutdown => match result {
                Ok(Ok(())) => StopOutcome::Gracefully,
                Ok(Err(e)) => {
                    warn!("graceful shutdown of {} failed: {}", self.info.id, e);
                    StopOutcome::Forcefully
                }
                Err(e) => {
                    error!("graceful shutdown task of {} failed: {}", self.info.id, e);
                    StopOutcome::Forcefully
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!("graceful shutdown of {} timed out", self.info.id);
                StopOutcome::Forcefully
            }
            _ = cancel.cancelled() => {
                warn!("stop of {} cancelled, killing it", self.info.id);
                StopOutcome::Forcefully
            }
        };

        if outcome == StopOutcome::Forcefully {
            shutdown.abort();
            if let Err(e) = self.control.kill().await {
                error!("failed to kill {}: {}", self.info.id, e);
            }
        }

        state.outcome = Some(outcome);
        self.teardown(&mut state).await;

        info!("{} stopped {}", self.info.id, outcome);
        outcome
    }

    /// Stops the instance on a separate task and waits for the process to exit.
    pub async fn stop_and_wait(self: Arc<Self>, cancel: CancellationToken) -> ExitInfo {
        let instance = Arc::clone(&self);
        let stopper = tokio::spawn(async move { instance.stop(&cancel).await });

        let exit = self.control.wait().await;
        match stopper.await {
            Ok(StopOutcome::Forcefully) => warn!(
                "{} was stopped forcefully, its file system may not be complete",
                self.info.id
            ),
            Ok(StopOutcome::Gracefully) => {}
            Err(e) => error!("stop task of {} failed: {}", self.info.id, e),
        }

        exit
    }

    /// Waits for the process to exit, however it is stopped.
    pub async fn wait(&self) -> ExitInfo {
        self.control.wait().await
    }

    /// Tears down an instance whose process exited on its own.
    ///
    /// Does nothing if the instance was already stopped. Otherwise the stop is recorded as
    /// graceful and announced on `notify`.
    pub async fn cleanup(&self, notify: &mpsc::Sender<StopOutcome>) {
        let mut state = self.state.lock().await;
        if state.outcome.is_some() {
            return;
        }

        info!("{} exited, cleaning up", self.info.id);
        state.outcome = Some(StopOutcome::Gracefully);
        self.teardown(&mut state).await;

        if notify.send(StopOutcome::Gracefully).await.is_err() {
            warn!("nobody is listening for the exit of {}", self.info.id);
        }
    }

    async fn teardown(&self, state: &mut StopState) {
        if let Err(e) = self.network.detach().await {
            error!("failed to detach the network of {}: {}", self.info.id, e);
        }

        state.resources.release();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::Gracefully => write!(f, "gracefully"),
            StopOutcome::Forcefully => write!(f, "forcefully"),
        }
    }
}

impl fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningInstance")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
