use std::{
    fmt,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::watch,
};
use tracing::{error, info};

use crate::{
    api::{wait_for_socket, ActionType, FirecrackerClient},
    config::{SandboxDescriptor, StdioWiring},
    launch::JailerParams,
    FirewardError, FirewardResult,
};

use super::Arch;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Control over a running hypervisor process.
#[async_trait]
pub trait MachineControl: Send + Sync {
    /// Returns the pid of the hypervisor.
    fn pid(&self) -> u32;

    /// Asks the guest to flush and power off, then waits for the process to exit.
    async fn shutdown(&self) -> FirewardResult<()>;

    /// Kills the process.
    async fn kill(&self) -> FirewardResult<()>;

    /// Waits for the process to exit.
    async fn wait(&self) -> ExitInfo;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a hypervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// The process exited with a status code.
    Exited(i32),

    /// The process was terminated by a signal.
    Signaled(i32),

    /// The process is gone but its status is not known.
    Gone,
}

/// A hypervisor started by the jailer.
#[derive(Debug)]
pub struct JailedVmm {
    id: String,
    pid: u32,
    arch: Arch,
    client: FirecrackerClient,
    exit: watch::Receiver<Option<ExitInfo>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl JailedVmm {
    /// Spawns the jailer for `sandbox`.
    pub fn spawn(
        params: &JailerParams,
        sandbox: &SandboxDescriptor,
        arch: Arch,
    ) -> FirewardResult<Self> {
        let mut command = Command::new(&params.jailer_binary);
        command.args(params.args()).stdin(Stdio::null());

        match params.stdio {
            StdioWiring::Log => command.stdout(Stdio::piped()).stderr(Stdio::piped()),
            StdioWiring::Inherit => command.stdout(Stdio::inherit()).stderr(Stdio::inherit()),
        };

        info!(
            "starting jailer {} for {}",
            params.jailer_binary.display(),
            params.id
        );
        let mut child = command.spawn()?;
        forward_output(&mut child, &params.id);

        // The jailer execs the hypervisor in place, daemonized or not.
        let pid = child
            .id()
            .ok_or_else(|| FirewardError::ProcessNotFound(params.id.clone()))?;
        let (tx, exit) = watch::channel(None);
        tokio::spawn(reap(child, tx));

        info!("hypervisor for {} running with pid {}", params.id, pid);

        Ok(Self {
            id: params.id.clone(),
            pid,
            arch,
            client: FirecrackerClient::new(sandbox.socket_path()),
            exit,
        })
    }

    /// Returns the control API client of this hypervisor.
    pub fn client(&self) -> &FirecrackerClient {
        &self.client
    }

    /// Returns the exit info if the process already exited.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `true` if `pid` names a live, non-zombie process.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Sends `SIGKILL` to `pid`. A process that is already gone is not an error.
pub fn kill_pid(pid: u32) -> FirewardResult<()> {
    let raw = i32::try_from(pid).map_err(|_| FirewardError::ProcessNotFound(pid.to_string()))?;
    match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Returns `true` if the command line of `pid` names the `exec_name` binary and carries `id` as
/// one of its arguments.
///
/// A process whose command line cannot be read is not a match.
pub fn is_vmm_process(pid: u32, exec_name: &str, id: &str) -> bool {
    if exec_name.is_empty() || id.is_empty() {
        return false;
    }

    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };

    let args: Vec<_> = cmdline
        .split(|byte| *byte == 0)
        .map(String::from_utf8_lossy)
        .collect();

    args.iter().any(|arg| arg.contains(exec_name)) && args.iter().any(|arg| arg == id)
}

/// The metadata document that asks an `aarch64` guest to power off.
pub fn shutdown_document() -> serde_json::Value {
    json!({ "ShutDown": 1 })
}

/// Polls until `pid` is gone.
pub async fn wait_for_pid(pid: u32) {
    while process_alive(pid) {
        tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
    }
}

/// Waits for the control socket, failing early if the hypervisor exits first.
pub async fn wait_for_socket_or_exit(
    socket_path: &Path,
    timeout: Duration,
    control: &dyn MachineControl,
) -> FirewardResult<()> {
    tokio::select! {
        result = wait_for_socket(socket_path, timeout) => result,
        exit = control.wait() => Err(FirewardError::custom(anyhow::anyhow!(
            "hypervisor {} before its control socket {} came up",
            exit,
            socket_path.display()
        ))),
    }
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

fn forward_output(child: &mut Child, id: &str) {
    if let Some(stdout) = child.stdout.take() {
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[{}] [stdout] {}", id, line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                error!("[{}] [stderr] {}", id, line);
            }
        });
    }
}

async fn reap(mut child: Child, tx: watch::Sender<Option<ExitInfo>>) {
    let info = match child.wait().await {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            error!("error waiting for hypervisor process: {}", e);
            ExitInfo::Gone
        }
    };

    info!("hypervisor process {}", info);
    let _ = tx.send(Some(info));
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl MachineControl for JailedVmm {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn shutdown(&self) -> FirewardResult<()> {
        match self.arch {
            Arch::X86_64 => {
                self.client
                    .instance_action(ActionType::SendCtrlAltDel)
                    .await?
            }
            Arch::Aarch64 => self.client.put_mmds(&shutdown_document()).await?,
        }

        info!("shutdown requested for {}, waiting for exit", self.id);
        self.wait().await;
        Ok(())
    }

    async fn kill(&self) -> FirewardResult<()> {
        info!("killing hypervisor {} (pid {})", self.id, self.pid);
        kill_pid(self.pid)
    }

    async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        // The ref borrows `exit`, release it before returning.
        let info = match exit.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or(ExitInfo::Gone),
            Err(_) => ExitInfo::Gone,
        };
        info
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitInfo::Exited(code),
            (None, Some(signal)) => ExitInfo::Signaled(signal),
            (None, None) => ExitInfo::Gone,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Exited(code) => write!(f, "exited with status {code}"),
            ExitInfo::Signaled(signal) => write!(f, "killed by signal {signal}"),
            ExitInfo::Gone => write!(f, "exited"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
