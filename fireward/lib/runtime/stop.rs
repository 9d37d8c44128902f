use std::{path::PathBuf, time::Duration};

use getset::Getters;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    api::{ActionType, FirecrackerClient},
    config::{JailerConfig, SandboxDescriptor, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STOP_TIMEOUT},
    FirewardError, FirewardResult,
};

use super::{is_vmm_process, kill_pid, process_alive, shutdown_document, wait_for_pid, Arch};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A request to stop an instance without a live handle on it.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct StopRequest {
    /// Instance id.
    #[builder(setter(into))]
    id: String,

    /// Pid of the hypervisor, needed on `aarch64`.
    #[builder(default, setter(into))]
    pid: Option<u32>,

    /// Declared architecture of the host running the instance.
    #[builder(setter(into))]
    arch: String,

    /// Overrides the configured chroot base.
    #[builder(default, setter(into))]
    chroot_base: Option<PathBuf>,

    /// How long the guest may take to power off before it is killed.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)]
    shutdown_timeout: Duration,

    /// Keep the sandbox directory when the stop sequence fails.
    #[builder(default)]
    preserve_sandbox_on_failure: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Stops the instance named by `request` through its control socket, then removes its sandbox
/// directory.
///
/// An instance whose control socket is gone is already stopped. On `x86_64` the guest receives
/// Ctrl+Alt+Del, and a refused connection also means the instance is already stopped. On
/// `aarch64` a shutdown document goes over the metadata channel and the process is waited on,
/// then killed once `shutdown_timeout` elapses.
///
/// The sandbox directory is removed whatever the outcome, unless
/// `preserve_sandbox_on_failure` is set and the stop sequence failed. Removal failures are
/// logged.
pub async fn stop_vmm(
    request: &StopRequest,
    jailer: &JailerConfig,
    cancel: &CancellationToken,
) -> FirewardResult<String> {
    let arch: Arch = request.arch.parse()?;

    let sandbox =
        SandboxDescriptor::from_config(jailer, request.id.clone(), request.chroot_base.as_deref());
    sandbox.validate()?;

    let socket_exists = match sandbox.socket_exists() {
        Ok(exists) => exists,
        Err(e) => {
            remove_sandbox(&sandbox);
            return Err(e);
        }
    };

    let result = if socket_exists {
        let client = FirecrackerClient::new(sandbox.socket_path());
        match arch {
            Arch::X86_64 => send_ctrl_alt_del(&client, &request.id).await,
            Arch::Aarch64 => shutdown_over_metadata(&client, &sandbox, request, cancel).await,
        }
    } else {
        info!(
            "control socket of {} is gone, the vm is already stopped",
            request.id
        );
        Ok(None)
    };

    if result.is_err() && request.preserve_sandbox_on_failure {
        warn!(
            "keeping sandbox {} of {} after a failed stop",
            sandbox.instance_dir().display(),
            request.id
        );
    } else {
        remove_sandbox(&sandbox);
    }

    let description = result?;
    let mut message = format!("VM with id: {} has been stopped", request.id);
    if let Some(description) = description {
        message.push(' ');
        message.push_str(&description);
    }

    info!("{}", message);
    Ok(message)
}

async fn send_ctrl_alt_del(
    client: &FirecrackerClient,
    id: &str,
) -> FirewardResult<Option<String>> {
    match client.instance_action(ActionType::SendCtrlAltDel).await {
        Ok(()) => {
            info!("sent Ctrl+Alt+Del to {}", id);
            Ok(None)
        }
        Err(e) if e.is_connection_refused() => {
            info!("control socket of {} refused the connection, already stopped", id);
            Ok(None)
        }
        Err(e) => Err(FirewardError::StopProtocol(e.to_string())),
    }
}

async fn shutdown_over_metadata(
    client: &FirecrackerClient,
    sandbox: &SandboxDescriptor,
    request: &StopRequest,
    cancel: &CancellationToken,
) -> FirewardResult<Option<String>> {
    let pid = resolve_vmm_pid(sandbox, request)?;

    client
        .put_mmds(&shutdown_document())
        .await
        .map_err(|e| FirewardError::MetadataDelivery(e.to_string()))?;

    info!("waiting for {} (pid {}) to power off", request.id, pid);
    let state = tokio::select! {
        _ = wait_for_pid(pid) => "exited",
        _ = tokio::time::sleep(request.shutdown_timeout) => {
            warn!("{} did not power off in {:?}, killing it", request.id, request.shutdown_timeout);
            kill_and_wait(sandbox, pid).await?
        }
        _ = cancel.cancelled() => {
            warn!("stop of {} cancelled, killing it", request.id);
            kill_and_wait(sandbox, pid).await?
        }
    };

    Ok(Some(format!("Process state: {state}")))
}

/// Returns the pid of the request once it is known to name the running hypervisor of the
/// sandbox.
fn resolve_vmm_pid(sandbox: &SandboxDescriptor, request: &StopRequest) -> FirewardResult<u32> {
    let pid = request.pid.ok_or_else(|| {
        FirewardError::ProcessNotFound(format!("no pid given for {}", request.id))
    })?;

    if !process_alive(pid) {
        return Err(FirewardError::ProcessNotFound(format!(
            "process {pid} of {} is not running",
            request.id
        )));
    }

    if !is_vmm_process(pid, &sandbox.exec_file_name(), &request.id) {
        return Err(FirewardError::ProcessNotFound(format!(
            "process {pid} is not the hypervisor of {}",
            request.id
        )));
    }

    Ok(pid)
}

async fn kill_and_wait(sandbox: &SandboxDescriptor, pid: u32) -> FirewardResult<&'static str> {
    // The pid may have been reused since the hypervisor exited.
    if !is_vmm_process(pid, &sandbox.exec_file_name(), sandbox.get_id()) {
        return Ok("exited");
    }

    kill_pid(pid)?;
    if tokio::time::timeout(DEFAULT_STOP_TIMEOUT, wait_for_pid(pid))
        .await
        .is_err()
    {
        return Err(FirewardError::StopProtocol(format!(
            "process {pid} survived SIGKILL"
        )));
    }
    Ok("killed")
}

fn remove_sandbox(sandbox: &SandboxDescriptor) {
    if let Err(e) = sandbox.remove() {
        error!(
            "failed to remove sandbox {}: {}",
            sandbox.instance_dir().display(),
            e
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;
    use tokio::process::{Child, Command};

    use crate::api::mock::MockControlSocket;

    use super::*;

    fn jailer(base: &Path) -> JailerConfig {
        JailerConfig {
            chroot_base: base.to_path_buf(),
            ..Default::default()
        }
    }

    fn sandbox_for(jailer: &JailerConfig, id: &str) -> anyhow::Result<SandboxDescriptor> {
        let sandbox = SandboxDescriptor::from_config(jailer, id, None);
        std::fs::create_dir_all(sandbox.socket_path().parent().unwrap())?;
        Ok(sandbox)
    }

    /// Spawns a shell whose command line reads like `firecracker --id <id>` and that lives for
    /// `secs` seconds.
    fn spawn_hypervisor(dir: &Path, id: &str, secs: &str) -> anyhow::Result<Child> {
        let script = dir.join("firecracker");
        std::fs::write(&script, "sleep \"$3\"\nexit 0\n")?;
        Ok(Command::new("/bin/sh")
            .arg(&script)
            .args(["--id", id, secs])
            .spawn()?)
    }

    #[tokio::test]
    async fn test_stop_without_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;

        let request = StopRequest::builder().id("vm-1").arch("x86_64").build();
        let message = stop_vmm(&request, &jailer, &CancellationToken::new()).await?;

        assert_eq!(message, "VM with id: vm-1 has been stopped");
        assert!(!sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_twice_is_fine() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        sandbox_for(&jailer, "vm-1")?;

        let request = StopRequest::builder().id("vm-1").arch("x86_64").build();
        let cancel = CancellationToken::new();
        stop_vmm(&request, &jailer, &cancel).await?;
        let message = stop_vmm(&request, &jailer, &cancel).await?;

        assert_eq!(message, "VM with id: vm-1 has been stopped");
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unsupported_arch_keeps_sandbox() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;

        let request = StopRequest::builder().id("vm-1").arch("ppc64").build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::UnsupportedArch(_))));
        assert!(sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_requires_id() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = StopRequest::builder().id("").arch("x86_64").build();

        let result = stop_vmm(&request, &jailer(dir.path()), &CancellationToken::new()).await;
        assert!(matches!(result, Err(FirewardError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_x86_sends_ctrl_alt_del() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let mut mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;

        let request = StopRequest::builder().id("vm-1").arch("x86_64").build();
        let message = stop_vmm(&request, &jailer, &CancellationToken::new()).await?;

        assert_eq!(message, "VM with id: vm-1 has been stopped");
        let action = mock.next_request().await?;
        assert_eq!(action.path, "/actions");
        assert_eq!(action.json()?, json!({ "action_type": "SendCtrlAltDel" }));
        assert!(!sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_x86_refused_is_already_stopped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        drop(std::os::unix::net::UnixListener::bind(sandbox.socket_path())?);

        let request = StopRequest::builder().id("vm-1").arch("x86_64").build();
        let message = stop_vmm(&request, &jailer, &CancellationToken::new()).await?;

        assert_eq!(message, "VM with id: vm-1 has been stopped");
        assert!(!sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_x86_api_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let _mock = MockControlSocket::start(
            &sandbox.socket_path(),
            400,
            r#"{"fault_message":"not running"}"#,
        )?;

        let request = StopRequest::builder().id("vm-1").arch("x86_64").build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::StopProtocol(_))));
        assert!(!sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_failure_preserves_sandbox_when_asked() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let _mock = MockControlSocket::start(&sandbox.socket_path(), 500, "")?;

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("x86_64")
            .preserve_sandbox_on_failure(true)
            .build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(result.is_err());
        assert!(sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_waits_for_exit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let mut mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;
        let bin = tempfile::tempdir()?;
        let mut child = spawn_hypervisor(bin.path(), "vm-1", "1")?;

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("aarch64")
            .pid(child.id().unwrap())
            .shutdown_timeout(Duration::from_secs(10))
            .build();
        let message = stop_vmm(&request, &jailer, &CancellationToken::new()).await?;

        assert_eq!(
            message,
            "VM with id: vm-1 has been stopped Process state: exited"
        );
        let request = mock.next_request().await?;
        assert_eq!(request.method, "PUT");
        assert_eq!(request.path, "/mmds");
        assert_eq!(request.json()?, json!({ "ShutDown": 1 }));

        child.wait().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_kills_after_timeout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let _mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;
        let bin = tempfile::tempdir()?;
        let mut child = spawn_hypervisor(bin.path(), "vm-1", "5")?;

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("aarch64")
            .pid(child.id().unwrap())
            .shutdown_timeout(Duration::from_millis(100))
            .build();
        let message = stop_vmm(&request, &jailer, &CancellationToken::new()).await?;

        assert_eq!(
            message,
            "VM with id: vm-1 has been stopped Process state: killed"
        );
        assert!(child.wait().await?.code().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_without_pid() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let _mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;

        let request = StopRequest::builder().id("vm-1").arch("aarch64").build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::ProcessNotFound(_))));
        assert!(!sandbox.instance_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_metadata_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let _mock = MockControlSocket::start(&sandbox.socket_path(), 400, "")?;
        let bin = tempfile::tempdir()?;
        let mut child = spawn_hypervisor(bin.path(), "vm-1", "5")?;

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("aarch64")
            .pid(child.id().unwrap())
            .build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::MetadataDelivery(_))));
        child.kill().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_dead_pid_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let mut mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("aarch64")
            .pid(999_999_999u32)
            .build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::ProcessNotFound(_))));
        assert!(mock.try_next_request().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_leaves_unrelated_process_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let mut mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;
        let mut child = Command::new("sleep").arg("30").spawn()?;
        let pid = child.id().unwrap();

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("aarch64")
            .pid(pid)
            .shutdown_timeout(Duration::from_millis(100))
            .build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::ProcessNotFound(_))));
        assert!(mock.try_next_request().is_none());
        assert!(process_alive(pid));

        child.kill().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_aarch64_other_instance_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(dir.path());
        let sandbox = sandbox_for(&jailer, "vm-1")?;
        let _mock = MockControlSocket::start(&sandbox.socket_path(), 204, "")?;
        let bin = tempfile::tempdir()?;
        let mut child = spawn_hypervisor(bin.path(), "vm-2", "5")?;
        let pid = child.id().unwrap();

        let request = StopRequest::builder()
            .id("vm-1")
            .arch("aarch64")
            .pid(pid)
            .build();
        let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FirewardError::ProcessNotFound(_))));
        assert!(process_alive(pid));

        child.kill().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_rejects_path_like_id() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let jailer = jailer(&dir.path().join("jail"));
        let victim = dir.path().join("victim");
        std::fs::create_dir_all(&victim)?;

        let id = victim.display().to_string();
        for id in [id.as_str(), "../../victim"] {
            let request = StopRequest::builder().id(id).arch("x86_64").build();
            let result = stop_vmm(&request, &jailer, &CancellationToken::new()).await;
            assert!(matches!(result, Err(FirewardError::Validation(_))));
        }

        assert!(victim.exists());
        Ok(())
    }
}
