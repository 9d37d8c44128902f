//! In-process stand-ins for a hypervisor and its network, used by unit tests.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    config::{FirewardConfig, MachineSpec, SandboxDescriptor},
    launch::{LaunchSpec, ScopedResources},
    management::fixtures::boot_files,
    network::NetworkAttachment,
    FirewardError, FirewardResult,
};

use super::{ExitInfo, InstanceInfo, MachineControl, RunningInstance};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How [`FakeControl`] answers a shutdown request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Shutdown {
    /// The guest powers off right away.
    Ack,

    /// The request never completes.
    Hang,

    /// The request fails.
    Fail,
}

pub(crate) struct FakeControl {
    behavior: Shutdown,
    shutdowns: AtomicUsize,
    killed: AtomicBool,
    exited: watch::Sender<bool>,
}

#[derive(Default)]
pub(crate) struct FakeNetwork {
    detaches: AtomicUsize,
    fail: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeControl {
    pub(crate) fn new(behavior: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            shutdowns: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            exited: watch::channel(false).0,
        })
    }

    /// Makes the process exit on its own.
    pub(crate) fn exit(&self) {
        self.exited.send_replace(true);
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl FakeNetwork {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the launch spec of `vm-1`, without a network, with its boot files and chroot base
/// under `dir`.
pub(crate) fn launch_spec(dir: &Path, jailer_binary: &Path) -> anyhow::Result<LaunchSpec> {
    let mut config = FirewardConfig::default();
    config.jailer.chroot_base = dir.join("jail");
    config.jailer.binary = jailer_binary.to_path_buf();

    let machine = MachineSpec::from_request(boot_files(dir)?, &config)?;
    let sandbox = SandboxDescriptor::from_config(&config.jailer, "vm-1", None);
    let mut spec = LaunchSpec::build(&machine, &sandbox)?;
    spec.network_interfaces.clear();
    spec.socket_wait_timeout = Duration::from_secs(5);

    std::fs::create_dir_all(spec.sandbox.chroot_dir())?;
    Ok(spec)
}

/// Writes an executable stand-in for the jailer that runs `body`.
pub(crate) fn jailer_script(dir: &Path, body: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join("jailer");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Registers a resource on `resources` and returns a flag set once it is released.
pub(crate) fn tracked_resource(resources: &mut ScopedResources) -> Arc<AtomicBool> {
    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);
    resources.register("tracked", move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    released
}

/// Builds a running instance `id` on top of the fakes.
pub(crate) fn instance(
    id: &str,
    control: Arc<FakeControl>,
    network: Arc<FakeNetwork>,
    timeout: Duration,
    resources: ScopedResources,
) -> RunningInstance {
    let sandbox = SandboxDescriptor::builder()
        .id(id)
        .uid(0)
        .gid(0)
        .exec_file("/usr/bin/firecracker")
        .jailer_binary("/usr/bin/jailer")
        .chroot_base("/srv/jailer")
        .build();

    instance_in(sandbox, control, network, timeout, resources)
}

/// Builds a running instance living in `sandbox` on top of the fakes.
pub(crate) fn instance_in(
    sandbox: SandboxDescriptor,
    control: Arc<FakeControl>,
    network: Arc<FakeNetwork>,
    timeout: Duration,
    resources: ScopedResources,
) -> RunningInstance {
    let info = InstanceInfo::builder()
        .id(sandbox.get_id().clone())
        .pid(control.pid())
        .ip(Some("10.0.0.2".to_string()))
        .iface_name("vethabc")
        .socket_path(sandbox.socket_path())
        .sandbox(sandbox)
        .graceful_timeout(timeout)
        .build();

    RunningInstance::new(info, control, network, resources)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl MachineControl for FakeControl {
    fn pid(&self) -> u32 {
        4242
    }

    async fn shutdown(&self) -> FirewardResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Shutdown::Ack => {
                self.exit();
                Ok(())
            }
            Shutdown::Hang => std::future::pending().await,
            Shutdown::Fail => Err(FirewardError::ControlSocketUnavailable("/nowhere".into())),
        }
    }

    async fn kill(&self) -> FirewardResult<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit();
        Ok(())
    }

    async fn wait(&self) -> ExitInfo {
        let mut exited = self.exited.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
        if self.killed() {
            ExitInfo::Signaled(9)
        } else {
            ExitInfo::Exited(0)
        }
    }
}

#[async_trait]
impl NetworkAttachment for FakeNetwork {
    async fn detach(&self) -> FirewardResult<()> {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FirewardError::Cni("bridge is gone".into()));
        }
        Ok(())
    }
}
