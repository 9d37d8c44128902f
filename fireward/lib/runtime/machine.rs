use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::{
    sys::stat::Mode,
    unistd::{chown, mkfifo, Gid, Uid},
};
use tokio::{io::AsyncReadExt, net::unix::pipe};
use tracing::{debug, error, info, warn};

use crate::{
    api::{
        ActionType, BootSource, FirecrackerClient, Logger, Metrics, MmdsConfig, NetworkInterface,
    },
    config::{MetadataConfig, GUEST_DEVICE_NAME},
    handlers::{Handler, HandlerAction},
    launch::{ensure_exists, LaunchSpec, LogSink},
    network::{
        create_netns, remove_netns, CniAttachment, CniAttachmentParams, CniResult, CniRuntime,
        NetworkAttachment, NoNetwork,
    },
    FirewardError, FirewardResult,
};

use super::{wait_for_socket_or_exit, Arch, InstanceInfo, JailedVmm, MachineControl, RunningInstance};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const COPY_BUFFER_SIZE: usize = 8 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The state threaded through the boot pipeline of one instance.
///
/// Each handler reads and extends it. On failure, [`abort`](BootContext::abort) tears down
/// whatever the handlers that already ran have set up.
pub(crate) struct BootContext {
    spec: LaunchSpec,
    arch: Arch,
    cni: CniRuntime,
    vmm: Option<Arc<JailedVmm>>,
    network: Option<Arc<dyn NetworkAttachment>>,
    cni_result: Option<CniResult>,
    guest_ip: Option<String>,
    log_path_in_chroot: Option<PathBuf>,
    metrics_path_in_chroot: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BootContext {
    pub(crate) fn new(spec: LaunchSpec, arch: Arch, cni: CniRuntime) -> Self {
        let guest_ip = spec.ip_address.clone();
        Self {
            spec,
            arch,
            cni,
            vmm: None,
            network: None,
            cni_result: None,
            guest_ip,
            log_path_in_chroot: None,
            metrics_path_in_chroot: None,
        }
    }

    /// Runs one step of the boot pipeline.
    pub(crate) async fn run(&mut self, handler: &Handler) -> FirewardResult<()> {
        debug!("{}: running {}", self.spec.id, handler);
        match handler.action() {
            HandlerAction::ValidateConfig => self.validate_config(),
            HandlerAction::SetupNetwork => self.setup_network().await,
            HandlerAction::SetupKernelArgs => {
                self.setup_kernel_args();
                Ok(())
            }
            HandlerAction::StartVmm => self.start_vmm().await,
            HandlerAction::CreateLogFiles => self.create_log_files(),
            HandlerAction::BootstrapLogging => self.bootstrap_logging().await,
            HandlerAction::CreateMachine => {
                self.client()?
                    .put_machine_config(&self.spec.machine_config)
                    .await
            }
            HandlerAction::CreateBootSource => {
                let source = BootSource {
                    kernel_image_path: self.spec.kernel_image_path.clone(),
                    boot_args: self.spec.kernel_args.clone(),
                };
                self.client()?.put_boot_source(&source).await
            }
            HandlerAction::AttachDrives => {
                let client = self.client()?;
                for drive in &self.spec.drives {
                    client.put_drive(drive).await?;
                }
                Ok(())
            }
            HandlerAction::CreateNetworkInterfaces => self.create_network_interfaces().await,
            HandlerAction::AddVsocks => {
                let client = self.client()?;
                for vsock in &self.spec.vsock_devices {
                    client.put_vsock(vsock).await?;
                }
                Ok(())
            }
            HandlerAction::ConfigMmds => self.config_mmds().await,
            HandlerAction::StartInstance => {
                self.client()?
                    .instance_action(ActionType::InstanceStart)
                    .await
            }
            HandlerAction::LinkFiles { kernel_file_name } => self.link_files(kernel_file_name),
            HandlerAction::SetMetadata(metadata) => self.set_metadata(metadata).await,
        }
    }

    /// Hands the booted instance over to a [`RunningInstance`].
    pub(crate) fn into_instance(mut self) -> FirewardResult<RunningInstance> {
        let vmm = self
            .vmm
            .take()
            .ok_or_else(|| FirewardError::ProcessNotFound(self.spec.id.clone()))?;

        let network = self
            .network
            .take()
            .unwrap_or_else(|| Arc::new(NoNetwork) as Arc<dyn NetworkAttachment>);

        let iface_name = self
            .spec
            .network_interfaces
            .first()
            .map(|iface| iface.if_name.clone())
            .unwrap_or_default();

        let info = InstanceInfo::builder()
            .id(self.spec.id.clone())
            .pid(vmm.pid())
            .ip(self.guest_ip.take())
            .iface_name(iface_name)
            .socket_path(self.spec.sandbox.socket_path())
            .sandbox(self.spec.sandbox.clone())
            .graceful_timeout(self.spec.shutdown_timeout)
            .build();

        let resources = std::mem::take(&mut self.spec.resources);
        Ok(RunningInstance::new(info, vmm, network, resources))
    }

    /// Tears down everything set up so far. Failures are logged.
    pub(crate) async fn abort(mut self) {
        warn!("{}: aborting launch", self.spec.id);

        if let Some(vmm) = self.vmm.take() {
            if let Err(e) = vmm.kill().await {
                error!("{}: failed to kill hypervisor: {}", self.spec.id, e);
            }
        }

        if let Some(network) = self.network.take() {
            if let Err(e) = network.detach().await {
                error!("{}: failed to detach network: {}", self.spec.id, e);
            }
        }

        self.spec.resources.release();

        if let Err(e) = self.spec.sandbox.remove() {
            error!("{}: failed to remove sandbox: {}", self.spec.id, e);
        }
    }

    fn client(&self) -> FirewardResult<&FirecrackerClient> {
        self.vmm
            .as_ref()
            .map(|vmm| vmm.client())
            .ok_or_else(|| FirewardError::ProcessNotFound(self.spec.id.clone()))
    }

    fn validate_config(&self) -> FirewardResult<()> {
        self.spec.sandbox.validate()?;
        ensure_exists(&self.spec.kernel_image_path)?;
        for drive in &self.spec.drives {
            ensure_exists(&drive.path_on_host)?;
        }
        Ok(())
    }

    async fn setup_network(&mut self) -> FirewardResult<()> {
        let Some(iface) = self.spec.network_interfaces.first() else {
            return Ok(());
        };

        let netns = self.cni.config().netns_path(&self.spec.id);
        create_netns(&netns).await?;

        let params = CniAttachmentParams {
            network_name: iface.network_name.clone(),
            container_id: self.spec.id.clone(),
            netns: netns.clone(),
            if_name: iface.if_name.clone(),
        };

        let result = match self.cni.add(&params).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(cleanup) = self.cni.del(&params).await {
                    debug!("{}: cni cleanup after failed add: {}", self.spec.id, cleanup);
                }
                if let Err(cleanup) = remove_netns(&netns) {
                    error!("{}: failed to remove netns: {}", self.spec.id, cleanup);
                }
                return Err(e);
            }
        };

        info!(
            "{}: attached {} to network {}",
            self.spec.id, params.if_name, params.network_name
        );

        self.spec.jailer.netns = Some(netns);
        self.network = Some(Arc::new(CniAttachment::new(self.cni.clone(), params)));
        self.cni_result = Some(result);
        Ok(())
    }

    fn setup_kernel_args(&mut self) {
        let Some(ip) = self.cni_result.as_ref().and_then(CniResult::ipv4) else {
            return;
        };

        self.spec.kernel_args = format!(
            "{} {}",
            self.spec.kernel_args,
            ip.kernel_arg(GUEST_DEVICE_NAME)
        )
        .trim()
        .to_string();
        self.guest_ip = Some(ip.address.to_string());
    }

    async fn start_vmm(&mut self) -> FirewardResult<()> {
        let vmm = Arc::new(JailedVmm::spawn(
            &self.spec.jailer,
            &self.spec.sandbox,
            self.arch,
        )?);
        self.vmm = Some(Arc::clone(&vmm));

        wait_for_socket_or_exit(
            &self.spec.sandbox.socket_path(),
            self.spec.socket_wait_timeout,
            vmm.as_ref(),
        )
        .await
    }

    fn link_files(&mut self, kernel_file_name: &str) -> FirewardResult<()> {
        let chroot = self.spec.sandbox.chroot_dir();
        fs::create_dir_all(&chroot)?;
        let owner = self.owner();

        let kernel_in_chroot = PathBuf::from(kernel_file_name);
        link_into(&self.spec.kernel_image_path, &chroot.join(&kernel_in_chroot), owner)?;
        self.spec.kernel_image_path = kernel_in_chroot;

        for drive in &mut self.spec.drives {
            let file_name = drive
                .path_on_host
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| FirewardError::ResourceNotFound(drive.path_on_host.clone()))?;

            link_into(&drive.path_on_host, &chroot.join(&file_name), owner)?;
            drive.path_on_host = file_name;
        }

        debug!("{}: linked boot files into {}", self.spec.id, chroot.display());
        Ok(())
    }

    fn create_log_files(&mut self) -> FirewardResult<()> {
        let chroot = self.spec.sandbox.chroot_dir();
        let owner = self.owner();

        if let Some(log_fifo) = self.spec.pipes.log_fifo.clone() {
            let (in_chroot, reader) = expose_fifo(&log_fifo, &chroot, owner)?;
            self.log_path_in_chroot = Some(in_chroot);

            if let Some(sink) = self.spec.pipes.sink.clone() {
                let id = self.spec.id.clone();
                let copier = tokio::spawn(async move {
                    if let Err(e) = drain_fifo(&reader, &sink).await {
                        warn!("{}: log copier stopped: {}", id, e);
                    }
                });

                self.spec.resources.register("log copier", move || {
                    copier.abort();
                    Ok(())
                });
            }
        }

        if let Some(metrics_fifo) = self.spec.pipes.metrics_fifo.clone() {
            let (in_chroot, _) = expose_fifo(&metrics_fifo, &chroot, owner)?;
            self.metrics_path_in_chroot = Some(in_chroot);
        }

        Ok(())
    }

    async fn bootstrap_logging(&self) -> FirewardResult<()> {
        let client = self.client()?;

        if let Some(log_path) = &self.log_path_in_chroot {
            client
                .put_logger(&Logger {
                    log_path: log_path.clone(),
                    level: self.spec.log_level.clone(),
                    show_level: true,
                    show_log_origin: false,
                })
                .await?;
        }

        if let Some(metrics_path) = &self.metrics_path_in_chroot {
            client
                .put_metrics(&Metrics {
                    metrics_path: metrics_path.clone(),
                })
                .await?;
        }

        Ok(())
    }

    async fn create_network_interfaces(&self) -> FirewardResult<()> {
        let client = self.client()?;
        let netns = self.spec.jailer.netns.clone().unwrap_or_default();

        for (i, iface) in self.spec.network_interfaces.iter().enumerate() {
            let (host_dev_name, guest_mac) = match &self.cni_result {
                Some(result) => {
                    let tap = result.tap_device(&self.spec.id, &netns, &iface.if_name);
                    (tap.name, tap.guest_mac)
                }
                None => (iface.if_name.clone(), None),
            };

            client
                .put_network_interface(&NetworkInterface {
                    iface_id: (i + 1).to_string(),
                    host_dev_name,
                    guest_mac,
                    rx_rate_limiter: Some(iface.in_rate_limiter.clone()),
                    tx_rate_limiter: Some(iface.out_rate_limiter.clone()),
                })
                .await?;
        }

        Ok(())
    }

    async fn config_mmds(&self) -> FirewardResult<()> {
        let network_interfaces: Vec<String> = self
            .spec
            .network_interfaces
            .iter()
            .enumerate()
            .filter(|(_, iface)| iface.allow_mmds)
            .map(|(i, _)| (i + 1).to_string())
            .collect();

        if network_interfaces.is_empty() {
            return Ok(());
        }

        self.client()?
            .put_mmds_config(&MmdsConfig {
                version: self.spec.mmds_version,
                network_interfaces,
            })
            .await
    }

    async fn set_metadata(&self, metadata: &MetadataConfig) -> FirewardResult<()> {
        self.client()?
            .put_mmds(&serde_json::to_value(metadata)?)
            .await
            .map_err(|e| FirewardError::MetadataDelivery(e.to_string()))
    }

    fn owner(&self) -> (u32, u32) {
        (self.spec.jailer.uid, self.spec.jailer.gid)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Hard links `src` to `dst`, copying across file systems, and hands it to `owner`.
fn link_into(src: &Path, dst: &Path, (uid, gid): (u32, u32)) -> FirewardResult<()> {
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = fs::hard_link(src, dst) {
        debug!(
            "hard link {} -> {} failed ({}), copying",
            src.display(),
            dst.display(),
            e
        );
        fs::copy(src, dst)?;
    }

    chown(dst, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
    Ok(())
}

/// Creates the pipe at `host_path` and makes it visible inside `chroot`.
///
/// Returns the path inside the chroot and the host path to read the pipe from. When the pipe
/// cannot be linked into the chroot, a separate pipe is created there and read instead.
fn expose_fifo(
    host_path: &Path,
    chroot: &Path,
    (uid, gid): (u32, u32),
) -> FirewardResult<(PathBuf, PathBuf)> {
    if !host_path.exists() {
        mkfifo(host_path, Mode::S_IRUSR | Mode::S_IWUSR)?;
    }

    let file_name = host_path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| FirewardError::ResourceNotFound(host_path.to_path_buf()))?;
    let chroot_path = chroot.join(&file_name);

    let reader = match fs::hard_link(host_path, &chroot_path) {
        Ok(()) => host_path.to_path_buf(),
        Err(e) => {
            debug!(
                "cannot link {} into chroot ({}), creating it there",
                host_path.display(),
                e
            );
            mkfifo(&chroot_path, Mode::S_IRUSR | Mode::S_IWUSR)?;
            chroot_path.clone()
        }
    };

    chown(&chroot_path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
    Ok((file_name, reader))
}

/// Copies everything written to the pipe at `path` into `sink` until the sink closes.
async fn drain_fifo(path: &Path, sink: &LogSink) -> io::Result<()> {
    // Opened read-write so the open does not wait for a writer and EOF never comes.
    let mut receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = receiver.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n])?;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use tokio::io::AsyncWriteExt;

    use crate::{
        config::CniConfig,
        handlers::{base_pipeline, START_VMM},
        runtime::fakes::{launch_spec, tracked_resource, FakeNetwork},
    };

    use super::*;

    fn current_owner() -> (u32, u32) {
        (Uid::current().as_raw(), Gid::current().as_raw())
    }

    #[tokio::test]
    async fn test_abort_after_failed_step_tears_down() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spec = launch_spec(dir.path(), Path::new("/bin/false"))?;
        let released = tracked_resource(&mut spec.resources);
        let sandbox = spec.sandbox.instance_dir();

        let network = Arc::new(FakeNetwork::default());
        let mut context =
            BootContext::new(spec, Arch::X86_64, CniRuntime::new(CniConfig::default()));
        context.network = Some(network.clone());

        let start = base_pipeline()
            .into_iter()
            .find(|handler| handler.name() == START_VMM)
            .unwrap();
        assert!(context.run(&start).await.is_err());
        assert!(context.vmm.is_some());

        context.abort().await;

        assert_eq!(network.detaches(), 1);
        assert!(released.load(Ordering::SeqCst));
        assert!(!sandbox.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_logs_detach_failure_and_continues() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spec = launch_spec(dir.path(), Path::new("/bin/false"))?;
        let released = tracked_resource(&mut spec.resources);
        let sandbox = spec.sandbox.instance_dir();

        let network = Arc::new(FakeNetwork::failing());
        let mut context =
            BootContext::new(spec, Arch::X86_64, CniRuntime::new(CniConfig::default()));
        context.network = Some(network.clone());

        context.abort().await;

        assert_eq!(network.detaches(), 1);
        assert!(released.load(Ordering::SeqCst));
        assert!(!sandbox.exists());
        Ok(())
    }

    #[test]
    fn test_link_into_replaces_existing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("vmlinux");
        let dst = dir.path().join("root").join("vmlinux");
        fs::create_dir_all(dst.parent().unwrap())?;
        fs::write(&src, b"kernel")?;
        fs::write(&dst, b"stale")?;

        link_into(&src, &dst, current_owner())?;

        assert_eq!(fs::read(&dst)?, b"kernel");
        Ok(())
    }

    #[test]
    fn test_expose_fifo_links_into_chroot() -> anyhow::Result<()> {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir()?;
        let chroot = dir.path().join("root");
        fs::create_dir_all(&chroot)?;
        let host = dir.path().join("log.fifo");

        let (in_chroot, reader) = expose_fifo(&host, &chroot, current_owner())?;

        assert_eq!(in_chroot, PathBuf::from("log.fifo"));
        assert_eq!(reader, host);
        assert!(fs::metadata(chroot.join("log.fifo"))?.file_type().is_fifo());
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_fifo_into_sink() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = dir.path().join("log.fifo");
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR)?;
        let sink = LogSink::open(&dir.path().join("vm.log"))?;

        let copier = {
            let fifo = fifo.clone();
            let sink = sink.clone();
            tokio::spawn(async move { drain_fifo(&fifo, &sink).await })
        };

        let mut writer = pipe::OpenOptions::new().open_sender(&fifo);
        // The reader may not have opened the pipe yet.
        for _ in 0..100 {
            if writer.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer = pipe::OpenOptions::new().open_sender(&fifo);
        }
        let mut writer = writer?;
        writer.write_all(b"boot ok\n").await?;

        let log = dir.path().join("vm.log");
        tokio::time::timeout(Duration::from_secs(5), async {
            while fs::read(&log).map(|b| b.is_empty()).unwrap_or(true) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;

        assert_eq!(fs::read_to_string(&log)?, "boot ok\n");
        copier.abort();
        Ok(())
    }
}
