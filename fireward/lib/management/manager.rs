use std::{collections::HashMap, path::PathBuf, sync::Arc};

use futures::future;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    config::{FirewardConfig, MachineSpec, SandboxDescriptor},
    handlers::{Handler, HandlerPlacement, Strategy, CREATE_BOOT_SOURCE},
    launch::LaunchSpec,
    network::CniRuntime,
    runtime::{stop_vmm, Arch, JailerBackend, LaunchBackend, RunningInstance, StopRequest},
    server::{CreateVmRequest, StopVmRequest},
    FirewardResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Launches and stops instances on this host, keeping a handle on the ones it launched.
///
/// Handles live in memory only. An instance launched by another process, or before a restart,
/// is stopped through [`stop_vmm`].
#[derive(Clone)]
pub struct VmmManager {
    config: Arc<FirewardConfig>,
    backend: Arc<dyn LaunchBackend>,
    instances: Arc<RwLock<HashMap<String, Arc<RunningInstance>>>>,
    cancel: CancellationToken,
}

/// The result of a successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVm {
    /// Instance id.
    pub id: String,

    /// Pid of the hypervisor.
    pub pid: u32,

    /// Guest IP address.
    pub ip: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmmManager {
    /// Creates a manager launching through the jailer on the host architecture.
    pub fn new(config: FirewardConfig) -> FirewardResult<Self> {
        let backend = JailerBackend::new(CniRuntime::new(config.cni.clone()), Arch::host()?);
        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Creates a manager launching through `backend`.
    pub fn with_backend(config: FirewardConfig, backend: Arc<dyn LaunchBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            instances: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &FirewardConfig {
        &self.config
    }

    /// Returns the handle of a live instance.
    pub async fn get(&self, id: &str) -> Option<Arc<RunningInstance>> {
        self.instances.read().await.get(id).cloned()
    }

    /// Returns the ids of the live instances.
    pub async fn ids(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    /// Launches an instance.
    ///
    /// The request metadata is delivered to the guest before the boot source is set.
    pub async fn create(&self, request: CreateVmRequest) -> FirewardResult<CreatedVm> {
        let chroot_base = request
            .jailer_chroot_base
            .clone()
            .filter(|base| !base.is_empty())
            .map(PathBuf::from);

        let machine = MachineSpec::from_request(request, &self.config)?;
        let id = Uuid::new_v4().to_string();
        let sandbox =
            SandboxDescriptor::from_config(&self.config.jailer, id.clone(), chroot_base.as_deref());

        let spec = LaunchSpec::build(&machine, &sandbox)?;
        let strategy = Strategy::default_for(&machine).add_requirement(HandlerPlacement::new(
            Handler::set_metadata(machine.get_metadata().clone()),
            CREATE_BOOT_SOURCE,
        ));

        let instance = Arc::new(self.backend.start(spec, &strategy, &self.cancel).await?);
        let created = CreatedVm {
            id: id.clone(),
            pid: instance.pid(),
            ip: instance.ip().map(str::to_string),
        };

        self.instances
            .write()
            .await
            .insert(id.clone(), Arc::clone(&instance));
        self.watch_exit(instance);

        info!("created vm {} with pid {}", created.id, created.pid);
        Ok(created)
    }

    /// Stops an instance.
    ///
    /// A live handle is stopped through the graceful/forceful race and its sandbox removed.
    /// Anything else goes through the detached stop sequence.
    pub async fn stop(&self, request: StopVmRequest) -> FirewardResult<String> {
        let arch: Arch = request.arch.parse()?;

        let live = self.instances.write().await.remove(&request.vmm_id);
        if let Some(instance) = live {
            let outcome = instance.stop(&self.cancel).await;
            remove_sandbox(&instance);

            info!("stopped {} ({}) {}", request.vmm_id, arch, outcome);
            return Ok(format!("VM with id: {} has been stopped", request.vmm_id));
        }

        let stop = StopRequest::builder()
            .id(request.vmm_id)
            .arch(arch.as_str())
            .pid((request.pid != 0).then_some(request.pid))
            .chroot_base(
                request
                    .jailer_chroot_base
                    .filter(|base| !base.is_empty())
                    .map(PathBuf::from),
            )
            .shutdown_timeout(self.config.machine.shutdown_timeout())
            .preserve_sandbox_on_failure(self.config.machine.preserve_sandbox_on_failure)
            .build();

        stop_vmm(&stop, &self.config.jailer, &self.cancel).await
    }

    /// Stops every live instance.
    pub async fn shutdown(&self) {
        let instances: Vec<_> = self.instances.write().await.drain().collect();
        let stops = instances.into_iter().map(|(id, instance)| async move {
            let outcome = instance.stop(&self.cancel).await;
            remove_sandbox(&instance);
            info!("stopped {} {} on shutdown", id, outcome);
        });

        future::join_all(stops).await;
    }

    /// Forgets an instance once its process exits, tearing it down if nobody stopped it.
    fn watch_exit(&self, instance: Arc<RunningInstance>) {
        let instances = Arc::clone(&self.instances);
        tokio::spawn(async move {
            let exit = instance.wait().await;
            info!("vm {} {}", instance.id(), exit);

            let (tx, mut rx) = mpsc::channel(1);
            instance.cleanup(&tx).await;
            if let Ok(outcome) = rx.try_recv() {
                info!("vm {} stopped {} on its own", instance.id(), outcome);
            }
            remove_sandbox(&instance);

            let mut instances = instances.write().await;
            if instances
                .get(instance.id())
                .is_some_and(|current| Arc::ptr_eq(current, &instance))
            {
                instances.remove(instance.id());
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn remove_sandbox(instance: &RunningInstance) {
    if let Err(e) = instance.info().get_sandbox().remove() {
        error!("failed to remove sandbox of {}: {}", instance.id(), e);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use crate::{
        handlers::{base_pipeline, SET_METADATA},
        runtime::fakes::{self, FakeControl, FakeNetwork, Shutdown},
        FirewardError,
    };

    use super::*;

    /// Records the launches it is asked for and hands out fake instances.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub(crate) launches: AtomicUsize,
        pub(crate) pipelines: Mutex<Vec<Vec<String>>>,
        pub(crate) controls: Mutex<Vec<Arc<FakeControl>>>,
        pub(crate) network: Arc<FakeNetwork>,
    }

    #[async_trait]
    impl LaunchBackend for FakeBackend {
        async fn start(
            &self,
            spec: LaunchSpec,
            strategy: &Strategy,
            _cancel: &CancellationToken,
        ) -> FirewardResult<RunningInstance> {
            let mut spec = spec;
            let pipeline = strategy.resolve(base_pipeline())?;
            self.pipelines
                .lock()
                .unwrap()
                .push(pipeline.iter().map(|h| h.name().to_string()).collect());
            self.launches.fetch_add(1, Ordering::SeqCst);

            let control = FakeControl::new(Shutdown::Ack);
            self.controls.lock().unwrap().push(Arc::clone(&control));

            Ok(fakes::instance_in(
                spec.sandbox.clone(),
                control,
                Arc::clone(&self.network),
                Duration::from_secs(5),
                std::mem::take(&mut spec.resources),
            ))
        }
    }

    pub(crate) fn boot_files(dir: &Path) -> anyhow::Result<CreateVmRequest> {
        let kernel = dir.join("vmlinux");
        let rootfs = dir.join("rootfs.ext4");
        std::fs::write(&kernel, b"kernel")?;
        std::fs::write(&rootfs, b"rootfs")?;

        Ok(CreateVmRequest {
            kernel_path: kernel.display().to_string(),
            root_drive_path: rootfs.display().to_string(),
            cni_network_name: "testnet".into(),
            vcpu_count: 1,
            mem_size_mib: 128,
            ..Default::default()
        })
    }

    fn config(dir: &Path) -> FirewardConfig {
        let mut config = FirewardConfig::default();
        config.jailer.chroot_base = dir.join("jail");
        config
    }

    /// Lays out the sandbox directory the jailer would have created for `id`.
    async fn make_sandbox(manager: &VmmManager, id: &str) -> anyhow::Result<PathBuf> {
        let instance = manager.get(id).await.unwrap();
        let sandbox = instance.info().get_sandbox();
        std::fs::create_dir_all(sandbox.chroot_dir())?;
        Ok(sandbox.instance_dir())
    }

    #[tokio::test]
    async fn test_create_registers_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(FakeBackend::default());
        let manager = VmmManager::with_backend(config(dir.path()), backend.clone());

        let created = manager.create(boot_files(dir.path())?).await?;

        assert_eq!(created.pid, 4242);
        assert_eq!(created.ip.as_deref(), Some("10.0.0.2"));
        assert!(manager.get(&created.id).await.is_some());

        let pipelines = backend.pipelines.lock().unwrap();
        let names = &pipelines[0];
        let metadata = names.iter().position(|n| n == SET_METADATA).unwrap();
        assert_eq!(names[metadata + 1], CREATE_BOOT_SOURCE);

        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_request() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(FakeBackend::default());
        let manager = VmmManager::with_backend(config(dir.path()), backend.clone());

        let request = CreateVmRequest {
            vcpu_count: 0,
            ..boot_files(dir.path())?
        };
        let err = manager.create(request).await.unwrap_err();

        assert!(matches!(err, FirewardError::Config(_)));
        assert!(err.is_client_error());
        assert_eq!(backend.launches.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_live_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(FakeBackend::default());
        let manager = VmmManager::with_backend(config(dir.path()), backend.clone());
        let created = manager.create(boot_files(dir.path())?).await?;
        let sandbox = make_sandbox(&manager, &created.id).await?;

        let message = manager
            .stop(StopVmRequest {
                vmm_id: created.id.clone(),
                pid: created.pid,
                arch: "x86_64".into(),
                jailer_chroot_base: None,
            })
            .await?;

        assert_eq!(message, format!("VM with id: {} has been stopped", created.id));
        assert!(manager.get(&created.id).await.is_none());
        assert_eq!(backend.network.detaches(), 1);
        assert!(!sandbox.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unknown_instance_runs_detached_stop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager =
            VmmManager::with_backend(config(dir.path()), Arc::new(FakeBackend::default()));

        let message = manager
            .stop(StopVmRequest {
                vmm_id: "gone".into(),
                pid: 1,
                arch: "x86_64".into(),
                jailer_chroot_base: None,
            })
            .await?;

        assert_eq!(message, "VM with id: gone has been stopped");
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(FakeBackend::default());
        let manager = VmmManager::with_backend(config(dir.path()), backend.clone());
        let first = manager.create(boot_files(dir.path())?).await?;
        let second = manager.create(boot_files(dir.path())?).await?;
        let sandboxes = [
            make_sandbox(&manager, &first.id).await?,
            make_sandbox(&manager, &second.id).await?,
        ];

        manager.shutdown().await;

        assert!(manager.ids().await.is_empty());
        for sandbox in &sandboxes {
            assert!(!sandbox.exists());
        }
        assert_eq!(backend.network.detaches(), 2);
        for control in backend.controls.lock().unwrap().iter() {
            assert_eq!(control.shutdowns(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_exit_is_cleaned_up() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(FakeBackend::default());
        let manager = VmmManager::with_backend(config(dir.path()), backend.clone());
        let created = manager.create(boot_files(dir.path())?).await?;
        let sandbox = make_sandbox(&manager, &created.id).await?;

        let control = backend.controls.lock().unwrap()[0].clone();
        control.exit();

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.get(&created.id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;

        assert_eq!(backend.network.detaches(), 1);
        assert!(!sandbox.exists());
        Ok(())
    }
}
