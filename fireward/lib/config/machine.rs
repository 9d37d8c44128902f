use std::{net::IpAddr, path::PathBuf, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{server::CreateVmRequest, FirewardError, FirewardResult};

use super::{
    is_production, FirewardConfig, DEFAULT_KERNEL_ARGS, DEFAULT_SHUTDOWN_TIMEOUT,
    DEFAULT_SOCKET_WAIT_TIMEOUT, DEFAULT_VMM_LOG_LEVEL, MIN_MEM_MIB, MIN_VCPUS, VMM_LOG_LEVELS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The machine configuration of a single microVM.
///
/// Built once per request and then handed to [`LaunchSpec::build`](crate::launch::LaunchSpec::build)
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MachineSpec {
    /// The number of vCPUs.
    #[builder(default = 1)]
    vcpu_count: u32,

    /// The amount of memory in MiB.
    #[builder(default = 128)]
    mem_size_mib: u32,

    /// The CPU template.
    #[builder(default, setter(strip_option, into))]
    cpu_template: Option<String>,

    /// Whether simultaneous multithreading is enabled.
    #[builder(default)]
    smt: bool,

    /// Host path of the kernel image.
    #[builder(setter(into))]
    kernel_path: PathBuf,

    /// The kernel command line.
    #[builder(default = DEFAULT_KERNEL_ARGS.to_string(), setter(into))]
    kernel_args: String,

    /// Host path of the root filesystem, optionally suffixed with `:ro` or `:rw`.
    #[builder(setter(into))]
    root_drive_path: String,

    /// Partition UUID of the root device.
    #[builder(default, setter(strip_option, into))]
    root_partuuid: Option<String>,

    /// Additional drives, each of the form `path:rw` or `path:ro`.
    #[builder(default)]
    additional_drives: Vec<String>,

    /// Vsock devices, each of the form `path:CID`.
    #[builder(default)]
    vsock_devices: Vec<String>,

    /// Name of the network the instance is attached to.
    #[builder(setter(into))]
    network_name: String,

    /// IP address to try to allocate to the instance.
    #[builder(default, setter(strip_option, into))]
    ip_address: Option<String>,

    /// Path of the raw log pipe.
    #[builder(default, setter(strip_option, into))]
    log_fifo: Option<PathBuf>,

    /// File that receives the piped log content.
    #[builder(default, setter(strip_option, into))]
    fifo_log_file: Option<PathBuf>,

    /// Path of the metrics pipe.
    #[builder(default, setter(strip_option, into))]
    metrics_fifo: Option<PathBuf>,

    /// Payload delivered over the metadata channel before boot.
    #[builder(default)]
    metadata: MetadataConfig,

    /// Attach a serial console.
    #[builder(default)]
    debug: bool,

    /// The hypervisor log level.
    #[builder(default = DEFAULT_VMM_LOG_LEVEL.to_string(), setter(into))]
    log_level: String,

    /// Graceful shutdown timeout.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)]
    shutdown_timeout: Duration,

    /// How long to wait for the control socket after spawning the jailer.
    #[builder(default = DEFAULT_SOCKET_WAIT_TIMEOUT)]
    socket_wait_timeout: Duration,
}

/// Data delivered to the guest over the metadata channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Opaque payload.
    #[serde(rename = "Data", default)]
    pub data: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineSpec {
    /// Maps a create request onto a validated machine specification.
    pub fn from_request(request: CreateVmRequest, config: &FirewardConfig) -> FirewardResult<Self> {
        let log_level = if is_production() {
            "Error".to_string()
        } else {
            config.machine.log_level.clone()
        };

        let additional_drives = match request.additional_drives.trim() {
            "" => Vec::new(),
            drive => vec![drive.to_string()],
        };

        let spec = MachineSpec {
            vcpu_count: request.vcpu_count,
            mem_size_mib: request.mem_size_mib,
            cpu_template: None,
            smt: request.enable_smt,
            kernel_path: request.kernel_path.into(),
            kernel_args: config.machine.kernel_args.clone(),
            root_drive_path: request.root_drive_path,
            root_partuuid: None,
            additional_drives,
            vsock_devices: request.vsock_devices,
            network_name: request.cni_network_name,
            ip_address: request.ip_address.filter(|ip| !ip.is_empty()),
            log_fifo: non_empty_path(request.log_fifo),
            fifo_log_file: non_empty_path(request.fifo_log_file),
            metrics_fifo: non_empty_path(request.metrics_fifo),
            metadata: request.metadata,
            debug: request.debug,
            log_level,
            shutdown_timeout: config.machine.shutdown_timeout(),
            socket_wait_timeout: config.machine.socket_wait_timeout(),
        };

        spec.validate()?;
        Ok(spec)
    }

    /// Checks the machine specification for errors a caller can fix.
    pub fn validate(&self) -> FirewardResult<()> {
        if let Some(ip) = &self.ip_address {
            if ip.parse::<IpAddr>().is_err() {
                return Err(FirewardError::Config(format!(
                    "ip address {ip:?} is not an IP address"
                )));
            }
        }

        if self.kernel_path.as_os_str().is_empty() {
            return Err(FirewardError::Config("kernel path cannot be empty".into()));
        }

        if self.root_drive_path.is_empty() {
            return Err(FirewardError::Config("rootfs path cannot be empty".into()));
        }

        if !VMM_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(FirewardError::Config(format!(
                "log level {:?} is invalid, expected one of {}",
                self.log_level,
                VMM_LOG_LEVELS.join(", ")
            )));
        }

        if self.vcpu_count < MIN_VCPUS {
            return Err(FirewardError::Config(format!(
                "vcpu count cannot be lower than {MIN_VCPUS}"
            )));
        }

        if self.mem_size_mib < MIN_MEM_MIB {
            return Err(FirewardError::Config(format!(
                "memory size cannot be lower than {MIN_MEM_MIB} MiB"
            )));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn non_empty_path(path: Option<String>) -> Option<PathBuf> {
    path.filter(|p| !p.is_empty()).map(PathBuf::from)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
