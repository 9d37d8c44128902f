//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

use crate::config::MetadataConfig;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Request body for the /create endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateVmRequest {
    /// Host path of the kernel image
    pub kernel_path: String,

    /// Host path of the root filesystem
    pub root_drive_path: String,

    /// Name of the CNI network to attach to
    pub cni_network_name: String,

    /// One additional drive of the form `path:rw` or `path:ro`
    pub additional_drives: String,

    /// Vsock devices, each of the form `path:CID`
    pub vsock_devices: Vec<String>,

    /// Payload delivered to the guest over the metadata channel
    pub metadata: MetadataConfig,

    /// Adds a serial console to the kernel command line
    pub debug: bool,

    /// Number of vCPUs
    #[serde(rename = "vCpuCount")]
    pub vcpu_count: u32,

    /// Memory size in MiB
    pub mem_size_mib: u32,

    /// Enables simultaneous multithreading
    pub enable_smt: bool,

    /// Overrides the configured chroot base directory
    pub jailer_chroot_base: Option<String>,

    /// Guest IP address to request
    pub ip_address: Option<String>,

    /// Host path of the hypervisor log pipe
    pub log_fifo: Option<String>,

    /// File receiving everything written to the log pipe
    pub fifo_log_file: Option<String>,

    /// Host path of the hypervisor metrics pipe
    pub metrics_fifo: Option<String>,
}

/// Response body for the /create endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmResponse {
    /// Guest IP address, empty when the network assigned none
    pub ip: String,

    /// Pid of the hypervisor
    pub pid: u32,

    /// Id of the new instance
    #[serde(rename = "vmId")]
    pub vm_id: String,
}

/// Request body for the /stop endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopVmRequest {
    /// Id of the instance
    pub vmm_id: String,

    /// Pid of the hypervisor
    pub pid: u32,

    /// Architecture of the host, `x86_64` or `aarch64`
    pub arch: String,

    /// Overrides the configured chroot base directory
    pub jailer_chroot_base: Option<String>,
}

/// Error response returned when an operation fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl StopVmRequest {
    /// Returns a description of the missing fields, if any.
    pub fn missing_fields(&self) -> Option<String> {
        if self.arch.is_empty() || self.pid == 0 || self.vmm_id.is_empty() {
            return Some(format!(
                "missing required field, arch: {}, pid: {}, vmmid: {}",
                self.arch, self.pid, self.vmm_id
            ));
        }

        None
    }
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
