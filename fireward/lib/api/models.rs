//! Request and response bodies of the hypervisor control API.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A block device attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// The drive id. `1` is reserved for the root device.
    pub drive_id: String,

    /// Host path of the backing file.
    pub path_on_host: PathBuf,

    /// Whether the guest sees the device read-only.
    pub is_read_only: bool,

    /// Whether this is the root device.
    pub is_root_device: bool,

    /// Partition UUID of the root device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partuuid: Option<String>,
}

/// A guest network interface backed by a host tap device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// The interface id.
    pub iface_id: String,

    /// Name of the tap device on the host side.
    pub host_dev_name: String,

    /// MAC address of the guest device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,

    /// Inbound rate limiter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_rate_limiter: Option<RateLimiter>,

    /// Outbound rate limiter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_rate_limiter: Option<RateLimiter>,
}

/// A rate limiter made of a bandwidth and an operations bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiter {
    /// Bandwidth bucket.
    pub bandwidth: TokenBucket,

    /// Operations bucket.
    pub ops: TokenBucket,
}

/// A token bucket. A zero size disables limiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Total number of tokens.
    pub size: u64,

    /// Milliseconds to refill the bucket.
    pub refill_time: u64,
}

/// A vsock device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vsock {
    /// The device id.
    pub vsock_id: String,

    /// Guest context identifier.
    pub guest_cid: u32,

    /// Host path of the backing unix socket.
    pub uds_path: PathBuf,
}

/// vCPU and memory sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfiguration {
    /// Number of vCPUs.
    pub vcpu_count: u32,

    /// Memory in MiB.
    pub mem_size_mib: u32,

    /// Simultaneous multithreading.
    pub smt: bool,

    /// CPU template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<String>,
}

/// Kernel image and command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    /// Path of the kernel image as seen by the hypervisor.
    pub kernel_image_path: PathBuf,

    /// Kernel command line.
    pub boot_args: String,
}

/// Hypervisor logger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logger {
    /// Path of the log pipe as seen by the hypervisor.
    pub log_path: PathBuf,

    /// Log level.
    pub level: String,

    /// Prefix lines with their level.
    pub show_level: bool,

    /// Prefix lines with their source location.
    pub show_log_origin: bool,
}

/// Hypervisor metrics settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Path of the metrics pipe as seen by the hypervisor.
    pub metrics_path: PathBuf,
}

/// Metadata service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsConfig {
    /// Metadata service version.
    pub version: MmdsVersion,

    /// Interfaces the guest can reach the service through.
    pub network_interfaces: Vec<String>,
}

/// Metadata service version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MmdsVersion {
    /// Version 1.
    V1,

    /// Version 2, session oriented.
    #[default]
    V2,
}

/// An instance action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceActionInfo {
    /// The action.
    pub action_type: ActionType,
}

/// Instance actions understood by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    /// Boot the guest.
    InstanceStart,

    /// Send Ctrl+Alt+Del to the guest keyboard controller (x86_64 only).
    SendCtrlAltDel,

    /// Flush the metrics pipe.
    FlushMetrics,
}

/// Error body returned by the hypervisor API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFault {
    /// Description of the fault.
    #[serde(default)]
    pub fault_message: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RateLimiter {
    /// Returns a rate limiter whose buckets are all zero, i.e. no limiting.
    pub fn disabled() -> Self {
        Self::default()
    }
}

impl InstanceActionInfo {
    /// Creates an action body.
    pub fn new(action_type: ActionType) -> Self {
        Self { action_type }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_action_wire_format() -> anyhow::Result<()> {
        let body = serde_json::to_value(InstanceActionInfo::new(ActionType::SendCtrlAltDel))?;
        assert_eq!(body, serde_json::json!({ "action_type": "SendCtrlAltDel" }));
        Ok(())
    }

    #[test]
    fn test_drive_omits_missing_partuuid() -> anyhow::Result<()> {
        let drive = Drive {
            drive_id: "2".into(),
            path_on_host: "/data.img".into(),
            is_read_only: false,
            is_root_device: false,
            partuuid: None,
        };

        let body = serde_json::to_value(&drive)?;
        assert!(body.get("partuuid").is_none());
        assert_eq!(body["path_on_host"], "/data.img");
        Ok(())
    }

    #[test]
    fn test_mmds_config_wire_format() -> anyhow::Result<()> {
        let config = MmdsConfig {
            version: MmdsVersion::V2,
            network_interfaces: vec!["1".into()],
        };

        assert_eq!(
            serde_json::to_value(config)?,
            serde_json::json!({ "version": "V2", "network_interfaces": ["1"] })
        );
        Ok(())
    }
}
