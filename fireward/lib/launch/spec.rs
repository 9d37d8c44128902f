use std::{path::PathBuf, time::Duration};

use crate::{
    api::{Drive, MachineConfiguration, MmdsVersion, RateLimiter, Vsock},
    config::{MetadataConfig, SandboxDescriptor, StdioWiring, JAILED_SOCKET_PATH},
};

use super::{LogPipes, ScopedResources};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything needed to boot one jailed microVM.
///
/// Produced by [`LaunchSpec::build`] and consumed by a launch backend. The spec owns the
/// resources synthesized while building it; they are released when the backend is done with
/// them or when the spec is dropped.
#[derive(Debug)]
pub struct LaunchSpec {
    /// The instance id.
    pub id: String,

    /// Where the instance lives on the host.
    pub sandbox: SandboxDescriptor,

    /// Arguments of the jailer.
    pub jailer: JailerParams,

    /// Host path of the kernel image. Rewritten to a chroot-relative path once linked.
    pub kernel_image_path: PathBuf,

    /// The kernel command line.
    pub kernel_args: String,

    /// Block devices, root device first.
    pub drives: Vec<Drive>,

    /// Network interfaces to attach.
    pub network_interfaces: Vec<NetworkInterfaceSpec>,

    /// Vsock devices.
    pub vsock_devices: Vec<Vsock>,

    /// Log and metrics pipes.
    pub pipes: LogPipes,

    /// The hypervisor log level.
    pub log_level: String,

    /// vCPU and memory sizing.
    pub machine_config: MachineConfiguration,

    /// Metadata service version.
    pub mmds_version: MmdsVersion,

    /// Payload delivered over the metadata channel.
    pub metadata: MetadataConfig,

    /// IP address requested for the guest.
    pub ip_address: Option<String>,

    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,

    /// How long to wait for the control socket.
    pub socket_wait_timeout: Duration,

    /// Resources released once the instance stops or fails to start.
    pub resources: ScopedResources,
}

/// A network interface attached through the network plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    /// Name of the plugin network.
    pub network_name: String,

    /// Generated interface name handed to the plugins.
    pub if_name: String,

    /// Whether the guest may reach the metadata service through this interface.
    pub allow_mmds: bool,

    /// Inbound rate limiter.
    pub in_rate_limiter: RateLimiter,

    /// Outbound rate limiter.
    pub out_rate_limiter: RateLimiter,
}

/// Arguments of the jailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailerParams {
    /// The uid the hypervisor runs as.
    pub uid: u32,

    /// The gid the hypervisor runs as.
    pub gid: u32,

    /// The NUMA node the hypervisor is pinned to.
    pub numa_node: Option<u32>,

    /// The instance id.
    pub id: String,

    /// The hypervisor executable.
    pub exec_file: PathBuf,

    /// The jailer executable.
    pub jailer_binary: PathBuf,

    /// Base directory of all chroots.
    pub chroot_base: PathBuf,

    /// Whether the jailer daemonizes.
    pub daemonize: bool,

    /// The cgroup version.
    pub cgroup_version: String,

    /// How the standard streams are wired.
    pub stdio: StdioWiring,

    /// Network namespace to join, set once the network is up.
    pub netns: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl JailerParams {
    /// Returns the command line arguments of the jailer.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--id".to_string(),
            self.id.clone(),
            "--uid".to_string(),
            self.uid.to_string(),
            "--gid".to_string(),
            self.gid.to_string(),
            "--exec-file".to_string(),
            self.exec_file.display().to_string(),
            "--chroot-base-dir".to_string(),
            self.chroot_base.display().to_string(),
            "--cgroup-version".to_string(),
            self.cgroup_version.clone(),
        ];

        if let Some(node) = self.numa_node {
            args.push("--cgroup".to_string());
            args.push(format!("cpuset.mems={node}"));
        }

        if let Some(netns) = &self.netns {
            args.push("--netns".to_string());
            args.push(netns.display().to_string());
        }

        if self.daemonize {
            args.push("--daemonize".to_string());
        }

        args.push("--".to_string());
        args.push("--api-sock".to_string());
        args.push(JAILED_SOCKET_PATH.to_string());

        args
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jailer_params_args() {
        let mut params = JailerParams {
            uid: 123,
            gid: 100,
            numa_node: None,
            id: "vm-1".into(),
            exec_file: "/usr/bin/firecracker".into(),
            jailer_binary: "/usr/bin/jailer".into(),
            chroot_base: "/srv/jailer".into(),
            daemonize: false,
            cgroup_version: "2".into(),
            stdio: StdioWiring::Log,
            netns: None,
        };

        assert_eq!(
            params.args().join(" "),
            "--id vm-1 --uid 123 --gid 100 --exec-file /usr/bin/firecracker \
             --chroot-base-dir /srv/jailer --cgroup-version 2 -- --api-sock /run/firecracker.socket"
        );

        params.numa_node = Some(0);
        params.netns = Some("/var/run/netns/vm-1".into());
        params.daemonize = true;

        let args = params.args().join(" ");
        assert!(args.contains("--cgroup cpuset.mems=0"));
        assert!(args.contains("--netns /var/run/netns/vm-1"));
        assert!(args.contains("--daemonize -- --api-sock"));
    }
}
