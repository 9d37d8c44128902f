use rand::{distr::Alphanumeric, Rng};

use crate::{
    api::{MachineConfiguration, MmdsVersion, RateLimiter},
    config::{
        MachineSpec, SandboxDescriptor, DEBUG_CONSOLE_KERNEL_ARG, VETH_IFACE_PREFIX,
        VETH_IFACE_SUFFIX_LEN,
    },
    FirewardError, FirewardResult,
};

use super::{
    drive::ensure_exists, parse_drives, parse_vsocks, resolve_log_pipes, root_drive, JailerParams,
    LaunchSpec, NetworkInterfaceSpec, ScopedResources,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LaunchSpec {
    /// Translates a machine specification and a sandbox into a launch specification.
    ///
    /// Fails without leaving anything behind: resources synthesized before a failure are
    /// released before returning.
    pub fn build(machine: &MachineSpec, sandbox: &SandboxDescriptor) -> FirewardResult<Self> {
        sandbox.validate()?;

        let mut kernel_args = machine.get_kernel_args().clone();
        if *machine.get_debug() {
            kernel_args.push(' ');
            kernel_args.push_str(DEBUG_CONSOLE_KERNEL_ARG);
        }

        let network_interfaces = vec![network_interface(machine.get_network_name())?];

        let mut drives = vec![root_drive(
            machine.get_root_drive_path(),
            machine.get_root_partuuid().clone(),
        )?];
        drives.extend(parse_drives(machine.get_additional_drives())?);

        let vsock_devices = parse_vsocks(machine.get_vsock_devices())?;

        ensure_exists(machine.get_kernel_path())?;

        let mut resources = ScopedResources::new();
        let pipes = resolve_log_pipes(
            machine.get_log_fifo().as_deref(),
            machine.get_metrics_fifo().as_deref(),
            machine.get_fifo_log_file().as_deref(),
            &mut resources,
        )?;

        let jailer = JailerParams {
            uid: sandbox.get_uid().unwrap_or_default(),
            gid: sandbox.get_gid().unwrap_or_default(),
            numa_node: *sandbox.get_numa_node(),
            id: sandbox.get_id().clone(),
            exec_file: sandbox.get_exec_file().clone(),
            jailer_binary: sandbox.get_jailer_binary().clone(),
            chroot_base: sandbox.get_chroot_base().clone(),
            daemonize: *sandbox.get_daemonize(),
            cgroup_version: sandbox.get_cgroup_version().clone(),
            stdio: *sandbox.get_stdio(),
            netns: None,
        };

        tracing::debug!(
            "built launch spec for {} with {} drives and interface {}",
            sandbox.get_id(),
            drives.len(),
            network_interfaces[0].if_name
        );

        Ok(LaunchSpec {
            id: sandbox.get_id().clone(),
            sandbox: sandbox.clone(),
            jailer,
            kernel_image_path: machine.get_kernel_path().clone(),
            kernel_args,
            drives,
            network_interfaces,
            vsock_devices,
            pipes,
            log_level: machine.get_log_level().clone(),
            machine_config: MachineConfiguration {
                vcpu_count: *machine.get_vcpu_count(),
                mem_size_mib: *machine.get_mem_size_mib(),
                smt: *machine.get_smt(),
                cpu_template: machine.get_cpu_template().clone(),
            },
            mmds_version: MmdsVersion::V2,
            metadata: machine.get_metadata().clone(),
            ip_address: machine.get_ip_address().clone(),
            shutdown_timeout: *machine.get_shutdown_timeout(),
            socket_wait_timeout: *machine.get_socket_wait_timeout(),
            resources,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a host interface name unlikely to collide with concurrently starting instances.
pub fn generate_iface_name() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(VETH_IFACE_SUFFIX_LEN)
        .map(char::from)
        .collect();

    format!("{VETH_IFACE_PREFIX}{suffix}")
}

fn network_interface(network_name: &str) -> FirewardResult<NetworkInterfaceSpec> {
    if network_name.is_empty() {
        return Err(FirewardError::Config("network name required".to_string()));
    }

    Ok(NetworkInterfaceSpec {
        network_name: network_name.to_string(),
        if_name: generate_iface_name(),
        allow_mmds: true,
        in_rate_limiter: RateLimiter::disabled(),
        out_rate_limiter: RateLimiter::disabled(),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
