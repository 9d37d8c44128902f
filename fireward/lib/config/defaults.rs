use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default port for the HTTP server.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default address the HTTP server binds to.
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";

/// Environment variable that overrides the server port.
pub const PORT_ENV_VAR: &str = "PORT";

/// Environment variable pointing at the configuration file.
pub const CONFIG_PATH_ENV_VAR: &str = "FIREWARD_CONFIG";

/// Environment variable selecting the deployment environment. `PROD` tightens log levels.
pub const DEPLOY_ENV_VAR: &str = "ENV";

/// The value of [`DEPLOY_ENV_VAR`] that marks a production deployment.
pub const PROD_ENV: &str = "PROD";

/// Default path of the jailer binary.
pub const DEFAULT_JAILER_BINARY: &str = "/usr/bin/jailer";

/// Default path of the firecracker binary.
pub const DEFAULT_FIRECRACKER_BINARY: &str = "/usr/bin/firecracker";

/// Default chroot base directory used by the jailer.
pub const DEFAULT_CHROOT_BASE: &str = "/srv/jailer";

/// Default cgroup version passed to the jailer.
pub const DEFAULT_CGROUP_VERSION: &str = "2";

/// Directory name under the instance directory that the jailer chroots into.
pub const CHROOT_ROOT_DIR: &str = "root";

/// Path of the API socket relative to the chroot root.
pub const SOCKET_PATH_IN_CHROOT: &str = "run/firecracker.socket";

/// Path of the API socket as seen by the jailed hypervisor.
pub const JAILED_SOCKET_PATH: &str = "/run/firecracker.socket";

/// Default CNI plugin binaries directory.
pub const DEFAULT_CNI_BIN_DIR: &str = "/opt/cni/bin";

/// Default CNI configuration directory.
pub const DEFAULT_CNI_CONF_DIR: &str = "/etc/cni/conf.d";

/// Default CNI cache directory.
pub const DEFAULT_CNI_CACHE_DIR: &str = "/var/lib/cni";

/// Default directory holding named network namespaces.
pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

/// Default kernel command line.
pub const DEFAULT_KERNEL_ARGS: &str = "noapic reboot=k panic=1 pci=off nomodules nosmt=force l1tf=full,force 8250.nr_uarts=0 quiet loglevel=1 rw";

/// Kernel argument appended when debug is enabled.
pub const DEBUG_CONSOLE_KERNEL_ARG: &str = "console=ttyS0";

/// Default graceful shutdown timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default graceful shutdown timeout used by detached stop requests.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time to wait for the API socket to accept connections.
pub const DEFAULT_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default hypervisor log level.
pub const DEFAULT_VMM_LOG_LEVEL: &str = "Info";

/// Hypervisor log levels accepted by the machine configuration.
pub const VMM_LOG_LEVELS: [&str; 4] = ["Error", "Warning", "Info", "Debug"];

/// Minimum number of vCPUs.
pub const MIN_VCPUS: u32 = 1;

/// Minimum amount of memory in MiB.
pub const MIN_MEM_MIB: u32 = 128;

/// Prefix of generated network interface names.
pub const VETH_IFACE_PREFIX: &str = "veth";

/// Length of the random suffix of generated network interface names.
pub const VETH_IFACE_SUFFIX_LEN: usize = 11;

/// Prefix of the private temporary directories holding synthesized pipes.
pub const FIFO_TEMP_DIR_PREFIX: &str = "fcfifo";

/// File name of a synthesized log pipe.
pub const LOG_FIFO_NAME: &str = "fc_fifo";

/// File name of a synthesized metrics pipe.
pub const METRICS_FIFO_NAME: &str = "fc_metrics_fifo";

/// Longest instance id the jailer accepts.
pub const MAX_INSTANCE_ID_LEN: usize = 64;

/// Drive id reserved for the root device.
pub const ROOT_DRIVE_ID: u32 = 1;

/// Interface id of the first network interface.
pub const FIRST_IFACE_ID: &str = "1";

/// Name of the guest-side network device.
pub const GUEST_DEVICE_NAME: &str = "eth0";
