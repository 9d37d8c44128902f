use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::FirewardResult;

use super::{
    CniConfig, CONFIG_PATH_ENV_VAR, DEFAULT_CGROUP_VERSION, DEFAULT_CHROOT_BASE,
    DEFAULT_FIRECRACKER_BINARY, DEFAULT_JAILER_BINARY, DEFAULT_KERNEL_ARGS, DEFAULT_SERVER_HOST,
    DEFAULT_SERVER_PORT, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SOCKET_WAIT_TIMEOUT,
    DEFAULT_VMM_LOG_LEVEL, DEPLOY_ENV_VAR, PORT_ENV_VAR, PROD_ENV,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The service configuration.
///
/// Loaded once at startup and then passed by reference into every component. Nothing in the
/// crate mutates it after loading.
///
/// ## Examples
///
/// ```toml
/// [server]
/// port = 9000
///
/// [jailer]
/// chroot_base = "/srv/jailer"
/// uid = 123
/// gid = 100
///
/// [machine]
/// shutdown_timeout = 10
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewardConfig {
    /// HTTP server settings.
    pub server: ServerConfig,

    /// Jailer settings.
    pub jailer: JailerConfig,

    /// Network plugin settings.
    pub cni: CniConfig,

    /// Machine defaults.
    pub machine: MachineDefaults,

    /// Logging settings.
    pub log: LogConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to bind.
    pub host: String,

    /// The port to bind.
    pub port: u16,
}

/// Jailer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JailerConfig {
    /// Path of the jailer binary.
    pub binary: PathBuf,

    /// Path of the firecracker binary executed inside the jail.
    pub firecracker_binary: PathBuf,

    /// Base directory of all chroots.
    pub chroot_base: PathBuf,

    /// The uid the hypervisor runs as.
    pub uid: Option<u32>,

    /// The gid the hypervisor runs as.
    pub gid: Option<u32>,

    /// The NUMA node the hypervisor is pinned to.
    pub numa_node: Option<u32>,

    /// Whether the jailer daemonizes the hypervisor.
    pub daemonize: bool,

    /// The cgroup version passed to the jailer.
    pub cgroup_version: String,

    /// How the hypervisor's standard streams are wired.
    pub stdio: StdioWiring,
}

/// How the standard streams of the sandboxed process are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioWiring {
    /// Lines are forwarded to the service log.
    #[default]
    Log,

    /// The streams of the service are inherited.
    Inherit,
}

/// Machine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineDefaults {
    /// The kernel command line.
    pub kernel_args: String,

    /// Graceful shutdown timeout in seconds.
    pub shutdown_timeout: u64,

    /// How long to wait for the API socket, in seconds.
    pub socket_wait_timeout: u64,

    /// The hypervisor log level.
    pub log_level: String,

    /// Keep the sandbox directory when a detached stop sequence fails.
    pub preserve_sandbox_on_failure: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level. When unset the level depends on the deployment environment.
    pub level: Option<String>,

    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirewardConfig {
    /// Loads the configuration.
    ///
    /// The file is looked up at `path`, then at the path in `FIREWARD_CONFIG`. When neither is
    /// given the defaults are used. The `PORT` environment variable overrides the server port.
    pub fn load(path: Option<&Path>) -> FirewardResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_ENV_VAR).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                tracing::info!("loading configuration from {}", path.display());
                let contents = std::fs::read_to_string(&path)?;
                toml::from_str(&contents)?
            }
            None => FirewardConfig::default(),
        };

        if let Some(port) = env::var(PORT_ENV_VAR).ok().and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }

        Ok(config)
    }
}

impl MachineDefaults {
    /// Returns the graceful shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Returns the API socket wait timeout.
    pub fn socket_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_wait_timeout)
    }
}

impl LogConfig {
    /// Returns the effective log level, `error` in production and `debug` otherwise unless one is
    /// configured.
    pub fn effective_level(&self) -> String {
        if let Some(level) = &self.level {
            return level.clone();
        }

        if is_production() {
            "error".to_string()
        } else {
            "debug".to_string()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `true` when the service runs in a production deployment.
pub fn is_production() -> bool {
    env::var(DEPLOY_ENV_VAR).is_ok_and(|env| env == PROD_ENV)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl Default for JailerConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_JAILER_BINARY.into(),
            firecracker_binary: DEFAULT_FIRECRACKER_BINARY.into(),
            chroot_base: DEFAULT_CHROOT_BASE.into(),
            uid: Some(0),
            gid: Some(0),
            numa_node: None,
            daemonize: false,
            cgroup_version: DEFAULT_CGROUP_VERSION.to_string(),
            stdio: StdioWiring::default(),
        }
    }
}

impl Default for MachineDefaults {
    fn default() -> Self {
        Self {
            kernel_args: DEFAULT_KERNEL_ARGS.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            socket_wait_timeout: DEFAULT_SOCKET_WAIT_TIMEOUT.as_secs(),
            log_level: DEFAULT_VMM_LOG_LEVEL.to_string(),
            preserve_sandbox_on_failure: false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
