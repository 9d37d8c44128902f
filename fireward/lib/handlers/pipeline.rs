use std::fmt;

use crate::config::MetadataConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Validates the launch specification.
pub const VALIDATE_CONFIG: &str = "validate_config";

/// Creates the network namespace and runs the network plugins.
pub const SETUP_NETWORK: &str = "setup_network";

/// Adds the guest IP configuration to the kernel command line.
pub const SETUP_KERNEL_ARGS: &str = "setup_kernel_args";

/// Spawns the jailer and waits for the control socket.
pub const START_VMM: &str = "start_vmm";

/// Creates the log and metrics pipes.
pub const CREATE_LOG_FILES: &str = "create_log_files";

/// Points the hypervisor logger and metrics at their pipes.
pub const BOOTSTRAP_LOGGING: &str = "bootstrap_logging";

/// Sets vCPU and memory sizing.
pub const CREATE_MACHINE: &str = "create_machine";

/// Sets the kernel image and command line.
pub const CREATE_BOOT_SOURCE: &str = "create_boot_source";

/// Attaches the block devices.
pub const ATTACH_DRIVES: &str = "attach_drives";

/// Attaches the network interfaces.
pub const CREATE_NETWORK_INTERFACES: &str = "create_network_interfaces";

/// Attaches the vsock devices.
pub const ADD_VSOCKS: &str = "add_vsocks";

/// Enables the metadata service.
pub const CONFIG_MMDS: &str = "config_mmds";

/// Boots the guest.
pub const START_INSTANCE: &str = "start_instance";

/// Links the kernel and drives into the chroot.
pub const LINK_FILES: &str = "link_files";

/// Delivers the request metadata over the metadata channel.
pub const SET_METADATA: &str = "set_metadata";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A named step of the boot sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    name: String,
    action: HandlerAction,
}

/// What a [`Handler`] does when it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerAction {
    /// See [`VALIDATE_CONFIG`].
    ValidateConfig,

    /// See [`SETUP_NETWORK`].
    SetupNetwork,

    /// See [`SETUP_KERNEL_ARGS`].
    SetupKernelArgs,

    /// See [`START_VMM`].
    StartVmm,

    /// See [`CREATE_LOG_FILES`].
    CreateLogFiles,

    /// See [`BOOTSTRAP_LOGGING`].
    BootstrapLogging,

    /// See [`CREATE_MACHINE`].
    CreateMachine,

    /// See [`CREATE_BOOT_SOURCE`].
    CreateBootSource,

    /// See [`ATTACH_DRIVES`].
    AttachDrives,

    /// See [`CREATE_NETWORK_INTERFACES`].
    CreateNetworkInterfaces,

    /// See [`ADD_VSOCKS`].
    AddVsocks,

    /// See [`CONFIG_MMDS`].
    ConfigMmds,

    /// See [`START_INSTANCE`].
    StartInstance,

    /// Links the kernel image, saved under `kernel_file_name`, and every drive into the chroot.
    LinkFiles {
        /// File name of the kernel image inside the chroot.
        kernel_file_name: String,
    },

    /// Delivers a payload over the metadata channel.
    SetMetadata(MetadataConfig),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Handler {
    /// Creates a handler.
    pub fn new(name: impl Into<String>, action: HandlerAction) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    /// Creates the handler linking boot artifacts into the chroot.
    pub fn link_files(kernel_file_name: impl Into<String>) -> Self {
        Self::new(
            LINK_FILES,
            HandlerAction::LinkFiles {
                kernel_file_name: kernel_file_name.into(),
            },
        )
    }

    /// Creates the handler delivering `metadata` to the guest.
    pub fn set_metadata(metadata: MetadataConfig) -> Self {
        Self::new(SET_METADATA, HandlerAction::SetMetadata(metadata))
    }

    /// Returns the name of the handler.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the action of the handler.
    pub fn action(&self) -> &HandlerAction {
        &self.action
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the boot sequence of a jailed hypervisor, before any placement.
pub fn base_pipeline() -> Vec<Handler> {
    vec![
        Handler::new(VALIDATE_CONFIG, HandlerAction::ValidateConfig),
        Handler::new(SETUP_NETWORK, HandlerAction::SetupNetwork),
        Handler::new(SETUP_KERNEL_ARGS, HandlerAction::SetupKernelArgs),
        Handler::new(START_VMM, HandlerAction::StartVmm),
        Handler::new(CREATE_LOG_FILES, HandlerAction::CreateLogFiles),
        Handler::new(BOOTSTRAP_LOGGING, HandlerAction::BootstrapLogging),
        Handler::new(CREATE_MACHINE, HandlerAction::CreateMachine),
        Handler::new(CREATE_BOOT_SOURCE, HandlerAction::CreateBootSource),
        Handler::new(ATTACH_DRIVES, HandlerAction::AttachDrives),
        Handler::new(CREATE_NETWORK_INTERFACES, HandlerAction::CreateNetworkInterfaces),
        Handler::new(ADD_VSOCKS, HandlerAction::AddVsocks),
        Handler::new(CONFIG_MMDS, HandlerAction::ConfigMmds),
        Handler::new(START_INSTANCE, HandlerAction::StartInstance),
    ]
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
