use std::{
    io,
    path::{Path, PathBuf},
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{FirewardError, FirewardResult};

use super::{
    JailerConfig, StdioWiring, CHROOT_ROOT_DIR, MAX_INSTANCE_ID_LEN, SOCKET_PATH_IN_CHROOT,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Identity and location of a jailed hypervisor.
///
/// The jailer creates the chroot at `chroot_base / basename(exec_file) / id / root` when it
/// starts. Path derivation is pure; [`socket_exists`](SandboxDescriptor::socket_exists) and
/// [`remove`](SandboxDescriptor::remove) are the only operations touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxDescriptor {
    /// The uid the hypervisor runs as.
    #[builder(default, setter(strip_option))]
    uid: Option<u32>,

    /// The gid the hypervisor runs as.
    #[builder(default, setter(strip_option))]
    gid: Option<u32>,

    /// The NUMA node the hypervisor is pinned to.
    #[builder(default, setter(strip_option))]
    numa_node: Option<u32>,

    /// The instance id.
    #[builder(setter(into))]
    id: String,

    /// The hypervisor executable run inside the jail.
    #[builder(setter(into))]
    exec_file: PathBuf,

    /// The jailer executable.
    #[builder(setter(into))]
    jailer_binary: PathBuf,

    /// The base directory of all chroots.
    #[builder(setter(into))]
    chroot_base: PathBuf,

    /// Whether the jailer daemonizes the hypervisor.
    #[builder(default)]
    daemonize: bool,

    /// The cgroup version passed to the jailer.
    #[builder(default = super::DEFAULT_CGROUP_VERSION.to_string(), setter(into))]
    cgroup_version: String,

    /// How the hypervisor's standard streams are wired.
    #[builder(default)]
    stdio: StdioWiring,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxDescriptor {
    /// Creates a descriptor for instance `id` from the jailer configuration.
    ///
    /// A non-empty `chroot_base` overrides the configured one.
    pub fn from_config(config: &JailerConfig, id: impl Into<String>, chroot_base: Option<&Path>) -> Self {
        Self {
            uid: config.uid,
            gid: config.gid,
            numa_node: config.numa_node,
            id: id.into(),
            exec_file: config.firecracker_binary.clone(),
            jailer_binary: config.binary.clone(),
            chroot_base: chroot_base
                .filter(|base| !base.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| config.chroot_base.clone()),
            daemonize: config.daemonize,
            cgroup_version: config.cgroup_version.clone(),
            stdio: config.stdio,
        }
    }

    /// Returns the name of the hypervisor executable.
    pub fn exec_file_name(&self) -> String {
        self.exec_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Returns the per-instance directory, `chroot_base / exec / id`.
    pub fn instance_dir(&self) -> PathBuf {
        self.chroot_base.join(self.exec_file_name()).join(&self.id)
    }

    /// Returns the chroot directory, `chroot_base / exec / id / root`.
    pub fn chroot_dir(&self) -> PathBuf {
        self.instance_dir().join(CHROOT_ROOT_DIR)
    }

    /// Returns the host path of the control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.chroot_dir().join(SOCKET_PATH_IN_CHROOT)
    }

    /// Returns the host path of a file placed at `relative` inside the chroot.
    pub fn path_in_chroot(&self, relative: impl AsRef<Path>) -> PathBuf {
        let relative = relative.as_ref();
        self.chroot_dir()
            .join(relative.strip_prefix("/").unwrap_or(relative))
    }

    /// Checks whether the control socket exists.
    ///
    /// A missing socket is `Ok(false)`. Any other stat failure is an error.
    pub fn socket_exists(&self) -> FirewardResult<bool> {
        match std::fs::symlink_metadata(self.socket_path()) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Fails with the first unset required field among uid, gid and id.
    ///
    /// The id must also be one the jailer accepts: up to 64 ASCII alphanumerics and hyphens. Any
    /// other id could name a path outside the chroot base.
    pub fn validate(&self) -> FirewardResult<()> {
        if self.uid.is_none() {
            return Err(FirewardError::Validation("uid must be set".to_string()));
        }

        if self.gid.is_none() {
            return Err(FirewardError::Validation("gid must be set".to_string()));
        }

        if self.id.is_empty() {
            return Err(FirewardError::Validation("id must be set".to_string()));
        }

        validate_id(&self.id)
    }

    /// Removes the instance directory recursively.
    ///
    /// Removing a directory that does not exist is not an error. An id the jailer would reject
    /// is refused before anything is touched.
    pub fn remove(&self) -> FirewardResult<()> {
        validate_id(&self.id)?;

        let dir = self.instance_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("removed sandbox directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that `id` is a valid jailer instance id.
pub fn validate_id(id: &str) -> FirewardResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_INSTANCE_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');

    if !valid {
        return Err(FirewardError::Validation(format!(
            "invalid id {id:?}: expected 1 to {MAX_INSTANCE_ID_LEN} alphanumeric characters or hyphens"
        )));
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
