use std::{fs, io, os::unix::fs::MetadataExt, path::Path};

use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
};

use crate::{FirewardError, FirewardResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates a named network namespace pinned by a bind mount at `path`.
///
/// The namespace is entered on a dedicated thread that exits right after the bind mount, so no
/// runtime thread ever leaves the host namespace.
pub async fn create_netns(path: &Path) -> FirewardResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await?;

    let target = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::thread::spawn(move || -> FirewardResult<()> {
            unshare(CloneFlags::CLONE_NEWNET)?;
            mount(
                Some("/proc/thread-self/ns/net"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            Ok(())
        })
        .join()
        .map_err(|_| FirewardError::Cni("network namespace thread panicked".to_string()))?
    })
    .await?;

    if let Err(e) = result {
        let _ = fs::remove_file(path);
        return Err(e);
    }

    tracing::debug!("created network namespace {}", path.display());
    Ok(())
}

/// Unmounts and removes a named network namespace. A namespace that is already gone is fine.
pub fn remove_netns(path: &Path) -> FirewardResult<()> {
    if is_mount_point(path) {
        match umount2(path, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(e) => return Err(e.into()),
        }
    }

    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("removed network namespace {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A bind-mounted namespace lives on `nsfs`, a different device than its directory.
fn is_mount_point(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };

    match (fs::metadata(path), fs::metadata(parent)) {
        (Ok(file), Ok(dir)) => file.dev() != dir.dev(),
        _ => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
