use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    api::Drive,
    config::ROOT_DRIVE_ID,
    FirewardError, FirewardResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const RW_SUFFIX: &str = ":rw";

const RO_SUFFIX: &str = ":ro";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A drive given as `path:rw` or `path:ro`.
///
/// ## Examples
///
/// ```
/// use fireward::launch::DriveSpec;
///
/// let drive = "/data.img:ro".parse::<DriveSpec>().unwrap();
/// assert!(drive.read_only);
/// assert_eq!(drive.to_string(), "/data.img:ro");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSpec {
    /// Host path of the backing file.
    pub path: PathBuf,

    /// Whether the guest sees the drive read-only.
    pub read_only: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses the additional drives, assigning ids `2, 3, ...` in input order.
///
/// Every backing file must exist.
pub fn parse_drives(entries: &[String]) -> FirewardResult<Vec<Drive>> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let spec = entry.parse::<DriveSpec>()?;
            ensure_exists(&spec.path)?;

            Ok(Drive {
                drive_id: (i as u32 + ROOT_DRIVE_ID + 1).to_string(),
                path_on_host: spec.path,
                is_read_only: spec.read_only,
                is_root_device: false,
                partuuid: None,
            })
        })
        .collect()
}

/// Builds the root drive from the root filesystem path.
///
/// A `:ro` suffix makes it read-only. A `:rw` suffix or no suffix at all makes it writable.
pub fn root_drive(entry: &str, partuuid: Option<String>) -> FirewardResult<Drive> {
    let (path, read_only) = match entry.strip_suffix(RO_SUFFIX) {
        Some(path) => (path, true),
        None => (entry.strip_suffix(RW_SUFFIX).unwrap_or(entry), false),
    };

    if path.is_empty() {
        return Err(FirewardError::MissingDrivePath(entry.to_string()));
    }

    let path = PathBuf::from(path);
    ensure_exists(&path)?;

    Ok(Drive {
        drive_id: ROOT_DRIVE_ID.to_string(),
        path_on_host: path,
        is_read_only: read_only,
        is_root_device: true,
        partuuid,
    })
}

pub(crate) fn ensure_exists(path: &Path) -> FirewardResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(FirewardError::ResourceNotFound(path.to_path_buf()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for DriveSpec {
    type Err = FirewardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, read_only) = if let Some(path) = s.strip_suffix(RW_SUFFIX) {
            (path, false)
        } else if let Some(path) = s.strip_suffix(RO_SUFFIX) {
            (path, true)
        } else {
            return Err(FirewardError::MissingDriveSuffix(s.to_string()));
        };

        if path.is_empty() {
            return Err(FirewardError::MissingDrivePath(s.to_string()));
        }

        Ok(Self {
            path: path.into(),
            read_only,
        })
    }
}

impl fmt::Display for DriveSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.read_only { RO_SUFFIX } else { RW_SUFFIX };
        write!(f, "{}{}", self.path.display(), suffix)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
