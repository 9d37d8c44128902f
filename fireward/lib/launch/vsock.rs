use std::{fmt, path::PathBuf, str::FromStr};

use crate::{api::Vsock, FirewardError, FirewardResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A vsock device given as `path:CID`.
///
/// ## Examples
///
/// ```
/// use fireward::launch::VsockSpec;
///
/// let vsock = "/tmp/v.sock:3".parse::<VsockSpec>().unwrap();
/// assert_eq!(vsock.cid, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockSpec {
    /// Host path of the backing unix socket.
    pub path: PathBuf,

    /// Guest context identifier.
    pub cid: u32,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses every vsock entry. Nothing is returned unless all of them parse.
pub fn parse_vsocks(entries: &[String]) -> FirewardResult<Vec<Vsock>> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let spec = entry.parse::<VsockSpec>()?;
            Ok(Vsock {
                vsock_id: format!("vsock{i}"),
                guest_cid: spec.cid,
                uds_path: spec.path,
            })
        })
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for VsockSpec {
    type Err = FirewardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [path, cid] = fields.as_slice() else {
            return Err(FirewardError::VsockFormat(s.to_string()));
        };

        if path.is_empty() || cid.is_empty() {
            return Err(FirewardError::VsockFormat(s.to_string()));
        }

        let cid = cid
            .parse::<u32>()
            .map_err(|_| FirewardError::VsockCid(cid.to_string()))?;

        Ok(Self {
            path: path.into(),
            cid,
        })
    }
}

impl fmt::Display for VsockSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.cid)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
