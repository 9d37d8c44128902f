use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{FirewardError, FirewardResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A host architecture with a known stop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    /// Stopped with an in-band Ctrl+Alt+Del.
    #[serde(rename = "x86_64")]
    X86_64,

    /// Stopped through the metadata channel.
    #[serde(rename = "aarch64")]
    Aarch64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Arch {
    /// Returns the architecture of the running host.
    pub fn host() -> FirewardResult<Self> {
        std::env::consts::ARCH.parse()
    }

    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Arch {
    type Err = FirewardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            other => Err(FirewardError::UnsupportedArch(other.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
