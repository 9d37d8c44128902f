use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{DEFAULT_CNI_BIN_DIR, DEFAULT_CNI_CACHE_DIR, DEFAULT_CNI_CONF_DIR, DEFAULT_NETNS_DIR};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Directories used by the network plugin protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CniConfig {
    /// Directory holding the plugin binaries.
    pub bin_dir: PathBuf,

    /// Directory holding network configuration lists.
    pub conf_dir: PathBuf,

    /// Directory where plugin results are cached between `ADD` and `DEL`.
    pub cache_dir: PathBuf,

    /// Directory holding named network namespaces.
    pub netns_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CniConfig {
    /// Returns the path of the cached result for an attachment.
    pub fn result_cache_path(&self, network: &str, container_id: &str, ifname: &str) -> PathBuf {
        self.cache_dir
            .join("results")
            .join(format!("{network}-{container_id}-{ifname}"))
    }

    /// Returns the path of the named network namespace of an instance.
    pub fn netns_path(&self, id: &str) -> PathBuf {
        self.netns_dir.join(id)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            bin_dir: DEFAULT_CNI_BIN_DIR.into(),
            conf_dir: DEFAULT_CNI_CONF_DIR.into(),
            cache_dir: DEFAULT_CNI_CACHE_DIR.into(),
            netns_dir: DEFAULT_NETNS_DIR.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cni_config_derived_paths() {
        let config = CniConfig::default();

        assert_eq!(
            config.result_cache_path("testnet", "abc", "veth0"),
            PathBuf::from("/var/lib/cni/results/testnet-abc-veth0")
        );
        assert_eq!(
            config.netns_path("abc"),
            PathBuf::from("/var/run/netns/abc")
        );
    }
}
