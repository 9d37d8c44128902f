use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Stdio,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{config::CniConfig, FirewardError, FirewardResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A network configuration list, the unit the plugins are run for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigList {
    /// Version of the plugin protocol.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    /// Name of the network.
    pub name: String,

    /// Plugin configurations, run in order on `ADD` and in reverse on `DEL`.
    pub plugins: Vec<Value>,
}

/// The result document of a successful `ADD`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniResult {
    /// Version of the plugin protocol.
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,

    /// Interfaces created by the plugins.
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,

    /// IP configurations assigned by the plugins.
    #[serde(default)]
    pub ips: Vec<CniIp>,

    /// Everything else the plugins returned.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An interface of a [`CniResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniInterface {
    /// Interface name.
    pub name: String,

    /// MAC address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// Namespace path (or VM id) the interface lives in. Empty for host interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// An IP configuration of a [`CniResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniIp {
    /// Address in CIDR notation.
    pub address: String,

    /// Gateway address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into [`CniResult::interfaces`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Static IPv4 configuration of the guest, derived from a [`CniResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpConfiguration {
    /// Guest address.
    pub address: Ipv4Addr,

    /// Netmask.
    pub netmask: Ipv4Addr,

    /// Gateway.
    pub gateway: Option<Ipv4Addr>,
}

/// The host side of a guest network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapDevice {
    /// Name of the tap device inside the namespace.
    pub name: String,

    /// MAC address handed to the guest.
    pub guest_mac: Option<String>,
}

/// The error document of a failing plugin.
#[derive(Debug, Clone, Default, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,

    #[serde(default)]
    msg: String,

    #[serde(default)]
    details: String,
}

/// Runs the network plugins found in the configured directories.
#[derive(Debug, Clone)]
pub struct CniRuntime {
    config: CniConfig,
}

/// One interface attachment, as needed to run `ADD` and `DEL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniAttachmentParams {
    /// Name of the network.
    pub network_name: String,

    /// The container id, i.e. the instance id.
    pub container_id: String,

    /// Network namespace path.
    pub netns: PathBuf,

    /// Interface name.
    pub if_name: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CniRuntime {
    /// Creates a runtime over the configured directories.
    pub fn new(config: CniConfig) -> Self {
        Self { config }
    }

    /// Returns the directories used by this runtime.
    pub fn config(&self) -> &CniConfig {
        &self.config
    }

    /// Runs `ADD` for every plugin of the network and caches the final result.
    pub async fn add(&self, params: &CniAttachmentParams) -> FirewardResult<CniResult> {
        let list = load_conflist(&self.config.conf_dir, &params.network_name).await?;

        let mut prev_result: Option<Value> = None;
        for plugin in &list.plugins {
            let output = self.exec_plugin("ADD", &list, plugin, prev_result.as_ref(), params).await?;
            prev_result = Some(serde_json::from_slice(&output)?);
        }

        let raw = prev_result.unwrap_or(Value::Null);
        let cache_path = self.cache_path(params);
        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&cache_path, serde_json::to_vec(&raw)?).await?;

        tracing::info!(
            "attached {} to network {} for {}",
            params.if_name,
            params.network_name,
            params.container_id
        );

        Ok(serde_json::from_value(raw)?)
    }

    /// Runs `DEL` for every plugin of the network, in reverse order, then drops the cached
    /// result.
    ///
    /// Every plugin is given a chance to clean up; the first failure is returned.
    pub async fn del(&self, params: &CniAttachmentParams) -> FirewardResult<()> {
        let list = load_conflist(&self.config.conf_dir, &params.network_name).await?;

        let cache_path = self.cache_path(params);
        let prev_result: Option<Value> = match tokio::fs::read(&cache_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        };

        let mut first_error = None;
        for plugin in list.plugins.iter().rev() {
            if let Err(e) = self
                .exec_plugin("DEL", &list, plugin, prev_result.as_ref(), params)
                .await
            {
                tracing::warn!("network plugin DEL failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match tokio::fs::remove_file(&cache_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove {}: {}", cache_path.display(), e),
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn cache_path(&self, params: &CniAttachmentParams) -> PathBuf {
        self.config
            .result_cache_path(&params.network_name, &params.container_id, &params.if_name)
    }

    async fn exec_plugin(
        &self,
        command: &str,
        list: &NetworkConfigList,
        plugin: &Value,
        prev_result: Option<&Value>,
        params: &CniAttachmentParams,
    ) -> FirewardResult<Vec<u8>> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FirewardError::Cni(format!("plugin of {} has no type", list.name)))?;

        let mut conf = plugin.clone();
        if let Value::Object(map) = &mut conf {
            map.insert("name".into(), Value::String(list.name.clone()));
            map.insert("cniVersion".into(), Value::String(list.cni_version.clone()));
            if let Some(prev) = prev_result {
                map.insert("prevResult".into(), prev.clone());
            }
        }

        let binary = self.config.bin_dir.join(plugin_type);
        tracing::debug!("running network plugin {} {}", binary.display(), command);

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &params.container_id)
            .env("CNI_NETNS", &params.netns)
            .env("CNI_IFNAME", &params.if_name)
            .env("CNI_PATH", &self.config.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                FirewardError::Cni(format!("failed to run plugin {}: {}", binary.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(&conf)?).await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let err: PluginError = serde_json::from_slice(&output.stdout).unwrap_or_else(|_| PluginError {
            msg: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ..Default::default()
        });

        Err(FirewardError::Cni(format!(
            "plugin {} {} failed with code {}: {} {}",
            plugin_type, command, err.code, err.msg, err.details
        )))
    }
}

impl CniResult {
    /// Returns the first IPv4 configuration.
    pub fn ipv4(&self) -> Option<IpConfiguration> {
        self.ips.iter().find_map(|ip| {
            let (address, prefix) = ip.address.split_once('/')?;
            let address = address.parse::<Ipv4Addr>().ok()?;
            let prefix = prefix.parse::<u32>().ok().filter(|p| *p <= 32)?;
            let netmask = match prefix {
                0 => Ipv4Addr::UNSPECIFIED,
                p => Ipv4Addr::from(u32::MAX << (32 - p)),
            };
            let gateway = ip.gateway.as_deref().and_then(|g| g.parse().ok());

            Some(IpConfiguration {
                address,
                netmask,
                gateway,
            })
        })
    }

    /// Finds the tap device inside `netns` and the MAC reserved for VM `vm_id`.
    ///
    /// Falls back to an interface named `if_name` when no plugin created a dedicated tap.
    pub fn tap_device(&self, vm_id: &str, netns: &Path, if_name: &str) -> TapDevice {
        let netns = netns.to_string_lossy();
        let in_sandbox = |iface: &&CniInterface, sandbox: &str| iface.sandbox.as_deref() == Some(sandbox);

        let guest_mac = self
            .interfaces
            .iter()
            .find(|iface| in_sandbox(iface, vm_id))
            .and_then(|iface| iface.mac.clone());

        let name = self
            .interfaces
            .iter()
            .find(|iface| in_sandbox(iface, &netns) && iface.name != if_name)
            .map(|iface| iface.name.clone())
            .unwrap_or_else(|| if_name.to_string());

        TapDevice { name, guest_mac }
    }
}

impl IpConfiguration {
    /// Returns the kernel argument configuring the guest device statically.
    pub fn kernel_arg(&self, device: &str) -> String {
        let gateway = self.gateway.map(|g| g.to_string()).unwrap_or_default();
        format!(
            "ip={}::{}:{}::{}:off",
            self.address, gateway, self.netmask, device
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Finds the configuration of network `name` in `conf_dir`.
///
/// `*.conflist` files are taken as they are. Single plugin `*.conf` and `*.json` files are
/// promoted to a list of one.
pub async fn load_conflist(conf_dir: &Path, name: &str) -> FirewardResult<NetworkConfigList> {
    let mut entries = tokio::fs::read_dir(conf_dir).await.map_err(|e| {
        FirewardError::Cni(format!(
            "failed to read network configuration directory {}: {}",
            conf_dir.display(),
            e
        ))
    })?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        files.push(entry.path());
    }
    files.sort();

    for path in files {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let contents = match extension {
            "conflist" | "conf" | "json" => tokio::fs::read(&path).await?,
            _ => continue,
        };

        let list = if extension == "conflist" {
            match serde_json::from_slice::<NetworkConfigList>(&contents) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!("skipping invalid {}: {}", path.display(), e);
                    continue;
                }
            }
        } else {
            let Ok(plugin) = serde_json::from_slice::<Value>(&contents) else {
                tracing::warn!("skipping invalid {}", path.display());
                continue;
            };

            NetworkConfigList {
                cni_version: plugin
                    .get("cniVersion")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: plugin
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                plugins: vec![plugin],
            }
        };

        if list.name == name {
            return Ok(list);
        }
    }

    Err(FirewardError::Cni(format!(
        "no network configuration named {name} in {}",
        conf_dir.display()
    )))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
