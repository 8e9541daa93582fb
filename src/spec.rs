//! OCI runtime configuration (`config.json`) as consumed by the runtime.
//!
//! Only the fields the lifecycle consults are typed. Everything else is kept
//! in flattened maps so the spec emitted by `create` round-trips the caller's
//! input untouched apart from the resolved fields.

use crate::constants::{BUNDLE_CONFIG_FILE, OCI_RUNTIME_SPEC_VERSION};
use crate::error::{Error, Result};
use crate::host::MappedDirectory;
use crate::layer::SandboxLayer;
use crate::network::NetworkEndpoint;
use crate::network::rules::NetRule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Top-level Spec
// =============================================================================

/// OCI runtime spec of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default)]
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<WindowsSpec>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Container process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSize {
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Bind mount of a host directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

// =============================================================================
// Windows Section
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsSpec {
    /// `[rootfs, parents...]`, nearest layer first.
    #[serde(default)]
    pub layer_folders: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<WindowsResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<WindowsNetwork>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowsResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<WindowsMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<WindowsCpu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<WindowsStorage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowsMemory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowsCpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps: Option<u64>,
    /// Sandbox disk quota in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_size: Option<u64>,
}

/// Network section. `dnsServers`, `networkName` and `rules` extend the
/// standard OCI fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsNetwork {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoint_list: Vec<String>,
    #[serde(default, rename = "DNSSearchList", skip_serializing_if = "Vec::is_empty")]
    pub dns_search_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    /// Host network to attach to; the runtime default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<NetRule>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// =============================================================================
// Loading & Validation
// =============================================================================

impl ContainerSpec {
    /// Reads `config.json` from a bundle directory.
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(BUNDLE_CONFIG_FILE);
        let data = std::fs::read(&path).map_err(|e| Error::InvalidBundle {
            path: bundle.to_path_buf(),
            reason: format!("cannot read {BUNDLE_CONFIG_FILE}: {e}"),
        })?;
        serde_json::from_slice(&data).map_err(|e| Error::InvalidBundle {
            path: bundle.to_path_buf(),
            reason: format!("malformed {BUNDLE_CONFIG_FILE}: {e}"),
        })
    }

    /// Checks the fields `create` depends on.
    pub fn validate(&self, bundle: &Path) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidBundle {
            path: bundle.to_path_buf(),
            reason: reason.to_string(),
        };

        let root = match &self.root {
            Some(root) if !root.path.is_empty() => root,
            _ => return Err(invalid("root.path is required")),
        };
        // Relative roots are relative to the bundle.
        if !bundle.join(&root.path).exists() {
            return Err(invalid(&format!("root path {} does not exist", root.path)));
        }
        match &self.process {
            Some(process) => process.validate()?,
            None => return Err(invalid("process is required")),
        }
        if self.layer_folders().is_empty() {
            return Err(invalid("windows.layerFolders must not be empty"));
        }
        Ok(())
    }

    /// Layer chain `[rootfs, parents...]`.
    pub fn layer_folders(&self) -> &[PathBuf] {
        self.windows
            .as_ref()
            .map(|w| w.layer_folders.as_slice())
            .unwrap_or_default()
    }

    pub fn network(&self) -> Option<&WindowsNetwork> {
        self.windows.as_ref().and_then(|w| w.network.as_ref())
    }

    fn resources(&self) -> Option<&WindowsResources> {
        self.windows.as_ref().and_then(|w| w.resources.as_ref())
    }

    /// Requested sandbox disk quota; zero or absent means no quota.
    pub fn sandbox_size(&self) -> u64 {
        self.resources()
            .and_then(|r| r.storage.as_ref())
            .and_then(|s| s.sandbox_size)
            .unwrap_or(0)
    }

    pub fn memory_limit(&self) -> Option<u64> {
        self.resources()
            .and_then(|r| r.memory.as_ref())
            .and_then(|m| m.limit)
    }

    pub fn cpu_shares(&self) -> Option<u16> {
        self.resources()
            .and_then(|r| r.cpu.as_ref())
            .and_then(|c| c.shares)
    }

    /// Mounts as host directory mappings. Mounts without a source are skipped.
    pub fn mapped_directories(&self) -> Vec<MappedDirectory> {
        self.mounts
            .iter()
            .filter(|m| !m.source.is_empty())
            .map(|m| MappedDirectory {
                host_path: PathBuf::from(&m.source),
                container_path: m.destination.clone(),
                read_only: m.options.iter().any(|o| o == "ro"),
            })
            .collect()
    }

    /// Minimal spec describing a freshly provisioned sandbox layer.
    pub fn for_sandbox(layer: &SandboxLayer) -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Some(Root {
                path: layer.volume_path.to_string_lossy().into_owned(),
                readonly: false,
            }),
            windows: Some(WindowsSpec {
                layer_folders: layer.layer_folders.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Copy of this spec with the provisioned values filled in: `root.path`
    /// is the sandbox volume, `windows.layerFolders` the layer chain, and
    /// port mappings carry their host-allocated ports.
    pub fn resolved(&self, layer: &SandboxLayer, endpoint: Option<&NetworkEndpoint>) -> Self {
        let mut spec = self.clone();
        let root = spec.root.get_or_insert_with(Root::default);
        root.path = layer.volume_path.to_string_lossy().into_owned();

        let windows = spec.windows.get_or_insert_with(WindowsSpec::default);
        windows.layer_folders = layer.layer_folders.clone();

        if let Some(endpoint) = endpoint {
            let network = windows.network.get_or_insert_with(WindowsNetwork::default);
            network.endpoint_list = vec![endpoint.id.clone()];
            resolve_port_mappings(&mut network.rules, endpoint);
        }
        spec
    }
}

/// Replaces declared mappings with the ones the host applied, matched by
/// container port and protocol.
fn resolve_port_mappings(rules: &mut [NetRule], endpoint: &NetworkEndpoint) {
    let mut claimed = vec![false; endpoint.port_mappings.len()];
    for rule in rules.iter_mut() {
        let NetRule::PortMapping(declared) = rule else {
            continue;
        };
        let found = endpoint
            .port_mappings
            .iter()
            .enumerate()
            .find(|(i, applied)| {
                !claimed[*i]
                    && applied.container_port == declared.container_port
                    && applied.protocol == declared.protocol
                    && (declared.host_port == 0 || applied.host_port == declared.host_port)
            })
            .map(|(i, applied)| (i, *applied));
        if let Some((i, applied)) = found {
            claimed[i] = true;
            *declared = applied;
        }
    }
}

impl ProcessSpec {
    /// Reads a standalone `process.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::InvalidProcess(format!("{}: {e}", path.display())))
    }

    /// Process from a bare command line.
    pub fn from_args(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.args.is_empty() || self.args[0].is_empty() {
            return Err(Error::InvalidProcess("args must not be empty".to_string()));
        }
        Ok(())
    }
}
