//! # Host Capabilities
//!
//! The runtime core never talks to the host compute, network or storage
//! services directly. It consumes three capability traits:
//!
//! | Capability      | Responsibility                                     |
//! |-----------------|----------------------------------------------------|
//! | [`ComputeHost`] | Container objects and the processes inside them    |
//! | [`NetworkHost`] | Networks, endpoints and endpoint policies          |
//! | [`LayerStore`]  | Sandbox layers: create, activate, prepare, destroy |
//!
//! [`local::LocalHost`] implements all three on the local machine. A native
//! binding to the host compute service plugs in behind the same traits.
//!
//! ## Error Model
//!
//! Every capability call returns [`HostResult`]. The core branches on
//! [`HostErrorKind`], never on message text: `NotFound` drives idempotent
//! teardown, `AlreadyExists` drives conflict detection and `PortInUse`
//! surfaces port-mapping collisions between live containers.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalHost;

/// Result type alias for host capability calls.
pub type HostResult<T> = std::result::Result<T, HostError>;

// =============================================================================
// Host Errors
// =============================================================================

/// Classification of a host failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// The addressed object does not exist.
    NotFound,
    /// An object with the same identity already exists.
    AlreadyExists,
    /// A requested host port is held by another endpoint.
    PortInUse,
    /// Any other failure.
    Other,
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PortInUse => write!(f, "port in use"),
            Self::Other => write!(f, "failed"),
        }
    }
}

/// Error returned by a host capability.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} {kind}: {message}")]
pub struct HostError {
    /// Failure classification.
    pub kind: HostErrorKind,
    /// The host operation that failed (e.g. `create endpoint`).
    pub operation: String,
    /// Host-provided detail.
    pub message: String,
}

impl HostError {
    /// Creates a new host error.
    pub fn new(
        kind: HostErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`HostErrorKind::NotFound`] error.
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::NotFound, operation, message)
    }

    /// Shorthand for a [`HostErrorKind::Other`] error.
    pub fn other(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::Other, operation, message)
    }

    /// Wraps a local I/O failure.
    pub fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => HostErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => HostErrorKind::AlreadyExists,
            std::io::ErrorKind::AddrInUse => HostErrorKind::PortInUse,
            _ => HostErrorKind::Other,
        };
        Self::new(kind, operation, err.to_string())
    }

    /// Returns true if the addressed object is absent.
    pub fn is_not_found(&self) -> bool {
        self.kind == HostErrorKind::NotFound
    }
}

// =============================================================================
// Compute
// =============================================================================

/// Host-side state of a container object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostContainerState {
    /// Created but never started (leftover of an interrupted create).
    Created,
    /// Started and accepting processes.
    Running,
    /// Terminated.
    Stopped,
}

/// A directory from the host made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedDirectory {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the host needs to create a container object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Container id.
    pub id: String,
    /// Owner recorded on the host object; the bundle path.
    pub owner: String,
    /// Sandbox volume the container boots from.
    pub volume_path: PathBuf,
    /// Read-only parent layers, nearest first.
    pub layer_folders: Vec<PathBuf>,
    #[serde(default)]
    pub mapped_directories: Vec<MappedDirectory>,
    /// Network endpoint attached to the container.
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_shares: Option<u16>,
}

/// Snapshot of a host container object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    pub id: String,
    /// Owner recorded at creation; the bundle path.
    pub owner: String,
    pub state: HostContainerState,
    /// Host pid of the container, once started.
    pub pid: Option<u32>,
    pub created: DateTime<Utc>,
    /// Number of live processes inside the container.
    pub process_count: usize,
    pub endpoint_id: Option<String>,
}

/// Resource usage of a host container, summed over its live processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub process_count: usize,
    /// Resident memory in bytes.
    pub memory_usage_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    /// User plus system CPU time in nanoseconds.
    pub cpu_usage_nanos: u64,
}

/// A process to create inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// argv; first element is the executable.
    pub args: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub cwd: String,
    pub user: Option<String>,
    pub terminal: bool,
    /// Console size as (height, width).
    pub console_size: Option<(u32, u32)>,
    /// Whether the host should create stdio pipes for the process.
    pub create_stdio: bool,
}

/// Standard I/O pipes of a host process.
pub struct ProcessStdio {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for ProcessStdio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStdio").finish_non_exhaustive()
    }
}

/// A process running inside a host container.
#[async_trait]
pub trait HostProcess: Send + Sync {
    /// Host pid of the process.
    fn pid(&self) -> u32;

    /// Takes ownership of the stdio pipes. Returns `None` when the process
    /// was created without stdio or the pipes were already taken.
    fn take_stdio(&self) -> Option<ProcessStdio>;

    /// Waits until the process has exited.
    async fn wait(&self) -> HostResult<()>;

    /// Exit code of an exited process; `None` while it is still running.
    fn exit_code(&self) -> Option<i32>;

    /// Forcefully terminates the process.
    async fn kill(&self) -> HostResult<()>;
}

/// Host container objects and their processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeHost: Send + Sync {
    /// Returns the properties of a container, `NotFound` if unknown.
    async fn container_properties(&self, id: &str) -> HostResult<ContainerProperties>;

    /// Returns the current resource usage of a container, `NotFound` if unknown.
    async fn container_stats(&self, id: &str) -> HostResult<ContainerStats>;

    /// Creates a container object. `AlreadyExists` if the id is taken.
    async fn create_container(&self, config: &ContainerConfig) -> HostResult<()>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> HostResult<()>;

    /// Creates a process inside a started container.
    async fn create_process(
        &self,
        id: &str,
        config: &ProcessConfig,
    ) -> HostResult<Arc<dyn HostProcess>>;

    /// Forcefully stops every process and the container itself.
    async fn terminate_container(&self, id: &str) -> HostResult<()>;

    /// Removes the container object.
    async fn delete_container(&self, id: &str) -> HostResult<()>;
}

// =============================================================================
// Network
// =============================================================================

/// Transport protocol of an endpoint policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyProtocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

/// Traffic direction of an ACL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclDirection {
    In,
    Out,
}

/// ACL verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Allow,
    Block,
}

/// A policy object attached to a network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EndpointPolicy {
    /// Inbound NAT from a host port to a container port. An external port of
    /// zero asks the host to allocate one.
    #[serde(rename_all = "camelCase")]
    Nat {
        protocol: PolicyProtocol,
        internal_port: u16,
        external_port: u16,
    },
    /// Outbound/inbound access control entry.
    #[serde(rename_all = "camelCase")]
    Acl {
        direction: AclDirection,
        action: AclAction,
        protocol: PolicyProtocol,
        /// CIDR blocks; empty means any address.
        remote_addresses: Vec<String>,
        /// Comma separated `start-end` port ranges; `None` means any port.
        remote_ports: Option<String>,
        priority: u16,
    },
}

/// A host network that endpoints attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNetwork {
    pub id: String,
    pub name: String,
}

/// Parameters of a new endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    /// Endpoint name; the owning container id.
    pub name: String,
    pub network_id: String,
    pub dns_servers: Vec<String>,
    pub dns_search: Vec<String>,
}

/// A host network endpoint and the policies applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEndpoint {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub ip_address: Option<std::net::Ipv4Addr>,
    /// Applied policies with host-allocated ports resolved.
    #[serde(default)]
    pub policies: Vec<EndpointPolicy>,
}

/// Host networks, endpoints and policies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkHost: Send + Sync {
    /// Looks up a network by name.
    async fn network_by_name(&self, name: &str) -> HostResult<HostNetwork>;

    /// Creates an endpoint on a network.
    async fn create_endpoint(&self, request: &EndpointRequest) -> HostResult<HostEndpoint>;

    /// Applies policies to an endpoint and returns it with any host-allocated
    /// ports resolved. `PortInUse` if a host port is held by another endpoint.
    async fn apply_policies(
        &self,
        endpoint_id: &str,
        policies: &[EndpointPolicy],
    ) -> HostResult<HostEndpoint>;

    /// Looks up an endpoint by name.
    async fn endpoint_by_name(&self, name: &str) -> HostResult<HostEndpoint>;

    /// Deletes an endpoint.
    async fn delete_endpoint(&self, endpoint_id: &str) -> HostResult<()>;
}

// =============================================================================
// Layers
// =============================================================================

/// Sandbox layer storage.
///
/// A sandbox layer moves through `created → activated → prepared`. Teardown
/// runs `unprepare → deactivate → destroy`; the first two are no-ops on a
/// layer that never reached the corresponding sub-state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Returns true if a layer directory exists at `path`.
    async fn layer_exists(&self, path: &std::path::Path) -> HostResult<bool>;

    /// Returns true if a sandbox layer is registered for `id`.
    async fn sandbox_exists(&self, id: &str) -> HostResult<bool>;

    /// Creates a writable sandbox layer on top of `parents` (nearest first).
    async fn create_sandbox_layer(&self, id: &str, parents: &[PathBuf]) -> HostResult<()>;

    async fn activate_layer(&self, id: &str) -> HostResult<()>;

    async fn prepare_layer(&self, id: &str, parents: &[PathBuf]) -> HostResult<()>;

    /// Volume path of a prepared layer.
    async fn layer_mount_path(&self, id: &str) -> HostResult<PathBuf>;

    /// Caps the sandbox volume at `bytes`.
    async fn set_disk_quota(&self, id: &str, bytes: u64) -> HostResult<()>;

    async fn unprepare_layer(&self, id: &str) -> HostResult<()>;

    async fn deactivate_layer(&self, id: &str) -> HostResult<()>;

    async fn destroy_layer(&self, id: &str) -> HostResult<()>;
}

// =============================================================================
// Service Bundle
// =============================================================================

/// The capability set handed to the lifecycle manager.
#[derive(Clone)]
pub struct HostServices {
    pub compute: Arc<dyn ComputeHost>,
    pub network: Arc<dyn NetworkHost>,
    pub layers: Arc<dyn LayerStore>,
}

impl HostServices {
    /// Bundles three capabilities.
    pub fn new(
        compute: Arc<dyn ComputeHost>,
        network: Arc<dyn NetworkHost>,
        layers: Arc<dyn LayerStore>,
    ) -> Self {
        Self {
            compute,
            network,
            layers,
        }
    }

    /// Uses one backend for all three capabilities.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ComputeHost + NetworkHost + LayerStore + 'static,
    {
        Self {
            compute: backend.clone(),
            network: backend.clone(),
            layers: backend,
        }
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}
