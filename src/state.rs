//! Container state as reported by `state`.
//!
//! The state is never persisted by the runtime; it is derived from the host
//! container object on every query.
//!
//! Ref: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::host::{ContainerProperties, ContainerStats, HostContainerState};
use crate::network::NetworkEndpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OCI container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Host object exists but was never started.
    Creating,
    /// Started, no process running yet.
    Created,
    /// At least one process is running.
    Running,
    /// Terminated.
    Stopped,
}

impl ContainerStatus {
    /// Derives the status from the host's view of the container.
    pub fn from_host(state: HostContainerState, process_count: usize) -> Self {
        match state {
            HostContainerState::Created => Self::Creating,
            HostContainerState::Running if process_count > 0 => Self::Running,
            HostContainerState::Running => Self::Created,
            HostContainerState::Stopped => Self::Stopped,
        }
    }

    /// True if new processes may be started in the container.
    pub fn accepts_processes(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// OCI container state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Bundle directory recorded at creation.
    pub bundle: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Endpoint attached to the container, with applied port mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkEndpoint>,
}

impl ContainerState {
    /// Builds the state from host properties and the container's endpoint.
    pub fn from_host(properties: ContainerProperties, network: Option<NetworkEndpoint>) -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            status: ContainerStatus::from_host(properties.state, properties.process_count),
            id: properties.id,
            pid: properties.pid,
            bundle: properties.owner,
            created: properties.created,
            annotations: BTreeMap::new(),
            network,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// One line of `events` output, in the runc event shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub data: ContainerStats,
}

impl ContainerEvent {
    pub fn stats(id: impl Into<String>, stats: ContainerStats) -> Self {
        Self {
            kind: "stats".to_string(),
            id: id.into(),
            data: stats,
        }
    }
}
