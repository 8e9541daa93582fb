//! Network endpoint provisioning.
//!
//! Each container owns at most one endpoint, named after the container id.
//! Endpoint creation translates the bundle's rules up front, so an invalid
//! rule set fails before any host object exists.

use crate::error::{Error, Result};
use crate::host::{EndpointPolicy, EndpointRequest, HostEndpoint, NetworkHost, PolicyProtocol};
use crate::network::rules::{self, PortMapping, Protocol};
use crate::spec::WindowsNetwork;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A container's network endpoint as applied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoint {
    pub id: String,
    /// Endpoint name; equals the owning container id.
    pub name: String,
    pub network_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Ipv4Addr>,
    /// Applied mappings with host-allocated ports resolved.
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

impl From<HostEndpoint> for NetworkEndpoint {
    fn from(endpoint: HostEndpoint) -> Self {
        let port_mappings = endpoint
            .policies
            .iter()
            .filter_map(|policy| match policy {
                EndpointPolicy::Nat {
                    protocol,
                    internal_port,
                    external_port,
                } => {
                    let protocol = match protocol {
                        PolicyProtocol::Tcp => Protocol::Tcp,
                        PolicyProtocol::Udp => Protocol::Udp,
                        _ => return None,
                    };
                    Some(PortMapping {
                        host_port: *external_port,
                        container_port: *internal_port,
                        protocol,
                    })
                }
                EndpointPolicy::Acl { .. } => None,
            })
            .collect();

        Self {
            id: endpoint.id,
            name: endpoint.name,
            network_id: endpoint.network_id,
            ip_address: endpoint.ip_address,
            port_mappings,
        }
    }
}

/// Creates and deletes container endpoints against the host network service.
pub struct NetworkProvisioner {
    host: Arc<dyn NetworkHost>,
    /// Network used when the bundle names none.
    network_name: String,
}

impl NetworkProvisioner {
    pub fn new(host: Arc<dyn NetworkHost>, network_name: impl Into<String>) -> Self {
        Self {
            host,
            network_name: network_name.into(),
        }
    }

    /// Creates the endpoint of `container_id` and applies the translated rules.
    ///
    /// If applying the policies fails, the endpoint is deleted again before
    /// the error is returned.
    pub async fn create_endpoint(
        &self,
        container_id: &str,
        network: &WindowsNetwork,
    ) -> Result<NetworkEndpoint> {
        let policies = rules::translate(&network.rules)?;

        let network_name = network
            .network_name
            .as_deref()
            .unwrap_or(&self.network_name);
        let host_network = self.host.network_by_name(network_name).await?;

        let request = EndpointRequest {
            name: container_id.to_string(),
            network_id: host_network.id.clone(),
            dns_servers: network.dns_servers.clone(),
            dns_search: network.dns_search_list.clone(),
        };
        let endpoint = self.host.create_endpoint(&request).await?;
        debug!(
            container_id,
            endpoint_id = %endpoint.id,
            network = %host_network.name,
            "Created endpoint"
        );

        if policies.is_empty() {
            return Ok(endpoint.into());
        }

        match self.host.apply_policies(&endpoint.id, &policies).await {
            Ok(applied) => {
                info!(
                    container_id,
                    endpoint_id = %applied.id,
                    policies = policies.len(),
                    "Applied endpoint policies"
                );
                Ok(applied.into())
            }
            Err(err) => {
                warn!(
                    container_id,
                    endpoint_id = %endpoint.id,
                    error = %err,
                    "Applying endpoint policies failed, deleting endpoint"
                );
                if let Err(cleanup) = self.host.delete_endpoint(&endpoint.id).await {
                    warn!(
                        container_id,
                        endpoint_id = %endpoint.id,
                        error = %cleanup,
                        "Failed to delete endpoint after policy failure"
                    );
                }
                Err(Error::Host(err))
            }
        }
    }

    /// Deletes the endpoint owned by `container_id`; no-op if there is none.
    pub async fn delete_endpoint(&self, container_id: &str) -> Result<()> {
        let Some(endpoint) = self.endpoint(container_id).await? else {
            warn!(container_id, "Endpoint not found. Skipping delete.");
            return Ok(());
        };

        match self.host.delete_endpoint(&endpoint.id).await {
            Ok(()) => {
                debug!(container_id, endpoint_id = %endpoint.id, "Deleted endpoint");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                warn!(container_id, endpoint_id = %endpoint.id, "Endpoint already deleted");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Looks up the endpoint owned by `container_id`.
    pub async fn endpoint(&self, container_id: &str) -> Result<Option<NetworkEndpoint>> {
        match self.host.endpoint_by_name(container_id).await {
            Ok(endpoint) => Ok(Some(endpoint.into())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
