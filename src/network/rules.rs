//! Network rule translation.
//!
//! Maps the declarative rule list of a bundle (`windows.network.rules`) into
//! host endpoint policies. Pure; no I/O.
//!
//! | Rule          | Policy                                          |
//! |---------------|-------------------------------------------------|
//! | `portMapping` | One inbound NAT policy per mapping              |
//! | `netOut`      | One outbound ACL allow policy per rule          |
//!
//! The output is sorted, so the same rule set yields the same policy list
//! whatever order the rules were declared in. Identical outbound rules
//! collapse into one ACL; every port mapping keeps its own NAT policy.

use crate::constants::{ACL_ALLOW_PRIORITY, MAX_NET_RULES};
use crate::error::{Error, Result};
use crate::host::{AclAction, AclDirection, EndpointPolicy, PolicyProtocol};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

// =============================================================================
// Rule Types
// =============================================================================

/// Protocol selector of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Icmp,
    All,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::All => write!(f, "all"),
        }
    }
}

impl From<Protocol> for PolicyProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => Self::Tcp,
            Protocol::Udp => Self::Udp,
            Protocol::Icmp => Self::Icmp,
            Protocol::All => Self::Any,
        }
    }
}

/// Inbound mapping from a host port to a container port.
///
/// A `host_port` of zero asks the host to allocate a free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// Creates a TCP port mapping.
    #[must_use]
    pub const fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Creates a UDP port mapping.
    #[must_use]
    pub const fn udp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.protocol, self.host_port, self.container_port
        )
    }
}

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Outbound allow rule. Empty `networks` or `ports` means "any".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetOut {
    #[serde(default)]
    pub networks: Vec<IpRange>,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub protocol: Protocol,
}

/// One declared network rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NetRule {
    PortMapping(PortMapping),
    NetOut(NetOut),
}

// =============================================================================
// Translation
// =============================================================================

/// Translates declared rules into endpoint policies.
///
/// # Errors
///
/// Returns [`Error::InvalidNetRule`] for a zero container port, a NAT on a
/// protocol other than TCP/UDP, an inverted IP or port range, a duplicate
/// non-zero `(host_port, protocol)` pair, or more than [`MAX_NET_RULES`] rules.
pub fn translate(rules: &[NetRule]) -> Result<Vec<EndpointPolicy>> {
    if rules.len() > MAX_NET_RULES {
        return Err(Error::InvalidNetRule(format!(
            "{} rules exceed the limit of {}",
            rules.len(),
            MAX_NET_RULES
        )));
    }

    // NAT entries stay one per declared mapping so every allocated host port
    // can be reported back; ACL entries are additive and collapse.
    let mut policies = Vec::new();
    let mut acls = BTreeSet::new();
    let mut host_ports: HashSet<(u16, Protocol)> = HashSet::new();

    for rule in rules {
        match rule {
            NetRule::PortMapping(mapping) => {
                validate_port_mapping(mapping)?;
                if mapping.host_port != 0 && !host_ports.insert((mapping.host_port, mapping.protocol))
                {
                    return Err(Error::InvalidNetRule(format!(
                        "host port {} is mapped more than once for {}",
                        mapping.host_port, mapping.protocol
                    )));
                }
                policies.push(EndpointPolicy::Nat {
                    protocol: mapping.protocol.into(),
                    internal_port: mapping.container_port,
                    external_port: mapping.host_port,
                });
            }
            NetRule::NetOut(net_out) => {
                acls.insert(translate_net_out(net_out)?);
            }
        }
    }

    policies.extend(acls);
    policies.sort();
    Ok(policies)
}

fn validate_port_mapping(mapping: &PortMapping) -> Result<()> {
    if mapping.container_port == 0 {
        return Err(Error::InvalidNetRule(format!(
            "container port cannot be 0 ({mapping})"
        )));
    }
    if !matches!(mapping.protocol, Protocol::Tcp | Protocol::Udp) {
        return Err(Error::InvalidNetRule(format!(
            "port mapping protocol must be tcp or udp ({mapping})"
        )));
    }
    Ok(())
}

fn translate_net_out(rule: &NetOut) -> Result<EndpointPolicy> {
    let mut blocks: BTreeSet<(u32, u8)> = BTreeSet::new();
    for range in &rule.networks {
        for block in cidr_cover(*range)? {
            blocks.insert((u32::from(block.network()), block.prefix()));
        }
    }
    let remote_addresses = blocks
        .into_iter()
        .map(|(addr, prefix)| format!("{}/{}", Ipv4Addr::from(addr), prefix))
        .collect();

    let mut ports: BTreeSet<PortRange> = BTreeSet::new();
    for range in &rule.ports {
        if range.start > range.end {
            return Err(Error::InvalidNetRule(format!(
                "port range {}-{} is inverted",
                range.start, range.end
            )));
        }
        ports.insert(*range);
    }
    // Ports carry no meaning for ICMP.
    let remote_ports = if ports.is_empty() || rule.protocol == Protocol::Icmp {
        None
    } else {
        Some(
            ports
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    };

    Ok(EndpointPolicy::Acl {
        direction: AclDirection::Out,
        action: AclAction::Allow,
        protocol: rule.protocol.into(),
        remote_addresses,
        remote_ports,
        priority: ACL_ALLOW_PRIORITY,
    })
}

/// Computes the minimal set of CIDR blocks exactly covering `range`.
pub fn cidr_cover(range: IpRange) -> Result<Vec<Ipv4Network>> {
    let start = u64::from(u32::from(range.start));
    let end = u64::from(u32::from(range.end));
    if start > end {
        return Err(Error::InvalidNetRule(format!(
            "IP range {}-{} is inverted",
            range.start, range.end
        )));
    }

    let mut blocks = Vec::new();
    let mut current = start;
    while current <= end {
        // Largest block aligned at `current` that stays inside the range.
        let mut host_bits = if current == 0 {
            32
        } else {
            current.trailing_zeros().min(32)
        };
        while host_bits > 0 && current + (1u64 << host_bits) - 1 > end {
            host_bits -= 1;
        }
        let prefix = (32 - host_bits) as u8;
        let network = Ipv4Network::new(Ipv4Addr::from(current as u32), prefix)
            .map_err(|e| Error::InvalidNetRule(e.to_string()))?;
        blocks.push(network);
        current += 1u64 << host_bits;
    }
    Ok(blocks)
}
