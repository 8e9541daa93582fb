//! Container networking: rule translation and endpoint provisioning.

pub mod provisioner;
pub mod rules;

pub use provisioner::{NetworkEndpoint, NetworkProvisioner};
pub use rules::{NetOut, NetRule, PortMapping, Protocol, translate};
