//! # hcsrun
//!
//! **OCI runtime for host-native containers**
//!
//! Turns an OCI bundle into a running container built from the host's own
//! container primitives: a sandbox filesystem layer, a network endpoint with
//! translated port-mapping and outbound rules, and a host container object
//! that processes are started in. Teardown runs the same steps in reverse and
//! tolerates any of them having already happened.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     ContainerManager (one per id)                   │
//! │        create(bundle, spec) · exec(process) · state · delete        │
//! ├──────────────────┬───────────────────────┬──────────────────────────┤
//! │  LayerSequencer  │  NetworkProvisioner   │     ProcessExecutor      │
//! │  create/activate │  endpoint + policies  │  spawn · stdio relays    │
//! │  prepare/quota   │          │            │  interrupt → kill        │
//! │  reverse teardown│    rules::translate   │  bounded relay drain     │
//! ├──────────────────┴───────────────────────┴──────────────────────────┤
//! │            Host capabilities (traits, mocked in unit tests)         │
//! │         LayerStore        ·     NetworkHost     ·   ComputeHost     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                 LocalHost: store root + child processes             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   ┌─────────┐  create  ┌──────────┐  start   ┌─────────┐  exec  ┌─────────┐
//!   │ (none)  │ ───────► │ creating │ ───────► │ created │ ─────► │ running │
//!   └─────────┘          └──────────┘          └─────────┘        └────┬────┘
//!                              │                    │                  │ exit/kill
//!                              │                    │                  ▼
//!                              │      delete        │             ┌─────────┐
//!                              └────────────────────┴──────────── │ stopped │
//!                                                                 └─────────┘
//! ```
//!
//! State is never kept by the runtime itself. Every query derives it from the
//! host objects, so separate invocations (one per lifecycle command) agree.
//!
//! # Example
//!
//! ```rust,ignore
//! use hcsrun::{ContainerManager, ContainerSpec, HostServices, LocalHost};
//! use std::sync::Arc;
//!
//! let services = HostServices::from_backend(Arc::new(LocalHost::new("/var/lib/hcsrun")));
//! let manager = ContainerManager::new("web", services, hcsrun::DEFAULT_NETWORK_NAME);
//!
//! let spec = ContainerSpec::load(bundle.as_ref())?;
//! let resolved = manager.create(bundle.as_ref(), &spec).await?;
//! let handle = manager.exec(&spec.process.unwrap(), false).await?;
//! let code = handle.attach(hcsrun::CallerIo::std(), hcsrun::interrupt_signal()).await?;
//! manager.delete().await?;
//! ```

pub mod config;
pub mod constants;
pub mod container;
pub mod error;
pub mod host;
pub mod layer;
pub mod logging;
pub mod network;
pub mod process;
pub mod spec;
pub mod state;

// Re-exports
pub use config::{LogConfig, LogFormat, RuntimeConfig};
pub use constants::*;
pub use container::ContainerManager;
pub use error::{Error, ErrorCategory, Result};
pub use host::{HostError, HostErrorKind, HostServices, LocalHost};
pub use layer::{DiskLimit, LayerSequencer, SandboxLayer};
pub use network::{NetOut, NetRule, NetworkEndpoint, NetworkProvisioner, PortMapping, Protocol};
pub use process::{CallerIo, ProcessExecutor, ProcessHandle, interrupt_signal};
pub use spec::{ContainerSpec, ProcessSpec};
pub use state::{ContainerEvent, ContainerState, ContainerStatus};
