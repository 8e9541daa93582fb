//! # Lifecycle Manager
//!
//! One [`ContainerManager`] is bound to one container id per invocation and
//! sequences the provisioning subsystems.
//!
//! ## Create
//!
//! ```text
//! validate → uniqueness → sandbox layer → endpoint → host container + start
//!                              │              │               │
//!                              └──────────────┴───────────────┴─► reverse cleanup on failure
//! ```
//!
//! ## Delete
//!
//! ```text
//! terminate → delete host container → delete endpoint → destroy sandbox
//! ```
//!
//! Every delete step runs regardless of the others. A resource that is already
//! gone is logged and skipped; other failures are collected and returned
//! together as [`Error::TeardownFailed`].
//!
//! ## State Machine
//!
//! ```text
//! creating ──► created ──► running ──► stopped
//!     │           │           │           │
//!     └───────────┴───── delete ──────────┘
//! ```

use crate::constants::validate_container_id;
use crate::error::{Error, Result, TeardownFailure};
use crate::host::{ContainerConfig, HostError, HostErrorKind, HostServices};
use crate::layer::{DiskLimit, LayerSequencer, SandboxLayer};
use crate::network::{NetworkEndpoint, NetworkProvisioner};
use crate::process::{ProcessExecutor, ProcessHandle};
use crate::spec::{ContainerSpec, ProcessSpec};
use crate::state::{ContainerEvent, ContainerState, ContainerStatus};
use std::path::{Path, PathBuf};
use tracing::{Instrument, Span, debug, info, info_span, warn};

/// Drives the lifecycle of one container.
pub struct ContainerManager {
    id: String,
    services: HostServices,
    layers: LayerSequencer,
    network: NetworkProvisioner,
    executor: ProcessExecutor,
    span: Span,
}

impl ContainerManager {
    /// Binds a manager to `id`. Endpoints attach to `network_name` unless the
    /// bundle names another network.
    pub fn new(id: impl Into<String>, services: HostServices, network_name: impl Into<String>) -> Self {
        let id = id.into();
        let span = info_span!("container", container_id = %id);
        Self {
            layers: LayerSequencer::new(services.layers.clone()),
            network: NetworkProvisioner::new(services.network.clone(), network_name),
            executor: ProcessExecutor::new(services.compute.clone()),
            services,
            id,
            span,
        }
    }

    /// Replaces the span every operation is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Provisions and starts the container described by `spec`.
    ///
    /// Returns the spec with the sandbox volume, layer chain and allocated
    /// host ports filled in.
    ///
    /// # Errors
    ///
    /// - Validation errors before any resource is touched
    /// - [`Error::ContainerAlreadyExists`] if the id is registered with the host
    /// - Layer, network or host errors after cleaning up what was provisioned
    pub async fn create(&self, bundle: &Path, spec: &ContainerSpec) -> Result<ContainerSpec> {
        self.create_inner(bundle, spec)
            .instrument(self.span.clone())
            .await
    }

    async fn create_inner(&self, bundle: &Path, spec: &ContainerSpec) -> Result<ContainerSpec> {
        self.validate_id()?;
        if bundle.file_name().is_none_or(|name| name != self.id.as_str()) {
            return Err(Error::InvalidContainerId {
                id: self.id.clone(),
                reason: format!(
                    "must match the bundle directory name ({})",
                    bundle.display()
                ),
            });
        }
        spec.validate(bundle)?;

        match self.services.compute.container_properties(&self.id).await {
            Ok(_) => return Err(Error::ContainerAlreadyExists(self.id.clone())),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let layer = self.provision_layer(spec).await?;

        let endpoint = match spec.network() {
            Some(network) => match self.network.create_endpoint(&self.id, network).await {
                Ok(endpoint) => Some(endpoint),
                Err(err) => {
                    self.rollback(&layer, None, false).await;
                    return Err(err);
                }
            },
            None => None,
        };

        let config = ContainerConfig {
            id: self.id.clone(),
            owner: bundle.to_string_lossy().into_owned(),
            volume_path: layer.volume_path.clone(),
            layer_folders: layer.layer_folders.clone(),
            mapped_directories: spec.mapped_directories(),
            endpoint_id: endpoint.as_ref().map(|e| e.id.clone()),
            hostname: spec.hostname.clone(),
            memory_limit_bytes: spec.memory_limit(),
            cpu_shares: spec.cpu_shares(),
        };

        if let Err(err) = self.services.compute.create_container(&config).await {
            // Another invocation won the race for this id; its resources are not ours.
            if err.kind == HostErrorKind::AlreadyExists {
                return Err(Error::ContainerAlreadyExists(self.id.clone()));
            }
            self.rollback(&layer, endpoint.as_ref(), false).await;
            return Err(err.into());
        }
        if let Err(err) = self.services.compute.start_container(&self.id).await {
            self.rollback(&layer, endpoint.as_ref(), true).await;
            return Err(err.into());
        }

        info!(
            volume = %layer.volume_path.display(),
            endpoint_id = ?config.endpoint_id,
            "Container created"
        );
        Ok(spec.resolved(&layer, endpoint.as_ref()))
    }

    async fn provision_layer(&self, spec: &ContainerSpec) -> Result<SandboxLayer> {
        let folders = spec.layer_folders();
        if let Some(layer) = self.layers.adopt_sandbox(&self.id, folders).await? {
            let sandbox_size = spec.sandbox_size();
            if sandbox_size > 0 {
                warn!(
                    sandbox_size,
                    "Sandbox layer was provisioned ahead of create; keeping its quota"
                );
            }
            return Ok(layer);
        }
        let (rootfs, parents) = folders.split_first().ok_or_else(|| {
            Error::Internal("layer folders checked non-empty by validation".to_string())
        })?;
        self.layers
            .create_sandbox(
                &self.id,
                rootfs,
                parents,
                DiskLimit::bytes(spec.sandbox_size()),
            )
            .await
    }

    /// Undoes a partial create in reverse order. Failures are logged only.
    async fn rollback(
        &self,
        layer: &SandboxLayer,
        endpoint: Option<&NetworkEndpoint>,
        container_created: bool,
    ) {
        warn!("Create failed, cleaning up provisioned resources");
        if container_created
            && let Err(err) = self.services.compute.delete_container(&self.id).await
        {
            warn!(error = %err, "Rollback: failed to delete host container");
        }
        if endpoint.is_some()
            && let Err(err) = self.network.delete_endpoint(&self.id).await
        {
            warn!(error = %err, "Rollback: failed to delete endpoint");
        }
        if layer.adopted {
            debug!("Rollback: keeping pre-existing sandbox layer");
        } else if let Err(err) = self.layers.discard_sandbox(&self.id).await {
            warn!(error = %err, "Rollback: failed to destroy sandbox layer");
        }
    }

    // =========================================================================
    // Exec / State
    // =========================================================================

    /// Starts `process` inside the container.
    ///
    /// # Errors
    ///
    /// [`Error::ContainerNotFound`] if the container does not exist and
    /// [`Error::ContainerNotRunning`] if it is neither created nor running.
    pub async fn exec(&self, process: &ProcessSpec, detach: bool) -> Result<ProcessHandle> {
        async {
            let status = self.status().await?;
            if !status.accepts_processes() {
                return Err(Error::ContainerNotRunning {
                    id: self.id.clone(),
                    state: status.to_string(),
                });
            }
            self.executor.run(&self.id, process, detach).await
        }
        .instrument(self.span.clone())
        .await
    }

    async fn status(&self) -> Result<ContainerStatus> {
        let properties = self.properties().await?;
        Ok(ContainerStatus::from_host(
            properties.state,
            properties.process_count,
        ))
    }

    async fn properties(&self) -> Result<crate::host::ContainerProperties> {
        self.validate_id()?;
        self.services
            .compute
            .container_properties(&self.id)
            .await
            .map_err(|err| self.not_found_or(err))
    }

    fn not_found_or(&self, err: HostError) -> Error {
        if err.is_not_found() {
            Error::ContainerNotFound(self.id.clone())
        } else {
            err.into()
        }
    }

    /// Snapshot of the container's state.
    pub async fn state(&self) -> Result<ContainerState> {
        async {
            let properties = self.properties().await?;
            let endpoint = self.network.endpoint(&self.id).await?;
            let bundle = PathBuf::from(&properties.owner);

            let mut state = ContainerState::from_host(properties, endpoint);
            match ContainerSpec::load(&bundle) {
                Ok(spec) => state.annotations = spec.annotations,
                Err(err) => debug!(error = %err, "Bundle config unavailable for annotations"),
            }
            Ok(state)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Current resource usage of the container as a stats event.
    ///
    /// # Errors
    ///
    /// [`Error::ContainerNotFound`] if the container does not exist.
    pub async fn stats(&self) -> Result<ContainerEvent> {
        async {
            self.validate_id()?;
            let stats = self
                .services
                .compute
                .container_stats(&self.id)
                .await
                .map_err(|err| self.not_found_or(err))?;
            Ok(ContainerEvent::stats(&self.id, stats))
        }
        .instrument(self.span.clone())
        .await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Tears the container down in reverse creation order.
    ///
    /// Succeeds if nothing is left, including when nothing existed.
    pub async fn delete(&self) -> Result<()> {
        self.delete_inner().instrument(self.span.clone()).await
    }

    async fn delete_inner(&self) -> Result<()> {
        self.validate_id()?;
        let compute = &self.services.compute;
        let mut failures = Vec::new();

        for (step, outcome) in [
            ("terminate container", compute.terminate_container(&self.id).await),
            ("delete container", compute.delete_container(&self.id).await),
        ] {
            match outcome {
                Ok(()) => debug!(step, "Teardown step done"),
                Err(err) if err.is_not_found() => {
                    warn!(step, "Container not found. Skipping.");
                }
                Err(err) => {
                    warn!(step, error = %err, "Teardown step failed");
                    failures.push(TeardownFailure {
                        step,
                        error: err.into(),
                    });
                }
            }
        }

        if let Err(err) = self.network.delete_endpoint(&self.id).await {
            warn!(step = "delete endpoint", error = %err, "Teardown step failed");
            failures.push(TeardownFailure {
                step: "delete endpoint",
                error: err,
            });
        }

        if let Err(err) = self.layers.destroy_sandbox(&self.id).await {
            warn!(step = "destroy sandbox", error = %err, "Teardown step failed");
            failures.push(TeardownFailure {
                step: "destroy sandbox",
                error: err,
            });
        }

        if failures.is_empty() {
            info!("Container deleted");
            Ok(())
        } else {
            Err(Error::TeardownFailed {
                id: self.id.clone(),
                failures,
            })
        }
    }

    fn validate_id(&self) -> Result<()> {
        validate_container_id(&self.id).map_err(|reason| Error::InvalidContainerId {
            id: self.id.clone(),
            reason: reason.to_string(),
        })
    }
}
