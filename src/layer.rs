//! # Layer Sequencer
//!
//! Orchestrates the layer store for one container's writable sandbox layer.
//!
//! ## Provisioning Order
//!
//! ```text
//! rootfs check → create → activate → prepare → mount path → [quota]
//! ```
//!
//! Any failure after `create` tears the partial layer down again before the
//! error is returned. Teardown runs `unprepare → deactivate → destroy` and
//! tolerates every sub-state, including a layer that was never created.

use crate::constants::LAYER_CHAIN_FILE;
use crate::error::{Error, Result};
use crate::host::{HostError, HostResult, LayerStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Disk Limit
// =============================================================================

/// Sandbox disk quota in bytes. Zero means no quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiskLimit(u64);

impl DiskLimit {
    /// No quota.
    pub const NONE: Self = Self(0);

    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_unlimited(self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<i64> for DiskLimit {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| Error::InvalidDiskLimit(value))
    }
}

// =============================================================================
// Sandbox Layer
// =============================================================================

/// A provisioned sandbox layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayer {
    /// Owning container id.
    pub id: String,
    /// Mounted volume the container boots from.
    pub volume_path: PathBuf,
    /// `[rootfs, parents...]`.
    pub layer_folders: Vec<PathBuf>,
    /// True if the layer existed before this invocation.
    pub adopted: bool,
}

/// Drives a [`LayerStore`] through sandbox creation and teardown.
pub struct LayerSequencer {
    store: Arc<dyn LayerStore>,
}

impl LayerSequencer {
    pub fn new(store: Arc<dyn LayerStore>) -> Self {
        Self { store }
    }

    /// Creates, activates and prepares the sandbox layer of `container_id`
    /// on top of `rootfs` and its `parents`.
    ///
    /// # Errors
    ///
    /// - [`Error::RootfsNotFound`] if `rootfs` is not a layer
    /// - [`Error::Host`] if any store step fails; the partial layer is
    ///   destroyed first
    pub async fn create_sandbox(
        &self,
        container_id: &str,
        rootfs: &Path,
        parents: &[PathBuf],
        disk_limit: DiskLimit,
    ) -> Result<SandboxLayer> {
        if !self.store.layer_exists(rootfs).await? {
            return Err(Error::RootfsNotFound {
                path: rootfs.to_path_buf(),
            });
        }

        let mut layer_folders = Vec::with_capacity(parents.len() + 1);
        layer_folders.push(rootfs.to_path_buf());
        layer_folders.extend_from_slice(parents);

        self.store
            .create_sandbox_layer(container_id, &layer_folders)
            .await?;
        debug!(container_id, rootfs = %rootfs.display(), "Created sandbox layer");

        match self
            .finish_sandbox(container_id, &layer_folders, disk_limit)
            .await
        {
            Ok(volume_path) => {
                info!(
                    container_id,
                    volume = %volume_path.display(),
                    disk_limit = disk_limit.get(),
                    "Sandbox layer ready"
                );
                Ok(SandboxLayer {
                    id: container_id.to_string(),
                    volume_path,
                    layer_folders,
                    adopted: false,
                })
            }
            Err(err) => {
                warn!(container_id, error = %err, "Sandbox setup failed, destroying partial layer");
                if let Err(cleanup) = self.teardown(container_id).await {
                    warn!(container_id, error = %cleanup, "Failed to destroy partial sandbox layer");
                }
                Err(err.into())
            }
        }
    }

    async fn finish_sandbox(
        &self,
        container_id: &str,
        layer_folders: &[PathBuf],
        disk_limit: DiskLimit,
    ) -> HostResult<PathBuf> {
        self.store.activate_layer(container_id).await?;
        self.store.prepare_layer(container_id, layer_folders).await?;
        let volume_path = self.store.layer_mount_path(container_id).await?;
        if !disk_limit.is_unlimited() {
            self.store
                .set_disk_quota(container_id, disk_limit.get())
                .await?;
        }
        Ok(volume_path)
    }

    /// Returns the existing sandbox of `container_id`, if one was provisioned
    /// earlier (for example by the image tool).
    pub async fn adopt_sandbox(
        &self,
        container_id: &str,
        layer_folders: &[PathBuf],
    ) -> Result<Option<SandboxLayer>> {
        if !self.store.sandbox_exists(container_id).await? {
            return Ok(None);
        }
        let volume_path = self.store.layer_mount_path(container_id).await?;
        debug!(container_id, volume = %volume_path.display(), "Adopted existing sandbox layer");
        Ok(Some(SandboxLayer {
            id: container_id.to_string(),
            volume_path,
            layer_folders: layer_folders.to_vec(),
            adopted: true,
        }))
    }

    /// Tears down the sandbox of `container_id` from whatever sub-state it
    /// reached. A missing layer is not an error.
    pub async fn destroy_sandbox(&self, container_id: &str) -> Result<()> {
        if !self.store.sandbox_exists(container_id).await? {
            warn!("Layer `{container_id}` not found. Skipping delete.");
            return Ok(());
        }
        self.teardown(container_id).await?;
        info!(container_id, "Destroyed sandbox layer");
        Ok(())
    }

    /// Tears down a sandbox this invocation created, without checking that
    /// it is registered first.
    pub async fn discard_sandbox(&self, container_id: &str) -> Result<()> {
        self.teardown(container_id).await?;
        debug!(container_id, "Discarded sandbox layer");
        Ok(())
    }

    /// Runs every teardown step and reports the first real failure.
    async fn teardown(&self, container_id: &str) -> HostResult<()> {
        let steps = [
            ("unprepare", self.store.unprepare_layer(container_id).await),
            ("deactivate", self.store.deactivate_layer(container_id).await),
            ("destroy", self.store.destroy_layer(container_id).await),
        ];

        let mut first: Option<HostError> = None;
        for (step, outcome) in steps {
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(container_id, step, "Layer step already undone");
                }
                Err(err) => {
                    warn!(container_id, step, error = %err, "Layer teardown step failed");
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

// =============================================================================
// Layer Chain Helpers
// =============================================================================

/// Reads the parent chain recorded next to a rootfs layer.
///
/// A layer without a chain file is a base layer and has no parents.
pub fn read_parent_chain(rootfs: &Path) -> Result<Vec<PathBuf>> {
    let path = rootfs.join(LAYER_CHAIN_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::InvalidLayerChain {
                path,
                reason: e.to_string(),
            });
        }
    };
    serde_json::from_slice(&data).map_err(|e| Error::InvalidLayerChain {
        path,
        reason: e.to_string(),
    })
}

/// Qualifies a rooted path without a drive (`/layers/base`) with the system
/// volume on Windows. Unchanged elsewhere.
pub fn host_layer_path(path: &Path) -> PathBuf {
    if cfg!(windows) && path.has_root() && !path.is_absolute() {
        PathBuf::from(format!("C:{}", path.display()))
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostErrorKind, MockLayerStore};
    use crate::logging::capture::LogBuffer;
    use mockall::Sequence;
    use mockall::predicate::eq;

    fn store_with_rootfs() -> MockLayerStore {
        let mut store = MockLayerStore::new();
        store.expect_layer_exists().returning(|_| Ok(true));
        store
    }

    #[test]
    fn test_disk_limit_conversion() {
        assert_eq!(DiskLimit::try_from(0).unwrap(), DiskLimit::NONE);
        assert_eq!(DiskLimit::try_from(4096).unwrap().get(), 4096);
        assert!(matches!(
            DiskLimit::try_from(-1),
            Err(Error::InvalidDiskLimit(-1))
        ));
    }

    #[tokio::test]
    async fn test_create_sandbox_runs_steps_in_order() {
        let mut store = store_with_rootfs();
        let mut seq = Sequence::new();
        store
            .expect_create_sandbox_layer()
            .withf(|id, chain| id == "c1" && chain.len() == 2)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_activate_layer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store
            .expect_prepare_layer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_layer_mount_path()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(PathBuf::from("/vol/c1")));
        store
            .expect_set_disk_quota()
            .with(eq("c1"), eq(1024u64))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let sequencer = LayerSequencer::new(Arc::new(store));
        let layer = sequencer
            .create_sandbox(
                "c1",
                Path::new("/layers/app"),
                &[PathBuf::from("/layers/base")],
                DiskLimit::bytes(1024),
            )
            .await
            .unwrap();

        assert_eq!(layer.volume_path, PathBuf::from("/vol/c1"));
        assert_eq!(
            layer.layer_folders,
            vec![PathBuf::from("/layers/app"), PathBuf::from("/layers/base")]
        );
        assert!(!layer.adopted);
    }

    #[tokio::test]
    async fn test_zero_disk_limit_skips_quota() {
        let mut store = store_with_rootfs();
        store.expect_create_sandbox_layer().returning(|_, _| Ok(()));
        store.expect_activate_layer().returning(|_| Ok(()));
        store.expect_prepare_layer().returning(|_, _| Ok(()));
        store
            .expect_layer_mount_path()
            .returning(|_| Ok(PathBuf::from("/vol/c1")));
        store.expect_set_disk_quota().never();

        let sequencer = LayerSequencer::new(Arc::new(store));
        sequencer
            .create_sandbox("c1", Path::new("/layers/app"), &[], DiskLimit::NONE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_rootfs_creates_nothing() {
        let mut store = MockLayerStore::new();
        store.expect_layer_exists().returning(|_| Ok(false));
        store.expect_create_sandbox_layer().never();

        let sequencer = LayerSequencer::new(Arc::new(store));
        let err = sequencer
            .create_sandbox("c1", Path::new("/nope"), &[], DiskLimit::NONE)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rootfs layer does not exist"));
    }

    #[tokio::test]
    async fn test_prepare_failure_destroys_partial_layer() {
        let mut store = store_with_rootfs();
        store.expect_create_sandbox_layer().returning(|_, _| Ok(()));
        store.expect_activate_layer().returning(|_| Ok(()));
        store
            .expect_prepare_layer()
            .returning(|_, _| Err(HostError::other("prepare layer", "disk full")));
        store.expect_unprepare_layer().times(1).returning(|_| Ok(()));
        store.expect_deactivate_layer().times(1).returning(|_| Ok(()));
        store.expect_destroy_layer().times(1).returning(|_| Ok(()));

        let sequencer = LayerSequencer::new(Arc::new(store));
        let err = sequencer
            .create_sandbox("c1", Path::new("/layers/app"), &[], DiskLimit::NONE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Host(ref e) if e.kind == HostErrorKind::Other));
    }

    #[tokio::test]
    async fn test_destroy_missing_layer_warns() {
        let mut store = MockLayerStore::new();
        store.expect_sandbox_exists().returning(|_| Ok(false));
        store.expect_destroy_layer().never();

        let logs = LogBuffer::default();
        let _guard = tracing::dispatcher::set_default(&logs.subscriber());

        let sequencer = LayerSequencer::new(Arc::new(store));
        sequencer
            .destroy_sandbox("some-bad-container-id")
            .await
            .unwrap();

        let output = logs.contents();
        assert!(output.contains("WARN"));
        assert!(output.contains("Layer `some-bad-container-id` not found. Skipping delete."));
    }

    #[tokio::test]
    async fn test_destroy_continues_past_failed_step() {
        let mut store = MockLayerStore::new();
        store.expect_sandbox_exists().returning(|_| Ok(true));
        store
            .expect_unprepare_layer()
            .returning(|_| Err(HostError::other("unprepare layer", "busy")));
        store.expect_deactivate_layer().times(1).returning(|_| Ok(()));
        store.expect_destroy_layer().times(1).returning(|_| Ok(()));

        let sequencer = LayerSequencer::new(Arc::new(store));
        assert!(sequencer.destroy_sandbox("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_adopt_existing_sandbox() {
        let mut store = MockLayerStore::new();
        store.expect_sandbox_exists().returning(|_| Ok(true));
        store
            .expect_layer_mount_path()
            .returning(|_| Ok(PathBuf::from("/vol/c1")));

        let sequencer = LayerSequencer::new(Arc::new(store));
        let layer = sequencer
            .adopt_sandbox("c1", &[PathBuf::from("/layers/app")])
            .await
            .unwrap()
            .unwrap();
        assert!(layer.adopted);
    }

    #[test]
    fn test_read_parent_chain() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_parent_chain(dir.path()).unwrap().is_empty());

        std::fs::write(
            dir.path().join(LAYER_CHAIN_FILE),
            r#"["/layers/parent", "/layers/base"]"#,
        )
        .unwrap();
        assert_eq!(
            read_parent_chain(dir.path()).unwrap(),
            vec![PathBuf::from("/layers/parent"), PathBuf::from("/layers/base")]
        );

        std::fs::write(dir.path().join(LAYER_CHAIN_FILE), "not json").unwrap();
        assert!(matches!(
            read_parent_chain(dir.path()),
            Err(Error::InvalidLayerChain { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_host_layer_path_unchanged_on_unix() {
        assert_eq!(
            host_layer_path(Path::new("/layers/base")),
            PathBuf::from("/layers/base")
        );
    }
}
