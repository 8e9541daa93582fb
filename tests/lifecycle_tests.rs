//! # Lifecycle Tests
//!
//! End-to-end container lifecycle against the `LocalHost` backend: create,
//! exec, state and delete on a temporary store root, with real child
//! processes. Process tests need a POSIX shell and only run on Unix.

use hcsrun::host::{LayerStore, NetworkHost};
use hcsrun::{
    CallerIo, ContainerManager, ContainerSpec, ContainerStatus, DiskLimit, Error, ErrorCategory,
    FORCED_KILL_EXIT_CODE, HostServices, LayerSequencer, LocalHost, ProcessSpec,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

struct Fixture {
    _dir: TempDir,
    host: Arc<LocalHost>,
    rootfs: PathBuf,
    bundles: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("images").join("base");
        let bundles = dir.path().join("bundles");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::create_dir_all(&bundles).unwrap();
        let host = Arc::new(LocalHost::new(dir.path().join("store")));
        Self {
            _dir: dir,
            host,
            rootfs,
            bundles,
        }
    }

    fn manager(&self, id: &str) -> ContainerManager {
        ContainerManager::new(id, HostServices::from_backend(self.host.clone()), "test-nat")
    }

    /// Writes a bundle for `id` and returns its directory.
    fn bundle(&self, id: &str, windows_extra: serde_json::Value) -> PathBuf {
        let bundle = self.bundles.join(id);
        std::fs::create_dir_all(bundle.join("rootfs")).unwrap();

        let mut windows = json!({ "layerFolders": [self.rootfs] });
        if let (Some(windows), Some(extra)) = (windows.as_object_mut(), windows_extra.as_object()) {
            windows.extend(extra.clone());
        }
        let config = json!({
            "ociVersion": "1.0.2",
            "root": { "path": "rootfs" },
            "process": { "args": ["sh", "-c", "exit 0"], "cwd": "/" },
            "annotations": { "io.example/team": "platform" },
            "windows": windows,
        });
        std::fs::write(bundle.join("config.json"), config.to_string()).unwrap();
        bundle
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.host.root().join("layers").join(id)
    }
}

async fn create(fixture: &Fixture, id: &str, windows_extra: serde_json::Value) -> (ContainerManager, ContainerSpec) {
    let bundle = fixture.bundle(id, windows_extra);
    let spec = ContainerSpec::load(&bundle).unwrap();
    let manager = fixture.manager(id);
    let resolved = manager.create(&bundle, &spec).await.unwrap();
    (manager, resolved)
}

fn port_mapping(host_port: u16, container_port: u16) -> serde_json::Value {
    json!({
        "network": {
            "rules": [
                { "type": "portMapping", "hostPort": host_port, "containerPort": container_port, "protocol": "tcp" }
            ]
        }
    })
}

// =============================================================================
// Create / State / Delete
// =============================================================================

#[tokio::test]
async fn test_create_state_delete() {
    let fixture = Fixture::new();
    let (manager, resolved) = create(&fixture, "web", json!({})).await;

    let volume = fixture.layer_dir("web").join("volume");
    assert_eq!(resolved.root.as_ref().unwrap().path, volume.to_string_lossy());
    assert_eq!(resolved.layer_folders(), [fixture.rootfs.clone()]);
    assert!(volume.is_dir());

    let state = manager.state().await.unwrap();
    assert_eq!(state.id, "web");
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(state.bundle, fixture.bundles.join("web").to_string_lossy());
    assert_eq!(state.annotations["io.example/team"], "platform");
    assert!(state.network.is_none());

    manager.delete().await.unwrap();
    assert!(!fixture.layer_dir("web").exists());
    let err = manager.state().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let fixture = Fixture::new();
    let (manager, _) = create(&fixture, "web", json!({})).await;

    manager.delete().await.unwrap();
    manager.delete().await.unwrap();
    fixture.manager("never-created").delete().await.unwrap();
}

#[tokio::test]
async fn test_create_conflict_leaves_container_untouched() {
    let fixture = Fixture::new();
    let (manager, _) = create(&fixture, "web", json!({})).await;

    let bundle = fixture.bundles.join("web");
    let spec = ContainerSpec::load(&bundle).unwrap();
    let err = fixture.manager("web").create(&bundle, &spec).await.unwrap_err();
    assert!(matches!(err, Error::ContainerAlreadyExists(_)));

    assert!(fixture.layer_dir("web").join("volume").is_dir());
    assert_eq!(manager.state().await.unwrap().status, ContainerStatus::Created);
}

#[tokio::test]
async fn test_bundle_name_must_match_id() {
    let fixture = Fixture::new();
    let bundle = fixture.bundle("web", json!({}));
    let spec = ContainerSpec::load(&bundle).unwrap();

    let err = fixture.manager("api").create(&bundle, &spec).await.unwrap_err();
    assert!(matches!(err, Error::InvalidContainerId { .. }));
    assert!(!fixture.layer_dir("api").exists());
}

#[tokio::test]
async fn test_missing_rootfs_provisions_nothing() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(&fixture.rootfs).unwrap();
    let bundle = fixture.bundle("web", json!({}));
    let spec = ContainerSpec::load(&bundle).unwrap();

    let err = fixture.manager("web").create(&bundle, &spec).await.unwrap_err();
    assert!(err.to_string().contains("rootfs layer does not exist"));
    assert!(!fixture.layer_dir("web").exists());
}

#[tokio::test]
async fn test_missing_bundle_root_provisions_nothing() {
    let fixture = Fixture::new();
    let bundle = fixture.bundle("web", json!({}));
    std::fs::remove_dir(bundle.join("rootfs")).unwrap();
    let spec = ContainerSpec::load(&bundle).unwrap();

    let err = fixture.manager("web").create(&bundle, &spec).await.unwrap_err();
    assert!(matches!(err, Error::InvalidBundle { .. }));
    assert!(err.to_string().contains("root path rootfs does not exist"));
    assert!(!fixture.layer_dir("web").exists());
    assert_eq!(
        fixture.manager("web").state().await.unwrap_err().category(),
        ErrorCategory::NotFound
    );
}

#[tokio::test]
async fn test_sandbox_size_sets_quota() {
    let fixture = Fixture::new();
    let storage = json!({ "resources": { "storage": { "sandboxSize": 1048576 } } });
    let (_manager, _) = create(&fixture, "web", storage).await;

    let record: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fixture.layer_dir("web").join("layer.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(record["quotaBytes"], 1048576);
}

// =============================================================================
// Network
// =============================================================================

#[tokio::test]
async fn test_allocated_port_is_reported() {
    let fixture = Fixture::new();
    let (manager, resolved) = create(&fixture, "web", port_mapping(0, 80)).await;

    let network = resolved.network().unwrap();
    assert_eq!(network.endpoint_list.len(), 1);
    let hcsrun::NetRule::PortMapping(mapping) = network.rules[0] else {
        panic!("expected a port mapping");
    };
    assert_eq!(mapping.container_port, 80);
    assert_ne!(mapping.host_port, 0);

    let state = manager.state().await.unwrap();
    let endpoint = state.network.unwrap();
    assert_eq!(endpoint.name, "web");
    assert!(endpoint.ip_address.is_some());
    assert_eq!(endpoint.port_mappings, vec![mapping]);

    manager.delete().await.unwrap();
    assert!(fixture.host.endpoint_by_name("web").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_every_allocated_port_is_reported() {
    let fixture = Fixture::new();
    let mapping = json!({ "type": "portMapping", "hostPort": 0, "containerPort": 80, "protocol": "tcp" });
    let (manager, resolved) =
        create(&fixture, "web", json!({ "network": { "rules": [mapping.clone(), mapping] } })).await;

    let ports: Vec<u16> = resolved
        .network()
        .unwrap()
        .rules
        .iter()
        .map(|rule| match rule {
            hcsrun::NetRule::PortMapping(mapping) => mapping.host_port,
            other => panic!("unexpected rule: {other:?}"),
        })
        .collect();
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().all(|&port| port != 0));
    assert_ne!(ports[0], ports[1]);

    let endpoint = manager.state().await.unwrap().network.unwrap();
    assert_eq!(endpoint.port_mappings.len(), 2);

    manager.delete().await.unwrap();
}

#[tokio::test]
async fn test_port_collision_rolls_back_second_container() {
    let fixture = Fixture::new();
    let (first, _) = create(&fixture, "web", port_mapping(18080, 80)).await;

    let bundle = fixture.bundle("api", port_mapping(18080, 8080));
    let spec = ContainerSpec::load(&bundle).unwrap();
    let second = fixture.manager("api");
    let err = second.create(&bundle, &spec).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Host);

    // Nothing of the failed create survives.
    assert!(!fixture.layer_dir("api").exists());
    assert!(fixture.host.endpoint_by_name("api").await.unwrap_err().is_not_found());
    assert_eq!(second.state().await.unwrap_err().category(), ErrorCategory::NotFound);

    // The first container keeps its mapping.
    let endpoint = first.state().await.unwrap().network.unwrap();
    assert_eq!(endpoint.port_mappings[0].host_port, 18080);

    // Once released, the port can be taken again.
    first.delete().await.unwrap();
    second.create(&bundle, &spec).await.unwrap();
}

#[tokio::test]
async fn test_invalid_rule_fails_before_endpoint_exists() {
    let fixture = Fixture::new();
    let bundle = fixture.bundle("web", port_mapping(8080, 0));
    let spec = ContainerSpec::load(&bundle).unwrap();

    let err = fixture.manager("web").create(&bundle, &spec).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(fixture.host.endpoint_by_name("web").await.unwrap_err().is_not_found());
    assert!(!fixture.layer_dir("web").exists());
}

// =============================================================================
// Pre-provisioned Layers
// =============================================================================

#[tokio::test]
async fn test_create_adopts_existing_sandbox() {
    let fixture = Fixture::new();
    let layers = LayerSequencer::new(fixture.host.clone());
    let layer = layers
        .create_sandbox("web", &fixture.rootfs, &[], DiskLimit::NONE)
        .await
        .unwrap();

    let (manager, resolved) = create(&fixture, "web", json!({})).await;
    assert_eq!(
        resolved.root.as_ref().unwrap().path,
        layer.volume_path.to_string_lossy()
    );

    manager.delete().await.unwrap();
    assert!(!fixture.host.sandbox_exists("web").await.unwrap());
}

#[tokio::test]
async fn test_failed_create_keeps_adopted_sandbox() {
    let fixture = Fixture::new();
    let layers = LayerSequencer::new(fixture.host.clone());
    layers
        .create_sandbox("web", &fixture.rootfs, &[], DiskLimit::NONE)
        .await
        .unwrap();

    let bundle = fixture.bundle("web", port_mapping(8080, 0));
    let spec = ContainerSpec::load(&bundle).unwrap();
    fixture.manager("web").create(&bundle, &spec).await.unwrap_err();

    assert!(fixture.host.sandbox_exists("web").await.unwrap());
    layers.destroy_sandbox("web").await.unwrap();
}

// =============================================================================
// Processes
// =============================================================================

#[cfg(unix)]
mod processes {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec::from_args(vec!["sh".into(), "-c".into(), script.into()])
    }

    /// Runs `process` attached with `stdin` and returns (exit code, stdout, stderr).
    async fn run_attached(
        manager: &ContainerManager,
        process: &ProcessSpec,
        stdin: &'static [u8],
        interrupt: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> (i32, String, String) {
        let handle = manager.exec(process, false).await.unwrap();
        let (stdout, mut stdout_rx) = tokio::io::duplex(64 * 1024);
        let (stderr, mut stderr_rx) = tokio::io::duplex(64 * 1024);
        let io = CallerIo {
            stdin,
            stdout,
            stderr,
        };
        let code = handle.attach(io, interrupt).await.unwrap();

        let mut out = String::new();
        let mut err = String::new();
        stdout_rx.read_to_string(&mut out).await.unwrap();
        stderr_rx.read_to_string(&mut err).await.unwrap();
        (code, out, err)
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let fixture = Fixture::new();
        let (manager, _) = create(&fixture, "web", json!({})).await;

        let (code, out, err) = run_attached(
            &manager,
            &shell("echo out; echo err >&2; exit 5"),
            b"",
            std::future::pending(),
        )
        .await;
        assert_eq!(code, 5);
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");

        manager.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_follow_detached_process() {
        let fixture = Fixture::new();
        let memory = json!({ "resources": { "memory": { "limit": 67108864 } } });
        let (manager, _) = create(&fixture, "web", memory).await;

        let idle = manager.stats().await.unwrap();
        assert_eq!(idle.kind, "stats");
        assert_eq!(idle.id, "web");
        assert_eq!(idle.data.process_count, 0);
        assert_eq!(idle.data.memory_limit_bytes, Some(67_108_864));

        let _handle = manager.exec(&shell("exec sleep 30"), true).await.unwrap();
        assert_eq!(manager.stats().await.unwrap().data.process_count, 1);

        manager.delete().await.unwrap();
        assert!(matches!(
            manager.stats().await.unwrap_err(),
            Error::ContainerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_stdin_is_relayed() {
        let fixture = Fixture::new();
        let (manager, _) = create(&fixture, "web", json!({})).await;

        let cat = ProcessSpec::from_args(vec!["cat".into()]);
        let (code, out, _) =
            run_attached(&manager, &cat, b"hello\nworld\n", std::future::pending()).await;
        assert_eq!(code, 0);
        assert_eq!(out, "hello\nworld\n");

        manager.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_kills_process() {
        let fixture = Fixture::new();
        let (manager, _) = create(&fixture, "web", json!({})).await;

        let (code, _, _) = run_attached(
            &manager,
            &shell("exec sleep 30"),
            b"",
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;
        assert_eq!(code, FORCED_KILL_EXIT_CODE);

        manager.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_working_directory_is_inside_volume() {
        let fixture = Fixture::new();
        let (manager, resolved) = create(&fixture, "web", json!({})).await;
        let volume = PathBuf::from(&resolved.root.as_ref().unwrap().path);
        std::fs::create_dir_all(volume.join("app")).unwrap();

        let mut process = shell("pwd -P");
        process.cwd = "/app".to_string();
        let (code, out, _) = run_attached(&manager, &process, b"", std::future::pending()).await;
        assert_eq!(code, 0);
        assert_eq!(
            Path::new(out.trim()),
            volume.join("app").canonicalize().unwrap()
        );

        manager.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_process_runs_until_delete() {
        let fixture = Fixture::new();
        let (manager, _) = create(&fixture, "web", json!({})).await;

        let handle = manager.exec(&shell("exec sleep 30"), true).await.unwrap();
        assert!(handle.is_detached());
        assert!(handle.exit_code().is_err());
        assert_eq!(manager.state().await.unwrap().status, ContainerStatus::Running);

        manager.delete().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), FORCED_KILL_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_exec_after_delete_is_not_found() {
        let fixture = Fixture::new();
        let (manager, _) = create(&fixture, "web", json!({})).await;
        manager.delete().await.unwrap();

        let err = manager.exec(&shell("true"), true).await.unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn test_exec_environment() {
        let fixture = Fixture::new();
        let (manager, _) = create(&fixture, "web", json!({})).await;

        let mut process = shell("printf %s \"$GREETING\"");
        process.env.push("GREETING=hello".to_string());
        let (code, out, _) = run_attached(&manager, &process, b"", std::future::pending()).await;
        assert_eq!(code, 0);
        assert_eq!(out, "hello");

        manager.delete().await.unwrap();
    }
}
