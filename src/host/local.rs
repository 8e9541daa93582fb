//! # Local Host Backend
//!
//! Implements every host capability on the local machine, rooted at one store
//! directory:
//!
//! ```text
//! <root>/
//! ├── layers/<id>/layer.json      sandbox layer record (state, parents, quota)
//! ├── layers/<id>/volume/         the sandbox volume once prepared
//! ├── containers/<id>.json        host container record
//! ├── endpoints/<uuid>.json       endpoint record with applied policies
//! └── networks/<name>.json        network record, created on first lookup
//! ```
//!
//! Processes are real child processes. Their working directory resolves
//! inside the sandbox volume, and each one is reaped by a supervisor task
//! that publishes its exit code. A forcefully killed process reports
//! [`FORCED_KILL_EXIT_CODE`].
//!
//! Mapped directories and disk quotas are recorded but not enforced.
//!
//! Record updates are serialized within one process. Separate invocations
//! sharing a store are expected to be sequenced by the caller, as an
//! orchestrator does.

use super::{
    ComputeHost, ContainerConfig, ContainerProperties, ContainerStats, EndpointPolicy, EndpointRequest,
    HostContainerState, HostEndpoint, HostError, HostErrorKind, HostNetwork, HostProcess,
    HostResult, LayerStore, NetworkHost, PolicyProtocol, ProcessConfig, ProcessStdio,
};
use crate::constants::{
    CONTAINER_STATE_DIR, ENDPOINT_DIR, FORCED_KILL_EXIT_CODE, LAYER_DIR, LOCAL_NETWORK_SUBNET,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

const LAYER_RECORD: &str = "layer.json";
const VOLUME_DIR: &str = "volume";
const NETWORK_DIR: &str = "networks";

/// Attempts at finding a free host port before giving up.
const PORT_ALLOCATION_ATTEMPTS: usize = 32;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LayerState {
    Created,
    Activated,
    Prepared,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayerRecord {
    id: String,
    parents: Vec<PathBuf>,
    state: LayerState,
    #[serde(default)]
    quota_bytes: Option<u64>,
    created: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerRecord {
    config: ContainerConfig,
    state: HostContainerState,
    pid: Option<u32>,
    created: DateTime<Utc>,
    /// Pids of every process started in the container.
    #[serde(default)]
    processes: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointRecord {
    endpoint: HostEndpoint,
    #[serde(default)]
    dns_servers: Vec<String>,
    #[serde(default)]
    dns_search: Vec<String>,
}

// =============================================================================
// LocalHost
// =============================================================================

/// Host capabilities backed by the local filesystem and process table.
pub struct LocalHost {
    root: PathBuf,
    /// Serializes read-modify-write cycles on records.
    records: tokio::sync::Mutex<()>,
    /// Processes started by this invocation, by pid.
    children: RwLock<HashMap<u32, Arc<LocalProcess>>>,
}

impl LocalHost {
    /// Creates a backend rooted at `root`. Directories are created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            records: tokio::sync::Mutex::new(()),
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.root.join(LAYER_DIR).join(id)
    }

    fn layer_record_path(&self, id: &str) -> PathBuf {
        self.layer_dir(id).join(LAYER_RECORD)
    }

    fn volume_path(&self, id: &str) -> PathBuf {
        self.layer_dir(id).join(VOLUME_DIR)
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.root.join(CONTAINER_STATE_DIR).join(format!("{id}.json"))
    }

    fn endpoint_path(&self, id: &str) -> PathBuf {
        self.root.join(ENDPOINT_DIR).join(format!("{id}.json"))
    }

    fn network_path(&self, name: &str) -> PathBuf {
        self.root.join(NETWORK_DIR).join(format!("{name}.json"))
    }

    fn child(&self, pid: u32) -> Option<Arc<LocalProcess>> {
        self.children
            .read()
            .ok()
            .and_then(|children| children.get(&pid).cloned())
    }

    fn is_live(&self, pid: u32) -> bool {
        match self.child(pid) {
            Some(child) => child.exit_code().is_none(),
            None => pid_alive(pid),
        }
    }

    /// Kills every live process recorded for a container and waits for the
    /// ones this invocation supervises.
    async fn kill_processes(&self, record: &ContainerRecord) {
        for &pid in &record.processes {
            match self.child(pid) {
                Some(child) => {
                    if let Err(err) = child.kill().await {
                        warn!(pid, error = %err, "Failed to kill process");
                    }
                    if let Err(err) = child.wait().await {
                        warn!(pid, error = %err, "Failed to reap process");
                    }
                }
                None if pid_alive(pid) => kill_pid(pid),
                None => {}
            }
        }
    }

    async fn read_layer(&self, id: &str, operation: &str) -> HostResult<LayerRecord> {
        read_record(&self.layer_record_path(id), operation).await
    }

    async fn write_layer(&self, record: &LayerRecord, operation: &str) -> HostResult<()> {
        write_record(&self.layer_record_path(&record.id), record, operation).await
    }

    async fn read_container(&self, id: &str, operation: &str) -> HostResult<ContainerRecord> {
        read_record(&self.container_path(id), operation).await
    }

    async fn write_container(&self, record: &ContainerRecord, operation: &str) -> HostResult<()> {
        write_record(&self.container_path(&record.config.id), record, operation).await
    }

    async fn load_endpoints(&self, operation: &str) -> HostResult<Vec<EndpointRecord>> {
        let dir = self.root.join(ENDPOINT_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(operation, &dir, &e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(operation, &dir, &e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                records.push(read_record(&path, operation).await?);
            }
        }
        Ok(records)
    }

    async fn network_exists(&self, network_id: &str) -> HostResult<bool> {
        let dir = self.root.join(NETWORK_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error("get network", &dir, &e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("get network", &dir, &e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let network: HostNetwork = read_record(&path, "get network").await?;
            if network.id == network_id {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// =============================================================================
// Layer Store
// =============================================================================

#[async_trait]
impl LayerStore for LocalHost {
    async fn layer_exists(&self, path: &Path) -> HostResult<bool> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false))
    }

    async fn sandbox_exists(&self, id: &str) -> HostResult<bool> {
        let path = self.layer_record_path(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("get layer", &path, &e))
    }

    async fn create_sandbox_layer(&self, id: &str, parents: &[PathBuf]) -> HostResult<()> {
        let _records = self.records.lock().await;
        let dir = self.layer_dir(id);
        if tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| io_error("create layer", &dir, &e))?
        {
            return Err(HostError::new(
                HostErrorKind::AlreadyExists,
                "create layer",
                format!("layer {id} already exists"),
            ));
        }
        let record = LayerRecord {
            id: id.to_string(),
            parents: parents.to_vec(),
            state: LayerState::Created,
            quota_bytes: None,
            created: Utc::now(),
        };
        self.write_layer(&record, "create layer").await?;
        debug!(layer = id, "Layer created");
        Ok(())
    }

    async fn activate_layer(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_layer(id, "activate layer").await?;
        if record.state == LayerState::Created {
            record.state = LayerState::Activated;
            self.write_layer(&record, "activate layer").await?;
        }
        Ok(())
    }

    async fn prepare_layer(&self, id: &str, parents: &[PathBuf]) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_layer(id, "prepare layer").await?;
        match record.state {
            LayerState::Created => Err(HostError::other(
                "prepare layer",
                format!("layer {id} is not activated"),
            )),
            LayerState::Prepared => Ok(()),
            LayerState::Activated => {
                let volume = self.volume_path(id);
                tokio::fs::create_dir_all(&volume)
                    .await
                    .map_err(|e| io_error("prepare layer", &volume, &e))?;
                record.parents = parents.to_vec();
                record.state = LayerState::Prepared;
                self.write_layer(&record, "prepare layer").await
            }
        }
    }

    async fn layer_mount_path(&self, id: &str) -> HostResult<PathBuf> {
        let record = self.read_layer(id, "get layer mount path").await?;
        if record.state != LayerState::Prepared {
            return Err(HostError::other(
                "get layer mount path",
                format!("layer {id} is not prepared"),
            ));
        }
        Ok(self.volume_path(id))
    }

    async fn set_disk_quota(&self, id: &str, bytes: u64) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_layer(id, "set disk quota").await?;
        record.quota_bytes = Some(bytes);
        self.write_layer(&record, "set disk quota").await
    }

    async fn unprepare_layer(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_layer(id, "unprepare layer").await?;
        if record.state == LayerState::Prepared {
            record.state = LayerState::Activated;
            self.write_layer(&record, "unprepare layer").await?;
        }
        Ok(())
    }

    async fn deactivate_layer(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_layer(id, "deactivate layer").await?;
        if record.state != LayerState::Created {
            record.state = LayerState::Created;
            self.write_layer(&record, "deactivate layer").await?;
        }
        Ok(())
    }

    async fn destroy_layer(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let dir = self.layer_dir(id);
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_error("destroy layer", &dir, &e))?;
        debug!(layer = id, "Layer destroyed");
        Ok(())
    }
}

// =============================================================================
// Compute
// =============================================================================

#[async_trait]
impl ComputeHost for LocalHost {
    async fn container_properties(&self, id: &str) -> HostResult<ContainerProperties> {
        let record = self.read_container(id, "get container").await?;
        let process_count = record
            .processes
            .iter()
            .filter(|&&pid| self.is_live(pid))
            .count();
        Ok(ContainerProperties {
            id: record.config.id.clone(),
            owner: record.config.owner.clone(),
            state: record.state,
            pid: record.pid,
            created: record.created,
            process_count,
            endpoint_id: record.config.endpoint_id,
        })
    }

    async fn container_stats(&self, id: &str) -> HostResult<ContainerStats> {
        let record = self.read_container(id, "get container stats").await?;
        let mut stats = ContainerStats {
            memory_limit_bytes: record.config.memory_limit_bytes,
            ..Default::default()
        };
        for &pid in record.processes.iter().filter(|&&pid| self.is_live(pid)) {
            stats.process_count += 1;
            if let Some(usage) = process_usage(pid).await {
                stats.memory_usage_bytes += usage.resident_bytes;
                stats.cpu_usage_nanos += usage.cpu_nanos;
            }
        }
        Ok(stats)
    }

    async fn create_container(&self, config: &ContainerConfig) -> HostResult<()> {
        let _records = self.records.lock().await;
        let path = self.container_path(&config.id);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("create container", &path, &e))?
        {
            return Err(HostError::new(
                HostErrorKind::AlreadyExists,
                "create container",
                format!("container {} already exists", config.id),
            ));
        }
        let record = ContainerRecord {
            config: config.clone(),
            state: HostContainerState::Created,
            pid: None,
            created: Utc::now(),
            processes: Vec::new(),
        };
        self.write_container(&record, "create container").await
    }

    async fn start_container(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_container(id, "start container").await?;
        match record.state {
            HostContainerState::Running => Ok(()),
            HostContainerState::Stopped => Err(HostError::other(
                "start container",
                format!("container {id} has stopped"),
            )),
            HostContainerState::Created => {
                record.state = HostContainerState::Running;
                record.pid = Some(std::process::id());
                self.write_container(&record, "start container").await
            }
        }
    }

    async fn create_process(
        &self,
        id: &str,
        config: &ProcessConfig,
    ) -> HostResult<Arc<dyn HostProcess>> {
        let _records = self.records.lock().await;
        let mut record = self.read_container(id, "create process").await?;
        if record.state != HostContainerState::Running {
            return Err(HostError::other(
                "create process",
                format!("container {id} is not running"),
            ));
        }

        let cwd = resolve_in_volume(&record.config.volume_path, &config.cwd);
        let process = LocalProcess::spawn(config, &cwd)?;
        let pid = process.pid;

        if let Ok(mut children) = self.children.write() {
            children.insert(pid, process.clone());
        }
        record.processes.push(pid);
        self.write_container(&record, "create process").await?;
        debug!(container_id = id, pid, cwd = %cwd.display(), "Process started");
        Ok(process)
    }

    async fn terminate_container(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let mut record = self.read_container(id, "terminate container").await?;
        self.kill_processes(&record).await;
        record.state = HostContainerState::Stopped;
        self.write_container(&record, "terminate container").await
    }

    async fn delete_container(&self, id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let record = self.read_container(id, "delete container").await?;
        self.kill_processes(&record).await;
        let path = self.container_path(id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error("delete container", &path, &e))
    }
}

// =============================================================================
// Network
// =============================================================================

#[async_trait]
impl NetworkHost for LocalHost {
    async fn network_by_name(&self, name: &str) -> HostResult<HostNetwork> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(HostError::other(
                "get network",
                format!("invalid network name '{name}'"),
            ));
        }
        let _records = self.records.lock().await;
        let path = self.network_path(name);
        match read_record(&path, "get network").await {
            Ok(network) => Ok(network),
            Err(err) if err.is_not_found() => {
                let network = HostNetwork {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: name.to_string(),
                };
                write_record(&path, &network, "create network").await?;
                debug!(network = name, network_id = %network.id, "Network created");
                Ok(network)
            }
            Err(err) => Err(err),
        }
    }

    async fn create_endpoint(&self, request: &EndpointRequest) -> HostResult<HostEndpoint> {
        let _records = self.records.lock().await;
        if !self.network_exists(&request.network_id).await? {
            return Err(HostError::not_found(
                "create endpoint",
                format!("network {} does not exist", request.network_id),
            ));
        }

        let existing = self.load_endpoints("create endpoint").await?;
        if existing.iter().any(|r| r.endpoint.name == request.name) {
            return Err(HostError::new(
                HostErrorKind::AlreadyExists,
                "create endpoint",
                format!("endpoint {} already exists", request.name),
            ));
        }

        let used: HashSet<Ipv4Addr> = existing
            .iter()
            .filter_map(|r| r.endpoint.ip_address)
            .collect();
        let endpoint = HostEndpoint {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.clone(),
            network_id: request.network_id.clone(),
            ip_address: Some(allocate_address(&used)?),
            policies: Vec::new(),
        };
        let record = EndpointRecord {
            endpoint: endpoint.clone(),
            dns_servers: request.dns_servers.clone(),
            dns_search: request.dns_search.clone(),
        };
        write_record(&self.endpoint_path(&endpoint.id), &record, "create endpoint").await?;
        Ok(endpoint)
    }

    async fn apply_policies(
        &self,
        endpoint_id: &str,
        policies: &[EndpointPolicy],
    ) -> HostResult<HostEndpoint> {
        let _records = self.records.lock().await;
        let endpoints = self.load_endpoints("apply policies").await?;

        let mut taken: HashSet<(PolicyProtocol, u16)> = HashSet::new();
        let mut own = None;
        for record in endpoints {
            if record.endpoint.id == endpoint_id {
                own = Some(record);
                continue;
            }
            for policy in &record.endpoint.policies {
                if let EndpointPolicy::Nat {
                    protocol,
                    external_port,
                    ..
                } = policy
                {
                    taken.insert((*protocol, *external_port));
                }
            }
        }
        let mut record = own.ok_or_else(|| {
            HostError::not_found("apply policies", format!("endpoint {endpoint_id}"))
        })?;

        let mut applied = Vec::with_capacity(policies.len());
        for policy in policies {
            match policy {
                EndpointPolicy::Nat {
                    protocol,
                    internal_port,
                    external_port,
                } => {
                    let external_port = if *external_port == 0 {
                        allocate_port(*protocol, &taken)?
                    } else if taken.contains(&(*protocol, *external_port)) {
                        return Err(HostError::new(
                            HostErrorKind::PortInUse,
                            "apply policies",
                            format!("host port {external_port}/{protocol:?} is in use by another endpoint"),
                        ));
                    } else {
                        *external_port
                    };
                    taken.insert((*protocol, external_port));
                    applied.push(EndpointPolicy::Nat {
                        protocol: *protocol,
                        internal_port: *internal_port,
                        external_port,
                    });
                }
                EndpointPolicy::Acl { .. } => applied.push(policy.clone()),
            }
        }
        applied.sort();
        record.endpoint.policies = applied;

        write_record(&self.endpoint_path(endpoint_id), &record, "apply policies").await?;
        Ok(record.endpoint)
    }

    async fn endpoint_by_name(&self, name: &str) -> HostResult<HostEndpoint> {
        self.load_endpoints("get endpoint")
            .await?
            .into_iter()
            .map(|record| record.endpoint)
            .find(|endpoint| endpoint.name == name)
            .ok_or_else(|| HostError::not_found("get endpoint", format!("endpoint {name}")))
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> HostResult<()> {
        let _records = self.records.lock().await;
        let path = self.endpoint_path(endpoint_id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error("delete endpoint", &path, &e))
    }
}

// =============================================================================
// Processes
// =============================================================================

/// A child process reaped by a supervisor task.
struct LocalProcess {
    pid: u32,
    stdio: Mutex<Option<ProcessStdio>>,
    exit: watch::Receiver<Option<i32>>,
    kill_tx: mpsc::Sender<()>,
}

impl LocalProcess {
    fn spawn(config: &ProcessConfig, cwd: &Path) -> HostResult<Arc<Self>> {
        let (program, args) = config
            .args
            .split_first()
            .ok_or_else(|| HostError::other("create process", "empty command line"))?;
        if !cwd.is_dir() {
            return Err(HostError::other(
                "create process",
                format!("working directory {} does not exist", cwd.display()),
            ));
        }

        let mut command = Command::new(program);
        command.args(args).current_dir(cwd).kill_on_drop(false);
        for entry in &config.env {
            match entry.split_once('=') {
                Some((key, value)) => {
                    command.env(key, value);
                }
                None => debug!(entry = %entry, "Ignoring malformed environment entry"),
            }
        }
        if config.create_stdio {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        // Spawn failures are never NotFound: that kind is reserved for the container.
        let mut child = command
            .spawn()
            .map_err(|e| HostError::other("create process", format!("{program}: {e}")))?;
        let pid = child.id().ok_or_else(|| {
            HostError::other("create process", "process exited before its pid was read")
        })?;

        let stdio = if config.create_stdio {
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => Some(ProcessStdio {
                    stdin: Box::new(stdin),
                    stdout: Box::new(stdout),
                    stderr: Box::new(stderr),
                }),
                _ => {
                    return Err(HostError::other(
                        "create process",
                        format!("stdio pipes of process {pid} are unavailable"),
                    ));
                }
            }
        } else {
            None
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let (status, killed) = tokio::select! {
                status = child.wait() => (status, false),
                Some(()) = kill_rx.recv() => {
                    if let Err(err) = child.start_kill() {
                        debug!(pid, error = %err, "Kill raced with process exit");
                    }
                    (child.wait().await, true)
                }
            };
            let code = match status {
                Ok(status) if !killed => status.code().unwrap_or(FORCED_KILL_EXIT_CODE),
                Ok(_) => FORCED_KILL_EXIT_CODE,
                Err(err) => {
                    warn!(pid, error = %err, "Failed to reap process");
                    FORCED_KILL_EXIT_CODE
                }
            };
            exit_tx.send_replace(Some(code));
        });

        Ok(Arc::new(Self {
            pid,
            stdio: Mutex::new(stdio),
            exit: exit_rx,
            kill_tx,
        }))
    }
}

#[async_trait]
impl HostProcess for LocalProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_stdio(&self) -> Option<ProcessStdio> {
        self.stdio.lock().ok()?.take()
    }

    async fn wait(&self) -> HostResult<()> {
        let mut exit = self.exit.clone();
        exit.wait_for(Option::is_some)
            .await
            .map(|_| ())
            .map_err(|_| {
                HostError::other(
                    "wait process",
                    format!("supervisor of process {} stopped", self.pid),
                )
            })
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    async fn kill(&self) -> HostResult<()> {
        if self.exit_code().is_some() {
            return Ok(());
        }
        // A full channel already carries a kill request.
        let _ = self.kill_tx.try_send(());
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn io_error(operation: &str, path: &Path, err: &std::io::Error) -> HostError {
    let mut error = HostError::io(operation, err);
    error.message = format!("{}: {err}", path.display());
    error
}

async fn read_record<T: DeserializeOwned>(path: &Path, operation: &str) -> HostResult<T> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| io_error(operation, path, &e))?;
    serde_json::from_slice(&data).map_err(|e| {
        HostError::other(operation, format!("corrupt record {}: {e}", path.display()))
    })
}

async fn write_record<T: Serialize>(path: &Path, value: &T, operation: &str) -> HostResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(operation, parent, &e))?;
    }
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| HostError::other(operation, e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| io_error(operation, &tmp, &e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(operation, path, &e))
}

/// Maps a container path (`C:\app`, `/app`) into the sandbox volume.
/// Parent components are dropped so the result never leaves the volume.
fn resolve_in_volume(volume: &Path, cwd: &str) -> PathBuf {
    let without_drive = match cwd.as_bytes() {
        [drive, b':', ..] if drive.is_ascii_alphabetic() => &cwd[2..],
        _ => cwd,
    };
    without_drive
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(volume.to_path_buf(), |path, part| path.join(part))
}

/// First free address of the local subnet, skipping the network address and
/// the gateway.
fn allocate_address(used: &HashSet<Ipv4Addr>) -> HostResult<Ipv4Addr> {
    let subnet: Ipv4Network = LOCAL_NETWORK_SUBNET
        .parse()
        .map_err(|e| HostError::other("create endpoint", format!("bad subnet: {e}")))?;
    let broadcast = subnet.broadcast();
    subnet
        .iter()
        .skip(2)
        .find(|addr| *addr != broadcast && !used.contains(addr))
        .ok_or_else(|| HostError::other("create endpoint", "address pool exhausted"))
}

/// Asks the OS for a free port not held by another endpoint.
fn allocate_port(protocol: PolicyProtocol, taken: &HashSet<(PolicyProtocol, u16)>) -> HostResult<u16> {
    for _ in 0..PORT_ALLOCATION_ATTEMPTS {
        let port = match protocol {
            PolicyProtocol::Tcp => std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
                .and_then(|listener| listener.local_addr()),
            PolicyProtocol::Udp => std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .and_then(|socket| socket.local_addr()),
            PolicyProtocol::Icmp | PolicyProtocol::Any => {
                return Err(HostError::other(
                    "apply policies",
                    format!("NAT requires tcp or udp, got {protocol:?}"),
                ));
            }
        }
        .map_err(|e| HostError::other("apply policies", format!("allocate host port: {e}")))?
        .port();
        if !taken.contains(&(protocol, port)) {
            return Ok(port);
        }
    }
    Err(HostError::new(
        HostErrorKind::PortInUse,
        "apply policies",
        "no free host port available",
    ))
}

/// Resource usage of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessUsage {
    resident_bytes: u64,
    cpu_nanos: u64,
}

#[cfg(target_os = "linux")]
async fn process_usage(pid: u32) -> Option<ProcessUsage> {
    let proc_dir = PathBuf::from("/proc").join(pid.to_string());
    let statm = tokio::fs::read_to_string(proc_dir.join("statm")).await.ok()?;
    let stat = tokio::fs::read_to_string(proc_dir.join("stat")).await.ok()?;
    // SAFETY: sysconf has no preconditions.
    let (page_size, ticks) = unsafe {
        (
            libc::sysconf(libc::_SC_PAGESIZE),
            libc::sysconf(libc::_SC_CLK_TCK),
        )
    };
    parse_proc_usage(
        &statm,
        &stat,
        u64::try_from(page_size).ok()?,
        u64::try_from(ticks).ok()?,
    )
}

#[cfg(not(target_os = "linux"))]
async fn process_usage(_pid: u32) -> Option<ProcessUsage> {
    None
}

/// Reads resident pages from `statm` and utime + stime from `stat`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_usage(
    statm: &str,
    stat: &str,
    page_size: u64,
    ticks_per_sec: u64,
) -> Option<ProcessUsage> {
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // The command name may contain spaces; fields resume after its ')'.
    let fields: Vec<&str> = stat.get(stat.rfind(')')? + 1..)?.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    if ticks_per_sec == 0 {
        return None;
    }
    Some(ProcessUsage {
        resident_bytes: resident_pages.saturating_mul(page_size),
        cpu_nanos: (utime + stime).saturating_mul(1_000_000_000) / ticks_per_sec,
    })
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists and may be signaled.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill() is safe to call with any pid; failure is reported via errno.
    let ret = unsafe { libc::kill(raw, libc::SIGKILL) };
    if ret != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) {
        warn!(pid, error = %std::io::Error::last_os_error(), "Failed to kill process");
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    warn!(pid, "Cannot kill a process started by another invocation on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_in_volume() {
        let volume = Path::new("/store/layers/c1/volume");
        assert_eq!(resolve_in_volume(volume, ""), volume);
        assert_eq!(resolve_in_volume(volume, "C:\\"), volume);
        assert_eq!(
            resolve_in_volume(volume, "C:\\Users\\app"),
            volume.join("Users").join("app")
        );
        assert_eq!(resolve_in_volume(volume, "/srv/../../etc"), volume.join("srv").join("etc"));
    }

    #[test]
    fn test_allocate_address_skips_used() {
        let first = allocate_address(&HashSet::new()).unwrap();
        assert_eq!(first, Ipv4Addr::new(172, 30, 0, 2));
        let used: HashSet<_> = [first].into_iter().collect();
        assert_eq!(allocate_address(&used).unwrap(), Ipv4Addr::new(172, 30, 0, 3));
    }

    #[tokio::test]
    async fn test_layer_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());

        assert!(!host.sandbox_exists("c1").await.unwrap());
        host.create_sandbox_layer("c1", &[]).await.unwrap();
        assert!(host.sandbox_exists("c1").await.unwrap());

        let err = host.create_sandbox_layer("c1", &[]).await.unwrap_err();
        assert_eq!(err.kind, HostErrorKind::AlreadyExists);

        // Not prepared yet.
        assert!(host.layer_mount_path("c1").await.is_err());
        assert!(host.prepare_layer("c1", &[]).await.is_err());

        host.activate_layer("c1").await.unwrap();
        host.prepare_layer("c1", &[]).await.unwrap();
        let volume = host.layer_mount_path("c1").await.unwrap();
        assert!(volume.is_dir());

        host.unprepare_layer("c1").await.unwrap();
        host.deactivate_layer("c1").await.unwrap();
        host.destroy_layer("c1").await.unwrap();
        assert!(!host.sandbox_exists("c1").await.unwrap());
        assert!(host.destroy_layer("c1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_network_created_on_first_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());
        let first = host.network_by_name("nat").await.unwrap();
        let second = host.network_by_name("nat").await.unwrap();
        assert_eq!(first, second);
        assert!(host.network_by_name("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_endpoint_port_collision() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());
        let network = host.network_by_name("nat").await.unwrap();

        let request = |name: &str| EndpointRequest {
            name: name.to_string(),
            network_id: network.id.clone(),
            dns_servers: vec![],
            dns_search: vec![],
        };
        let nat = |external_port| EndpointPolicy::Nat {
            protocol: PolicyProtocol::Tcp,
            internal_port: 80,
            external_port,
        };

        let a = host.create_endpoint(&request("a")).await.unwrap();
        let b = host.create_endpoint(&request("b")).await.unwrap();
        assert_ne!(a.ip_address, b.ip_address);
        assert_eq!(
            host.create_endpoint(&request("a")).await.unwrap_err().kind,
            HostErrorKind::AlreadyExists
        );

        let applied = host.apply_policies(&a.id, &[nat(0)]).await.unwrap();
        let EndpointPolicy::Nat { external_port, .. } = applied.policies[0] else {
            panic!("expected NAT policy");
        };
        assert_ne!(external_port, 0);

        let err = host
            .apply_policies(&b.id, &[nat(external_port)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, HostErrorKind::PortInUse);

        // Same port on another protocol is fine.
        let udp = EndpointPolicy::Nat {
            protocol: PolicyProtocol::Udp,
            internal_port: 80,
            external_port,
        };
        host.apply_policies(&b.id, &[udp]).await.unwrap();

        host.delete_endpoint(&a.id).await.unwrap();
        assert!(host.endpoint_by_name("a").await.unwrap_err().is_not_found());
        host.apply_policies(&b.id, &[nat(external_port)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_container_record_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());
        let config = ContainerConfig {
            id: "c1".to_string(),
            owner: "/bundles/c1".to_string(),
            volume_path: dir.path().to_path_buf(),
            ..Default::default()
        };

        assert!(host.container_properties("c1").await.unwrap_err().is_not_found());
        host.create_container(&config).await.unwrap();
        assert_eq!(
            host.create_container(&config).await.unwrap_err().kind,
            HostErrorKind::AlreadyExists
        );

        let props = host.container_properties("c1").await.unwrap();
        assert_eq!(props.state, HostContainerState::Created);
        assert_eq!(props.owner, "/bundles/c1");

        host.start_container("c1").await.unwrap();
        let props = host.container_properties("c1").await.unwrap();
        assert_eq!(props.state, HostContainerState::Running);
        assert_eq!(props.process_count, 0);

        host.terminate_container("c1").await.unwrap();
        host.delete_container("c1").await.unwrap();
        assert!(host.delete_container("c1").await.unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_code_and_kill() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());
        let config = ContainerConfig {
            id: "c1".to_string(),
            volume_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        host.create_container(&config).await.unwrap();
        host.start_container("c1").await.unwrap();

        let exits = ProcessConfig {
            args: vec!["sh".into(), "-c".into(), "exit 5".into()],
            ..Default::default()
        };
        let process = host.create_process("c1", &exits).await.unwrap();
        process.wait().await.unwrap();
        assert_eq!(process.exit_code(), Some(5));

        let sleeps = ProcessConfig {
            args: vec!["sleep".into(), "30".into()],
            ..Default::default()
        };
        let process = host.create_process("c1", &sleeps).await.unwrap();
        assert_eq!(process.exit_code(), None);
        assert_eq!(host.container_properties("c1").await.unwrap().process_count, 1);

        host.terminate_container("c1").await.unwrap();
        process.wait().await.unwrap();
        assert_eq!(process.exit_code(), Some(FORCED_KILL_EXIT_CODE));
        assert_eq!(host.container_properties("c1").await.unwrap().process_count, 0);
    }

    #[test]
    fn test_parse_proc_usage() {
        let statm = "2048 300 120 10 0 200 0\n";
        let stat = "4242 (my (odd) app) S 1 4242 4242 0 -1 4194304 120 0 0 0 250 50 0 0 20 0 1 0 100";
        let usage = parse_proc_usage(statm, stat, 4096, 100).unwrap();
        assert_eq!(usage.resident_bytes, 300 * 4096);
        assert_eq!(usage.cpu_nanos, 3_000_000_000);

        assert!(parse_proc_usage("", stat, 4096, 100).is_none());
        assert!(parse_proc_usage(statm, "4242 (truncated", 4096, 100).is_none());
        assert!(parse_proc_usage(statm, stat, 4096, 0).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_stats_follow_live_processes() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path());
        let config = ContainerConfig {
            id: "c1".to_string(),
            volume_path: dir.path().to_path_buf(),
            memory_limit_bytes: Some(1 << 20),
            ..Default::default()
        };
        assert!(host.container_stats("c1").await.unwrap_err().is_not_found());
        host.create_container(&config).await.unwrap();
        host.start_container("c1").await.unwrap();

        let idle = host.container_stats("c1").await.unwrap();
        assert_eq!(idle.process_count, 0);
        assert_eq!(idle.memory_usage_bytes, 0);
        assert_eq!(idle.memory_limit_bytes, Some(1 << 20));

        let sleeps = ProcessConfig {
            args: vec!["sleep".into(), "30".into()],
            ..Default::default()
        };
        let process = host.create_process("c1", &sleeps).await.unwrap();
        let busy = host.container_stats("c1").await.unwrap();
        assert_eq!(busy.process_count, 1);
        if cfg!(target_os = "linux") {
            assert!(busy.memory_usage_bytes > 0);
        }

        host.terminate_container("c1").await.unwrap();
        process.wait().await.unwrap();
        assert_eq!(host.container_stats("c1").await.unwrap().process_count, 0);
    }
}
