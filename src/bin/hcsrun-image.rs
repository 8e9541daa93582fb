//! hcsrun-image - Sandbox Layer Tool
//!
//! Provisions the sandbox layer of a container ahead of `hcsrun create`, and
//! removes it again.
//!
//! ## Usage
//!
//! ```sh
//! hcsrun-image create [--disk-limit-size-bytes <n>] <rootfs> <container-id>
//! hcsrun-image delete <container-id>
//! ```
//!
//! `create` prints a spec fragment with `root.path` set to the sandbox volume
//! and `windows.layerFolders` set to the rootfs followed by the parent chain
//! read from `<rootfs>/layerchain.json`.

use clap::{Args, Parser, Subcommand};
use hcsrun::layer::{host_layer_path, read_parent_chain};
use hcsrun::{
    ContainerSpec, DiskLimit, Error, LayerSequencer, LocalHost, LogConfig, LogFormat, Result,
    RuntimeConfig, validate_container_id,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "hcsrun-image", version, about = "Sandbox layer tool for hcsrun")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Log file (logs are discarded when absent)
    #[arg(long = "log", global = true, env = "HCSRUN_LOG_FILE")]
    log: Option<PathBuf>,

    /// Log file format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Root of the layer store
    #[arg(long = "image-store", alias = "store", global = true, env = "HCSRUN_IMAGE_STORE")]
    image_store: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and mount the sandbox layer of a container
    Create {
        /// Cap on the sandbox volume in bytes; 0 means no cap
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        disk_limit_size_bytes: i64,
        /// Read-only rootfs layer
        rootfs: PathBuf,
        container_id: String,
    },
    /// Remove the sandbox layer of a container
    Delete { container_id: String },
}

// =============================================================================
// Command Implementations
// =============================================================================

fn check_id(id: &str) -> Result<()> {
    validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
        id: id.to_string(),
        reason: reason.to_string(),
    })
}

async fn cmd_create(
    layers: &LayerSequencer,
    rootfs: PathBuf,
    id: &str,
    disk_limit: i64,
) -> Result<()> {
    check_id(id)?;
    let disk_limit = DiskLimit::try_from(disk_limit)?;
    let rootfs = host_layer_path(&rootfs);
    let parents = read_parent_chain(&rootfs)?;

    let layer = layers.create_sandbox(id, &rootfs, &parents, disk_limit).await?;
    println!("{}", serde_json::to_string_pretty(&ContainerSpec::for_sandbox(&layer))?);
    Ok(())
}

async fn cmd_delete(layers: &LayerSequencer, id: &str) -> Result<()> {
    check_id(id)?;
    layers.destroy_sandbox(id).await
}

async fn dispatch(command: Command, layers: LayerSequencer) -> Result<()> {
    match command {
        Command::Create {
            disk_limit_size_bytes,
            rootfs,
            container_id,
        } => cmd_create(&layers, rootfs, &container_id, disk_limit_size_bytes).await,
        Command::Delete { container_id } => cmd_delete(&layers, &container_id).await,
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log = LogConfig {
        debug: cli.global.debug,
        file: cli.global.log,
        format: cli.global.log_format,
    };
    if let Err(e) = hcsrun::logging::init(&log) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    let config = RuntimeConfig::new(cli.global.image_store, None);
    let layers = LayerSequencer::new(Arc::new(LocalHost::new(config.store_root)));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli.command, layers)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, category = %e.category(), "Command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_disk_limit_parses() {
        let cli = Cli::parse_from([
            "hcsrun-image",
            "create",
            "--disk-limit-size-bytes",
            "-1",
            "/layers/base",
            "c1",
        ]);
        match cli.command {
            Command::Create {
                disk_limit_size_bytes,
                rootfs,
                container_id,
            } => {
                assert_eq!(disk_limit_size_bytes, -1);
                assert_eq!(rootfs, PathBuf::from("/layers/base"));
                assert_eq!(container_id, "c1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_create_requires_two_arguments() {
        assert!(Cli::try_parse_from(["hcsrun-image", "create", "/layers/base"]).is_err());
    }
}
