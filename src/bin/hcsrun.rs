//! hcsrun - OCI Runtime CLI
//!
//! Runs OCI bundles as host-native containers. Follows the OCI runtime-spec
//! CLI interface like runc/crun: one invocation per lifecycle transition.
//!
//! ## Usage
//!
//! ```sh
//! hcsrun create <container-id> [--bundle <path>] [--pid-file <file>]
//! hcsrun run <container-id> [--bundle <path>] [--detach]
//! hcsrun exec <container-id> [--process process.json | <command>...]
//! hcsrun state <container-id>
//! hcsrun events [--stats] [--interval <secs>] <container-id>
//! hcsrun delete <container-id>
//! ```

use clap::{Args, Parser, Subcommand};
use hcsrun::{
    CallerIo, ContainerManager, ContainerSpec, Error, HostServices, LocalHost, LogConfig,
    LogFormat, OCI_RUNTIME_SPEC_VERSION, ProcessHandle, ProcessSpec, Result, RuntimeConfig,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "hcsrun",
    version,
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        "\nspec: ",
        hcsrun::oci_runtime_spec_version!()
    ),
    about = "OCI runtime for host-native containers"
)]
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

    /// Root of the layer, container and endpoint store
    #[arg(long = "image-store", alias = "store", global = true, env = "HCSRUN_IMAGE_STORE")]
    image_store: Option<PathBuf>,

    /// Host network endpoints attach to unless the bundle names one
    #[arg(long, global = true)]
    network_name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a container from a bundle
    Create {
        container_id: String,
        #[command(flatten)]
        bundle: BundleArgs,
    },
    /// Create a container and run its process
    Run {
        container_id: String,
        #[command(flatten)]
        bundle: BundleArgs,
        /// Return once the process has started
        #[arg(short, long)]
        detach: bool,
        /// Accepted for runc compatibility; has no effect
        #[arg(long)]
        no_new_keyring: bool,
    },
    /// Run an additional process in a container
    Exec {
        container_id: String,
        /// Path to a process.json
        #[arg(short, long, conflicts_with = "command")]
        process: Option<PathBuf>,
        /// Working directory of the process
        #[arg(long)]
        cwd: Option<String>,
        /// Extra environment variable (KEY=VALUE), repeatable
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Return once the process has started
        #[arg(short, long)]
        detach: bool,
        /// Write the process pid to this file
        #[arg(long)]
        pid_file: Option<PathBuf>,
        /// Command and arguments to run
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Print the state of a container
    State { container_id: String },
    /// Print resource usage events of a container
    Events {
        container_id: String,
        /// Print one stats event and exit
        #[arg(long)]
        stats: bool,
        /// Seconds between stats events
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,
    },
    /// Delete a container and everything provisioned for it
    Delete { container_id: String },
}

#[derive(Debug, Args)]
struct BundleArgs {
    /// Bundle directory (defaults to the current directory)
    #[arg(short, long)]
    bundle: Option<PathBuf>,

    /// Write the container (or process) pid to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

// =============================================================================
// Command Implementations
// =============================================================================

struct Context {
    services: HostServices,
    config: RuntimeConfig,
}

impl Context {
    fn manager(&self, command: &'static str, id: &str) -> ContainerManager {
        ContainerManager::new(id, self.services.clone(), self.config.network_name.clone())
            .with_span(info_span!("hcsrun", command, container_id = %id))
    }
}

fn resolve_bundle(bundle: Option<PathBuf>) -> Result<PathBuf> {
    let bundle = match bundle {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    bundle.canonicalize().map_err(|e| Error::InvalidBundle {
        path: bundle.clone(),
        reason: e.to_string(),
    })
}

fn write_pid_file(path: Option<&Path>, pid: u32) -> Result<()> {
    if let Some(path) = path {
        std::fs::write(path, pid.to_string())?;
    }
    Ok(())
}

async fn cmd_create(ctx: &Context, id: &str, args: BundleArgs) -> Result<i32> {
    let bundle = resolve_bundle(args.bundle)?;
    let spec = ContainerSpec::load(&bundle)?;
    let manager = ctx.manager("create", id);
    manager.create(&bundle, &spec).await?;
    write_container_pid(&manager, args.pid_file.as_deref()).await?;
    Ok(0)
}

/// Writes the pid of the container itself, not of a process inside it.
async fn write_container_pid(manager: &ContainerManager, path: Option<&Path>) -> Result<()> {
    if path.is_none() {
        return Ok(());
    }
    match manager.state().await?.pid {
        Some(pid) => write_pid_file(path, pid),
        None => Ok(()),
    }
}

async fn cmd_run(ctx: &Context, id: &str, args: BundleArgs, detach: bool) -> Result<i32> {
    let bundle = resolve_bundle(args.bundle)?;
    let spec = ContainerSpec::load(&bundle)?;
    let process = spec.process.clone().ok_or_else(|| Error::InvalidBundle {
        path: bundle.clone(),
        reason: "process is required".to_string(),
    })?;

    let manager = ctx.manager("run", id);
    manager.create(&bundle, &spec).await?;
    write_container_pid(&manager, args.pid_file.as_deref()).await?;
    let handle = manager.exec(&process, detach).await?;
    finish(handle).await
}

#[allow(clippy::too_many_arguments)]
async fn cmd_exec(
    ctx: &Context,
    id: &str,
    process: Option<PathBuf>,
    cwd: Option<String>,
    env: Vec<String>,
    detach: bool,
    pid_file: Option<PathBuf>,
    command: Vec<String>,
) -> Result<i32> {
    let mut spec = match process {
        Some(path) => ProcessSpec::load(&path)?,
        None if !command.is_empty() => ProcessSpec::from_args(command),
        None => {
            return Err(Error::InvalidProcess(
                "exec requires --process or a command".to_string(),
            ));
        }
    };
    if let Some(cwd) = cwd {
        spec.cwd = cwd;
    }
    spec.env.extend(env);

    let handle = ctx.manager("exec", id).exec(&spec, detach).await?;
    write_pid_file(pid_file.as_deref(), handle.pid())?;
    finish(handle).await
}

/// Detached processes are done once started; attached ones relay stdio and
/// report the process exit code.
async fn finish(handle: ProcessHandle) -> Result<i32> {
    if handle.is_detached() {
        info!(pid = handle.pid(), "Process started detached");
        return Ok(0);
    }
    handle
        .attach(CallerIo::std(), hcsrun::interrupt_signal())
        .await
}

async fn cmd_state(ctx: &Context, id: &str) -> Result<i32> {
    let state = ctx.manager("state", id).state().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(0)
}

/// Prints one stats event per interval until interrupted or the container
/// goes away, or a single event with `--stats`.
async fn cmd_events(ctx: &Context, id: &str, once: bool, interval: Duration) -> Result<i32> {
    let manager = ctx.manager("events", id);
    let mut interrupted = std::pin::pin!(hcsrun::interrupt_signal());
    loop {
        let event = manager.stats().await?;
        println!("{}", serde_json::to_string(&event)?);
        if once {
            return Ok(0);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut interrupted => return Ok(0),
        }
    }
}

async fn cmd_delete(ctx: &Context, id: &str) -> Result<i32> {
    ctx.manager("delete", id).delete().await?;
    Ok(0)
}

async fn dispatch(command: Command, ctx: Context) -> Result<i32> {
    match command {
        Command::Create {
            container_id,
            bundle,
        } => cmd_create(&ctx, &container_id, bundle).await,
        Command::Run {
            container_id,
            bundle,
            detach,
            no_new_keyring: _,
        } => cmd_run(&ctx, &container_id, bundle, detach).await,
        Command::Exec {
            container_id,
            process,
            cwd,
            env,
            detach,
            pid_file,
            command,
        } => {
            cmd_exec(
                &ctx,
                &container_id,
                process,
                cwd,
                env,
                detach,
                pid_file,
                command,
            )
            .await
        }
        Command::State { container_id } => cmd_state(&ctx, &container_id).await,
        Command::Events {
            container_id,
            stats,
            interval,
        } => cmd_events(&ctx, &container_id, stats, Duration::from_secs(interval)).await,
        Command::Delete { container_id } => cmd_delete(&ctx, &container_id).await,
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

    let config = RuntimeConfig::new(cli.global.image_store, cli.global.network_name);
    let ctx = Context {
        services: HostServices::from_backend(Arc::new(LocalHost::new(&config.store_root))),
        config,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(dispatch(cli.command, ctx));
    // A stdin relay may still be parked in a blocking read.
    runtime.shutdown_background();

    match result {
        Ok(code) => exit_with(code),
        Err(e) => {
            error!(error = %e, category = %e.category(), "Command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Exit codes outside `0..=255` (such as the forced-kill code) bypass
/// `ExitCode`, which only carries a byte.
fn exit_with(code: i32) -> ExitCode {
    match byte_exit_code(code) {
        Some(code) => ExitCode::from(code),
        None => std::process::exit(code),
    }
}

fn byte_exit_code(code: i32) -> Option<u8> {
    u8::try_from(code).ok()
}
