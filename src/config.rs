//! Runtime and logging configuration shared by the binaries.

use crate::constants::DEFAULT_NETWORK_NAME;
use std::path::PathBuf;

/// Output format of the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Where and how the binaries log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Log at debug level instead of warn.
    pub debug: bool,
    /// Log file; logs are discarded when absent.
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

/// Settings of one runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Root of the layer, container and endpoint store.
    pub store_root: PathBuf,
    /// Host network endpoints attach to unless the bundle names one.
    pub network_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            network_name: DEFAULT_NETWORK_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn new(store_root: Option<PathBuf>, network_name: Option<String>) -> Self {
        Self {
            store_root: store_root.unwrap_or_else(default_store_root),
            network_name: network_name.unwrap_or_else(|| DEFAULT_NETWORK_NAME.to_string()),
        }
    }
}

/// Returns the platform default store root.
pub fn default_store_root() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/hcsrun")
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .map(|h| h.join(".hcsrun").join("store"))
            .unwrap_or_else(|| PathBuf::from(".hcsrun/store"))
    }

    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir()
            .map(|d| d.join("hcsrun").join("store"))
            .unwrap_or_else(|| PathBuf::from("hcsrun\\store"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from("/var/lib/hcsrun")
    }
}
