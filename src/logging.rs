//! Log subscriber setup for the binaries.
//!
//! The library only emits `tracing` events. A subscriber is installed once,
//! by the binary, from a [`LogConfig`]:
//!
//! | Setting      | Effect                                               |
//! |--------------|------------------------------------------------------|
//! | `debug`      | `debug` level instead of the default `warn`          |
//! | `file`       | Appends to the file; events are discarded when unset |
//! | `format`     | `json` (default) or plain `text` lines               |
//! | `HCSRUN_LOG` | `EnvFilter` directive overriding the level           |

use crate::config::{LogConfig, LogFormat};
use crate::constants::LOG_FILTER_ENV;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Installs the global subscriber described by `config`.
pub fn init(config: &LogConfig) -> Result<()> {
    let default_directive = if config.debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let writer = match open_log_file(config)? {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::sink),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("failed to install log subscriber: {e}")))
}

fn open_log_file(config: &LogConfig) -> Result<Option<File>> {
    let Some(path) = config.file.as_deref().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(None);
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Some(file))
}
