//! # Runtime Constants
//!
//! Timeouts, sentinel values, file names and identifier rules shared by the
//! lifecycle manager, its provisioning subsystems, and the binaries.
//!
//! ## Cross-References
//!
//! - [`crate::process`]: Uses the relay drain timeout and the forced-kill exit code
//! - [`crate::network`]: Uses the rule limits and default network name
//! - [`crate::layer`]: Uses the layer chain file name
//! - [`crate::host::local`]: Uses the store layout directories

use std::time::Duration;

// =============================================================================
// OCI Spec Versions
// =============================================================================

/// Expands to the OCI Runtime Spec version as a string literal, for use in
/// `concat!` where a `const` cannot appear.
#[macro_export]
macro_rules! oci_runtime_spec_version {
    () => {
        "1.0.2"
    };
}

/// OCI Runtime Spec version reported in state output and emitted specs.
///
/// See: <https://github.com/opencontainers/runtime-spec/releases>
pub const OCI_RUNTIME_SPEC_VERSION: &str = oci_runtime_spec_version!();

/// Name of the runtime configuration file inside a bundle directory.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// Name of the file inside a rootfs layer listing its parent layers.
///
/// The file holds a JSON array of absolute layer paths, nearest parent first.
/// A base layer has no such file.
pub const LAYER_CHAIN_FILE: &str = "layerchain.json";

// =============================================================================
// Process Execution
// =============================================================================

/// Upper bound on how long an attached run waits for stdout/stderr relays to
/// drain after the process has exited.
///
/// A relay stuck on a slow consumer must never hold back exit-code reporting.
pub const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code reported for a process that was forcefully terminated.
///
/// Matches the host's `ERROR_PROCESS_ABORTED`, so callers observe the same
/// value whether the kill came from this runtime or from the host.
pub const FORCED_KILL_EXIT_CODE: i32 = 1067;

// =============================================================================
// Networking
// =============================================================================

/// Host network that endpoints are attached to unless overridden.
pub const DEFAULT_NETWORK_NAME: &str = "hcsrun-nat";

/// Maximum number of network rules accepted from a single bundle.
///
/// **Security**: Bounds the size of the policy list pushed to the host
/// network service for one endpoint.
pub const MAX_NET_RULES: usize = 1024;

/// Priority assigned to translated outbound allow policies.
pub const ACL_ALLOW_PRIORITY: u16 = 1000;

/// Subnet from which the local host backend hands out endpoint addresses.
pub const LOCAL_NETWORK_SUBNET: &str = "172.30.0.0/16";

// =============================================================================
// Storage Layout
// =============================================================================

/// Subdirectory of the store root holding sandbox layers.
pub const LAYER_DIR: &str = "layers";

/// Subdirectory of the store root holding host container records.
pub const CONTAINER_STATE_DIR: &str = "containers";

/// Subdirectory of the store root holding network endpoint records.
pub const ENDPOINT_DIR: &str = "endpoints";

// =============================================================================
// Logging
// =============================================================================

/// Environment variable holding an `EnvFilter` directive that overrides the
/// level selected by `--debug`.
pub const LOG_FILTER_ENV: &str = "HCSRUN_LOG";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container IDs.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes path separators. IDs name layer directories and
/// endpoint records under the store root.
pub const CONTAINER_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

// =============================================================================
// Container ID Validation Helper
// =============================================================================

/// Validates a container ID for safety.
///
/// # Security
///
/// This function ensures container IDs:
/// - Are non-empty
/// - Don't exceed `MAX_CONTAINER_ID_LEN`
/// - Only contain characters from `CONTAINER_ID_VALID_CHARS`
/// - Are not `.` or `..`
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if id == "." || id == ".." {
        return Err("container ID cannot be a relative path component");
    }
    if !id.chars().all(|c| CONTAINER_ID_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
