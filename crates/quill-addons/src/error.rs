//! Addon runtime error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::AddonId;
use crate::permission::PermissionLevel;

/// Errors from addon runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum AddonError {
    /// The requested addon is not known to the runtime.
    #[error("addon not found: {0}")]
    NotFound(AddonId),

    /// Another lifecycle operation on the addon is in flight.
    #[error("another operation on addon {0} is in flight")]
    Busy(AddonId),

    /// The addon ID is invalid.
    #[error("invalid addon id: {0}")]
    InvalidId(String),

    /// Failed to parse an addon manifest file.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParseError {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// An addon directory could not be enumerated.
    #[error("failed to enumerate {path}: {message}")]
    EnumerateFailed {
        /// The directory that was scanned.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// Reading an addon's source or stylesheet failed.
    #[error("failed to read {path}: {message}")]
    ReadFailed {
        /// Location that was read.
        path: PathBuf,
        /// Failure reason.
        message: String,
    },

    /// Reading an addon's source did not complete in time.
    #[error("reading {path} timed out after {timeout:?}")]
    ReadTimeout {
        /// Location that was read.
        path: PathBuf,
        /// The configured bound.
        timeout: Duration,
    },

    /// The plugin script failed to compile.
    #[error("plugin {plugin_id} failed to compile: {message}")]
    CompileFailed {
        /// The plugin whose script failed to compile.
        plugin_id: AddonId,
        /// Parser message.
        message: String,
    },

    /// The plugin script raised an error while running.
    #[error("plugin {plugin_id} failed in {phase}: {message}")]
    ScriptFailed {
        /// The plugin that failed.
        plugin_id: AddonId,
        /// Top-level evaluation or the name of the hook that failed.
        phase: String,
        /// Script error message.
        message: String,
    },

    /// The script called a host service outside its capability graph.
    #[error(
        "capability '{capability}' is not available to plugin {plugin_id} at permission level '{level}'"
    )]
    CapabilityUnavailable {
        /// The plugin that made the call.
        plugin_id: AddonId,
        /// Namespace of the missing service.
        capability: String,
        /// The tier the plugin was loaded with.
        level: PermissionLevel,
    },

    /// Persisting addon state failed.
    #[error("failed to persist addon state: {0}")]
    PersistFailed(String),

    /// The file watcher could not be started.
    #[error("watcher error: {0}")]
    Watcher(String),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for addon runtime operations.
pub type AddonResult<T> = Result<T, AddonError>;
