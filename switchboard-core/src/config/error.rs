//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
///
/// Any of these aborts startup; the gateway never runs on a configuration
/// it could not fully validate.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found at the given path.
    #[error("configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Config file exists but is empty.
    #[error("configuration file is empty")]
    EmptyFile,

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// I/O error reading the config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `${VAR}` substitution referenced an unset variable with no default.
    #[error("environment variable '{var}' not set")]
    MissingEnvVar { var: String },

    /// A backend descriptor has an empty id.
    #[error("backend at index {index} has an empty id")]
    EmptyBackendId { index: usize },

    /// Two backend descriptors share an id.
    #[error("duplicate backend id: '{id}'")]
    DuplicateBackendId { id: String },

    /// Only the stdio transport is supported.
    #[error("backend '{id}' has unsupported transport '{transport}' (only \"stdio\" is supported)")]
    UnsupportedTransport { id: String, transport: String },

    /// A stdio backend has no command to spawn.
    #[error("backend '{id}' has an empty command")]
    EmptyCommand { id: String },

    /// A timeout field is zero.
    #[error("backend '{id}': {field} must be greater than zero")]
    ZeroTimeout { id: String, field: &'static str },

    /// Neither static tokens nor OAuth clients are configured.
    #[error("no authentication configured: provide static_tokens or oauth clients")]
    NoAuthConfigured,

    /// An OAuth client entry is structurally invalid.
    #[error("oauth client '{client_id}': {reason}")]
    InvalidClient { client_id: String, reason: String },

    /// Two OAuth clients share an id.
    #[error("duplicate oauth client id: '{client_id}'")]
    DuplicateClientId { client_id: String },

    /// Rate limit values must be positive.
    #[error("rate_limit.{field} must be greater than zero")]
    ZeroRateLimit { field: &'static str },

    /// Environment override could not be parsed.
    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidEnvOverride {
        var: &'static str,
        value: String,
        reason: String,
    },
}
