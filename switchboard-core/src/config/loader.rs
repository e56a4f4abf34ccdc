//! Configuration loading and validation.
//!
//! Loading is a pipeline: read file → reject empty → substitute `${VAR}`
//! references → parse JSON → apply environment overrides → validate. Any
//! failure aborts startup with a structured [`ConfigError`].

use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use super::error::ConfigError;
use super::schema::Config;

/// Environment variable overriding the listen port.
pub const ENV_PORT: &str = "SWITCHBOARD_PORT";

/// Environment variable overriding the bind host.
pub const ENV_BIND: &str = "SWITCHBOARD_BIND";

/// Environment variable controlling the log filter (read at tracing init).
pub const ENV_LOG: &str = "SWITCHBOARD_LOG";

/// Load, substitute, parse, override, and validate a configuration file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyFile);
    }

    let contents = substitute_env_vars(&contents)?;
    let mut config: Config = serde_json::from_str(&contents)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

// SAFETY of .expect(): compile-time literal pattern, covered by
// test_env_var_pattern_compiles.
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in the raw config text.
///
/// # Syntax
/// - `${VAR}` - required, fail if not set
/// - `${VAR:-default}` - optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut result = content.to_string();

    let matches: Vec<_> = ENV_VAR_PATTERN
        .captures_iter(content)
        .filter_map(|cap| {
            let full = cap.get(0)?.as_str().to_string();
            let var = cap.get(1)?.as_str().to_string();
            let default = cap.get(2).map(|m| m.as_str().to_string());
            Some((full, var, default))
        })
        .collect();

    for (full, var, default) in matches {
        match std::env::var(&var) {
            Ok(value) => result = result.replace(&full, &value),
            Err(_) => match default {
                Some(d) => result = result.replace(&full, &d),
                None => return Err(ConfigError::MissingEnvVar { var }),
            },
        }
    }

    Ok(result)
}

/// Apply `SWITCHBOARD_PORT` / `SWITCHBOARD_BIND` overrides.
fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(port) = std::env::var(ENV_PORT) {
        config.port = port
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnvOverride {
                var: ENV_PORT,
                value: port.clone(),
                reason: e.to_string(),
            })?;
    }
    if let Ok(bind) = std::env::var(ENV_BIND) {
        config.host = bind;
    }
    Ok(())
}

/// Validate a parsed configuration. Called once at startup.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    // Backends: unique non-empty ids, stdio transport, runnable commands,
    // positive deadlines.
    let mut seen_ids = HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        if backend.id.trim().is_empty() {
            return Err(ConfigError::EmptyBackendId { index });
        }
        if !seen_ids.insert(backend.id.clone()) {
            return Err(ConfigError::DuplicateBackendId {
                id: backend.id.clone(),
            });
        }
        if backend.transport != "stdio" {
            return Err(ConfigError::UnsupportedTransport {
                id: backend.id.clone(),
                transport: backend.transport.clone(),
            });
        }
        if backend.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                id: backend.id.clone(),
            });
        }
        if backend.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                id: backend.id.clone(),
                field: "connect_timeout_secs",
            });
        }
        if backend.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                id: backend.id.clone(),
                field: "request_timeout_secs",
            });
        }
    }

    // Auth: at least one mechanism, well-formed clients.
    if config.auth.static_tokens.is_empty() && config.auth.clients.is_empty() {
        return Err(ConfigError::NoAuthConfigured);
    }
    let mut seen_clients = HashSet::new();
    for client in &config.auth.clients {
        if client.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidClient {
                client_id: client.client_id.clone(),
                reason: "empty client_id".to_string(),
            });
        }
        if !seen_clients.insert(client.client_id.clone()) {
            return Err(ConfigError::DuplicateClientId {
                client_id: client.client_id.clone(),
            });
        }
        if client.client_secret.is_empty() {
            return Err(ConfigError::InvalidClient {
                client_id: client.client_id.clone(),
                reason: "empty client_secret".to_string(),
            });
        }
        if client.grant_types.is_empty() {
            return Err(ConfigError::InvalidClient {
                client_id: client.client_id.clone(),
                reason: "no grant_types".to_string(),
            });
        }
    }

    if config.rate_limit.rps == 0 {
        return Err(ConfigError::ZeroRateLimit { field: "rps" });
    }
    if config.rate_limit.burst == 0 {
        return Err(ConfigError::ZeroRateLimit { field: "burst" });
    }

    Ok(())
}
