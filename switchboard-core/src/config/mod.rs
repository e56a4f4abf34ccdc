//! Gateway configuration: schema, loading, and validation.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ENV_BIND, ENV_LOG, ENV_PORT, load, substitute_env_vars, validate};
pub use schema::{
    AuthConfig, BackendConfig, Config, GrantType, OAuthClientConfig, RateLimitConfig,
};
