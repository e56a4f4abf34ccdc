//! Configuration schema.
//!
//! The gateway is configured by a single JSON document declaring the listen
//! address, authentication material, backend descriptors, and rate-limit
//! parameters. Backend descriptors are immutable after load; everything the
//! supervisor needs to spawn and police a child process lives here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bind host. Overridable via `SWITCHBOARD_BIND`.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port. Overridable via `SWITCHBOARD_PORT`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Authentication: static bearer tokens and/or OAuth clients.
    pub auth: AuthConfig,

    /// Backend child-process descriptors, in declaration order.
    ///
    /// Declaration order is significant: catalog merges resolve name
    /// collisions first-declared-wins.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Per-IP rate limiting for authenticated endpoints.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Gateway-side per-call deadline in seconds. The effective deadline for
    /// a routed call is the minimum of this and the backend's own
    /// `request_timeout_secs`.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Idle timeout for SSE sessions in seconds.
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Issuer URL for the OAuth discovery document. Defaults to the
    /// request's base URL when unset.
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Config {
    /// Gateway-side per-call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// SSE session idle timeout.
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Full bind address string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Tokens accepted verbatim, outside the OAuth store.
    #[serde(default)]
    pub static_tokens: Vec<String>,

    /// OAuth clients registered at startup.
    #[serde(default)]
    pub clients: Vec<OAuthClientConfig>,

    /// Access token lifetime in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Refresh token lifetime in seconds.
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }
}

/// A statically registered OAuth client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthClientConfig {
    /// Client identifier presented at the token endpoint.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Human-readable name, shown in admin output.
    #[serde(default)]
    pub name: String,
    /// Scopes this client may request.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Grants this client may use.
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
}

/// OAuth grant types supported by the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    ClientCredentials,
    Password,
    RefreshToken,
}

impl GrantType {
    /// Wire name as it appears in `grant_type` form fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::ClientCredentials => "client_credentials",
            GrantType::Password => "password",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

/// Backend descriptor. Immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Stable identifier, used in routing, logs, and admin output.
    pub id: String,

    /// Transport kind. Only `stdio` is supported.
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Executable to spawn.
    pub command: String,

    /// Argument list.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment additions for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Disabled backends are recorded but never started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deadline for spawn + initialize + catalog discovery.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-call deadline for requests forwarded to this backend.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Consecutive restart failures before the backend is left degraded
    /// permanently.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Interval for periodic `ping` health checks. Absent disables them.
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs.map(Duration::from_secs)
    }
}

/// Per-IP rate limiting parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Sustained requests per second per IP.
    #[serde(default = "default_rps")]
    pub rps: u32,
    /// Burst allowance per IP.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            burst: default_burst(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    5
}

fn default_call_timeout() -> u64 {
    30
}

fn default_session_idle_timeout() -> u64 {
    300
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_refresh_ttl() -> u64 {
    86400
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::ClientCredentials]
}

fn default_rps() -> u32 {
    100
}

fn default_burst() -> u32 {
    200
}
