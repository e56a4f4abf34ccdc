//! Shared building blocks for the switchboard MCP gateway.
//!
//! This crate is transport-agnostic: JSON-RPC 2.0 wire types and
//! classification, MCP protocol constants, the gateway error taxonomy, and
//! the configuration schema. The server lives in the `switchboard` crate.

pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod protocol;

pub use error::{ErrorData, GatewayError, JsonRpcError};
pub use jsonrpc::{GatewayRequest, JsonRpcId, JsonRpcResponse};
