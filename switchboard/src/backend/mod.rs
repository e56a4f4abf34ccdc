//! Backend lifecycle: stdio JSON-RPC adapters and their supervising registry.

mod adapter;
mod framing;
mod registry;
mod shutdown;

pub use adapter::{Adapter, BackendState};
pub use framing::{BackendReply, FramingError, MAX_LINE_BYTES};
pub use registry::{BackendStatus, Registry};
