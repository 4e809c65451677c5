//! Outbound backend capability.
//!
//! A [`Backend`] turns a flow key into a connected [`FlowTransport`]
//! carrying that flow's payload. Which backend a flow uses is decided by
//! the router; the dispatcher never cares what transport protocol sits
//! behind the trait. Wire-format proxy protocols plug in here as
//! additional implementations.

pub mod direct;
pub mod manager;
pub mod reject;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::EngineError;
use crate::packet::FlowKey;

pub use direct::DirectBackend;
pub use manager::BackendManager;
pub use reject::{BlackholeBackend, RejectBackend};

/// One outbound transport kind, instantiated per config descriptor.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn tag(&self) -> &str;

    /// Open a transport for one flow. Errors classify to `Unreachable`
    /// (retryable after backoff), `AuthRejected` (never retried) or
    /// `ConnectTimeout` (retryable).
    async fn connect(&self, key: &FlowKey) -> Result<BoxFlowTransport, EngineError>;
}

/// A connected per-flow transport. `close` is idempotent and safe to
/// call on an already-closed handle; `send`/`recv` after close return
/// `SessionClosed`.
#[async_trait]
pub trait FlowTransport: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), EngineError>;
    async fn recv(&self) -> Result<Bytes, EngineError>;
    async fn close(&self);
}

pub type BoxFlowTransport = Arc<dyn FlowTransport>;

impl std::fmt::Debug for dyn FlowTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn FlowTransport")
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Backend").field("tag", &self.tag()).finish()
    }
}
