use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::EngineError;
use crate::packet::FlowKey;

use super::{Backend, BoxFlowTransport, FlowTransport};

/// Refuses every flow. Useful for ad-block style rules.
pub struct RejectBackend {
    tag: String,
}

impl RejectBackend {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl Backend for RejectBackend {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, key: &FlowKey) -> Result<BoxFlowTransport, EngineError> {
        debug!(flow = %key, "reject: flow blocked");
        Err(EngineError::Unreachable(format!(
            "flow rejected by outbound '{}'",
            self.tag
        )))
    }
}

/// Accepts every flow and silently discards its payload; `recv` parks
/// until the transport is closed.
pub struct BlackholeBackend {
    tag: String,
}

impl BlackholeBackend {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl Backend for BlackholeBackend {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, key: &FlowKey) -> Result<BoxFlowTransport, EngineError> {
        debug!(flow = %key, "blackhole: flow silently absorbed");
        Ok(Arc::new(BlackholeTransport {
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }))
    }
}

struct BlackholeTransport {
    closed: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl FlowTransport for BlackholeTransport {
    async fn send(&self, _data: Bytes) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, EngineError> {
        self.cancel.cancelled().await;
        Err(EngineError::SessionClosed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }
}
