//! Userspace tunnel engine: reads raw IP packets from a host-provided
//! TUN-like source, terminates TCP/UDP flows locally and forwards their
//! payloads through configurable backends.

pub mod backend;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod packet;
pub mod router;
pub mod session;
pub mod tun;

pub use common::{EngineError, EngineErrorKind, EngineMetrics, MetricsSnapshot};
pub use engine::{Engine, EngineState, SessionInfo, StatusCode};
pub use tun::{BoxPacketSource, PacketSource, PacketSourceProvider};
