pub mod error;
pub mod metrics;

pub use error::{EngineError, EngineErrorKind};
pub use metrics::{EngineMetrics, MetricsSnapshot};

/// Current epoch milliseconds, used for session activity stamps.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
