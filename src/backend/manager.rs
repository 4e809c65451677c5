use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::common::EngineError;
use crate::config::OutboundConfig;

use super::{Backend, BlackholeBackend, DirectBackend, RejectBackend};

/// Tag → backend instance table, built once per config snapshot.
#[derive(Debug)]
pub struct BackendManager {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendManager {
    pub fn new(configs: &[OutboundConfig]) -> Result<Self, EngineError> {
        let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        for config in configs {
            let backend: Arc<dyn Backend> = match config.protocol.as_str() {
                "direct" => {
                    let mut direct = DirectBackend::new(config.tag.clone());
                    if let Some(ms) = config.settings.connect_timeout_ms {
                        direct = direct.with_connect_timeout(Duration::from_millis(ms));
                    }
                    Arc::new(direct)
                }
                "reject" => Arc::new(RejectBackend::new(config.tag.clone())),
                "blackhole" => Arc::new(BlackholeBackend::new(config.tag.clone())),
                other => {
                    return Err(EngineError::InvalidConfig(format!(
                        "unknown outbound protocol '{}' for tag '{}'",
                        other, config.tag
                    )))
                }
            };
            backends.insert(config.tag.clone(), backend);
        }
        info!(count = backends.len(), "backends initialized");
        Ok(Self { backends })
    }

    /// Empty manager; used with `insert` to register custom backends.
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend instance under its own tag. Host embeddings
    /// use this to plug transports not expressible in config.
    pub fn insert(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.tag().to_string(), backend);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(tag).cloned()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}
