pub mod manager;

use serde::Deserialize;

use crate::common::EngineError;

pub use manager::{ConfigManager, RoutingSnapshot};

/// Top-level engine configuration, deserialized from the host's JSON.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Structural validation. Rule-value parsing and backend
    /// instantiation are checked when the snapshot is built.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.outbounds.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one outbound is required".into(),
            ));
        }

        let mut tags: Vec<&str> = Vec::with_capacity(self.outbounds.len());
        for outbound in &self.outbounds {
            if outbound.tag.is_empty() {
                return Err(EngineError::InvalidConfig("outbound tag must not be empty".into()));
            }
            if tags.contains(&outbound.tag.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate outbound tag '{}'",
                    outbound.tag
                )));
            }
            tags.push(&outbound.tag);
        }

        if !tags.contains(&self.routing.default.as_str()) {
            return Err(EngineError::InvalidConfig(format!(
                "routing default '{}' does not match any outbound tag",
                self.routing.default
            )));
        }
        for rule in &self.routing.rules {
            if !tags.contains(&rule.outbound.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "rule outbound '{}' does not match any outbound tag",
                    rule.outbound
                )));
            }
            if rule.values.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "rule '{}' has no values",
                    rule.rule_type
                )));
            }
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "session idle_timeout_secs must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Parse a config from its JSON text.
pub fn parse_config(json: &str) -> Result<Config, EngineError> {
    serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(default)]
    pub settings: OutboundSettings,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutboundSettings {
    /// Connect timeout for stream backends, milliseconds.
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default = "default_outbound")]
    pub default: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: default_outbound(),
        }
    }
}

fn default_outbound() -> String {
    "direct".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub values: Vec<String>,
    pub outbound: String,
}

/// Session table tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_evict_interval")]
    pub evict_interval_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            evict_interval_secs: default_evict_interval(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_evict_interval() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    2000
}
