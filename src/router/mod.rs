pub mod rules;

use std::path::Path;

use tracing::debug;

use crate::common::EngineError;
use crate::config::RoutingConfig;
use crate::packet::FlowKey;
use rules::Rule;

/// Compiled routing table: ordered rules, first match wins, fallback to
/// the default outbound tag. Immutable once built; reload builds a new
/// Router as part of the next snapshot.
pub struct Router {
    rules: Vec<(Rule, String)>,
    default: String,
}

impl Router {
    pub fn new(config: &RoutingConfig, asset_dir: Option<&Path>) -> Result<Self, EngineError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule_config in &config.rules {
            let rule = Rule::from_config(rule_config, asset_dir)?;
            rules.push((rule, rule_config.outbound.clone()));
        }
        Ok(Self {
            rules,
            default: config.default.clone(),
        })
    }

    /// Resolve a flow to its outbound tag.
    pub fn resolve(&self, key: &FlowKey) -> &str {
        for (rule, outbound) in &self.rules {
            if rule.matches(key) {
                debug!(flow = %key, rule = %rule, outbound = outbound, "route matched");
                return outbound;
            }
        }
        debug!(flow = %key, outbound = %self.default, "route default");
        &self.default
    }

    pub fn default_outbound(&self) -> &str {
        &self.default
    }

    pub fn rules(&self) -> &[(Rule, String)] {
        &self.rules
    }
}
