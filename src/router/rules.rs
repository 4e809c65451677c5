use std::fmt;
use std::path::Path;

use ipnet::IpNet;

use crate::common::EngineError;
use crate::config::RuleConfig;
use crate::packet::{FlowKey, IpProtocol};

/// A single routing match rule over a flow key.
#[derive(Debug)]
pub enum Rule {
    /// Destination port match
    DstPort(Vec<u16>),
    /// Source port match
    SrcPort(Vec<u16>),
    /// Destination IP CIDR match
    DstIpCidr(Vec<IpNet>),
    /// Source IP CIDR match
    SrcIpCidr(Vec<IpNet>),
    /// L4 protocol match ("tcp" / "udp")
    Network(Vec<IpProtocol>),
}

impl Rule {
    /// Build a rule from its config entry. File-backed `ip-list` values
    /// are resolved against `asset_dir` (the host's asset directory).
    pub fn from_config(config: &RuleConfig, asset_dir: Option<&Path>) -> Result<Self, EngineError> {
        match config.rule_type.as_str() {
            "dst-port" => Ok(Rule::DstPort(parse_ports(&config.values)?)),
            "src-port" => Ok(Rule::SrcPort(parse_ports(&config.values)?)),
            "dst-ip-cidr" => Ok(Rule::DstIpCidr(parse_nets(&config.values)?)),
            "src-ip-cidr" => Ok(Rule::SrcIpCidr(parse_nets(&config.values)?)),
            "network" => {
                let mut protocols = Vec::with_capacity(config.values.len());
                for value in &config.values {
                    protocols.push(match value.as_str() {
                        "tcp" => IpProtocol::Tcp,
                        "udp" => IpProtocol::Udp,
                        other => {
                            return Err(EngineError::InvalidConfig(format!(
                                "unknown network '{}' (expected tcp/udp)",
                                other
                            )))
                        }
                    });
                }
                Ok(Rule::Network(protocols))
            }
            "ip-list" => {
                let mut nets = Vec::new();
                for value in &config.values {
                    let path = match asset_dir {
                        Some(dir) => dir.join(value),
                        None => Path::new(value).to_path_buf(),
                    };
                    nets.extend(load_ip_list(&path)?);
                }
                Ok(Rule::DstIpCidr(nets))
            }
            other => Err(EngineError::InvalidConfig(format!(
                "unsupported rule type: {}",
                other
            ))),
        }
    }

    pub fn matches(&self, key: &FlowKey) -> bool {
        match self {
            Rule::DstPort(ports) => ports.contains(&key.dst.port()),
            Rule::SrcPort(ports) => ports.contains(&key.src.port()),
            Rule::DstIpCidr(nets) => nets.iter().any(|net| net.contains(&key.dst.ip())),
            Rule::SrcIpCidr(nets) => nets.iter().any(|net| net.contains(&key.src.ip())),
            Rule::Network(protocols) => protocols.contains(&key.protocol),
        }
    }
}

fn parse_ports(values: &[String]) -> Result<Vec<u16>, EngineError> {
    values
        .iter()
        .map(|s| {
            s.parse::<u16>()
                .map_err(|_| EngineError::InvalidConfig(format!("invalid port: '{}'", s)))
        })
        .collect()
}

fn parse_nets(values: &[String]) -> Result<Vec<IpNet>, EngineError> {
    values
        .iter()
        .map(|s| {
            s.parse::<IpNet>()
                .map_err(|_| EngineError::InvalidConfig(format!("invalid CIDR: '{}'", s)))
        })
        .collect()
}

/// One CIDR per line; blank lines and `#` comments are skipped.
fn load_ip_list(path: &Path) -> Result<Vec<IpNet>, EngineError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidConfig(format!("cannot read ip-list {}: {}", path.display(), e))
    })?;
    let mut nets = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        nets.push(line.parse::<IpNet>().map_err(|_| {
            EngineError::InvalidConfig(format!(
                "invalid CIDR '{}' in {}",
                line,
                path.display()
            ))
        })?);
    }
    Ok(nets)
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::DstPort(v) => {
                let strs: Vec<String> = v.iter().map(|p| p.to_string()).collect();
                write!(f, "dst-port({})", strs.join(","))
            }
            Rule::SrcPort(v) => {
                let strs: Vec<String> = v.iter().map(|p| p.to_string()).collect();
                write!(f, "src-port({})", strs.join(","))
            }
            Rule::DstIpCidr(v) => {
                let strs: Vec<String> = v.iter().map(|n| n.to_string()).collect();
                write!(f, "dst-ip-cidr({})", strs.join(","))
            }
            Rule::SrcIpCidr(v) => {
                let strs: Vec<String> = v.iter().map(|n| n.to_string()).collect();
                write!(f, "src-ip-cidr({})", strs.join(","))
            }
            Rule::Network(v) => {
                let strs: Vec<&str> = v.iter().map(|p| p.as_str()).collect();
                write!(f, "network({})", strs.join(","))
            }
        }
    }
}
