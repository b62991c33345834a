//! Typed server configuration. The daemon loads a file into this model once,
//! validates it, and shares the snapshot immutably; reload builds a fresh
//! snapshot and swaps it only if validation passes.

use std::net::{Ipv4Addr, SocketAddr};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::options::{self, OptionOverride};
use crate::packet::MacAddr;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no listen addresses configured")]
    NoListenAddrs,
    #[error("no subnets configured")]
    NoSubnets,
    #[error("listen address {0} has no interface address and no global server_id is set")]
    NoServerId(SocketAddr),
    #[error("subnet '{0}': {1}")]
    Subnet(String, String),
    #[error("global option {0}: {1}")]
    GlobalOption(u8, String),
    #[error("invalid MAC filter pattern '{0}': {1}")]
    MacPattern(String, String),
    #[error("rate limit rule has zero limit or window")]
    RateLimit,
    #[error("client authentication enabled with an empty key")]
    EmptyAuthKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    #[default]
    Reject,
    Replace,
    Extend,
    Negotiate,
}

/// One socket to bind. `address` is the primary IPv4 address of the
/// interface behind this socket; it doubles as the server identifier for
/// requests received here unless a global `server_id` overrides it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub addr: SocketAddr,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
}

impl IpRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(self.from) <= u32::from(ip) && u32::from(ip) <= u32::from(self.to)
    }
}

/// A fixed MAC→IP binding. Reserved addresses are never handed to other
/// clients and do not consume pool state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticReservation {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_lease_time")]
    pub lease_time: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_class: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub name: String,
    pub network: Ipv4Net,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default = "default_lease_time")]
    pub lease_time: u64,
    #[serde(default = "default_max_lease_time")]
    pub max_lease_time: u64,
    #[serde(default)]
    pub options: Vec<OptionOverride>,
    #[serde(default)]
    pub exclusions: Vec<IpRange>,
    #[serde(default)]
    pub reservations: Vec<StaticReservation>,
}

impl SubnetConfig {
    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        u32::from(self.range_start) <= u32::from(ip) && u32::from(ip) <= u32::from(self.range_end)
    }

    pub fn is_excluded(&self, ip: Ipv4Addr) -> bool {
        self.exclusions.iter().any(|r| r.contains(ip))
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        self.network.broadcast()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let err = |msg: String| ConfigError::Subnet(self.name.clone(), msg);

        if self.lease_time == 0 {
            return Err(err("lease_time must be positive".into()));
        }
        if self.lease_time < 60 {
            return Err(err("lease_time below the 60 second minimum".into()));
        }
        if self.max_lease_time < self.lease_time {
            return Err(err("max_lease_time is shorter than lease_time".into()));
        }
        if u32::from(self.range_start) > u32::from(self.range_end) {
            return Err(err(format!(
                "range start {} is above range end {}",
                self.range_start, self.range_end
            )));
        }
        for ip in [self.range_start, self.range_end] {
            if !self.network.contains(&ip) {
                return Err(err(format!("range endpoint {} outside {}", ip, self.network)));
            }
        }
        for excl in &self.exclusions {
            if u32::from(excl.from) > u32::from(excl.to) {
                return Err(err(format!("exclusion {}-{} is inverted", excl.from, excl.to)));
            }
            if !self.in_range(excl.from) || !self.in_range(excl.to) {
                return Err(err(format!(
                    "exclusion {}-{} outside the allocation range",
                    excl.from, excl.to
                )));
            }
        }
        for res in &self.reservations {
            if !self.network.contains(&res.ip) {
                return Err(err(format!("reservation {} outside {}", res.ip, self.network)));
            }
            if self.is_excluded(res.ip) {
                return Err(err(format!("reservation {} collides with an exclusion", res.ip)));
            }
            if res.lease_time == 0 {
                return Err(err(format!("reservation {} has zero lease_time", res.mac)));
            }
            for opt in &res.options {
                options::validate(opt.code, &opt.value.to_bytes(opt.code))
                    .map_err(|e| err(e.to_string()))?;
            }
        }
        for opt in &self.options {
            options::validate(opt.code, &opt.value.to_bytes(opt.code))
                .map_err(|e| err(e.to_string()))?;
        }
        Ok(())
    }
}

// ── Security configuration ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacFilterRule {
    /// Exact MAC, `*` wildcard groups (`00:11:22:*`), or an anchored regex.
    pub pattern: String,
    pub action: FilterAction,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpFilterRule {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub action: FilterAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateIdentifier {
    Mac,
    Ip,
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub identifier: RateIdentifier,
    pub limit: usize,
    pub window_secs: u64,
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedRelay {
    pub giaddr: Ipv4Addr,
    #[serde(default)]
    pub circuit_id: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Option82Config {
    #[serde(default)]
    pub required: bool,
    /// Interfaces that require option 82 even for non-relayed traffic.
    #[serde(default)]
    pub require_on: Vec<String>,
    #[serde(default)]
    pub trusted_relays: Vec<TrustedRelay>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub dhcp_snooping: bool,
    #[serde(default)]
    pub trusted_interfaces: Vec<String>,
    #[serde(default)]
    pub mac_filters: Vec<MacFilterRule>,
    #[serde(default = "default_true")]
    pub mac_default_allow: bool,
    #[serde(default)]
    pub ip_filters: Vec<IpFilterRule>,
    #[serde(default = "default_true")]
    pub ip_default_allow: bool,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRule>,
    #[serde(default)]
    pub option_82: Option82Config,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            dhcp_snooping: false,
            trusted_interfaces: vec![],
            mac_filters: vec![],
            mac_default_allow: true,
            ip_filters: vec![],
            ip_default_allow: true,
            rate_limits: vec![],
            option_82: Option82Config::default(),
            auth: AuthConfig::default(),
        }
    }
}

// ── Top level ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub listen: Vec<ListenConfig>,
    pub subnets: Vec<SubnetConfig>,
    #[serde(default)]
    pub global_options: Vec<OptionOverride>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub auto_save_secs: Option<u64>,
    #[serde(default = "default_max_leases")]
    pub max_leases: usize,
    #[serde(default = "default_decline_cooldown")]
    pub decline_cooldown_secs: u64,
    #[serde(default)]
    pub server_id: Option<Ipv4Addr>,
    #[serde(default)]
    pub authoritative: bool,
}

impl DhcpConfig {
    /// Validate the whole snapshot. Called at load and at every reload; a
    /// snapshot that fails here is never installed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::NoListenAddrs);
        }
        if self.subnets.is_empty() {
            return Err(ConfigError::NoSubnets);
        }
        if self.server_id.is_none() {
            for listen in &self.listen {
                if listen.address.is_none() {
                    return Err(ConfigError::NoServerId(listen.addr));
                }
            }
        }
        for subnet in &self.subnets {
            subnet.validate()?;
        }
        for opt in &self.global_options {
            options::validate(opt.code, &opt.value.to_bytes(opt.code))
                .map_err(|e| ConfigError::GlobalOption(opt.code, e.to_string()))?;
        }
        for rule in &self.security.rate_limits {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(ConfigError::RateLimit);
            }
        }
        if self.security.auth.enabled && self.security.auth.key.is_empty() {
            return Err(ConfigError::EmptyAuthKey);
        }
        Ok(())
    }

    /// The server identifier for a request received on `listen`.
    pub fn server_id_for(&self, listen: &ListenConfig) -> Ipv4Addr {
        self.server_id
            .or(listen.address)
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

fn default_true() -> bool {
    true
}

fn default_lease_time() -> u64 {
    86400
}

fn default_max_lease_time() -> u64 {
    86400
}

fn default_block_secs() -> u64 {
    300
}

fn default_lease_file() -> String {
    "/var/lib/sdhcpd/leases".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_leases() -> usize {
    65536
}

fn default_decline_cooldown() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_subnet() -> SubnetConfig {
        serde_json::from_str(
            r#"{
                "name": "lan",
                "network": "192.168.1.0/24",
                "range_start": "192.168.1.100",
                "range_end": "192.168.1.200",
                "gateway": "192.168.1.1",
                "dns_servers": ["192.168.1.1"],
                "domain_name": "lan.example",
                "lease_time": 86400
            }"#,
        )
        .unwrap()
    }

    fn test_config() -> DhcpConfig {
        serde_json::from_str(
            r#"{
                "listen": [{"addr": "0.0.0.0:67", "interface": "eth0", "address": "192.168.1.1"}],
                "subnets": [{
                    "name": "lan",
                    "network": "192.168.1.0/24",
                    "range_start": "192.168.1.100",
                    "range_end": "192.168.1.200"
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = test_config();
        assert_eq!(config.lease_file, "/var/lib/sdhcpd/leases");
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Reject);
        assert!(config.security.mac_default_allow);
        assert_eq!(config.subnets[0].lease_time, 86400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_subnet_helpers() {
        let subnet = test_subnet();
        assert!(subnet.in_range(Ipv4Addr::new(192, 168, 1, 150)));
        assert!(!subnet.in_range(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnet.broadcast_addr(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_validate_rejects_bad_range() {
        let mut config = test_config();
        config.subnets[0].range_start = Ipv4Addr::new(192, 168, 1, 201);
        assert!(matches!(config.validate(), Err(ConfigError::Subnet(_, _))));

        let mut config = test_config();
        config.subnets[0].range_end = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(config.validate(), Err(ConfigError::Subnet(_, _))));
    }

    #[test]
    fn test_validate_rejects_bad_exclusion_and_reservation() {
        let mut config = test_config();
        config.subnets[0].exclusions.push(IpRange {
            from: Ipv4Addr::new(192, 168, 1, 10),
            to: Ipv4Addr::new(192, 168, 1, 20),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Subnet(_, _))));

        let mut config = test_config();
        config.subnets[0].reservations.push(StaticReservation {
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            ip: Ipv4Addr::new(10, 9, 9, 9),
            hostname: String::new(),
            description: String::new(),
            lease_time: 3600,
            enabled: true,
            vendor_class: None,
            options: vec![],
        });
        assert!(matches!(config.validate(), Err(ConfigError::Subnet(_, _))));
    }

    #[test]
    fn test_validate_requires_server_identity() {
        let mut config = test_config();
        config.listen[0].address = None;
        assert!(matches!(config.validate(), Err(ConfigError::NoServerId(_))));
        config.server_id = Some(Ipv4Addr::new(192, 168, 1, 1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_security() {
        let mut config = test_config();
        config.security.auth.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::EmptyAuthKey)));
        config.security.auth.key = "secret".into();
        assert!(config.validate().is_ok());

        config.security.rate_limits.push(RateLimitRule {
            identifier: RateIdentifier::Mac,
            limit: 0,
            window_secs: 1,
            block_secs: 5,
        });
        assert!(matches!(config.validate(), Err(ConfigError::RateLimit)));
    }
}
