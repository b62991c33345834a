//! Admission pipeline, applied to every message before protocol dispatch.
//!
//! Stages run in order and short-circuit on the first deny: interface trust
//! (snooping), MAC filter, IP filter, rate limiting, relay-agent (option 82)
//! validation, client authentication. Every deny emits a [`SecurityEvent`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use regex::Regex;
use ring::hmac;
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, FilterAction, RateIdentifier, RateLimitRule, SecurityConfig};
use crate::events::{EventLog, SecurityEvent, SecurityEventKind, Severity};
use crate::options::RelayAgentInfo;
use crate::packet::{DhcpPacket, MacAddr};
use crate::unix_now;

const MAX_RATE_TRACKERS: usize = 4096;
const MAX_SNOOPING_BINDINGS: usize = 8192;

/// Network-level metadata for a received datagram.
#[derive(Debug, Clone)]
pub struct PacketSource {
    pub interface: String,
    pub ip: Ipv4Addr,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    #[error("untrusted interface {0} without a snooping binding")]
    UntrustedInterface(String),
    #[error("MAC address denied by filter")]
    MacFiltered,
    #[error("source address denied by filter")]
    IpFiltered,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("relay agent information missing or incomplete")]
    Option82Missing,
    #[error("relay agent {0} is not trusted")]
    Option82Untrusted(Ipv4Addr),
    #[error("authentication token missing")]
    AuthMissing,
    #[error("authentication failed")]
    AuthFailed,
}

enum MacPattern {
    Exact(MacAddr),
    /// Per-octet groups; `None` is a wildcard. A trailing wildcard covers
    /// the remaining octets.
    Wildcard(Vec<Option<u8>>),
    Regex(Regex),
}

impl MacPattern {
    fn compile(pattern: &str) -> Result<Self, ConfigError> {
        if let Ok(mac) = pattern.parse::<MacAddr>() {
            return Ok(MacPattern::Exact(mac));
        }

        let groups: Vec<&str> = pattern.split(':').collect();
        let is_wildcard = pattern.contains('*')
            && groups.len() <= 6
            && groups
                .iter()
                .all(|g| *g == "*" || u8::from_str_radix(g, 16).is_ok());
        if is_wildcard {
            let parsed = groups
                .iter()
                .map(|g| if *g == "*" { None } else { u8::from_str_radix(g, 16).ok() })
                .collect();
            return Ok(MacPattern::Wildcard(parsed));
        }

        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^(?:{pattern})$")
        };
        let regex = Regex::new(&anchored)
            .map_err(|e| ConfigError::MacPattern(pattern.to_string(), e.to_string()))?;
        Ok(MacPattern::Regex(regex))
    }

    fn matches(&self, mac: MacAddr) -> bool {
        match self {
            MacPattern::Exact(m) => *m == mac,
            MacPattern::Wildcard(groups) => {
                let octets = mac.octets();
                for (i, octet) in octets.iter().enumerate() {
                    match groups.get(i) {
                        Some(Some(b)) => {
                            if b != octet {
                                return false;
                            }
                        }
                        Some(None) => {}
                        None => return groups.last() == Some(&None),
                    }
                }
                true
            }
            MacPattern::Regex(re) => re.is_match(&mac.to_string()),
        }
    }
}

struct CompiledMacRule {
    pattern: MacPattern,
    action: FilterAction,
    reason: Option<String>,
}

struct RateTracker {
    hits: Vec<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

enum RateVerdict {
    Admitted,
    /// First deny of a new block window.
    Blocked,
    /// Deny inside an ongoing block window; no further event.
    Suppressed,
}

impl RateTracker {
    fn new(now: Instant) -> Self {
        Self { hits: Vec::new(), blocked_until: None, last_seen: now }
    }

    fn check(&mut self, rule: &RateLimitRule, now: Instant) -> RateVerdict {
        self.last_seen = now;

        if let Some(until) = self.blocked_until {
            if now < until {
                return RateVerdict::Suppressed;
            }
            self.blocked_until = None;
            self.hits.clear();
        }

        let window = Duration::from_secs(rule.window_secs);
        self.hits.retain(|&hit| now.duration_since(hit) <= window);
        self.hits.push(now);

        if self.hits.len() > rule.limit {
            self.blocked_until = Some(now + Duration::from_secs(rule.block_secs));
            RateVerdict::Blocked
        } else {
            RateVerdict::Admitted
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SnoopingBinding {
    ip: Ipv4Addr,
    interface: String,
}

/// The admission pipeline. Kept behind the server state lock; rate trackers
/// and snooping bindings mutate on the hot path.
pub struct SecurityPipeline {
    config: SecurityConfig,
    mac_rules: Vec<CompiledMacRule>,
    auth_key: Option<hmac::Key>,
    trackers: HashMap<String, RateTracker>,
    bindings: HashMap<MacAddr, SnoopingBinding>,
    events: Arc<EventLog>,
}

impl SecurityPipeline {
    pub fn new(config: &SecurityConfig, events: Arc<EventLog>) -> Result<Self, ConfigError> {
        let mut pipeline = SecurityPipeline {
            config: SecurityConfig::default(),
            mac_rules: Vec::new(),
            auth_key: None,
            trackers: HashMap::new(),
            bindings: HashMap::new(),
            events,
        };
        pipeline.rebuild(config)?;
        Ok(pipeline)
    }

    /// Adopt a new rule set. Snooping bindings and rate state survive the
    /// swap; in-flight admissions saw the old rules.
    pub fn rebuild(&mut self, config: &SecurityConfig) -> Result<(), ConfigError> {
        let mut mac_rules = Vec::with_capacity(config.mac_filters.len());
        for rule in &config.mac_filters {
            mac_rules.push(CompiledMacRule {
                pattern: MacPattern::compile(&rule.pattern)?,
                action: rule.action,
                reason: rule.reason.clone(),
            });
        }

        self.auth_key = if config.auth.enabled {
            Some(hmac::Key::new(hmac::HMAC_SHA256, config.auth.key.as_bytes()))
        } else {
            None
        };
        self.mac_rules = mac_rules;
        self.config = config.clone();
        Ok(())
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Record a verified client binding, learned from completed exchanges.
    pub fn record_binding(&mut self, mac: MacAddr, ip: Ipv4Addr, interface: &str) {
        if self.bindings.len() >= MAX_SNOOPING_BINDINGS && !self.bindings.contains_key(&mac) {
            return;
        }
        self.bindings
            .insert(mac, SnoopingBinding { ip, interface: interface.to_string() });
    }

    pub fn remove_binding(&mut self, mac: MacAddr) {
        self.bindings.remove(&mac);
    }

    /// Run the full admission pipeline.
    pub fn admit(&mut self, packet: &DhcpPacket, source: &PacketSource) -> Result<(), DenyReason> {
        self.admit_at(packet, source, Instant::now(), unix_now())
    }

    /// Admission with explicit clocks.
    pub fn admit_at(
        &mut self,
        packet: &DhcpPacket,
        source: &PacketSource,
        now: Instant,
        unix: u64,
    ) -> Result<(), DenyReason> {
        let mac = packet.mac();

        self.check_interface_trust(source, mac)?;
        self.check_mac_filter(source, mac)?;
        self.check_ip_filter(source, mac)?;
        self.check_rate_limits(packet, source, mac, now)?;
        self.check_option_82(packet, source, mac)?;
        self.check_auth(packet, source, mac, unix)?;

        Ok(())
    }

    fn deny(
        &self,
        reason: DenyReason,
        kind: SecurityEventKind,
        severity: Severity,
        mac: MacAddr,
        source: &PacketSource,
        description: String,
    ) -> Result<(), DenyReason> {
        self.events.emit(
            SecurityEvent::new(kind, severity, description)
                .with_mac(mac)
                .with_ip(source.ip)
                .with_interface(&source.interface),
        );
        Err(reason)
    }

    fn check_interface_trust(&self, source: &PacketSource, mac: MacAddr) -> Result<(), DenyReason> {
        if !self.config.dhcp_snooping {
            return Ok(());
        }
        if self.config.trusted_interfaces.iter().any(|i| *i == source.interface) {
            return Ok(());
        }

        let bound = self.bindings.get(&mac).is_some_and(|b| {
            b.interface == source.interface && (source.ip.is_unspecified() || b.ip == source.ip)
        });
        if bound {
            return Ok(());
        }

        self.deny(
            DenyReason::UntrustedInterface(source.interface.clone()),
            SecurityEventKind::UnauthorizedDhcpServer,
            Severity::High,
            mac,
            source,
            format!("DHCP message from {} on untrusted interface {}", mac, source.interface),
        )
    }

    fn check_mac_filter(&self, source: &PacketSource, mac: MacAddr) -> Result<(), DenyReason> {
        let decision = self
            .mac_rules
            .iter()
            .find(|rule| rule.pattern.matches(mac));

        let (allowed, reason) = match decision {
            Some(rule) => (rule.action == FilterAction::Allow, rule.reason.clone()),
            None => (self.config.mac_default_allow, None),
        };

        if allowed {
            return Ok(());
        }
        self.deny(
            DenyReason::MacFiltered,
            SecurityEventKind::MacFilterDeny,
            Severity::Medium,
            mac,
            source,
            match reason {
                Some(r) => format!("MAC {} denied by filter: {}", mac, r),
                None => format!("MAC {} denied by filter", mac),
            },
        )
    }

    fn check_ip_filter(&self, source: &PacketSource, mac: MacAddr) -> Result<(), DenyReason> {
        let candidate = u32::from(source.ip);
        let decision = self.config.ip_filters.iter().find(|rule| {
            let mask = u32::from(rule.mask);
            candidate & mask == u32::from(rule.ip) & mask
        });

        let allowed = match decision {
            Some(rule) => rule.action == FilterAction::Allow,
            None => self.config.ip_default_allow,
        };

        if allowed {
            return Ok(());
        }
        self.deny(
            DenyReason::IpFiltered,
            SecurityEventKind::IpFilterDeny,
            Severity::Medium,
            mac,
            source,
            format!("source address {} denied by filter", source.ip),
        )
    }

    fn check_rate_limits(
        &mut self,
        packet: &DhcpPacket,
        source: &PacketSource,
        mac: MacAddr,
        now: Instant,
    ) -> Result<(), DenyReason> {
        for i in 0..self.config.rate_limits.len() {
            let rule = self.config.rate_limits[i].clone();
            let key = match rule.identifier {
                RateIdentifier::Mac => format!("mac:{}", mac),
                RateIdentifier::Ip => format!("ip:{}", source.ip),
                RateIdentifier::Relay => {
                    if packet.giaddr.is_unspecified() {
                        continue;
                    }
                    format!("relay:{}", packet.giaddr)
                }
            };

            self.evict_trackers_if_full(&key);
            let tracker = self
                .trackers
                .entry(key)
                .or_insert_with(|| RateTracker::new(now));

            match tracker.check(&rule, now) {
                RateVerdict::Admitted => {}
                RateVerdict::Blocked => {
                    return self.deny(
                        DenyReason::RateLimited,
                        SecurityEventKind::RateLimited,
                        Severity::Medium,
                        mac,
                        source,
                        format!(
                            "{} exceeded {} requests in {}s, blocking for {}s",
                            mac, rule.limit, rule.window_secs, rule.block_secs
                        ),
                    );
                }
                RateVerdict::Suppressed => {
                    debug!("dropping request from {} inside block window", mac);
                    return Err(DenyReason::RateLimited);
                }
            }
        }
        Ok(())
    }

    fn evict_trackers_if_full(&mut self, incoming: &str) {
        if self.trackers.len() < MAX_RATE_TRACKERS || self.trackers.contains_key(incoming) {
            return;
        }
        if let Some(oldest) = self
            .trackers
            .iter()
            .min_by_key(|(_, t)| t.last_seen)
            .map(|(k, _)| k.clone())
        {
            self.trackers.remove(&oldest);
        }
    }

    fn check_option_82(
        &self,
        packet: &DhcpPacket,
        source: &PacketSource,
        mac: MacAddr,
    ) -> Result<(), DenyReason> {
        let o82 = &self.config.option_82;
        let relayed = !packet.giaddr.is_unspecified();
        let required =
            o82.required && (relayed || o82.require_on.iter().any(|i| *i == source.interface));
        if !required {
            return Ok(());
        }

        let info = match packet.relay_agent_info() {
            Some(data) => RelayAgentInfo::parse(data),
            None => {
                return self.deny(
                    DenyReason::Option82Missing,
                    SecurityEventKind::Option82Missing,
                    Severity::High,
                    mac,
                    source,
                    format!("relay agent information absent (giaddr {})", packet.giaddr),
                );
            }
        };

        if info.circuit_id.is_none() || info.remote_id.is_none() {
            return self.deny(
                DenyReason::Option82Missing,
                SecurityEventKind::Option82Missing,
                Severity::High,
                mac,
                source,
                "relay agent information lacks circuit-id or remote-id".to_string(),
            );
        }

        if relayed {
            let trusted = self.config.option_82.trusted_relays.iter().find(|t| t.giaddr == packet.giaddr);
            let verified = trusted.is_some_and(|t| {
                let circuit_ok = t
                    .circuit_id
                    .as_ref()
                    .is_none_or(|c| info.circuit_id.as_deref() == Some(c.as_bytes()));
                let remote_ok = t
                    .remote_id
                    .as_ref()
                    .is_none_or(|r| info.remote_id.as_deref() == Some(r.as_bytes()));
                circuit_ok && remote_ok
            });
            if !verified {
                return self.deny(
                    DenyReason::Option82Untrusted(packet.giaddr),
                    SecurityEventKind::Option82Untrusted,
                    Severity::High,
                    mac,
                    source,
                    format!("relay agent {} failed trust verification", packet.giaddr),
                );
            }
        }

        Ok(())
    }

    fn check_auth(
        &self,
        packet: &DhcpPacket,
        source: &PacketSource,
        mac: MacAddr,
        unix: u64,
    ) -> Result<(), DenyReason> {
        let Some(ref key) = self.auth_key else {
            return Ok(());
        };

        let token = match packet.auth_token() {
            Some(t) => t,
            None => {
                return self.deny(
                    DenyReason::AuthMissing,
                    SecurityEventKind::AuthMissing,
                    Severity::High,
                    mac,
                    source,
                    format!("{} sent no authentication token", mac),
                );
            }
        };

        let minute = unix / 60;
        // accept the previous minute to tolerate client clock skew
        let valid = token.len() == 16
            && [minute, minute.saturating_sub(1)].iter().any(|&m| {
                let expected = auth_token_for(key, mac, m);
                ring::constant_time::verify_slices_are_equal(token, &expected).is_ok()
            });

        if valid {
            return Ok(());
        }
        self.deny(
            DenyReason::AuthFailed,
            SecurityEventKind::AuthFailed,
            Severity::High,
            mac,
            source,
            format!("{} sent an invalid authentication token", mac),
        )
    }
}

fn auth_token_for(key: &hmac::Key, mac: MacAddr, minute: u64) -> [u8; 16] {
    let mut msg = Vec::with_capacity(14);
    msg.extend_from_slice(&mac.octets());
    msg.extend_from_slice(&minute.to_be_bytes());
    let tag = hmac::sign(key, &msg);
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag.as_ref()[..16]);
    out
}

/// Client-side token: `HMAC-SHA256(key, mac || unix_minute)` truncated to 16
/// bytes. Exposed for provisioning tools and tests.
pub fn compute_auth_token(shared_key: &str, mac: MacAddr, unix: u64) -> [u8; 16] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, shared_key.as_bytes());
    auth_token_for(&key, mac, unix / 60)
}
