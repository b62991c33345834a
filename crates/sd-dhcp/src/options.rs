//! DHCP option codes, per-code validation, and inheritance (RFC 2132, RFC 3046)

use std::net::Ipv4Addr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::packet::MessageType;

/// DHCP option codes (RFC 2132)
pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_BROADCAST_ADDR: u8 = 28;
pub const OPT_NTP_SERVERS: u8 = 42;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MSG_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_MESSAGE: u8 = 56;
pub const OPT_MAX_MESSAGE_SIZE: u8 = 57;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_VENDOR_CLASS: u8 = 60;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_TFTP_SERVER: u8 = 66;
pub const OPT_BOOTFILE_NAME: u8 = 67;
pub const OPT_USER_CLASS: u8 = 77;
pub const OPT_RELAY_AGENT_INFO: u8 = 82;
pub const OPT_AUTH: u8 = 90;
pub const OPT_END: u8 = 255;

/// Relay agent sub-option codes (RFC 3046)
pub const RAI_CIRCUIT_ID: u8 = 1;
pub const RAI_REMOTE_ID: u8 = 2;
pub const RAI_SUBSCRIBER_ID: u8 = 6;

/// A parsed DHCP option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn msg_type(t: MessageType) -> Self {
        Self::new(OPT_MSG_TYPE, vec![t as u8])
    }

    pub fn server_id(ip: Ipv4Addr) -> Self {
        Self::new(OPT_SERVER_ID, ip.octets().to_vec())
    }

    /// Lease time as big-endian 32-bit seconds
    pub fn lease_time(secs: u32) -> Self {
        Self::new(OPT_LEASE_TIME, secs.to_be_bytes().to_vec())
    }

    pub fn renewal_time(secs: u32) -> Self {
        Self::new(OPT_RENEWAL_TIME, secs.to_be_bytes().to_vec())
    }

    pub fn rebinding_time(secs: u32) -> Self {
        Self::new(OPT_REBINDING_TIME, secs.to_be_bytes().to_vec())
    }

    pub fn subnet_mask(mask: Ipv4Addr) -> Self {
        Self::new(OPT_SUBNET_MASK, mask.octets().to_vec())
    }

    pub fn router(ip: Ipv4Addr) -> Self {
        Self::new(OPT_ROUTER, ip.octets().to_vec())
    }

    pub fn dns_servers(ips: &[Ipv4Addr]) -> Self {
        let mut data = Vec::with_capacity(ips.len() * 4);
        for ip in ips {
            data.extend_from_slice(&ip.octets());
        }
        Self::new(OPT_DNS_SERVER, data)
    }

    pub fn domain_name(name: &str) -> Self {
        Self::new(OPT_DOMAIN_NAME, name.as_bytes().to_vec())
    }

    pub fn hostname(name: &str) -> Self {
        Self::new(OPT_HOSTNAME, name.as_bytes().to_vec())
    }

    pub fn broadcast(ip: Ipv4Addr) -> Self {
        Self::new(OPT_BROADCAST_ADDR, ip.octets().to_vec())
    }

    pub fn requested_ip(ip: Ipv4Addr) -> Self {
        Self::new(OPT_REQUESTED_IP, ip.octets().to_vec())
    }

    pub fn message(text: &str) -> Self {
        Self::new(OPT_MESSAGE, text.as_bytes().to_vec())
    }

    /// Extract IPv4 address from option data
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        if self.data.len() == 4 {
            Some(Ipv4Addr::new(self.data[0], self.data[1], self.data[2], self.data[3]))
        } else {
            None
        }
    }

    /// Extract u32 from option data
    pub fn as_u32(&self) -> Option<u32> {
        if self.data.len() == 4 {
            Some(u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]))
        } else {
            None
        }
    }

    /// Extract u16 from option data
    pub fn as_u16(&self) -> Option<u16> {
        if self.data.len() == 2 {
            Some(u16::from_be_bytes([self.data[0], self.data[1]]))
        } else {
            None
        }
    }

    /// Extract u8 from option data
    pub fn as_u8(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Extract string from option data
    pub fn as_str(&self) -> Option<String> {
        String::from_utf8(self.data.clone()).ok()
    }
}

/// Parse DHCP options from bytes (after the magic cookie).
///
/// Parsing stops at END or at a truncated TLV; options collected up to that
/// point are returned.
pub fn parse_options(data: &[u8]) -> Vec<DhcpOption> {
    let mut options = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }

        i += 1;
        if i >= data.len() {
            break;
        }

        let len = data[i] as usize;
        i += 1;

        if i + len > data.len() {
            warn!("truncated option {} (declared {} bytes, {} left)", code, len, data.len() - i);
            break;
        }

        options.push(DhcpOption::new(code, data[i..i + len].to_vec()));
        i += len;
    }

    options
}

/// Encode DHCP options to bytes, terminated by END.
pub fn encode_options(options: &[DhcpOption]) -> Vec<u8> {
    let mut buf = Vec::new();
    for opt in options {
        if opt.code == OPT_PAD || opt.code == OPT_END {
            continue;
        }
        buf.push(opt.code);
        buf.push(opt.data.len() as u8);
        buf.extend_from_slice(&opt.data);
    }
    buf.push(OPT_END);
    buf
}

// ── Registry ────────────────────────────────────────────────────────────

/// Per-code metadata used to validate option payloads.
pub struct OptionSpec {
    pub code: u8,
    pub name: &'static str,
    pub min_len: usize,
    pub max_len: usize,
    /// Payload must be a multiple of this (4 for address lists).
    pub unit: usize,
}

static REGISTRY: &[OptionSpec] = &[
    OptionSpec { code: OPT_SUBNET_MASK, name: "subnet-mask", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_ROUTER, name: "routers", min_len: 4, max_len: 255, unit: 4 },
    OptionSpec { code: OPT_DNS_SERVER, name: "domain-name-servers", min_len: 4, max_len: 255, unit: 4 },
    OptionSpec { code: OPT_HOSTNAME, name: "host-name", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_DOMAIN_NAME, name: "domain-name", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_BROADCAST_ADDR, name: "broadcast-address", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_NTP_SERVERS, name: "ntp-servers", min_len: 4, max_len: 255, unit: 4 },
    OptionSpec { code: OPT_REQUESTED_IP, name: "requested-address", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_LEASE_TIME, name: "lease-time", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_MSG_TYPE, name: "message-type", min_len: 1, max_len: 1, unit: 1 },
    OptionSpec { code: OPT_SERVER_ID, name: "server-identifier", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_PARAM_REQUEST, name: "parameter-request-list", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_MESSAGE, name: "message", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_MAX_MESSAGE_SIZE, name: "max-message-size", min_len: 2, max_len: 2, unit: 2 },
    OptionSpec { code: OPT_RENEWAL_TIME, name: "renewal-time", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_REBINDING_TIME, name: "rebinding-time", min_len: 4, max_len: 4, unit: 4 },
    OptionSpec { code: OPT_VENDOR_CLASS, name: "vendor-class-identifier", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_CLIENT_ID, name: "client-identifier", min_len: 2, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_TFTP_SERVER, name: "tftp-server-name", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_BOOTFILE_NAME, name: "bootfile-name", min_len: 1, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_RELAY_AGENT_INFO, name: "relay-agent-information", min_len: 2, max_len: 255, unit: 1 },
    OptionSpec { code: OPT_AUTH, name: "authentication", min_len: 1, max_len: 255, unit: 1 },
];

pub fn lookup(code: u8) -> Option<&'static OptionSpec> {
    REGISTRY.iter().find(|s| s.code == code)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionError {
    #[error("option {code} ({name}): length {len} outside [{min}, {max}]")]
    Length { code: u8, name: &'static str, len: usize, min: usize, max: usize },
    #[error("option {code} ({name}): length {len} is not a multiple of {unit}")]
    Format { code: u8, name: &'static str, len: usize, unit: usize },
    #[error("unknown option code {0}")]
    Unknown(u8),
}

/// Validate option payload bytes against the registry.
/// Codes without registry metadata are passed through as opaque.
pub fn validate(code: u8, data: &[u8]) -> Result<(), OptionError> {
    let Some(spec) = lookup(code) else {
        return Ok(());
    };
    if data.len() < spec.min_len || data.len() > spec.max_len {
        return Err(OptionError::Length {
            code,
            name: spec.name,
            len: data.len(),
            min: spec.min_len,
            max: spec.max_len,
        });
    }
    if spec.unit > 1 && data.len() % spec.unit != 0 {
        return Err(OptionError::Format { code, name: spec.name, len: data.len(), unit: spec.unit });
    }
    Ok(())
}

// ── Inheritance ─────────────────────────────────────────────────────────

/// A configured option value, written in whichever shape reads best.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Ip(Ipv4Addr),
    IpList(Vec<Ipv4Addr>),
    Number(u32),
    Text(String),
}

impl OptionValue {
    /// Render to wire bytes. Numbers take the registry's fixed width for the
    /// code, defaulting to 32 bits.
    pub fn to_bytes(&self, code: u8) -> Vec<u8> {
        match self {
            OptionValue::Ip(ip) => ip.octets().to_vec(),
            OptionValue::IpList(ips) => {
                let mut data = Vec::with_capacity(ips.len() * 4);
                for ip in ips {
                    data.extend_from_slice(&ip.octets());
                }
                data
            }
            OptionValue::Number(n) => match lookup(code).map(|s| s.max_len) {
                Some(1) => vec![*n as u8],
                Some(2) => (*n as u16).to_be_bytes().to_vec(),
                _ => n.to_be_bytes().to_vec(),
            },
            OptionValue::Text(s) => s.as_bytes().to_vec(),
        }
    }
}

/// One option override rule, optionally guarded by client class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionOverride {
    pub code: u8,
    pub value: OptionValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_class: Option<String>,
}

impl OptionOverride {
    pub fn matches(&self, ctx: &ClientContext) -> bool {
        let vendor_ok = self
            .vendor_class
            .as_ref()
            .is_none_or(|v| ctx.vendor_class.as_deref() == Some(v.as_str()));
        let user_ok = self
            .user_class
            .as_ref()
            .is_none_or(|u| ctx.user_class.as_deref() == Some(u.as_str()));
        vendor_ok && user_ok
    }
}

/// Client classing context extracted from the request (options 60 and 77).
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
}

/// Layered option sources, highest precedence first: host > pool > subnet > global.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionLayers<'a> {
    pub host: Option<&'a [OptionOverride]>,
    pub pool: Option<&'a [OptionOverride]>,
    pub subnet: &'a [OptionOverride],
    pub global: &'a [OptionOverride],
}

/// Resolve the effective value for `code` through the inheritance chain.
pub fn resolve(code: u8, layers: &OptionLayers<'_>, ctx: &ClientContext) -> Option<DhcpOption> {
    let chain = [layers.host, layers.pool, Some(layers.subnet), Some(layers.global)];
    for layer in chain.into_iter().flatten() {
        if let Some(rule) = layer.iter().find(|r| r.code == code && r.matches(ctx)) {
            return Some(DhcpOption::new(code, rule.value.to_bytes(code)));
        }
    }
    None
}

/// Expand a client's parameter request list (option 55) into the overrides
/// the chain can satisfy, skipping codes already present in `have`.
pub fn requested_options(
    prl: &[u8],
    layers: &OptionLayers<'_>,
    ctx: &ClientContext,
    have: &[DhcpOption],
) -> Vec<DhcpOption> {
    let mut out = Vec::new();
    for &code in prl {
        if code == OPT_PAD || code == OPT_END {
            continue;
        }
        if have.iter().any(|o| o.code == code) || out.iter().any(|o: &DhcpOption| o.code == code) {
            continue;
        }
        if let Some(opt) = resolve(code, layers, ctx) {
            out.push(opt);
        }
    }
    out
}

// ── Relay agent information (option 82) ─────────────────────────────────

/// Parsed relay agent information. Unknown sub-options are preserved opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayAgentInfo {
    pub circuit_id: Option<Vec<u8>>,
    pub remote_id: Option<Vec<u8>>,
    pub subscriber_id: Option<Vec<u8>>,
    pub other: Vec<(u8, Vec<u8>)>,
}

impl RelayAgentInfo {
    /// Parse the sub-TLV payload of option 82. Same framing as the top-level
    /// option walk: a truncated sub-TLV ends parsing.
    pub fn parse(data: &[u8]) -> Self {
        let mut info = RelayAgentInfo::default();
        let mut i = 0;

        while i + 2 <= data.len() {
            let code = data[i];
            let len = data[i + 1] as usize;
            i += 2;
            if i + len > data.len() {
                break;
            }
            let value = data[i..i + len].to_vec();
            i += len;

            match code {
                RAI_CIRCUIT_ID => info.circuit_id = Some(value),
                RAI_REMOTE_ID => info.remote_id = Some(value),
                RAI_SUBSCRIBER_ID => info.subscriber_id = Some(value),
                other => info.other.push((other, value)),
            }
        }

        info
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut push = |code: u8, value: &[u8]| {
            buf.push(code);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        };
        if let Some(ref v) = self.circuit_id {
            push(RAI_CIRCUIT_ID, v);
        }
        if let Some(ref v) = self.remote_id {
            push(RAI_REMOTE_ID, v);
        }
        if let Some(ref v) = self.subscriber_id {
            push(RAI_SUBSCRIBER_ID, v);
        }
        for (code, v) in &self.other {
            push(*code, v);
        }
        buf
    }
}
