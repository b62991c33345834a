//! DHCPv4 packet parser/serializer (RFC 2131)

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::options::{
    self, DhcpOption, OPT_AUTH, OPT_CLIENT_ID, OPT_HOSTNAME, OPT_MAX_MESSAGE_SIZE, OPT_MSG_TYPE,
    OPT_PARAM_REQUEST, OPT_RELAY_AGENT_INFO, OPT_REQUESTED_IP, OPT_SERVER_ID, OPT_USER_CLASS,
    OPT_VENDOR_CLASS,
};

/// DHCP magic cookie
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Fixed BOOTP header size
pub const HEADER_LEN: usize = 236;

/// Minimum on-wire reply size (BOOTP-era clients reject smaller frames)
pub const MIN_PACKET_LEN: usize = 300;

/// Default cap when the client sends no Maximum DHCP Message Size (option 57)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 576;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DhcpParseError {
    #[error("packet too short: {0} bytes (header is {HEADER_LEN})")]
    TooShort(usize),
    #[error("missing DHCP message type (option 53)")]
    MissingMessageType,
    #[error("unknown DHCP message type {0}")]
    UnknownMessageType(u8),
    #[error("serialized message is {0} bytes, limit {1}")]
    MessageTooLarge(usize, usize),
    #[error("invalid {0} in outbound message")]
    InvalidField(&'static str),
}

/// DHCP message types (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = DhcpParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Discover),
            2 => Ok(MessageType::Offer),
            3 => Ok(MessageType::Request),
            4 => Ok(MessageType::Decline),
            5 => Ok(MessageType::Ack),
            6 => Ok(MessageType::Nak),
            7 => Ok(MessageType::Release),
            8 => Ok(MessageType::Inform),
            other => Err(DhcpParseError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Discover => "DHCPDISCOVER",
            MessageType::Offer => "DHCPOFFER",
            MessageType::Request => "DHCPREQUEST",
            MessageType::Decline => "DHCPDECLINE",
            MessageType::Ack => "DHCPACK",
            MessageType::Nak => "DHCPNAK",
            MessageType::Release => "DHCPRELEASE",
            MessageType::Inform => "DHCPINFORM",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid MAC address '{0}'")]
pub struct MacParseError(String);

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0u8; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(MacParseError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl serde::Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parsed DHCPv4 packet
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parse a DHCP packet from raw bytes.
    ///
    /// A buffer shorter than the 236-byte header is rejected. A missing magic
    /// cookie still yields the parsed header with an empty option set (raw
    /// BOOTP); the message then fails [`DhcpPacket::message_type`]. A
    /// truncated option TLV ends option parsing without error.
    pub fn parse(data: &[u8]) -> Result<Self, DhcpParseError> {
        if data.len() < HEADER_LEN {
            return Err(DhcpParseError::TooShort(data.len()));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let options = if data.len() >= HEADER_LEN + 4 && data[236..240] == MAGIC_COOKIE {
            options::parse_options(&data[240..])
        } else {
            if data.len() > HEADER_LEN {
                warn!("DHCP packet without magic cookie, treating as raw BOOTP");
            }
            vec![]
        };

        Ok(DhcpPacket {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Extract the message type without a full parse.
    pub fn peek_type(data: &[u8]) -> Option<MessageType> {
        if data.len() < HEADER_LEN + 4 || data[236..240] != MAGIC_COOKIE {
            return None;
        }
        for opt in options::parse_options(&data[240..]) {
            if opt.code == OPT_MSG_TYPE {
                return opt.as_u8().and_then(|v| MessageType::try_from(v).ok());
            }
        }
        None
    }

    /// Serialize to wire bytes, padded to the 300-byte BOOTP minimum and
    /// capped at `max_size`.
    pub fn serialize(&self, max_size: usize) -> Result<Vec<u8>, DhcpParseError> {
        let mut buf = Vec::with_capacity(DEFAULT_MAX_MESSAGE_SIZE);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);

        let opt_bytes = options::encode_options(&self.options);
        buf.extend_from_slice(&opt_bytes);

        while buf.len() < MIN_PACKET_LEN {
            buf.push(0);
        }

        let limit = max_size.max(MIN_PACKET_LEN);
        if buf.len() > limit {
            return Err(DhcpParseError::MessageTooLarge(buf.len(), limit));
        }

        Ok(buf)
    }

    /// Serialize with the default 576-byte cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DhcpParseError> {
        self.serialize(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Validate an outbound message before it is sent.
    pub fn validate(&self) -> Result<(), DhcpParseError> {
        if self.op != BOOTREQUEST && self.op != BOOTREPLY {
            return Err(DhcpParseError::InvalidField("op"));
        }
        if self.htype != 1 {
            return Err(DhcpParseError::InvalidField("htype"));
        }
        if self.hlen != 6 {
            return Err(DhcpParseError::InvalidField("hlen"));
        }
        self.message_type()?;
        Ok(())
    }

    /// Find option by code. Duplicate codes resolve last-wins.
    pub fn get_option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().rfind(|o| o.code == code)
    }

    /// Get the MAC address from chaddr.
    pub fn mac(&self) -> MacAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.chaddr[..6]);
        MacAddr(octets)
    }

    /// Get DHCP message type as a raw byte
    pub fn msg_type(&self) -> Option<u8> {
        self.get_option(OPT_MSG_TYPE)?.as_u8()
    }

    /// Get the DHCP message type, or an error for raw BOOTP / unknown values.
    pub fn message_type(&self) -> Result<MessageType, DhcpParseError> {
        match self.msg_type() {
            Some(v) => MessageType::try_from(v),
            None => Err(DhcpParseError::MissingMessageType),
        }
    }

    /// Get requested IP address (option 50)
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP)?.as_ipv4()
    }

    /// Get server identifier (option 54)
    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID)?.as_ipv4()
    }

    /// Get hostname (option 12)
    pub fn hostname(&self) -> Option<String> {
        self.get_option(OPT_HOSTNAME)?.as_str()
    }

    /// Get client identifier (option 61) as hex
    pub fn client_id(&self) -> Option<String> {
        let opt = self.get_option(OPT_CLIENT_ID)?;
        Some(
            opt.data
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }

    /// Get the parameter request list (option 55)
    pub fn param_request_list(&self) -> Option<&[u8]> {
        Some(self.get_option(OPT_PARAM_REQUEST)?.data.as_slice())
    }

    /// Get vendor class identifier (option 60)
    pub fn vendor_class(&self) -> Option<String> {
        self.get_option(OPT_VENDOR_CLASS)?.as_str()
    }

    /// Get user class (option 77)
    pub fn user_class(&self) -> Option<String> {
        self.get_option(OPT_USER_CLASS)?.as_str()
    }

    /// Get raw relay agent information (option 82)
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        Some(self.get_option(OPT_RELAY_AGENT_INFO)?.data.as_slice())
    }

    /// Get the authentication token (option 90)
    pub fn auth_token(&self) -> Option<&[u8]> {
        Some(self.get_option(OPT_AUTH)?.data.as_slice())
    }

    /// Reply size cap from the client's option 57, else 576 bytes.
    pub fn max_message_size(&self) -> usize {
        self.get_option(OPT_MAX_MESSAGE_SIZE)
            .and_then(|o| o.as_u16())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
            .max(MIN_PACKET_LEN)
    }

    /// Check if the broadcast flag is set
    pub fn is_broadcast(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Build a reply packet from this request.
    /// `ciaddr` should be set from the client's ciaddr for DHCPACK (RFC 2131 §4.3.1).
    pub fn build_reply(
        &self,
        msg_type: MessageType,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: {
                let mut opts = vec![DhcpOption::msg_type(msg_type)];
                opts.extend(options);
                opts
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_discover() -> Vec<u8> {
        let mut pkt = vec![0u8; 300];
        pkt[0] = 1; // BOOTREQUEST
        pkt[1] = 1; // Ethernet
        pkt[2] = 6; // MAC length
        pkt[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        pkt[28] = 0xAA;
        pkt[29] = 0xBB;
        pkt[30] = 0xCC;
        pkt[31] = 0xDD;
        pkt[32] = 0xEE;
        pkt[33] = 0xFF;
        pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
        // Options: DHCP Message Type = DISCOVER
        pkt[240] = 53;
        pkt[241] = 1;
        pkt[242] = 1;
        pkt[243] = 255; // END
        pkt
    }

    #[test]
    fn test_parse_discover() {
        let data = make_discover();
        let pkt = DhcpPacket::parse(&data).unwrap();
        assert_eq!(pkt.op, 1);
        assert_eq!(pkt.xid, 0x12345678);
        assert_eq!(pkt.mac().to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(pkt.message_type().unwrap(), MessageType::Discover);
    }

    #[test]
    fn test_too_short() {
        let data = vec![0u8; 235];
        assert!(matches!(
            DhcpPacket::parse(&data),
            Err(DhcpParseError::TooShort(235))
        ));

        // exactly 236 bytes parses fine, there is just no option region
        let data = vec![0u8; 236];
        let pkt = DhcpPacket::parse(&data).unwrap();
        assert!(pkt.options.is_empty());
    }

    #[test]
    fn test_missing_cookie_yields_header_only() {
        let mut data = make_discover();
        data[236..240].copy_from_slice(&[0, 0, 0, 0]);
        let pkt = DhcpPacket::parse(&data).unwrap();
        assert_eq!(pkt.xid, 0x12345678);
        assert!(pkt.options.is_empty());
        assert_eq!(pkt.message_type(), Err(DhcpParseError::MissingMessageType));
    }

    #[test]
    fn test_truncated_option_keeps_earlier_options() {
        let mut data = make_discover();
        data.truncate(243);
        // declare a 10-byte option with only 1 byte remaining
        data.extend_from_slice(&[50, 10, 1]);
        let pkt = DhcpPacket::parse(&data).unwrap();
        assert_eq!(pkt.options.len(), 1);
        assert_eq!(pkt.message_type().unwrap(), MessageType::Discover);
    }

    #[test]
    fn test_duplicate_option_last_wins() {
        let mut data = make_discover();
        data.truncate(243);
        // second option 53 with a different value
        data.extend_from_slice(&[53, 1, 3, 255]);
        let pkt = DhcpPacket::parse(&data).unwrap();
        assert_eq!(pkt.message_type().unwrap(), MessageType::Request);
    }

    #[test]
    fn test_roundtrip() {
        let data = make_discover();
        let pkt = DhcpPacket::parse(&data).unwrap();
        let serialized = pkt.to_bytes().unwrap();
        let pkt2 = DhcpPacket::parse(&serialized).unwrap();
        assert_eq!(pkt2.xid, pkt.xid);
        assert_eq!(pkt2.mac(), pkt.mac());
        assert_eq!(pkt2.msg_type(), pkt.msg_type());
        assert_eq!(pkt2.options.len(), pkt.options.len());
    }

    #[test]
    fn test_peek_type() {
        let data = make_discover();
        assert_eq!(DhcpPacket::peek_type(&data), Some(MessageType::Discover));
        assert_eq!(DhcpPacket::peek_type(&data[..200]), None);
    }

    #[test]
    fn test_serialize_respects_size_cap() {
        let data = make_discover();
        let mut pkt = DhcpPacket::parse(&data).unwrap();
        // a few fat options push the message past 576 bytes
        for code in [200u8, 201, 202] {
            pkt.options.push(DhcpOption::new(code, vec![0u8; 200]));
        }
        match pkt.to_bytes() {
            Err(DhcpParseError::MessageTooLarge(_, 576)) => {}
            other => panic!("expected MessageTooLarge, got {:?}", other),
        }
        // a client advertising a bigger cap makes the same message fit
        assert!(pkt.serialize(1400).is_ok());
    }

    #[test]
    fn test_validate_outbound() {
        let data = make_discover();
        let mut pkt = DhcpPacket::parse(&data).unwrap();
        assert!(pkt.validate().is_ok());
        pkt.op = 3;
        assert_eq!(pkt.validate(), Err(DhcpParseError::InvalidField("op")));
        pkt.op = 2;
        pkt.options.clear();
        assert_eq!(pkt.validate(), Err(DhcpParseError::MissingMessageType));
    }

    #[test]
    fn test_build_reply() {
        let data = make_discover();
        let request = DhcpPacket::parse(&data).unwrap();
        let reply = request.build_reply(
            MessageType::Offer,
            Ipv4Addr::new(10, 0, 0, 100),
            Ipv4Addr::new(10, 0, 0, 254),
            Ipv4Addr::UNSPECIFIED,
            vec![
                DhcpOption::lease_time(86400),
                DhcpOption::subnet_mask(Ipv4Addr::new(255, 255, 255, 0)),
            ],
        );
        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.message_type().unwrap(), MessageType::Offer);
    }

    #[test]
    fn test_mac_addr_parse_display() {
        let mac: MacAddr = "AA:bb:CC:dd:ee:01".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:01");
        let dashed: MacAddr = "aa-bb-cc-dd-ee-01".parse().unwrap();
        assert_eq!(mac, dashed);
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:01".parse::<MacAddr>().is_err());
        assert!(MacAddr::ZERO.is_zero());
    }
}
