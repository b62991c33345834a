//! Protocol dispatch: one admitted inbound message in, at most one reply out,
//! plus lease-store mutations. Per-client state lives entirely in the store.

use std::net::{Ipv4Addr, SocketAddr};
use tracing::{debug, info, warn};

use crate::config::{DhcpConfig, SubnetConfig};
use crate::events::{EventLog, SecurityEvent, SecurityEventKind, Severity};
use crate::lease_store::{AllocError, Lease, LeaseStore};
use crate::options::{self, ClientContext, DhcpOption, OptionLayers};
use crate::packet::{DhcpPacket, MessageType};
use crate::server::ServerStats;
use crate::unix_now;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Where a datagram arrived: the bound interface, its primary address, and
/// the sender.
#[derive(Debug, Clone)]
pub struct ReceiveContext {
    pub interface: String,
    pub interface_addr: Ipv4Addr,
    pub source: SocketAddr,
}

/// Handle an admitted DHCP packet and produce a response (if any).
pub fn handle_packet(
    packet: &DhcpPacket,
    config: &DhcpConfig,
    store: &mut LeaseStore,
    events: &EventLog,
    stats: &ServerStats,
    ctx: &ReceiveContext,
) -> Option<DhcpPacket> {
    let msg_type = match packet.message_type() {
        Ok(t) => t,
        Err(e) => {
            debug!("undispatchable packet from {}: {}", ctx.source, e);
            return None;
        }
    };

    match msg_type {
        MessageType::Discover => handle_discover(packet, config, store, stats, ctx),
        MessageType::Request => handle_request(packet, config, store, stats, ctx),
        MessageType::Release => {
            handle_release(packet, store);
            None
        }
        MessageType::Decline => {
            handle_decline(packet, store, events);
            None
        }
        MessageType::Inform => handle_inform(packet, config, stats, ctx),
        MessageType::Offer | MessageType::Ack | MessageType::Nak => {
            debug!("dropping server-originated {} from {}", msg_type, ctx.source);
            None
        }
    }
}

fn server_id(config: &DhcpConfig, ctx: &ReceiveContext) -> Ipv4Addr {
    config.server_id.unwrap_or(ctx.interface_addr)
}

/// Pick the subnet whose network contains `probe`, most specific prefix
/// winning.
fn subnet_containing(config: &DhcpConfig, probe: Ipv4Addr) -> Option<&SubnetConfig> {
    config
        .subnets
        .iter()
        .filter(|s| s.network.contains(&probe))
        .max_by_key(|s| s.network.prefix_len())
}

/// Subnet selection: the relay address when relayed, else the address of the
/// receiving interface.
fn select_subnet<'a>(
    config: &'a DhcpConfig,
    packet: &DhcpPacket,
    ctx: &ReceiveContext,
) -> Option<&'a SubnetConfig> {
    let probe = if packet.giaddr.is_unspecified() {
        ctx.interface_addr
    } else {
        packet.giaddr
    };
    subnet_containing(config, probe)
}

fn client_context(packet: &DhcpPacket) -> ClientContext {
    ClientContext {
        vendor_class: packet.vendor_class(),
        user_class: packet.user_class(),
    }
}

fn as_secs32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}

/// Options shared by every reply: identity, addressing, and whatever the
/// parameter request list can pull through the inheritance chain.
fn base_options(
    config: &DhcpConfig,
    subnet: &SubnetConfig,
    host_options: Option<&[options::OptionOverride]>,
    packet: &DhcpPacket,
    sid: Ipv4Addr,
) -> Vec<DhcpOption> {
    let mut opts = vec![
        DhcpOption::server_id(sid),
        DhcpOption::subnet_mask(subnet.netmask()),
    ];
    if let Some(gateway) = subnet.gateway {
        opts.push(DhcpOption::router(gateway));
    }
    if !subnet.dns_servers.is_empty() {
        opts.push(DhcpOption::dns_servers(&subnet.dns_servers));
    }
    if !subnet.domain_name.is_empty() {
        opts.push(DhcpOption::domain_name(&subnet.domain_name));
    }
    opts.push(DhcpOption::broadcast(subnet.broadcast_addr()));

    if let Some(prl) = packet.param_request_list() {
        let layers = OptionLayers {
            host: host_options,
            pool: None,
            subnet: &subnet.options,
            global: &config.global_options,
        };
        let extra = options::requested_options(prl, &layers, &client_context(packet), &opts);
        opts.extend(extra);
    }

    opts
}

fn lease_options(
    config: &DhcpConfig,
    subnet: &SubnetConfig,
    store: &LeaseStore,
    lease: &Lease,
    packet: &DhcpPacket,
    sid: Ipv4Addr,
) -> Vec<DhcpOption> {
    let host_options = store
        .reservation_for(lease.mac)
        .map(|r| r.options.as_slice());

    let duration = as_secs32(lease.duration());
    let mut opts = vec![
        DhcpOption::lease_time(duration),
        DhcpOption::renewal_time(duration / 2),
        DhcpOption::rebinding_time(duration / 8 * 7),
    ];
    opts.extend(base_options(config, subnet, host_options, packet, sid));
    if let Some(ref hostname) = lease.hostname {
        opts.push(DhcpOption::hostname(hostname));
    }
    opts
}

fn build_nak(packet: &DhcpPacket, sid: Ipv4Addr, text: Option<&str>) -> DhcpPacket {
    // DHCPNAK: ciaddr and yiaddr are always 0 (RFC 2131 §4.3.2)
    let mut opts = vec![DhcpOption::server_id(sid)];
    if let Some(text) = text {
        opts.push(DhcpOption::message(text));
    }
    packet.build_reply(
        MessageType::Nak,
        Ipv4Addr::UNSPECIFIED,
        sid,
        Ipv4Addr::UNSPECIFIED,
        opts,
    )
}

fn handle_discover(
    packet: &DhcpPacket,
    config: &DhcpConfig,
    store: &mut LeaseStore,
    stats: &ServerStats,
    ctx: &ReceiveContext,
) -> Option<DhcpPacket> {
    let mac = packet.mac();
    if mac.is_zero() {
        debug!("DHCPDISCOVER with zero chaddr from {}", ctx.source);
        return None;
    }
    info!("DHCPDISCOVER from {}", mac);

    let Some(subnet) = select_subnet(config, packet, ctx) else {
        debug!("no subnet serves DISCOVER from {} (giaddr {})", mac, packet.giaddr);
        return None;
    };

    let now = unix_now();
    let lease = match store.allocate(
        mac,
        packet.requested_ip(),
        subnet,
        packet.hostname(),
        packet.client_id(),
        now,
    ) {
        Ok(lease) => lease,
        Err(AllocError::PoolExhausted) => {
            stats.bump_pool_exhausted();
            warn!("pool exhausted in subnet '{}', no offer for {}", subnet.name, mac);
            return None;
        }
        Err(e) => {
            // DISCOVER never draws a NAK: drop and let the client retry
            debug!("no offer for {}: {}", mac, e);
            return None;
        }
    };

    let sid = server_id(config, ctx);
    info!("DHCPOFFER {} to {}", lease.ip, mac);
    stats.bump_offers();

    let opts = lease_options(config, subnet, store, &lease, packet, sid);
    // DHCPOFFER: ciaddr is always 0 (RFC 2131 §4.3.1)
    Some(packet.build_reply(MessageType::Offer, lease.ip, sid, Ipv4Addr::UNSPECIFIED, opts))
}

fn handle_request(
    packet: &DhcpPacket,
    config: &DhcpConfig,
    store: &mut LeaseStore,
    stats: &ServerStats,
    ctx: &ReceiveContext,
) -> Option<DhcpPacket> {
    let mac = packet.mac();
    let sid = server_id(config, ctx);

    // REQUESTs committed to another server are not ours to answer
    if let Some(requested_server) = packet.server_id() {
        if requested_server != sid {
            debug!("DHCPREQUEST from {} for other server {}", mac, requested_server);
            return None;
        }
    }

    let requested_ip = packet.requested_ip().or_else(|| {
        (!packet.ciaddr.is_unspecified()).then_some(packet.ciaddr)
    });
    let Some(ip) = requested_ip else {
        warn!("DHCPREQUEST from {} names no address", mac);
        stats.bump_naks();
        return Some(build_nak(packet, sid, Some("no address requested")));
    };

    info!("DHCPREQUEST from {} for {}", mac, ip);

    // RFC 2131 §4.3.2: INIT-REBOOT with no record of the client, stay silent
    let init_reboot = packet.server_id().is_none()
        && packet.requested_ip().is_some()
        && packet.ciaddr.is_unspecified();
    if init_reboot && store.get_by_mac(mac).is_none() {
        debug!("INIT-REBOOT from {} for {} with no record, staying silent", mac, ip);
        return None;
    }

    let Some(subnet) = select_subnet(config, packet, ctx) else {
        stats.bump_naks();
        return Some(build_nak(packet, sid, Some("no subnet for this network")));
    };

    let now = unix_now();
    let renewing = !packet.ciaddr.is_unspecified() && packet.requested_ip().is_none();

    let result = if renewing {
        store
            .renew(mac, ip, subnet.lease_time, now)
            .map_err(|_| AllocError::IpUnavailable(ip))
    } else {
        store.commit(mac, ip, subnet, packet.hostname(), packet.client_id(), now)
    };

    match result {
        Ok(lease) => {
            info!("DHCPACK {} to {}", lease.ip, mac);
            stats.bump_acks();
            let opts = lease_options(config, subnet, store, &lease, packet, sid);
            // DHCPACK: echo the client's ciaddr (RFC 2131 §4.3.1 Table 3)
            Some(packet.build_reply(MessageType::Ack, lease.ip, sid, packet.ciaddr, opts))
        }
        Err(e) => {
            // A non-authoritative server stays quiet about foreign addresses
            if !config.authoritative && !subnet.in_range(ip) {
                debug!("ignoring REQUEST for foreign address {} from {}", ip, mac);
                return None;
            }
            warn!("DHCPNAK to {} for {}: {}", mac, ip, e);
            stats.bump_naks();
            Some(build_nak(packet, sid, Some(&e.to_string())))
        }
    }
}

fn handle_release(packet: &DhcpPacket, store: &mut LeaseStore) {
    let mac = packet.mac();
    let ip = packet.ciaddr;
    if ip.is_unspecified() {
        return;
    }
    if store.release(mac, ip) {
        info!("DHCPRELEASE from {} for {}", mac, ip);
    } else {
        warn!("DHCPRELEASE from {} for {} ignored (not the holder)", mac, ip);
    }
}

fn handle_decline(packet: &DhcpPacket, store: &mut LeaseStore, events: &EventLog) {
    let mac = packet.mac();
    let Some(ip) = packet.requested_ip() else {
        return;
    };

    if let Some(lease) = store.get_by_ip(ip) {
        if lease.mac != mac {
            warn!("DHCPDECLINE from {} for {} ignored (leased to {})", mac, ip, lease.mac);
            return;
        }
    }

    info!("DHCPDECLINE from {} for {}", mac, ip);
    store.decline(mac, ip, unix_now());
    events.emit(
        SecurityEvent::new(
            SecurityEventKind::IpDeclined,
            Severity::Medium,
            format!("{} declined {}, poisoning the address", mac, ip),
        )
        .with_mac(mac)
        .with_ip(ip),
    );
}

fn handle_inform(
    packet: &DhcpPacket,
    config: &DhcpConfig,
    stats: &ServerStats,
    ctx: &ReceiveContext,
) -> Option<DhcpPacket> {
    let mac = packet.mac();
    if packet.ciaddr.is_unspecified() {
        debug!("DHCPINFORM from {} without ciaddr", mac);
        return None;
    }
    info!("DHCPINFORM from {}", mac);

    let probe = if packet.giaddr.is_unspecified() { packet.ciaddr } else { packet.giaddr };
    let subnet = subnet_containing(config, probe)
        .or_else(|| subnet_containing(config, ctx.interface_addr))?;

    let sid = server_id(config, ctx);
    stats.bump_acks();
    // configuration only: no lease times, yiaddr stays 0 (RFC 2131 §4.3.5)
    let opts = base_options(config, subnet, None, packet, sid);
    Some(packet.build_reply(MessageType::Ack, Ipv4Addr::UNSPECIFIED, sid, packet.ciaddr, opts))
}

/// Where to send a reply (RFC 2131 §4.1): relays get it on the server port,
/// configured clients unicast, everyone else via broadcast.
pub fn reply_destination(request: &DhcpPacket, reply: &DhcpPacket) -> SocketAddr {
    if !request.giaddr.is_unspecified() {
        return SocketAddr::new(request.giaddr.into(), SERVER_PORT);
    }
    if reply.message_type() == Ok(MessageType::Nak) {
        // NAK is always broadcast when not relayed (RFC 2131 §4.3.2)
        return SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT);
    }
    if !request.ciaddr.is_unspecified() {
        return SocketAddr::new(request.ciaddr.into(), CLIENT_PORT);
    }
    // fresh bindings have no routable address yet
    SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT)
}
