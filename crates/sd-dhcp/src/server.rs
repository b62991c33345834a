//! Server loop: sockets, receive → admit → dispatch → send, and the
//! background sweep/auto-save timers.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, DhcpConfig, ListenConfig};
use crate::packet::{BOOTREQUEST, DhcpPacket, MessageType};
use crate::security::PacketSource;
use crate::state_machine::{self, ReceiveContext};
use crate::{SharedDhcpState, unix_now};

/// Transaction counters, shared across receive tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    received: AtomicU64,
    sent: AtomicU64,
    parse_errors: AtomicU64,
    denied: AtomicU64,
    offers: AtomicU64,
    acks: AtomicU64,
    naks: AtomicU64,
    pool_exhausted: AtomicU64,
}

impl ServerStats {
    pub fn bump_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_parse_errors(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_offers(&self) {
        self.offers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_acks(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_naks(&self) {
        self.naks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    pub fn offers(&self) -> u64 {
        self.offers.load(Ordering::Relaxed)
    }

    pub fn acks(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    pub fn naks(&self) -> u64 {
        self.naks.load(Ordering::Relaxed)
    }

    pub fn pool_exhausted(&self) -> u64 {
        self.pool_exhausted.load(Ordering::Relaxed)
    }
}

/// Build one listening socket with SO_BROADCAST for DHCP replies.
fn build_socket(listen: &ListenConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket
        .bind(&listen.addr.into())
        .with_context(|| format!("failed to bind {}", listen.addr))?;

    #[cfg(target_os = "linux")]
    if !listen.interface.is_empty() {
        socket
            .bind_device(Some(listen.interface.as_bytes()))
            .with_context(|| format!("failed to bind device {}", listen.interface))?;
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into()).context("failed to register socket with tokio")
}

/// Run the DHCP server until `shutdown` flips. Binds every configured
/// socket up front; a bind failure is an initialization error. A final
/// lease save runs before returning.
pub async fn run_dhcp_server(
    state: SharedDhcpState,
    stats: Arc<ServerStats>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = state.read().await.config.clone();

    let mut sockets = Vec::with_capacity(config.listen.len());
    for listen in &config.listen {
        let socket = Arc::new(build_socket(listen)?);
        info!(
            "DHCP server listening on {}{}",
            listen.addr,
            if listen.interface.is_empty() {
                String::new()
            } else {
                format!(" ({})", listen.interface)
            }
        );
        sockets.push((socket, listen.clone()));
    }

    let mut tasks = Vec::new();
    for (socket, listen) in sockets {
        tasks.push(tokio::spawn(receive_loop(
            socket,
            listen,
            state.clone(),
            stats.clone(),
            shutdown.clone(),
        )));
    }
    tasks.push(tokio::spawn(sweep_loop(state.clone(), shutdown.clone())));
    if config.auto_save_secs.is_some() {
        tasks.push(tokio::spawn(auto_save_loop(state.clone(), shutdown.clone())));
    }

    let mut shutdown = shutdown;
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    for task in tasks {
        let _ = task.await;
    }

    if let Err(e) = state.read().await.lease_store.save_to_file() {
        error!("final lease save failed: {e:#}");
    }
    info!("DHCP server stopped");
    Ok(())
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    listen: ListenConfig,
    state: SharedDhcpState,
    stats: Arc<ServerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 1500];

    loop {
        let (len, src) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("DHCP recv error: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        stats.bump_received();

        let packet = match DhcpPacket::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                stats.bump_parse_errors();
                warn!("invalid DHCP packet from {}: {}", src, e);
                continue;
            }
        };

        // only client-originated messages are served
        if packet.op != BOOTREQUEST {
            continue;
        }

        let src_ip = match src {
            SocketAddr::V4(a) => *a.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let source = PacketSource { interface: listen.interface.clone(), ip: src_ip };

        let mut guard = state.write().await;
        let config = guard.config.clone();

        if guard.security.admit(&packet, &source).is_err() {
            // denied silently on the wire; the pipeline already emitted the event
            stats.bump_denied();
            continue;
        }

        let ctx = ReceiveContext {
            interface: listen.interface.clone(),
            interface_addr: listen.address.or(config.server_id).unwrap_or(Ipv4Addr::UNSPECIFIED),
            source: src,
        };

        let events = guard.events.clone();
        let response = state_machine::handle_packet(
            &packet,
            &config,
            &mut guard.lease_store,
            &events,
            &stats,
            &ctx,
        );

        if let Some(ref reply) = response {
            if reply.message_type() == Ok(MessageType::Ack) && !reply.yiaddr.is_unspecified() {
                guard
                    .security
                    .record_binding(packet.mac(), reply.yiaddr, &listen.interface);
            }
        }
        drop(guard);

        let Some(reply) = response else {
            continue;
        };

        if let Err(e) = reply.validate() {
            debug_assert!(false, "invalid outbound message: {e}");
            error!("dropping invalid outbound message: {}", e);
            continue;
        }

        let bytes = match reply.serialize(packet.max_message_size()) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to serialize reply for {}: {}", packet.mac(), e);
                continue;
            }
        };

        let dest = state_machine::reply_destination(&packet, &reply);
        match socket.send_to(&bytes, dest).await {
            Ok(_) => stats.bump_sent(),
            Err(e) => warn!("failed to send DHCP reply to {}: {}", dest, e),
        }
    }
}

/// Expire leases on the configured interval. Re-reads the interval each
/// cycle so a reload takes effect without restarting the task.
async fn sweep_loop(state: SharedDhcpState, mut shutdown: watch::Receiver<bool>) {
    loop {
        let secs = state.read().await.config.sweep_interval_secs.max(1);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                let mut guard = state.write().await;
                let expired = guard.lease_store.sweep_expired(unix_now());
                if expired > 0 {
                    debug!("expired {} leases", expired);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn auto_save_loop(state: SharedDhcpState, mut shutdown: watch::Receiver<bool>) {
    loop {
        let secs = state.read().await.config.auto_save_secs.unwrap_or(0);
        if secs == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                let guard = state.read().await;
                if let Err(e) = guard.lease_store.save_to_file() {
                    // next cycle retries; persistence errors never stop the server
                    error!("periodic lease save failed: {e:#}");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Validate and install a new configuration snapshot. On any validation
/// error the running snapshot stays in place. In-flight transactions keep
/// the snapshot they started with.
pub async fn apply_config(state: &SharedDhcpState, config: DhcpConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let mut guard = state.write().await;
    guard.security.rebuild(&config.security)?;
    guard.lease_store.apply_config(&config);
    guard.config = Arc::new(config);
    info!("configuration reloaded");
    Ok(())
}
