//! Lease engine: dynamic pool allocation, static reservations, conflict
//! resolution, expiration, and the line-oriented lease database.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConflictStrategy, DhcpConfig, StaticReservation, SubnetConfig};
use crate::events::{EventLog, SecurityEvent, SecurityEventKind, Severity};
use crate::packet::MacAddr;
use crate::unix_now;

const DB_HEADER: &str = "# Simple DHCP Daemon Lease Database";
const MAX_PENDING_CONFLICTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseType {
    Dynamic,
    Static,
}

impl LeaseType {
    fn as_str(&self) -> &'static str {
        match self {
            LeaseType::Dynamic => "dynamic",
            LeaseType::Static => "static",
        }
    }
}

/// A committed or offered lease. Times are unix seconds; T1/T2 are derived
/// from one `now` sample so `allocated_at < renewal_at < rebinding_at <=
/// expires_at` holds regardless of clock behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub client_id: Option<String>,
    pub lease_type: LeaseType,
    pub allocated_at: u64,
    pub renewal_at: u64,
    pub rebinding_at: u64,
    pub expires_at: u64,
    pub active: bool,
}

impl Lease {
    pub fn new(
        mac: MacAddr,
        ip: Ipv4Addr,
        hostname: Option<String>,
        client_id: Option<String>,
        lease_type: LeaseType,
        now: u64,
        duration: u64,
    ) -> Self {
        let mut lease = Lease {
            mac,
            ip,
            hostname,
            client_id,
            lease_type,
            allocated_at: now,
            renewal_at: 0,
            rebinding_at: 0,
            expires_at: 0,
            active: true,
        };
        lease.set_times(now, duration);
        lease
    }

    /// Reset the lease clock: T1 at half the duration, T2 at 7/8.
    pub fn set_times(&mut self, now: u64, duration: u64) {
        self.allocated_at = now;
        self.renewal_at = now.saturating_add((duration / 2).max(1));
        self.rebinding_at = now
            .saturating_add(duration.saturating_mul(7) / 8)
            .max(self.renewal_at + 1);
        self.expires_at = now.saturating_add(duration).max(self.rebinding_at);
    }

    pub fn duration(&self) -> u64 {
        self.expires_at.saturating_sub(self.allocated_at)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// An unresolved address collision queued under the `negotiate` strategy.
#[derive(Debug, Clone)]
pub struct LeaseConflict {
    pub ip: Ipv4Addr,
    pub incumbent: MacAddr,
    pub claimant: MacAddr,
    pub at: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    #[error("address pool exhausted")]
    PoolExhausted,
    #[error("address {0} is unavailable")]
    IpUnavailable(Ipv4Addr),
    #[error("address {ip} is held by {holder}")]
    Conflict { ip: Ipv4Addr, holder: MacAddr },
    #[error("lease store is full ({0} leases)")]
    StoreFull(usize),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RenewError {
    #[error("no lease for {0}")]
    NoLease(Ipv4Addr),
    #[error("{0} is bound to a different client")]
    NotOwner(Ipv4Addr),
}

pub type ExpiryCallback = Box<dyn Fn(&Lease) + Send + Sync>;

/// DHCP lease store. The IP index owns the records; the MAC index is kept in
/// lockstep: every mutation updates both or neither. All public operations
/// run under the owner's state lock.
pub struct LeaseStore {
    leases: HashMap<Ipv4Addr, Lease>,
    by_mac: HashMap<MacAddr, Ipv4Addr>,
    reservations: HashMap<MacAddr, StaticReservation>,
    declined: HashMap<Ipv4Addr, u64>,
    conflicts: VecDeque<LeaseConflict>,
    conflict_strategy: ConflictStrategy,
    max_leases: usize,
    decline_cooldown: u64,
    file_path: PathBuf,
    events: Option<Arc<EventLog>>,
    on_expire: Option<ExpiryCallback>,
}

impl LeaseStore {
    pub fn new(file_path: &str) -> Self {
        Self {
            leases: HashMap::new(),
            by_mac: HashMap::new(),
            reservations: HashMap::new(),
            declined: HashMap::new(),
            conflicts: VecDeque::new(),
            conflict_strategy: ConflictStrategy::Reject,
            max_leases: usize::MAX,
            decline_cooldown: 300,
            file_path: PathBuf::from(file_path),
            events: None,
            on_expire: None,
        }
    }

    /// Build a store from a validated config snapshot.
    pub fn from_config(config: &DhcpConfig) -> Self {
        let mut store = Self::new(&config.lease_file);
        store.apply_config(config);
        store
    }

    /// Adopt the tunable parts of a (re)loaded config. Existing leases are
    /// left untouched.
    pub fn apply_config(&mut self, config: &DhcpConfig) {
        self.conflict_strategy = config.conflict_strategy;
        self.max_leases = config.max_leases;
        self.decline_cooldown = config.decline_cooldown_secs;
        self.file_path = PathBuf::from(&config.lease_file);
        self.reservations.clear();
        for subnet in &config.subnets {
            for res in &subnet.reservations {
                self.reservations.insert(res.mac, res.clone());
            }
        }
    }

    pub fn set_event_log(&mut self, events: Arc<EventLog>) {
        self.events = Some(events);
    }

    pub fn set_expiry_callback(&mut self, callback: ExpiryCallback) {
        self.on_expire = Some(callback);
    }

    pub fn reservation_for(&self, mac: MacAddr) -> Option<&StaticReservation> {
        self.reservations.get(&mac).filter(|r| r.enabled)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.leases.get(&ip).cloned()
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<Lease> {
        let ip = self.by_mac.get(&mac)?;
        self.leases.get(ip).cloned()
    }

    /// All active leases, for persistence and inspection.
    pub fn snapshot(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.leases.values().filter(|l| l.active).cloned().collect();
        leases.sort_by_key(|l| u32::from(l.ip));
        leases
    }

    fn active_holder(&self, ip: Ipv4Addr, now: u64) -> Option<&Lease> {
        self.leases.get(&ip).filter(|l| l.active && !l.is_expired(now))
    }

    fn reserved_for_other(&self, ip: Ipv4Addr, mac: MacAddr) -> bool {
        self.reservations
            .values()
            .any(|r| r.enabled && r.ip == ip && r.mac != mac)
    }

    fn in_decline_cooldown(&self, ip: Ipv4Addr, now: u64) -> bool {
        self.declined.get(&ip).is_some_and(|&deadline| deadline > now)
    }

    /// Whether `ip` can be offered to a new client right now.
    pub fn is_available(&self, ip: Ipv4Addr, subnet: &SubnetConfig, now: u64) -> bool {
        subnet.in_range(ip)
            && !subnet.is_excluded(ip)
            && !self.in_decline_cooldown(ip, now)
            && !self.reservations.values().any(|r| r.enabled && r.ip == ip)
            && self.active_holder(ip, now).is_none()
    }

    /// Insert keeping both indexes in lockstep, as one atomic step.
    fn insert_lease(&mut self, lease: Lease) -> Result<Lease, AllocError> {
        if !self.leases.contains_key(&lease.ip) && self.leases.len() >= self.max_leases {
            return Err(AllocError::StoreFull(self.leases.len()));
        }

        // A different MAC previously held this IP: drop its index entry.
        if let Some(old) = self.leases.get(&lease.ip) {
            if old.mac != lease.mac {
                self.by_mac.remove(&old.mac);
            }
        }
        // This MAC previously held a different IP: drop the old record.
        if let Some(&old_ip) = self.by_mac.get(&lease.mac) {
            if old_ip != lease.ip {
                self.leases.remove(&old_ip);
            }
        }

        self.by_mac.insert(lease.mac, lease.ip);
        self.leases.insert(lease.ip, lease.clone());
        Ok(lease)
    }

    fn remove_lease(&mut self, ip: Ipv4Addr) -> Option<Lease> {
        let mut lease = self.leases.remove(&ip)?;
        self.by_mac.remove(&lease.mac);
        lease.active = false;
        Some(lease)
    }

    fn static_lease(&self, res: &StaticReservation, client_id: Option<String>, now: u64) -> Lease {
        let hostname = if res.hostname.is_empty() { None } else { Some(res.hostname.clone()) };
        Lease::new(res.mac, res.ip, hostname, client_id, LeaseType::Static, now, res.lease_time)
    }

    /// An incoming claim hit an active lease held by another MAC.
    fn resolve_collision(
        &mut self,
        ip: Ipv4Addr,
        claimant: MacAddr,
        duration: u64,
        now: u64,
    ) -> Result<(), AllocError> {
        let holder = match self.active_holder(ip, now) {
            Some(l) => l.mac,
            None => return Ok(()),
        };

        match self.conflict_strategy {
            ConflictStrategy::Reject => Err(AllocError::Conflict { ip, holder }),
            ConflictStrategy::Replace => {
                self.remove_lease(ip);
                if let Some(ref events) = self.events {
                    events.emit(
                        SecurityEvent::new(
                            SecurityEventKind::ConflictReplaced,
                            Severity::Medium,
                            format!("lease on {} moved from {} to {}", ip, holder, claimant),
                        )
                        .with_mac(claimant)
                        .with_ip(ip),
                    );
                }
                Ok(())
            }
            ConflictStrategy::Extend => {
                if let Some(lease) = self.leases.get_mut(&ip) {
                    lease.set_times(now, duration);
                }
                Err(AllocError::Conflict { ip, holder })
            }
            ConflictStrategy::Negotiate => {
                if !self.conflicts.iter().any(|c| c.ip == ip && c.claimant == claimant) {
                    if self.conflicts.len() >= MAX_PENDING_CONFLICTS {
                        self.conflicts.pop_front();
                    }
                    self.conflicts.push_back(LeaseConflict {
                        ip,
                        incumbent: holder,
                        claimant,
                        at: now,
                    });
                }
                Err(AllocError::Conflict { ip, holder })
            }
        }
    }

    /// Allocate an address for DISCOVER.
    ///
    /// Priority: enabled reservation, existing active lease (idempotent
    /// DISCOVER), valid requested IP, then the lowest free address in the
    /// range. The scan is deterministic for a given store state.
    pub fn allocate(
        &mut self,
        mac: MacAddr,
        requested: Option<Ipv4Addr>,
        subnet: &SubnetConfig,
        hostname: Option<String>,
        client_id: Option<String>,
        now: u64,
    ) -> Result<Lease, AllocError> {
        if let Some(res) = self.reservation_for(mac).cloned() {
            let lease = self.static_lease(&res, client_id, now);
            return self.insert_lease(lease);
        }

        if let Some(existing) = self.get_by_mac(mac) {
            if existing.active && !existing.is_expired(now) {
                return Ok(existing);
            }
        }

        if let Some(ip) = requested {
            if subnet.in_range(ip)
                && !subnet.is_excluded(ip)
                && !self.reserved_for_other(ip, mac)
                && !self.in_decline_cooldown(ip, now)
            {
                if self.active_holder(ip, now).is_some() {
                    self.resolve_collision(ip, mac, subnet.lease_time, now)?;
                }
                let lease =
                    Lease::new(mac, ip, hostname, client_id, LeaseType::Dynamic, now, subnet.lease_time);
                return self.insert_lease(lease);
            }
        }

        let start = u32::from(subnet.range_start);
        let end = u32::from(subnet.range_end);
        for ip_int in start..=end {
            let ip = Ipv4Addr::from(ip_int);
            if self.is_available(ip, subnet, now) {
                let lease =
                    Lease::new(mac, ip, hostname, client_id, LeaseType::Dynamic, now, subnet.lease_time);
                return self.insert_lease(lease);
            }
        }

        Err(AllocError::PoolExhausted)
    }

    /// Commit a specific address for REQUEST (selecting / init-reboot).
    pub fn commit(
        &mut self,
        mac: MacAddr,
        ip: Ipv4Addr,
        subnet: &SubnetConfig,
        hostname: Option<String>,
        client_id: Option<String>,
        now: u64,
    ) -> Result<Lease, AllocError> {
        if let Some(res) = self.reservation_for(mac).cloned() {
            if res.ip != ip {
                return Err(AllocError::IpUnavailable(ip));
            }
            let lease = self.static_lease(&res, client_id, now);
            return self.insert_lease(lease);
        }

        if !subnet.in_range(ip) || subnet.is_excluded(ip) {
            return Err(AllocError::IpUnavailable(ip));
        }
        if self.reserved_for_other(ip, mac) || self.in_decline_cooldown(ip, now) {
            return Err(AllocError::IpUnavailable(ip));
        }

        match self.leases.get(&ip) {
            Some(l) if l.mac == mac => {
                let mut lease = l.clone();
                lease.hostname = hostname.or(lease.hostname);
                lease.client_id = client_id.or(lease.client_id);
                lease.active = true;
                lease.set_times(now, subnet.lease_time);
                self.insert_lease(lease)
            }
            Some(l) if l.active && !l.is_expired(now) => {
                self.resolve_collision(ip, mac, subnet.lease_time, now)?;
                let lease =
                    Lease::new(mac, ip, hostname, client_id, LeaseType::Dynamic, now, subnet.lease_time);
                self.insert_lease(lease)
            }
            _ => {
                let lease =
                    Lease::new(mac, ip, hostname, client_id, LeaseType::Dynamic, now, subnet.lease_time);
                self.insert_lease(lease)
            }
        }
    }

    /// Extend an existing binding (REQUEST in renewing/rebinding state).
    pub fn renew(
        &mut self,
        mac: MacAddr,
        ip: Ipv4Addr,
        duration: u64,
        now: u64,
    ) -> Result<Lease, RenewError> {
        match self.leases.get_mut(&ip) {
            Some(lease) if lease.mac == mac => {
                lease.active = true;
                lease.set_times(now, duration);
                Ok(lease.clone())
            }
            Some(_) => Err(RenewError::NotOwner(ip)),
            None => Err(RenewError::NoLease(ip)),
        }
    }

    /// Drop a binding. Returns false when no matching lease exists, so a
    /// repeated release is a no-op.
    pub fn release(&mut self, mac: MacAddr, ip: Ipv4Addr) -> bool {
        match self.leases.get(&ip) {
            Some(lease) if lease.mac == mac => {
                self.remove_lease(ip);
                true
            }
            _ => false,
        }
    }

    /// The client reported an address conflict: poison the IP for the
    /// cooldown period and drop the lease.
    pub fn decline(&mut self, mac: MacAddr, ip: Ipv4Addr, now: u64) {
        if let Some(lease) = self.leases.get(&ip) {
            if lease.mac == mac {
                self.remove_lease(ip);
            }
        }
        self.declined.insert(ip, now + self.decline_cooldown);
    }

    /// Deactivate and remove leases past expiry; declined addresses leave
    /// cooldown when their timer elapses.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let expired: Vec<Ipv4Addr> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired(now))
            .map(|(ip, _)| *ip)
            .collect();

        let count = expired.len();
        for ip in expired {
            if let Some(lease) = self.remove_lease(ip) {
                debug!("lease {} for {} expired", lease.ip, lease.mac);
                if let Some(ref callback) = self.on_expire {
                    callback(&lease);
                }
            }
        }

        self.declined.retain(|_, &mut deadline| deadline > now);
        count
    }

    pub fn pending_conflicts(&self) -> impl Iterator<Item = &LeaseConflict> {
        self.conflicts.iter()
    }

    /// Operator decision for a queued `negotiate` conflict. Granting the
    /// claimant releases the incumbent so the next REQUEST succeeds.
    pub fn resolve_conflict(&mut self, ip: Ipv4Addr, grant_claimant: bool) -> Option<LeaseConflict> {
        let pos = self.conflicts.iter().position(|c| c.ip == ip)?;
        let conflict = self.conflicts.remove(pos)?;
        if grant_claimant {
            self.remove_lease(ip);
        }
        Some(conflict)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Render the database: one record per line, `#` comments.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(DB_HEADER);
        out.push('\n');
        out.push_str(&format!("# Generated: {}\n", unix_now()));

        for lease in self.snapshot() {
            out.push_str(&format!(
                "LEASE:{}|{}|{}|{}|{}|{}|{}|{}\n",
                lease.mac,
                lease.ip,
                lease.hostname.as_deref().unwrap_or(""),
                lease.duration(),
                lease.lease_type.as_str(),
                lease.allocated_at,
                lease.expires_at,
                lease.client_id.as_deref().unwrap_or(""),
            ));
        }

        let mut reservations: Vec<&StaticReservation> = self.reservations.values().collect();
        reservations.sort_by_key(|r| u32::from(r.ip));
        for res in reservations {
            out.push_str(&format!(
                "STATIC:{}|{}|{}|{}|{}|{}|{}\n",
                res.mac,
                res.ip,
                res.hostname,
                res.description,
                res.lease_time,
                if res.enabled { 1 } else { 0 },
                res.vendor_class.as_deref().unwrap_or(""),
            ));
        }

        out
    }

    /// Restore records from database text. Malformed lines are skipped with
    /// a warning; already-expired leases are not resurrected. Returns the
    /// number of leases restored.
    pub fn restore(&mut self, content: &str, now: u64) -> usize {
        let mut count = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("LEASE:") {
                match parse_lease_line(rest) {
                    Some(lease) if lease.is_expired(now) => {
                        debug!("skipping expired lease for {}", lease.mac);
                    }
                    Some(lease) => {
                        if self.insert_lease(lease).is_ok() {
                            count += 1;
                        }
                    }
                    None => warn!("invalid lease record: {}", line),
                }
            } else if let Some(rest) = line.strip_prefix("STATIC:") {
                match parse_static_line(rest) {
                    // Config-defined reservations win over database records.
                    Some(res) => {
                        self.reservations.entry(res.mac).or_insert(res);
                    }
                    None => warn!("invalid static record: {}", line),
                }
            } else {
                warn!("unrecognized lease database line: {}", line);
            }
        }
        count
    }

    pub fn load_from_file(&mut self, now: u64) -> Result<usize> {
        if !self.file_path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(&self.file_path)
            .with_context(|| format!("failed to read leases from {}", self.file_path.display()))?;
        let count = self.restore(&content, now);
        info!("loaded {} leases from {}", count, self.file_path.display());
        Ok(count)
    }

    /// Full-file rewrite through a temp file + rename.
    pub fn save_to_file(&self) -> Result<()> {
        let content = self.render();
        let tmp_path = self.file_path.with_extension("tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write leases to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.file_path)
            .with_context(|| format!("failed to rename leases to {}", self.file_path.display()))?;
        Ok(())
    }
}

fn parse_lease_line(rest: &str) -> Option<Lease> {
    let fields: Vec<&str> = rest.split('|').collect();
    if fields.len() < 7 {
        return None;
    }

    let mac: MacAddr = fields[0].parse().ok()?;
    let ip: Ipv4Addr = fields[1].parse().ok()?;
    let hostname = match fields[2] {
        "" | "*" => None,
        h => Some(h.to_string()),
    };
    let duration: u64 = fields[3].parse().ok()?;
    let lease_type = match fields[4] {
        "dynamic" => LeaseType::Dynamic,
        "static" => LeaseType::Static,
        _ => return None,
    };
    let allocated_at: u64 = fields[5].parse().ok()?;
    let expires_at: u64 = fields[6].parse().ok()?;
    let client_id = fields.get(7).filter(|s| !s.is_empty()).map(|s| s.to_string());

    let mut lease = Lease::new(mac, ip, hostname, client_id, lease_type, allocated_at, duration);
    lease.expires_at = expires_at.max(lease.rebinding_at);
    Some(lease)
}

fn parse_static_line(rest: &str) -> Option<StaticReservation> {
    let fields: Vec<&str> = rest.split('|').collect();
    if fields.len() < 6 {
        return None;
    }

    Some(StaticReservation {
        mac: fields[0].parse().ok()?,
        ip: fields[1].parse().ok()?,
        hostname: fields[2].to_string(),
        description: fields[3].to_string(),
        lease_time: fields[4].parse().ok()?,
        enabled: fields[5] == "1",
        vendor_class: fields.get(6).filter(|s| !s.is_empty()).map(|s| s.to_string()),
        options: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, n])
    }

    fn subnet() -> SubnetConfig {
        serde_json::from_str(
            r#"{
                "name": "lan",
                "network": "192.168.1.0/24",
                "range_start": "192.168.1.100",
                "range_end": "192.168.1.200",
                "lease_time": 86400
            }"#,
        )
        .unwrap()
    }

    fn store() -> LeaseStore {
        LeaseStore::new("/tmp/sdhcpd-test-leases")
    }

    fn reservation(mac: MacAddr, ip: Ipv4Addr) -> StaticReservation {
        StaticReservation {
            mac,
            ip,
            hostname: "printer".into(),
            description: String::new(),
            lease_time: 3600,
            enabled: true,
            vendor_class: None,
            options: vec![],
        }
    }

    #[test]
    fn test_allocate_scans_from_range_start() {
        let mut store = store();
        let lease = store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(lease.lease_type, LeaseType::Dynamic);

        let lease2 = store.allocate(mac(2), None, &subnet(), None, None, 1000).unwrap();
        assert_eq!(lease2.ip, Ipv4Addr::new(192, 168, 1, 101));
    }

    #[test]
    fn test_discover_is_idempotent() {
        let mut store = store();
        let first = store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        let second = store.allocate(mac(1), None, &subnet(), None, None, 1001).unwrap();
        assert_eq!(first.ip, second.ip);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lease_time_invariant() {
        let lease = Lease::new(mac(1), Ipv4Addr::new(10, 0, 0, 1), None, None, LeaseType::Dynamic, 5000, 86400);
        assert!(lease.allocated_at < lease.renewal_at);
        assert!(lease.renewal_at < lease.rebinding_at);
        assert!(lease.rebinding_at <= lease.expires_at);
        assert_eq!(lease.renewal_at, 5000 + 43200);
        assert_eq!(lease.rebinding_at, 5000 + 75600);

        // ordering survives degenerate durations
        let tiny = Lease::new(mac(1), Ipv4Addr::new(10, 0, 0, 1), None, None, LeaseType::Dynamic, 5000, 1);
        assert!(tiny.allocated_at < tiny.renewal_at);
        assert!(tiny.renewal_at < tiny.rebinding_at);
        assert!(tiny.rebinding_at <= tiny.expires_at);
    }

    #[test]
    fn test_reservation_wins_over_pool() {
        let mut store = store();
        store
            .reservations
            .insert(mac(9), reservation(mac(9), Ipv4Addr::new(192, 168, 1, 150)));

        let lease = store.allocate(mac(9), None, &subnet(), None, None, 1000).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 150));
        assert_eq!(lease.lease_type, LeaseType::Static);
        assert_eq!(lease.hostname.as_deref(), Some("printer"));
        assert_eq!(lease.duration(), 3600);

        // requesting a different address is refused
        let err = store
            .commit(mac(9), Ipv4Addr::new(192, 168, 1, 120), &subnet(), None, None, 1000)
            .unwrap_err();
        assert_eq!(err, AllocError::IpUnavailable(Ipv4Addr::new(192, 168, 1, 120)));

        // reserved addresses are never offered to other clients
        let other = store.allocate(mac(2), Some(Ipv4Addr::new(192, 168, 1, 150)), &subnet(), None, None, 1000).unwrap();
        assert_ne!(other.ip, Ipv4Addr::new(192, 168, 1, 150));
    }

    #[test]
    fn test_disabled_reservation_is_ignored() {
        let mut store = store();
        let mut res = reservation(mac(9), Ipv4Addr::new(192, 168, 1, 150));
        res.enabled = false;
        store.reservations.insert(mac(9), res);

        let lease = store.allocate(mac(9), None, &subnet(), None, None, 1000).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 100));
    }

    #[test]
    fn test_exclusions_are_skipped() {
        let mut store = store();
        let mut subnet = subnet();
        subnet.exclusions.push(crate::config::IpRange {
            from: Ipv4Addr::new(192, 168, 1, 100),
            to: Ipv4Addr::new(192, 168, 1, 104),
        });
        let lease = store.allocate(mac(1), None, &subnet, None, None, 1000).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 105));
    }

    #[test]
    fn test_exclusion_covering_range_exhausts_pool() {
        let mut store = store();
        let mut subnet = subnet();
        subnet.exclusions.push(crate::config::IpRange {
            from: subnet.range_start,
            to: subnet.range_end,
        });
        let err = store.allocate(mac(1), None, &subnet, None, None, 1000).unwrap_err();
        assert_eq!(err, AllocError::PoolExhausted);
    }

    #[test]
    fn test_single_ip_pool() {
        let mut store = store();
        let mut subnet = subnet();
        subnet.range_start = Ipv4Addr::new(192, 168, 1, 100);
        subnet.range_end = Ipv4Addr::new(192, 168, 1, 100);

        let lease = store.allocate(mac(1), None, &subnet, None, None, 1000).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 100));
        let err = store.allocate(mac(2), None, &subnet, None, None, 1000).unwrap_err();
        assert_eq!(err, AllocError::PoolExhausted);
    }

    #[test]
    fn test_dual_index_lockstep_when_mac_moves() {
        let mut store = store();
        let first = store
            .allocate(mac(1), Some(Ipv4Addr::new(192, 168, 1, 110)), &subnet(), None, None, 1000)
            .unwrap();
        assert_eq!(first.ip, Ipv4Addr::new(192, 168, 1, 110));

        // same client commits a different address: old record must vanish
        store.commit(mac(1), Ipv4Addr::new(192, 168, 1, 120), &subnet(), None, None, 1000).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_by_mac(mac(1)).unwrap().ip, Ipv4Addr::new(192, 168, 1, 120));
        assert!(store.get_by_ip(Ipv4Addr::new(192, 168, 1, 110)).is_none());
        assert_eq!(store.get_by_ip(Ipv4Addr::new(192, 168, 1, 120)).unwrap().mac, mac(1));
    }

    #[test]
    fn test_conflict_reject() {
        let mut store = store();
        store.commit(mac(1), Ipv4Addr::new(192, 168, 1, 120), &subnet(), None, None, 1000).unwrap();

        let err = store
            .allocate(mac(2), Some(Ipv4Addr::new(192, 168, 1, 120)), &subnet(), None, None, 1000)
            .unwrap_err();
        assert_eq!(
            err,
            AllocError::Conflict { ip: Ipv4Addr::new(192, 168, 1, 120), holder: mac(1) }
        );
    }

    #[test]
    fn test_conflict_replace_emits_event() {
        let mut store = store();
        store.conflict_strategy = ConflictStrategy::Replace;
        let events = Arc::new(EventLog::new(16));
        store.set_event_log(events.clone());

        store.commit(mac(1), Ipv4Addr::new(192, 168, 1, 120), &subnet(), None, None, 1000).unwrap();
        let lease = store
            .allocate(mac(2), Some(Ipv4Addr::new(192, 168, 1, 120)), &subnet(), None, None, 1000)
            .unwrap();

        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 120));
        assert_eq!(lease.mac, mac(2));
        assert!(store.get_by_mac(mac(1)).is_none());
        assert_eq!(events.count(SecurityEventKind::ConflictReplaced, Severity::Medium), 1);
    }

    #[test]
    fn test_conflict_negotiate_queues() {
        let mut store = store();
        store.conflict_strategy = ConflictStrategy::Negotiate;
        store.commit(mac(1), Ipv4Addr::new(192, 168, 1, 120), &subnet(), None, None, 1000).unwrap();

        let err = store
            .allocate(mac(2), Some(Ipv4Addr::new(192, 168, 1, 120)), &subnet(), None, None, 1000)
            .unwrap_err();
        assert!(matches!(err, AllocError::Conflict { .. }));
        assert_eq!(store.pending_conflicts().count(), 1);

        // operator grants the claimant: the incumbent is released
        store.resolve_conflict(Ipv4Addr::new(192, 168, 1, 120), true).unwrap();
        assert!(store.get_by_ip(Ipv4Addr::new(192, 168, 1, 120)).is_none());
        assert_eq!(store.pending_conflicts().count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut store = store();
        let lease = store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        assert!(store.release(mac(1), lease.ip));
        assert!(!store.release(mac(1), lease.ip));
        assert!(store.is_empty());
    }

    #[test]
    fn test_release_checks_owner() {
        let mut store = store();
        let lease = store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        assert!(!store.release(mac(2), lease.ip));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_decline_poisons_ip() {
        let mut store = store();
        store.decline_cooldown = 300;
        let lease = store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        let poisoned = lease.ip;
        store.decline(mac(1), poisoned, 1000);

        // the poisoned address is skipped while in cooldown
        let next = store.allocate(mac(1), None, &subnet(), None, None, 1001).unwrap();
        assert_ne!(next.ip, poisoned);

        // cooldown elapses via the sweep
        store.release(mac(1), next.ip);
        store.sweep_expired(1400);
        let again = store.allocate(mac(1), None, &subnet(), None, None, 1400).unwrap();
        assert_eq!(again.ip, poisoned);
    }

    #[test]
    fn test_renew() {
        let mut store = store();
        let lease = store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();

        let renewed = store.renew(mac(1), lease.ip, 86400, 5000).unwrap();
        assert_eq!(renewed.expires_at, 5000 + 86400);

        assert_eq!(store.renew(mac(2), lease.ip, 86400, 5000), Err(RenewError::NotOwner(lease.ip)));
        assert_eq!(
            store.renew(mac(2), Ipv4Addr::new(192, 168, 1, 199), 86400, 5000),
            Err(RenewError::NoLease(Ipv4Addr::new(192, 168, 1, 199)))
        );
    }

    #[test]
    fn test_sweep_expires_and_fires_callback() {
        let mut store = store();
        let expired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = expired.clone();
        store.set_expiry_callback(Box::new(move |lease| {
            sink.lock().unwrap().push(lease.ip);
        }));

        store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        store.allocate(mac(2), None, &subnet(), None, None, 1000).unwrap();

        assert_eq!(store.sweep_expired(1000 + 86400 + 1), 2);
        assert!(store.is_empty());
        assert_eq!(expired.lock().unwrap().len(), 2);
        assert!(store.get_by_mac(mac(1)).is_none());
    }

    #[test]
    fn test_max_leases_cap() {
        let mut store = store();
        store.max_leases = 1;
        store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        let err = store.allocate(mac(2), None, &subnet(), None, None, 1000).unwrap_err();
        assert_eq!(err, AllocError::StoreFull(1));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let mut store = store();
        store
            .reservations
            .insert(mac(9), reservation(mac(9), Ipv4Addr::new(192, 168, 1, 150)));
        store.allocate(mac(1), None, &subnet(), Some("laptop".into()), Some("01:aa".into()), 1000).unwrap();
        store.allocate(mac(2), None, &subnet(), None, None, 1000).unwrap();

        let content = store.render();
        assert!(content.starts_with(DB_HEADER));

        let mut restored = LeaseStore::new("/tmp/sdhcpd-test-leases2");
        assert_eq!(restored.restore(&content, 2000), 2);

        let lease = restored.get_by_mac(mac(1)).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(lease.hostname.as_deref(), Some("laptop"));
        assert_eq!(lease.client_id.as_deref(), Some("01:aa"));
        assert_eq!(lease.lease_type, LeaseType::Dynamic);
        assert_eq!(lease.allocated_at, 1000);

        let res = restored.reservation_for(mac(9)).unwrap();
        assert_eq!(res.ip, Ipv4Addr::new(192, 168, 1, 150));
        assert_eq!(res.hostname, "printer");
    }

    #[test]
    fn test_restore_skips_malformed_and_expired() {
        let mut store = store();
        let content = "\
# comment\n\
\n\
LEASE:00:11:22:33:44:01|192.168.1.100|host|86400|dynamic|1000|87400|\n\
LEASE:not-a-mac|192.168.1.101|x|86400|dynamic|1000|87400|\n\
LEASE:00:11:22:33:44:02|192.168.1.102|gone|60|dynamic|1000|1060|\n\
STATIC:00:11:22:33:44:09|192.168.1.150|printer|desk|3600|1|\n\
GARBAGE\n";

        // now=2000: the 60 second lease is already expired
        assert_eq!(store.restore(content, 2000), 1);
        assert!(store.get_by_mac(mac(1)).is_some());
        assert!(store.get_by_mac(mac(2)).is_none());
        assert!(store.reservation_for(mac(9)).is_some());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        let path_str = path.to_str().unwrap();

        let mut store = LeaseStore::new(path_str);
        store.allocate(mac(1), None, &subnet(), None, None, 1000).unwrap();
        store.save_to_file().unwrap();

        let mut loaded = LeaseStore::new(path_str);
        assert_eq!(loaded.load_from_file(2000).unwrap(), 1);
        assert_eq!(loaded.get_by_mac(mac(1)).unwrap().ip, Ipv4Addr::new(192, 168, 1, 100));

        // missing file is not an error
        let mut empty = LeaseStore::new(dir.path().join("absent").to_str().unwrap());
        assert_eq!(empty.load_from_file(2000).unwrap(), 0);
    }
}
