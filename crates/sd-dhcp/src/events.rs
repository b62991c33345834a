//! Security events: sink callback, bounded history ring, counters

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::packet::MacAddr;
use crate::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    UnauthorizedDhcpServer,
    MacFilterDeny,
    IpFilterDeny,
    RateLimited,
    Option82Missing,
    Option82Untrusted,
    AuthMissing,
    AuthFailed,
    IpDeclined,
    ConflictReplaced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub description: String,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            timestamp: unix_now(),
            mac: None,
            ip: None,
            interface: None,
            description: description.into(),
        }
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }
}

pub type EventCallback = Box<dyn Fn(&SecurityEvent) + Send + Sync>;

struct EventLogInner {
    ring: VecDeque<SecurityEvent>,
    counters: HashMap<(SecurityEventKind, Severity), u64>,
    callback: Option<EventCallback>,
}

/// Bounded event history. Overwrites oldest on overflow; counters are kept
/// per (kind, severity) for the lifetime of the log.
pub struct EventLog {
    inner: Mutex<EventLogInner>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EventLogInner {
                ring: VecDeque::with_capacity(capacity),
                counters: HashMap::new(),
                callback: None,
            }),
            capacity,
        }
    }

    pub fn set_callback(&self, callback: EventCallback) {
        self.inner.lock().unwrap().callback = Some(callback);
    }

    pub fn emit(&self, event: SecurityEvent) {
        warn!(
            kind = ?event.kind,
            severity = %event.severity,
            mac = ?event.mac,
            ip = ?event.ip,
            "{}", event.description
        );

        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry((event.kind, event.severity)).or_insert(0) += 1;
        if inner.ring.len() >= self.capacity {
            inner.ring.pop_front();
        }
        if let Some(ref callback) = inner.callback {
            callback(&event);
        }
        inner.ring.push_back(event);
    }

    /// Most recent events, newest last.
    pub fn recent(&self, n: usize) -> Vec<SecurityEvent> {
        let inner = self.inner.lock().unwrap();
        inner.ring.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn count(&self, kind: SecurityEventKind, severity: Severity) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.counters.get(&(kind, severity)).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.counters.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ring_evicts_oldest() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.emit(SecurityEvent::new(
                SecurityEventKind::MacFilterDeny,
                Severity::Medium,
                format!("event {i}"),
            ));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].description, "event 2");
        assert_eq!(recent[2].description, "event 4");
        assert_eq!(log.count(SecurityEventKind::MacFilterDeny, Severity::Medium), 5);
    }

    #[test]
    fn test_counters_keyed_by_kind_and_severity() {
        let log = EventLog::new(8);
        log.emit(SecurityEvent::new(SecurityEventKind::RateLimited, Severity::Medium, "a"));
        log.emit(SecurityEvent::new(SecurityEventKind::RateLimited, Severity::High, "b"));
        assert_eq!(log.count(SecurityEventKind::RateLimited, Severity::Medium), 1);
        assert_eq!(log.count(SecurityEventKind::RateLimited, Severity::High), 1);
        assert_eq!(log.count(SecurityEventKind::AuthFailed, Severity::High), 0);
        assert_eq!(log.total(), 2);
    }

    #[test]
    fn test_callback_fires() {
        let log = EventLog::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        log.set_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        log.emit(SecurityEvent::new(SecurityEventKind::IpDeclined, Severity::Medium, "x"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
