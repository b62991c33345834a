pub mod config;
pub mod events;
pub mod lease_store;
pub mod options;
pub mod packet;
pub mod security;
pub mod server;
pub mod state_machine;

pub use config::{ConfigError, DhcpConfig};
pub use lease_store::LeaseStore;
pub use server::ServerStats;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use events::EventLog;
use security::SecurityPipeline;

/// Capacity of the security event history ring.
pub const EVENT_HISTORY: usize = 1024;

/// Everything behind the server's state lock: the config snapshot handle,
/// the lease store, and the admission pipeline.
pub struct DhcpState {
    pub config: Arc<DhcpConfig>,
    pub lease_store: LeaseStore,
    pub security: SecurityPipeline,
    pub events: Arc<EventLog>,
}

impl DhcpState {
    /// Build the server state from a validated configuration.
    pub fn new(config: DhcpConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let events = Arc::new(EventLog::new(EVENT_HISTORY));
        let mut lease_store = LeaseStore::from_config(&config);
        lease_store.set_event_log(events.clone());
        let security = SecurityPipeline::new(&config.security, events.clone())?;
        Ok(DhcpState {
            config: Arc::new(config),
            lease_store,
            security,
            events,
        })
    }
}

pub type SharedDhcpState = Arc<RwLock<DhcpState>>;

/// Wall-clock unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
