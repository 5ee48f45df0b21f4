//! Configuration for the exchange.

use forked_remote::{RecordId, ZoneId};
use std::path::PathBuf;
use std::time::Duration;

/// Zone holding synchronized resources unless configured otherwise.
pub const DEFAULT_ZONE_NAME: &str = "Forked";

/// Record type used for synchronized resources unless configured otherwise.
pub const DEFAULT_RECORD_TYPE: &str = "ForkedResource";

/// Default interval between watchdog passes.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity of the command channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Stable identifier of the resource. Also the remote record name.
    pub id: String,
    /// Zone the record lives in.
    pub zone_id: ZoneId,
    /// Record type of the remote record.
    pub record_type: String,
    /// Directory holding the persisted sync state.
    pub state_dir: PathBuf,
    /// Interval between watchdog passes.
    pub watchdog_interval: Duration,
    /// Capacity of the command channel feeding the worker.
    pub channel_capacity: usize,
}

impl ExchangeConfig {
    /// Creates a configuration with default zone, record type and timing.
    pub fn new(id: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            zone_id: ZoneId::new(DEFAULT_ZONE_NAME),
            record_type: DEFAULT_RECORD_TYPE.to_string(),
            state_dir: state_dir.into(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets the zone.
    pub fn with_zone_id(mut self, zone_id: ZoneId) -> Self {
        self.zone_id = zone_id;
        self
    }

    /// Sets the record type.
    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = record_type.into();
        self
    }

    /// Sets the watchdog interval.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Sets the command channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Returns the identifier of the resource's remote record.
    pub fn record_id(&self) -> RecordId {
        RecordId::new(self.id.clone(), self.zone_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ExchangeConfig::new("doc", "/tmp/state");
        assert_eq!(config.zone_id.name(), "Forked");
        assert_eq!(config.record_type, "ForkedResource");
        assert_eq!(config.watchdog_interval, Duration::from_secs(60));
        assert_eq!(config.record_id(), RecordId::new("doc", ZoneId::new("Forked")));
    }

    #[test]
    fn builder_methods() {
        let config = ExchangeConfig::new("doc", "/tmp/state")
            .with_zone_id(ZoneId::new("Notes"))
            .with_record_type("Note")
            .with_watchdog_interval(Duration::from_millis(50))
            .with_channel_capacity(0);
        assert_eq!(config.record_id().zone_id.name(), "Notes");
        assert_eq!(config.record_type, "Note");
        assert_eq!(config.watchdog_interval, Duration::from_millis(50));
        assert_eq!(config.channel_capacity, 1);
    }
}
