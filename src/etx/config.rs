//! Configuration for the transaction manager

use std::time::Duration;

/// Longest delay accepted by `add_timed`: 90 days
pub const MAX_DELAY_SECS: u64 = 90 * 24 * 60 * 60;

/// Configuration for the transaction manager
#[derive(Debug, Clone)]
pub struct EtxConfig {
    /// How often the background worker looks for due timed operations
    /// (milliseconds). Set to 0 to run without a worker and call
    /// `poll_timed` yourself.
    pub worker_tick_ms: u64,
    /// Timed delays are clamped to this many seconds
    pub max_delay_secs: u64,
}

impl Default for EtxConfig {
    fn default() -> Self {
        Self {
            worker_tick_ms: 250, // a fraction of the one second minimum delay
            max_delay_secs: MAX_DELAY_SECS,
        }
    }
}

impl EtxConfig {
    /// No background worker. Timed operations only run from `poll_timed`
    /// or when an asynchronous operation ends.
    pub fn manual() -> Self {
        Self {
            worker_tick_ms: 0,
            ..Default::default()
        }
    }

    /// Frequent ticks, so timed operations start close to their due time
    pub fn low_latency() -> Self {
        Self {
            worker_tick_ms: 50,
            ..Default::default()
        }
    }

    pub fn worker_tick(&self) -> Option<Duration> {
        match self.worker_tick_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etx_config_default() {
        let config = EtxConfig::default();
        assert_eq!(config.worker_tick_ms, 250);
        assert_eq!(config.max_delay_secs, 7_776_000);
        assert_eq!(config.worker_tick(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_etx_config_manual() {
        let config = EtxConfig::manual();
        assert_eq!(config.worker_tick(), None);
        assert_eq!(config.max_delay_secs, MAX_DELAY_SECS);
    }

    #[test]
    fn test_etx_config_low_latency() {
        let config = EtxConfig::low_latency();
        assert_eq!(config.worker_tick_ms, 50);
    }
}
