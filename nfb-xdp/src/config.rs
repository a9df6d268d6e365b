//! Channel configuration.

use core::time::Duration;

use crate::error::{ConfigError, RingError};

/// Order in which a stopping channel joins its poller threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopOrder {
    /// Join the RX poller first, so no new transmit-back traffic reaches the
    /// TX queue while its own poller is still reclaiming.
    #[default]
    RxFirst,
    /// Join the TX poller first.
    TxFirst,
}

/// Per-channel ring sizes, batching and stop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Descriptors per ring.
    pub desc_count: u32,
    /// RX headers (and buffer slots) per ring.
    pub hdr_count: u32,
    /// Buffers posted per fill step; fill waits until this many slots are free.
    pub fill_batch: u32,
    /// Frames drained per RX poll pass.
    pub poll_budget: u32,
    /// Sleep between passes that did not exhaust the budget.
    pub poll_sleep: Duration,
    /// Graceful stop attempts before forcing.
    pub stop_retries: u32,
    /// Delay between stop attempts.
    pub stop_interval: Duration,
    pub stop_order: StopOrder,
    /// Frames pulled from the zero-copy TX pool per pass.
    pub tx_budget: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            desc_count: 4096,
            hdr_count: 4096,
            fill_batch: 64,
            poll_budget: 64,
            poll_sleep: Duration::from_micros(15),
            stop_retries: 100,
            stop_interval: Duration::from_millis(1),
            stop_order: StopOrder::RxFirst,
            tx_budget: 64,
        }
    }
}

impl ChannelConfig {
    /// Small rings for tests and low-memory setups.
    pub const fn compact() -> Self {
        Self {
            desc_count: 64,
            hdr_count: 64,
            fill_batch: 8,
            poll_budget: 16,
            poll_sleep: Duration::from_micros(50),
            stop_retries: 100,
            stop_interval: Duration::from_millis(1),
            stop_order: StopOrder::RxFirst,
            tx_budget: 16,
        }
    }

    /// Check ring sizes and batch limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for n in [self.desc_count, self.hdr_count] {
            if n < 2 || !n.is_power_of_two() {
                return Err(RingError::NotPowerOfTwo(n).into());
            }
        }
        if self.fill_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        let ring = self.desc_count.min(self.hdr_count);
        if self.fill_batch > ring - 1 {
            return Err(ConfigError::BatchTooLarge { batch: self.fill_batch, ring });
        }
        if self.poll_budget == 0 || self.tx_budget == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        if self.stop_retries == 0 {
            return Err(ConfigError::ZeroStopRetries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert_eq!(ChannelConfig::default().validate(), Ok(()));
        assert_eq!(ChannelConfig::compact().validate(), Ok(()));
        assert_eq!(ChannelConfig::default().stop_retries, 100);
    }

    #[test]
    fn test_rejects_bad_values() {
        let cfg = ChannelConfig { desc_count: 100, ..ChannelConfig::compact() };
        assert_eq!(cfg.validate(), Err(ConfigError::Ring(RingError::NotPowerOfTwo(100))));

        let cfg = ChannelConfig { fill_batch: 64, ..ChannelConfig::compact() };
        assert_eq!(cfg.validate(), Err(ConfigError::BatchTooLarge { batch: 64, ring: 64 }));

        let cfg = ChannelConfig { stop_retries: 0, ..ChannelConfig::compact() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroStopRetries));
    }
}
