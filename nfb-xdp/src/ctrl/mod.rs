//! Queue controllers: one descriptor ring bound to one hardware queue.
//!
//! [`RxQueue`] is owned by its poller thread. [`TxQueue`] is shared between
//! the RX dispatcher (transmit-back) and the zero-copy TX poller, so all of
//! its ring state sits behind one spin lock.

pub mod rx;
pub mod tx;

use core::time::Duration;
use std::thread;

use log::error;

use crate::config::ChannelConfig;
use crate::error::HwError;
use crate::hal::{NdpController, QueueDir};

pub use rx::RxQueue;
pub use tx::TxQueue;

/// Bound on graceful hardware stop attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl StopPolicy {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            retries: config.stop_retries,
            interval: config.stop_interval,
        }
    }
}

/// How a queue stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Hardware confirmed the stop after `attempts` requests.
    Graceful { attempts: u32 },
    /// The retry bound ran out and the queue was force-stopped.
    Forced,
}

/// Request a stop up to `policy.retries` times, `policy.interval` apart.
///
/// `on_pending` runs after every attempt that reports a stop in progress,
/// before the wait; RX queues use it to hand completed buffers back. When
/// the bound runs out, or the controller fails the request outright, it is
/// force-stopped exactly once.
pub(crate) fn stop_bounded(
    ctrl: &mut dyn NdpController,
    dir: QueueDir,
    index: u16,
    policy: &StopPolicy,
    mut on_pending: impl FnMut(&dyn NdpController),
) -> StopOutcome {
    for attempt in 1..=policy.retries {
        match ctrl.stop() {
            Ok(()) => return StopOutcome::Graceful { attempts: attempt },
            Err(HwError::StopInProgress) => on_pending(&*ctrl),
            Err(e) => {
                error!("{dir} queue {index}: stop request failed: {e}; forcing stop");
                ctrl.stop_force();
                return StopOutcome::Forced;
            }
        }
        thread::sleep(policy.interval);
    }
    error!(
        "{dir} queue {index}: controller did not stop after {} attempts over {:?}; \
         forcing stop, firmware state may be inconsistent",
        policy.retries,
        policy.interval * policy.retries,
    );
    ctrl.stop_force();
    StopOutcome::Forced
}
