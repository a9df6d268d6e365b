//! Per-queue counters.
//!
//! Counters live in an `Arc` held by the channel, so they survive the queue
//! controllers being torn down and rebuilt across restarts.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! queue_counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Shared counters of one queue.
        #[derive(Debug, Default)]
        pub struct QueueStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`QueueStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct QueueStatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl QueueStats {
            pub fn snapshot(&self) -> QueueStatsSnapshot {
                QueueStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

queue_counters! {
    /// Frames received (RX) or enqueued (TX).
    packets,
    bytes,
    /// Fill steps cut short because the buffer source ran dry.
    alloc_failures,
    /// RX buffers released while a stop was in progress.
    stop_drained,
    xdp_pass,
    xdp_tx,
    xdp_redirect,
    xdp_drop,
    /// Aborted verdicts, unknown verdicts and failed stack conversions.
    xdp_aborted,
    redirect_errors,
    /// Enqueue attempts refused because the ring was full.
    tx_busy,
    /// TX frames released after hardware completion.
    tx_completed,
    forced_stops,
}

impl QueueStats {
    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n != 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters of both queues of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub rx: QueueStatsSnapshot,
    pub tx: QueueStatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = QueueStats::default();
        QueueStats::inc(&stats.packets);
        QueueStats::add(&stats.bytes, 1500);
        QueueStats::add(&stats.bytes, 0);
        let snap = stats.snapshot();
        assert_eq!(snap.packets, 1);
        assert_eq!(snap.bytes, 1500);
        assert_eq!(snap.tx_busy, 0);
    }
}
