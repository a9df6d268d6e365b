//! Channel: one RX and one TX queue plus the threads polling them.
//!
//! # States
//! ```text
//!            start(mode)
//!   Stopped ─────────────> Running(PagePool | ZeroCopy)
//!      ▲                          │
//!      └────────── stop() ────────┘
//! ```
//! Transitions are serialized by the channel mutex. Steady-state packet
//! processing never takes it: the RX poller owns its queue outright and the
//! TX queue has its own lock.
//!
//! A start either brings up everything (both queues, both hardware
//! controllers, the pollers) or nothing: whatever was created before a
//! failure is torn down by its destructor on the way out.

pub mod poller;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{error, info};

use crate::buffer::{BufferSource, PagePool, XdpBuff, ZeroCopySource};
use crate::config::{ChannelConfig, StopOrder};
use crate::ctrl::{RxQueue, TxQueue};
use crate::error::ChannelError;
use crate::hal::{NdpDevice, PageAllocator, XskPool};
use crate::stats::{ChannelStats, QueueStats};
use crate::xdp::{Dispatcher, XdpEnv};

pub use poller::Poller;

/// Where a running channel takes its buffers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Recycled pages from the channel's page pool.
    PagePool,
    /// Frames of an attached zero-copy socket pool.
    ZeroCopy,
}

/// Zero-copy pools attached to a channel: `fill` supplies RX frames, `tx`
/// supplies frames to transmit.
#[derive(Clone)]
pub struct XskBinding {
    pub fill: Arc<dyn XskPool>,
    pub tx: Arc<dyn XskPool>,
}

struct Running {
    mode: ChannelMode,
    rx: Poller<RxQueue>,
    tx: Arc<TxQueue>,
    tx_poller: Option<Poller<()>>,
}

#[derive(Default)]
struct ChannelState {
    running: Option<Running>,
    xsk: Option<XskBinding>,
}

/// One RX/TX queue pair of an interface.
pub struct Channel {
    eth_index: u16,
    nfb_index: u16,
    ifname: String,
    hw: Arc<dyn NdpDevice>,
    allocator: Arc<dyn PageAllocator>,
    env: Arc<XdpEnv>,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    rx_stats: Arc<QueueStats>,
    tx_stats: Arc<QueueStats>,
}

impl Channel {
    /// Create a stopped channel.
    ///
    /// # Arguments
    /// - `eth_index`: queue index within the interface, reported with
    ///   frames passed to the stack
    /// - `nfb_index`: card-wide DMA queue index
    pub fn new(
        eth_index: u16,
        nfb_index: u16,
        ifname: impl Into<String>,
        hw: Arc<dyn NdpDevice>,
        allocator: Arc<dyn PageAllocator>,
        env: Arc<XdpEnv>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            eth_index,
            nfb_index,
            ifname: ifname.into(),
            hw,
            allocator,
            env,
            config,
            state: Mutex::new(ChannelState::default()),
            rx_stats: Arc::default(),
            tx_stats: Arc::default(),
        }
    }

    pub fn eth_index(&self) -> u16 {
        self.eth_index
    }

    pub fn nfb_index(&self) -> u16 {
        self.nfb_index
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Poller thread name.
    pub fn thread_name(&self) -> String {
        format!("{}/{}", self.ifname, self.nfb_index)
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running.is_some()
    }

    /// Current mode, `None` while stopped.
    pub fn mode(&self) -> Option<ChannelMode> {
        self.lock_state().running.as_ref().map(|r| r.mode)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            rx: self.rx_stats.snapshot(),
            tx: self.tx_stats.snapshot(),
        }
    }

    /// Attach zero-copy pools. Only allowed while stopped.
    pub fn attach_xsk_pool(&self, binding: XskBinding) -> Result<(), ChannelError> {
        let mut state = self.lock_state();
        if state.running.is_some() {
            return Err(ChannelError::AlreadyRunning);
        }
        state.xsk = Some(binding);
        Ok(())
    }

    /// Detach the zero-copy pools. Only allowed while stopped.
    pub fn detach_xsk_pool(&self) -> Result<Option<XskBinding>, ChannelError> {
        let mut state = self.lock_state();
        if state.running.is_some() {
            return Err(ChannelError::AlreadyRunning);
        }
        Ok(state.xsk.take())
    }

    /// Bring the channel up in `mode`.
    pub fn start(&self, mode: ChannelMode) -> Result<(), ChannelError> {
        let mut state = self.lock_state();
        if state.running.is_some() {
            return Err(ChannelError::AlreadyRunning);
        }
        self.config.validate()?;
        let xsk = match mode {
            ChannelMode::ZeroCopy => Some(state.xsk.clone().ok_or(ChannelError::NoXskPool)?),
            ChannelMode::PagePool => None,
        };
        let running = self.bring_up(mode, xsk.as_ref()).map_err(|e| {
            error!("{}: start failed, rolled back: {e}", self.thread_name());
            e
        })?;
        state.running = Some(running);
        info!("{}: channel started in {mode:?} mode", self.thread_name());
        Ok(())
    }

    fn bring_up(&self, mode: ChannelMode, xsk: Option<&XskBinding>) -> Result<Running, ChannelError> {
        let source: Arc<dyn BufferSource> = match xsk {
            Some(binding) => Arc::new(ZeroCopySource::new(Arc::clone(&binding.fill))),
            None => Arc::new(PagePool::new(Arc::clone(&self.allocator), self.config.hdr_count as usize)),
        };
        let hw = self.hw.as_ref();
        let mut rx = RxQueue::open(hw, self.nfb_index, &self.config, source, Arc::clone(&self.rx_stats))?;
        let tx = Arc::new(TxQueue::open(hw, self.nfb_index, &self.config, Arc::clone(&self.tx_stats))?);
        rx.start()?;
        tx.start()?;

        let dispatcher = Dispatcher::new(
            self.eth_index,
            Arc::clone(&self.env),
            Arc::clone(&tx),
            Arc::clone(&self.rx_stats),
        );
        let cfg = self.config;
        let rx_poller = Poller::spawn(self.thread_name(), move |stop| rx_poll(rx, dispatcher, &cfg, stop))
            .map_err(ChannelError::Spawn)?;

        let tx_poller = match xsk {
            Some(binding) => {
                let source = ZeroCopySource::new(Arc::clone(&binding.tx));
                let queue = Arc::clone(&tx);
                let poller = Poller::spawn(self.thread_name(), move |stop| tx_poll(&queue, &source, &cfg, stop))
                    .map_err(ChannelError::Spawn)?;
                Some(poller)
            }
            None => None,
        };

        Ok(Running { mode, rx: rx_poller, tx, tx_poller })
    }

    /// Stop the pollers and tear down both queues.
    pub fn stop(&self) -> Result<(), ChannelError> {
        let mut state = self.lock_state();
        let running = state.running.take().ok_or(ChannelError::NotRunning)?;
        self.tear_down(running);
        Ok(())
    }

    fn tear_down(&self, running: Running) {
        let Running { rx, tx, tx_poller, .. } = running;
        let join_tx = |poller: Option<Poller<()>>| {
            if let Some(poller) = poller {
                poller.join();
            }
        };
        let rx_queue = match self.config.stop_order {
            StopOrder::RxFirst => {
                let queue = rx.join();
                join_tx(tx_poller);
                queue
            }
            StopOrder::TxFirst => {
                join_tx(tx_poller);
                rx.join()
            }
        };
        if let Some(mut queue) = rx_queue {
            queue.stop();
        }
        tx.stop();
        drop(tx);
        info!("{}: channel stopped", self.thread_name());
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let running = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .running
            .take();
        if let Some(running) = running {
            self.tear_down(running);
        }
    }
}

/// RX poller body: fill, drain, dispatch, flush; sleep when idle.
fn rx_poll(mut rx: RxQueue, mut dispatcher: Dispatcher, cfg: &ChannelConfig, stop: &AtomicBool) -> RxQueue {
    let mut burst: Vec<XdpBuff> = Vec::with_capacity(cfg.poll_budget as usize);
    while !stop.load(Ordering::Acquire) {
        let n = rx.receive_burst(cfg.poll_budget, &mut burst);
        dispatcher.run(&mut burst);
        rx.flush();
        if n < cfg.poll_budget {
            thread::sleep(cfg.poll_sleep);
        }
    }
    rx
}

/// Zero-copy TX poller body.
fn tx_poll(tx: &TxQueue, source: &ZeroCopySource, cfg: &ChannelConfig, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        if tx.pump(source, cfg.tx_budget) < cfg.tx_budget {
            thread::sleep(cfg.poll_sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::{HeapPageAllocator, LoopbackNdp, LoopbackXskPool};
    use crate::hal::QueueDir;
    use crate::xdp::{DiscardStack, NoRedirect};

    fn channel(hw: &Arc<LoopbackNdp>) -> Channel {
        let env = Arc::new(XdpEnv::new(Arc::new(DiscardStack), Arc::new(NoRedirect)));
        Channel::new(
            0,
            1,
            "nfb0p0",
            hw.clone(),
            Arc::new(HeapPageAllocator::new(1024)),
            env,
            ChannelConfig::compact(),
        )
    }

    #[test]
    fn test_thread_name() {
        let hw = Arc::new(LoopbackNdp::new(2, 2));
        assert_eq!(channel(&hw).thread_name(), "nfb0p0/1");
    }

    #[test]
    fn test_start_stop_cycle() {
        let hw = Arc::new(LoopbackNdp::new(2, 2));
        let ch = channel(&hw);
        assert_eq!(ch.mode(), None);
        ch.start(ChannelMode::PagePool).unwrap();
        assert_eq!(ch.mode(), Some(ChannelMode::PagePool));
        assert!(hw.queue(QueueDir::Rx, 1).unwrap().is_running());
        ch.stop().unwrap();
        assert!(!ch.is_running());
        assert!(!hw.queue(QueueDir::Rx, 1).unwrap().is_open());
        assert!(!hw.queue(QueueDir::Tx, 1).unwrap().is_open());
    }

    #[test]
    fn test_zero_copy_needs_pool() {
        let hw = Arc::new(LoopbackNdp::new(2, 2));
        let ch = channel(&hw);
        assert!(matches!(ch.start(ChannelMode::ZeroCopy), Err(ChannelError::NoXskPool)));
        let binding = XskBinding {
            fill: Arc::new(LoopbackXskPool::new(16, 2048, 256)),
            tx: Arc::new(LoopbackXskPool::new(16, 2048, 256)),
        };
        ch.attach_xsk_pool(binding.clone()).unwrap();
        ch.start(ChannelMode::ZeroCopy).unwrap();
        assert!(matches!(ch.attach_xsk_pool(binding), Err(ChannelError::AlreadyRunning)));
        assert!(matches!(ch.detach_xsk_pool(), Err(ChannelError::AlreadyRunning)));
        ch.stop().unwrap();
        assert!(ch.detach_xsk_pool().unwrap().is_some());
    }

    #[test]
    fn test_drop_stops_running_channel() {
        let hw = Arc::new(LoopbackNdp::new(2, 2));
        let ch = channel(&hw);
        ch.start(ChannelMode::PagePool).unwrap();
        drop(ch);
        let rx = hw.queue(QueueDir::Rx, 1).unwrap();
        assert!(!rx.is_open());
        assert_eq!(rx.closes(), 1);
    }
}
