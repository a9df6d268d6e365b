//! TX queue controller.
//!
//! Each descriptor slot remembers what it carries so reclaim can hand frames
//! back once hardware has moved `hdp` past them. Enqueue and reclaim run
//! under one spin lock: the RX dispatcher and the zero-copy TX poller both
//! feed the same ring.

use core::mem;
use std::sync::Arc;

use log::{debug, info};

use crate::buffer::{BufferSource, SourceKind, XdpBuff, ETH_ZLEN};
use crate::config::ChannelConfig;
use crate::error::{QueueError, TxBusy};
use crate::hal::{NdpController, NdpDevice, QueueDir};
use crate::ndp::DescriptorRing;
use crate::stats::QueueStats;

use super::{stop_bounded, StopOutcome, StopPolicy};

/// What a TX descriptor slot holds.
enum TxSlot {
    Empty,
    AddrExt,
    Frame(XdpBuff),
}

struct TxInner {
    ctrl: Box<dyn NdpController>,
    ring: DescriptorRing,
    slots: Vec<TxSlot>,
    running: bool,
}

impl TxInner {
    /// Release every frame hardware has finished with. Returns the count.
    fn reclaim(&mut self) -> u32 {
        self.ring.refresh_hardware_cursors();
        let hdp = self.ring.hdp();
        let freed = release_range(&mut self.slots, self.ring.fdp(), hdp, self.ring.mdp());
        self.ring.release_descriptors_to(hdp);
        freed
    }
}

/// Empty slots `[from, to)`, dropping the frames they hold.
fn release_range(slots: &mut [TxSlot], from: u32, to: u32, mask: u32) -> u32 {
    let mut freed = 0;
    let mut pos = from;
    while pos != to {
        if let TxSlot::Frame(buff) = mem::replace(&mut slots[pos as usize], TxSlot::Empty) {
            drop(buff);
            freed += 1;
        }
        pos = (pos + 1) & mask;
    }
    freed
}

/// Transmit side of one channel.
pub struct TxQueue {
    index: u16,
    inner: spin::Mutex<TxInner>,
    stop_policy: StopPolicy,
    stats: Arc<QueueStats>,
}

impl TxQueue {
    /// Allocate the descriptor ring and open hardware queue `index`.
    pub fn open(
        device: &dyn NdpDevice,
        index: u16,
        config: &ChannelConfig,
        stats: Arc<QueueStats>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let ring = DescriptorRing::new(config.desc_count, None)?;
        let ctrl = device.open_queue(QueueDir::Tx, index)?;
        Ok(Self {
            index,
            inner: spin::Mutex::new(TxInner {
                ctrl,
                ring,
                slots: (0..config.desc_count).map(|_| TxSlot::Empty).collect(),
                running: false,
            }),
            stop_policy: StopPolicy::from_config(config),
            stats,
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Register the ring and start DMA.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let TxInner { ctrl, ring, slots, .. } = &mut *inner;
        let (fdp, sdp, mdp) = (ring.fdp(), ring.sdp(), ring.mdp());
        release_range(slots, fdp, sdp, mdp);
        ring.reset();
        ctrl.start(&ring.registration())?;
        inner.running = true;
        info!("tx queue {}: started", self.index);
        Ok(())
    }

    /// Queue one frame for transmission.
    ///
    /// Reclaims completed frames first. Page-pool frames shorter than
    /// [`ETH_ZLEN`] are zero-padded. When the ring has no room the frame is
    /// handed back in [`TxBusy`].
    pub fn enqueue(&self, mut buff: XdpBuff) -> Result<(), TxBusy> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(TxBusy(buff));
        }
        let freed = inner.reclaim();
        QueueStats::add(&self.stats.tx_completed, freed as u64);

        if buff.kind() == SourceKind::PagePool {
            buff.pad_to(ETH_ZLEN);
        }
        let addr = buff.dma_addr();
        if inner.ring.descs_needed(addr) > inner.ring.free_producer_slots() {
            QueueStats::inc(&self.stats.tx_busy);
            debug!("tx queue {}: ring full", self.index);
            return Err(TxBusy(buff));
        }

        let len = buff.len().min(u16::MAX as usize);
        let TxInner { ctrl, ring, slots, .. } = &mut *inner;
        ctrl.sync_for_device(addr, len);
        let posted = ring.post(addr, len as u16, 0);
        if let Some(ext) = posted.ext_slot {
            slots[ext as usize] = TxSlot::AddrExt;
        }
        debug_assert!(matches!(slots[posted.data_slot as usize], TxSlot::Empty));
        slots[posted.data_slot as usize] = TxSlot::Frame(buff);
        ring.flush_producer(ctrl.as_ref());

        QueueStats::inc(&self.stats.packets);
        QueueStats::add(&self.stats.bytes, len as u64);
        Ok(())
    }

    /// Release frames completed by hardware. Calling it again without new
    /// completions does nothing.
    pub fn reclaim(&self) -> u32 {
        let freed = self.inner.lock().reclaim();
        QueueStats::add(&self.stats.tx_completed, freed as u64);
        freed
    }

    /// Zero-copy TX pass: reclaim, then move up to `budget` frames from
    /// `source` onto the ring while there is room.
    pub fn pump(&self, source: &dyn BufferSource, budget: u32) -> u32 {
        let mut sent = 0;
        let mut freed = 0;
        {
            let mut inner = self.inner.lock();
            if !inner.running {
                return 0;
            }
            freed += inner.reclaim();
        }
        while sent < budget && self.has_room() {
            let Ok(buff) = source.allocate() else {
                break;
            };
            match self.enqueue(buff) {
                Ok(()) => sent += 1,
                Err(TxBusy(buff)) => {
                    drop(buff);
                    break;
                }
            }
        }
        QueueStats::add(&self.stats.tx_completed, freed as u64);
        sent
    }

    /// Room for a frame even if it needs an address extension.
    fn has_room(&self) -> bool {
        self.inner.lock().ring.free_producer_slots() >= 2
    }

    /// Frames enqueued and not yet reclaimed.
    pub fn in_flight(&self) -> u32 {
        let inner = self.inner.lock();
        inner.slots.iter().filter(|s| matches!(s, TxSlot::Frame(_))).count() as u32
    }

    /// Bounded hardware stop.
    pub fn stop(&self) -> StopOutcome {
        let mut inner = self.inner.lock();
        if !inner.running {
            return StopOutcome::Graceful { attempts: 0 };
        }
        inner.running = false;
        let TxInner { ctrl, ring, slots, .. } = &mut *inner;
        let mut freed = 0;
        let outcome = stop_bounded(ctrl.as_mut(), QueueDir::Tx, self.index, &self.stop_policy, |_| {
            ring.refresh_hardware_cursors();
            let hdp = ring.hdp();
            freed += release_range(slots, ring.fdp(), hdp, ring.mdp());
            ring.release_descriptors_to(hdp);
        });
        QueueStats::add(&self.stats.tx_completed, freed as u64);
        if outcome == StopOutcome::Forced {
            QueueStats::inc(&self.stats.forced_stops);
        }
        info!("tx queue {}: stopped ({outcome:?})", self.index);
        outcome
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        self.stop();
        let inner = self.inner.get_mut();
        let (fdp, sdp, mdp) = (inner.ring.fdp(), inner.ring.sdp(), inner.ring.mdp());
        release_range(&mut inner.slots, fdp, sdp, mdp);
        inner.ctrl.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PagePool;
    use crate::hal::loopback::{HeapPageAllocator, LoopbackNdp, LoopbackQueue};

    fn open_tx(ring: u32) -> (Arc<LoopbackQueue>, TxQueue) {
        let dev = LoopbackNdp::new(0, 1);
        let config = ChannelConfig { desc_count: ring, fill_batch: 2, ..ChannelConfig::compact() };
        let tx = TxQueue::open(&dev, 0, &config, Arc::default()).unwrap();
        tx.start().unwrap();
        (dev.queue(QueueDir::Tx, 0).unwrap(), tx)
    }

    fn frame(pool: &PagePool, len: usize) -> XdpBuff {
        let mut buff = pool.allocate().unwrap();
        buff.set_len(len);
        buff
    }

    #[test]
    fn test_short_frames_are_padded() {
        let (hw, tx) = open_tx(8);
        let pool = PagePool::new(Arc::new(HeapPageAllocator::new(4)), 4);
        tx.enqueue(frame(&pool, 14)).unwrap();
        hw.transmit(8);
        assert_eq!(hw.transmitted()[0].len, ETH_ZLEN as u16);
        assert_eq!(hw.device_syncs(), 1);
    }

    #[test]
    fn test_busy_hands_frame_back() {
        let (_hw, tx) = open_tx(4);
        let pool = PagePool::new(Arc::new(HeapPageAllocator::new(8)), 8);
        // ext + 2 data fill 3 of 4 slots.
        tx.enqueue(frame(&pool, 64)).unwrap();
        tx.enqueue(frame(&pool, 64)).unwrap();
        let TxBusy(back) = tx.enqueue(frame(&pool, 64)).unwrap_err();
        assert_eq!(back.len(), 64);
        drop(back);
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(tx.stats.tx_busy.load(core::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let (hw, tx) = open_tx(8);
        let pool = PagePool::new(Arc::new(HeapPageAllocator::new(8)), 8);
        for _ in 0..3 {
            tx.enqueue(frame(&pool, 100)).unwrap();
        }
        assert_eq!(hw.transmit(2), 2);
        assert_eq!(tx.reclaim(), 2);
        assert_eq!(tx.reclaim(), 0);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(tx.in_flight(), 1);
    }

    #[test]
    fn test_drop_releases_unsent_frames() {
        let (hw, tx) = open_tx(8);
        let pool = PagePool::new(Arc::new(HeapPageAllocator::new(8)), 8);
        tx.enqueue(frame(&pool, 100)).unwrap();
        tx.enqueue(frame(&pool, 100)).unwrap();
        drop(tx);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(hw.closes(), 1);
    }

    #[test]
    fn test_enqueue_after_stop_is_busy() {
        let (_hw, tx) = open_tx(8);
        let pool = PagePool::new(Arc::new(HeapPageAllocator::new(8)), 8);
        tx.stop();
        assert!(tx.enqueue(frame(&pool, 100)).is_err());
        assert_eq!(pool.outstanding(), 0);
    }
}
