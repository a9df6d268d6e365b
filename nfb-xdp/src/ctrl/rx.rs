//! RX queue controller.
//!
//! Every header slot `i` pairs with buffer slot `i`: a buffer is attached
//! at `php` when posted and detached at `shp` when its header is read.
//! Posting a buffer costs one data descriptor, plus an address-extension
//! descriptor whenever the upper address bits change.

use std::sync::Arc;

use log::{debug, error, info};

use crate::buffer::{BufferSource, XdpBuff};
use crate::config::ChannelConfig;
use crate::error::{Exhausted, QueueError};
use crate::hal::{NdpController, NdpDevice, QueueDir};
use crate::ndp::DescriptorRing;
use crate::stats::QueueStats;

use super::{stop_bounded, StopOutcome, StopPolicy};

/// Receive side of one channel.
pub struct RxQueue {
    index: u16,
    ctrl: Box<dyn NdpController>,
    ring: DescriptorRing,
    slots: Vec<Option<XdpBuff>>,
    source: Arc<dyn BufferSource>,
    frame_len: u16,
    batch: u32,
    stop_policy: StopPolicy,
    stats: Arc<QueueStats>,
    running: bool,
}

impl RxQueue {
    /// Allocate the rings and open hardware queue `index`.
    pub fn open(
        device: &dyn NdpDevice,
        index: u16,
        config: &ChannelConfig,
        source: Arc<dyn BufferSource>,
        stats: Arc<QueueStats>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let frame_len = source.frame_len();
        let frame_len = u16::try_from(frame_len).map_err(|_| QueueError::FrameTooLarge { frame_len })?;
        let ring = DescriptorRing::new(config.desc_count, Some(config.hdr_count))?;
        let ctrl = device.open_queue(QueueDir::Rx, index)?;
        Ok(Self {
            index,
            ctrl,
            ring,
            slots: (0..config.hdr_count).map(|_| None).collect(),
            source,
            frame_len,
            batch: config.fill_batch,
            stop_policy: StopPolicy::from_config(config),
            stats,
            running: false,
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn ring(&self) -> &DescriptorRing {
        &self.ring
    }

    pub fn source(&self) -> &Arc<dyn BufferSource> {
        &self.source
    }

    /// Buffers currently posted to hardware or waiting to be drained.
    pub fn posted(&self) -> u32 {
        self.ring.posted_buffers()
    }

    /// Register the rings and start DMA.
    pub fn start(&mut self) -> Result<(), QueueError> {
        self.release_slots();
        self.ring.reset();
        self.ctrl.start(&self.ring.registration())?;
        self.running = true;
        info!("rx queue {}: started ({:?} buffers)", self.index, self.source.kind());
        Ok(())
    }

    fn refresh(&mut self) {
        self.ring.refresh_hardware_cursors();
        let hdp = self.ring.hdp();
        self.ring.release_descriptors_to(hdp);
    }

    /// Post one batch of buffers.
    ///
    /// Does nothing unless at least `fill_batch` descriptors and headers are
    /// free. Stops early, without error, when the source runs dry or an
    /// address extension would not fit. Returns the number posted.
    pub fn fill(&mut self) -> u32 {
        self.refresh();
        if self.ring.free_producer_slots() < self.batch || self.ring.free_consumer_slots() < self.batch {
            return 0;
        }

        let mut filled = 0;
        while filled < self.batch {
            let buff = match self.source.allocate() {
                Ok(buff) => buff,
                Err(Exhausted) => {
                    QueueStats::inc(&self.stats.alloc_failures);
                    debug!("rx queue {}: buffer source exhausted after {filled}", self.index);
                    break;
                }
            };
            let addr = buff.dma_addr();
            if self.ring.descs_needed(addr) > self.ring.free_producer_slots() {
                self.source.release(buff);
                break;
            }
            let slot = self.ring.php() as usize;
            debug_assert!(self.slots[slot].is_none());
            // Never let the device write past the end of the frame.
            let len = buff.capacity().min(self.frame_len as usize) as u16;
            self.ring.post(addr, len, 0);
            self.slots[slot] = Some(buff);
            self.ring.advance_fill(1);
            filled += 1;
        }
        filled
    }

    /// Detach up to `max` completed buffers, in ring order, into `out`.
    pub fn drain(&mut self, max: u32, out: &mut Vec<XdpBuff>) -> u32 {
        self.refresh();
        let n = max.min(self.ring.ready_headers());
        let mut bytes = 0u64;
        for _ in 0..n {
            let shp = self.ring.shp();
            let hdr = self.ring.header(shp);
            self.ring.advance_consumer(1);
            let Some(mut buff) = self.slots[shp as usize].take() else {
                error!("rx queue {}: header {shp} completed without a buffer", self.index);
                continue;
            };
            let len = (hdr.frame_len() as usize).min(buff.capacity());
            buff.set_len(len);
            buff.set_meta(hdr.meta());
            self.ctrl.sync_for_cpu(buff.dma_addr(), len);
            bytes += len as u64;
            out.push(buff);
        }
        QueueStats::add(&self.stats.packets, n as u64);
        QueueStats::add(&self.stats.bytes, bytes);
        n
    }

    /// Refill the ring until saturated, publish `sdp`, then drain up to
    /// `budget` buffers.
    pub fn receive_burst(&mut self, budget: u32, out: &mut Vec<XdpBuff>) -> u32 {
        while self.fill() > 0 {}
        self.ring.flush_producer(self.ctrl.as_ref());
        self.drain(budget, out)
    }

    /// Publish both software pointers after a processing pass.
    pub fn flush(&self) {
        self.ring.flush_consumer(self.ctrl.as_ref());
    }

    /// Bounded hardware stop. Buffers the hardware completes while the stop
    /// is in progress go straight back to the source.
    pub fn stop(&mut self) -> StopOutcome {
        if !self.running {
            return StopOutcome::Graceful { attempts: 0 };
        }
        let Self { index, ctrl, ring, slots, stats, stop_policy, .. } = self;
        let outcome = stop_bounded(ctrl.as_mut(), QueueDir::Rx, *index, stop_policy, |ctrl| {
            ring.refresh_hardware_cursors();
            let hdp = ring.hdp();
            ring.release_descriptors_to(hdp);
            let ready = ring.ready_headers();
            for _ in 0..ready {
                let shp = ring.shp();
                ring.advance_consumer(1);
                drop(slots[shp as usize].take());
            }
            QueueStats::add(&stats.stop_drained, ready as u64);
            ring.flush_consumer(ctrl);
        });
        if outcome == StopOutcome::Forced {
            QueueStats::inc(&self.stats.forced_stops);
        }
        self.running = false;
        info!("rx queue {}: stopped ({outcome:?})", self.index);
        outcome
    }

    fn release_slots(&mut self) {
        for slot in &mut self.slots {
            drop(slot.take());
        }
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        self.stop();
        self.ctrl.close();
        self.release_slots();
        self.source.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PagePool;
    use crate::buffer::ZeroCopySource;
    use crate::hal::loopback::{HeapPageAllocator, LoopbackNdp, LoopbackQueue, LoopbackXskPool};

    fn rx_config(ring: u32, batch: u32) -> ChannelConfig {
        ChannelConfig {
            desc_count: ring,
            hdr_count: ring,
            fill_batch: batch,
            ..ChannelConfig::compact()
        }
    }

    fn open_rx(
        ring: u32,
        batch: u32,
        pages: usize,
    ) -> (Arc<LoopbackQueue>, Arc<HeapPageAllocator>, RxQueue) {
        let dev = LoopbackNdp::new(1, 1);
        let alloc = Arc::new(HeapPageAllocator::new(pages));
        let pool: Arc<dyn BufferSource> = Arc::new(PagePool::new(alloc.clone(), ring as usize));
        let mut rx = RxQueue::open(&dev, 0, &rx_config(ring, batch), pool, Arc::default()).unwrap();
        rx.start().unwrap();
        (dev.queue(QueueDir::Rx, 0).unwrap(), alloc, rx)
    }

    #[test]
    fn test_capacity_eight_scenario() {
        let (hw, _alloc, mut rx) = open_rx(8, 3, 64);
        assert_eq!(rx.fill(), 3);
        rx.ring.flush_producer(rx.ctrl.as_ref());
        assert_eq!(hw.receive(&[100, 200]), 2);

        let mut out = Vec::new();
        let shp = rx.ring().shp();
        assert_eq!(rx.drain(10, &mut out), 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 100);
        assert_eq!(out[1].len(), 200);
        assert_eq!(rx.ring().shp(), shp + 2);
        assert_eq!(rx.drain(10, &mut out), 0);
        assert_eq!(rx.posted(), 1);
    }

    #[test]
    fn test_fill_waits_for_a_full_batch() {
        let (_hw, _alloc, mut rx) = open_rx(8, 4, 64);
        // 1 address extension + 4 data descriptors; 2 left, batch is 4.
        assert_eq!(rx.fill(), 4);
        assert_eq!(rx.fill(), 0);
        assert_eq!(rx.ring().free_producer_slots(), 2);
    }

    #[test]
    fn test_exhaustion_is_counted_not_fatal() {
        let (_hw, _alloc, mut rx) = open_rx(16, 4, 2);
        assert_eq!(rx.fill(), 2);
        assert_eq!(rx.stats.alloc_failures.load(core::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(rx.source().outstanding(), 2);
    }

    #[test]
    fn test_address_extension_on_upper_change() {
        let dev = LoopbackNdp::new(1, 0);
        // Page 1 sits just below 1 GiB, page 2 just above.
        let base = (1u64 << 30) - 2 * crate::hal::PAGE_SIZE as u64;
        let alloc = Arc::new(HeapPageAllocator::with_dma_base(64, base));
        let pool: Arc<dyn BufferSource> = Arc::new(PagePool::new(alloc, 8));
        let mut rx = RxQueue::open(&dev, 0, &rx_config(8, 3), pool, Arc::default()).unwrap();
        rx.start().unwrap();
        assert_eq!(rx.fill(), 3);
        // ext, data, data, ext, data
        assert_eq!(rx.ring().sdp(), 5);
    }

    #[test]
    fn test_receive_burst_publishes_sdp() {
        let (hw, _alloc, mut rx) = open_rx(16, 4, 64);
        let mut out = Vec::new();
        assert_eq!(rx.receive_burst(8, &mut out), 0);
        assert_eq!(hw.pending_descriptors(), rx.ring().sdp());
        assert_eq!(hw.receive(&[64; 5]), 5);
        assert_eq!(rx.receive_burst(8, &mut out), 5);
        rx.flush();
        assert_eq!(hw.cpu_syncs(), 5);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (hw, alloc, mut rx) = open_rx(16, 4, 64);
        let mut out = Vec::new();
        rx.receive_burst(8, &mut out);
        assert!(alloc.live() > 0);
        drop(rx);
        assert_eq!(alloc.live(), 0);
        assert_eq!(hw.closes(), 1);
        assert!(!hw.is_open());
    }

    #[test]
    fn test_zero_copy_offset_shrinks_posted_length() {
        let dev = LoopbackNdp::new(1, 0);
        let xsk = Arc::new(LoopbackXskPool::new(4, 2048, 256));
        xsk.submit_at(0, 512, 0);
        xsk.submit(1, 0);
        let src: Arc<dyn BufferSource> = Arc::new(ZeroCopySource::new(xsk.clone()));
        let mut rx = RxQueue::open(&dev, 0, &rx_config(8, 2), src, Arc::default()).unwrap();
        rx.start().unwrap();
        assert_eq!(rx.fill(), 2);
        // ext, data (frame 0, 768 bytes in), data (frame 1, 256 bytes in)
        assert_eq!(rx.ring().descriptor(1).len(), 2048 - 768);
        assert_eq!(rx.ring().descriptor(2).len(), 2048 - 256);

        rx.ring.flush_producer(rx.ctrl.as_ref());
        let hw = dev.queue(QueueDir::Rx, 0).unwrap();
        assert_eq!(hw.receive(&[4000, 4000]), 2);
        let mut out = Vec::new();
        assert_eq!(rx.drain(2, &mut out), 2);
        for buff in &out {
            let (off, len) = buff.data_span();
            assert!(off + len <= 2048);
        }
        assert_eq!(out[0].len(), 1280);
    }
}
