//! In-process NDP backend.
//!
//! [`LoopbackNdp`] plays the firmware side of the rings: it walks the
//! descriptors software posted, writes RX headers and publishes the shadow
//! cursors, and records every TX data descriptor it consumes. Progress only
//! happens when the owner calls [`LoopbackQueue::receive`] or
//! [`LoopbackQueue::transmit`], so tests decide exactly when the hardware
//! "completes" work.
//!
//! Faults can be injected per queue: failing `open`, failing `start`, and a
//! [`StopBehavior`] that keeps reporting a stop in progress.
//!
//! [`HeapPageAllocator`] and [`LoopbackXskPool`] provide the matching page
//! and zero-copy memory.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::dma::{DmaAddr, RingRegistration};
use crate::error::HwError;
use crate::ndp::{DescKind, NdpDesc, NdpHdr};

use super::{NdpController, NdpDevice, Page, PageAllocator, QueueDir, XskDesc, XskPool, PAGE_SIZE};

/// How a queue answers graceful stop requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBehavior {
    /// Stop succeeds on the first request.
    #[default]
    Immediate,
    /// The first `n` requests report a stop in progress.
    Pending(u32),
    /// Every request reports a stop in progress.
    Never,
}

/// One data descriptor consumed by a TX queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRecord {
    pub addr: DmaAddr,
    pub len: u16,
}

#[derive(Default)]
struct HwState {
    opened: bool,
    running: bool,
    reg: Option<RingRegistration>,
    /// Next descriptor the hardware consumes.
    dp: u32,
    /// Next header the hardware writes.
    hp: u32,
    upper: u64,
    stop: StopBehavior,
    pending_stops: u32,
    sent: Vec<TxRecord>,
}

/// Firmware model of one DMA queue.
pub struct LoopbackQueue {
    dir: QueueDir,
    index: u16,
    sdp_reg: AtomicU32,
    shp_reg: AtomicU32,
    fail_open: AtomicBool,
    fail_start: AtomicBool,
    stop_calls: AtomicU32,
    force_stops: AtomicU32,
    starts: AtomicU32,
    closes: AtomicU32,
    cpu_syncs: AtomicU64,
    device_syncs: AtomicU64,
    hw: spin::Mutex<HwState>,
}

impl LoopbackQueue {
    fn new(dir: QueueDir, index: u16) -> Self {
        Self {
            dir,
            index,
            sdp_reg: AtomicU32::new(0),
            shp_reg: AtomicU32::new(0),
            fail_open: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            stop_calls: AtomicU32::new(0),
            force_stops: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            cpu_syncs: AtomicU64::new(0),
            device_syncs: AtomicU64::new(0),
            hw: spin::Mutex::new(HwState::default()),
        }
    }

    pub fn dir(&self) -> QueueDir {
        self.dir
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Complete one RX frame per entry of `lens`, in ring order.
    ///
    /// Stops early when no posted buffer or no free header slot is left.
    /// Returns the number of frames written.
    pub fn receive(&self, lens: &[u16]) -> usize {
        let mut hw = self.hw.lock();
        if !hw.running || self.dir != QueueDir::Rx {
            return 0;
        }
        self.complete_rx(&mut hw, lens.iter().copied())
    }

    /// Consume up to `max` TX frames. Returns the number transmitted.
    pub fn transmit(&self, max: usize) -> usize {
        let mut hw = self.hw.lock();
        if !hw.running || self.dir != QueueDir::Tx {
            return 0;
        }
        self.complete_tx(&mut hw, max)
    }

    fn complete_rx(&self, hw: &mut HwState, lens: impl Iterator<Item = u16>) -> usize {
        let Some(reg) = hw.reg.clone() else {
            return 0;
        };
        let Some(headers) = reg.headers.as_ref() else {
            return 0;
        };
        let mhp = reg.mhp();
        let sdp = self.sdp_reg.load(Ordering::Acquire) & reg.mdp();
        let shp = self.shp_reg.load(Ordering::Acquire) & mhp;

        let mut done = 0;
        for len in lens {
            if shp.wrapping_sub(hw.hp).wrapping_sub(1) & mhp == 0 {
                break;
            }
            let Some((_, desc)) = next_data(hw, &reg, sdp) else {
                break;
            };
            headers.write(hw.hp, NdpHdr::new(len.min(desc.len()), 0, 0).raw());
            hw.hp = (hw.hp + 1) & mhp;
            done += 1;
        }
        reg.shadow.publish(hw.dp, hw.hp);
        done
    }

    fn complete_tx(&self, hw: &mut HwState, max: usize) -> usize {
        let Some(reg) = hw.reg.clone() else {
            return 0;
        };
        let sdp = self.sdp_reg.load(Ordering::Acquire) & reg.mdp();
        let mut done = 0;
        while done < max {
            let Some((addr, desc)) = next_data(hw, &reg, sdp) else {
                break;
            };
            hw.sent.push(TxRecord { addr, len: desc.len() });
            done += 1;
        }
        reg.shadow.publish(hw.dp, 0);
        done
    }

    /// Firmware flushing its queue while a stop is pending: every posted RX
    /// buffer completes empty, every posted TX frame goes out.
    fn flush_in_flight(&self, hw: &mut HwState) {
        match self.dir {
            QueueDir::Rx => {
                self.complete_rx(hw, core::iter::repeat(0));
            }
            QueueDir::Tx => {
                self.complete_tx(hw, usize::MAX);
            }
        }
    }

    pub fn set_stop_behavior(&self, stop: StopBehavior) {
        let mut hw = self.hw.lock();
        hw.stop = stop;
        hw.pending_stops = 0;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.hw.lock().opened
    }

    pub fn is_running(&self) -> bool {
        self.hw.lock().running
    }

    /// Descriptors posted by software and not yet consumed.
    pub fn pending_descriptors(&self) -> u32 {
        let hw = self.hw.lock();
        match &hw.reg {
            Some(reg) => self.sdp_reg.load(Ordering::Acquire).wrapping_sub(hw.dp) & reg.mdp(),
            None => 0,
        }
    }

    /// Every TX data descriptor consumed since the queue was created.
    pub fn transmitted(&self) -> Vec<TxRecord> {
        self.hw.lock().sent.clone()
    }

    pub fn transmitted_count(&self) -> usize {
        self.hw.lock().sent.len()
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::Relaxed)
    }

    pub fn force_stops(&self) -> u32 {
        self.force_stops.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn cpu_syncs(&self) -> u64 {
        self.cpu_syncs.load(Ordering::Relaxed)
    }

    pub fn device_syncs(&self) -> u64 {
        self.device_syncs.load(Ordering::Relaxed)
    }
}

/// Walk descriptors up to `sdp` until the next data descriptor, applying
/// address extensions on the way.
fn next_data(hw: &mut HwState, reg: &RingRegistration, sdp: u32) -> Option<(DmaAddr, NdpDesc)> {
    let mdp = reg.mdp();
    while hw.dp != sdp {
        let desc = NdpDesc::from_raw(reg.descs.read(hw.dp));
        hw.dp = (hw.dp + 1) & mdp;
        match desc.kind() {
            DescKind::AddrExt => hw.upper = desc.addr_hi(),
            DescKind::Data => {
                return Some((DmaAddr::new(hw.upper | desc.addr_lo() as u64), desc));
            }
            DescKind::Reserved(_) => {}
        }
    }
    None
}

struct LoopbackController {
    queue: Arc<LoopbackQueue>,
}

impl NdpController for LoopbackController {
    fn start(&mut self, ring: &RingRegistration) -> Result<(), HwError> {
        if self.queue.fail_start.load(Ordering::Relaxed) {
            return Err(HwError::Controller("injected start failure".into()));
        }
        let mut hw = self.queue.hw.lock();
        self.queue.sdp_reg.store(0, Ordering::Relaxed);
        self.queue.shp_reg.store(0, Ordering::Relaxed);
        ring.shadow.reset();
        hw.reg = Some(ring.clone());
        hw.dp = 0;
        hw.hp = 0;
        hw.upper = 0;
        hw.pending_stops = 0;
        hw.running = true;
        self.queue.starts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HwError> {
        self.queue.stop_calls.fetch_add(1, Ordering::Relaxed);
        let mut hw = self.queue.hw.lock();
        if !hw.running {
            return Ok(());
        }
        let pending = match hw.stop {
            StopBehavior::Immediate => false,
            StopBehavior::Pending(n) => hw.pending_stops < n,
            StopBehavior::Never => true,
        };
        if pending {
            hw.pending_stops += 1;
            self.queue.flush_in_flight(&mut hw);
            return Err(HwError::StopInProgress);
        }
        hw.running = false;
        Ok(())
    }

    fn stop_force(&mut self) {
        self.queue.force_stops.fetch_add(1, Ordering::Relaxed);
        self.queue.hw.lock().running = false;
    }

    fn flush_sdp(&self, sdp: u32) {
        self.queue.sdp_reg.store(sdp, Ordering::Relaxed);
    }

    fn flush_shp(&self, shp: u32) {
        self.queue.shp_reg.store(shp, Ordering::Relaxed);
    }

    fn sync_for_cpu(&self, _addr: DmaAddr, _len: usize) {
        self.queue.cpu_syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_for_device(&self, _addr: DmaAddr, _len: usize) {
        self.queue.device_syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&mut self) {
        let mut hw = self.queue.hw.lock();
        hw.opened = false;
        hw.running = false;
        hw.reg = None;
        self.queue.closes.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-process NDP card.
pub struct LoopbackNdp {
    rx: Vec<Arc<LoopbackQueue>>,
    tx: Vec<Arc<LoopbackQueue>>,
}

impl LoopbackNdp {
    pub fn new(rx_queues: u16, tx_queues: u16) -> Self {
        Self {
            rx: (0..rx_queues).map(|i| Arc::new(LoopbackQueue::new(QueueDir::Rx, i))).collect(),
            tx: (0..tx_queues).map(|i| Arc::new(LoopbackQueue::new(QueueDir::Tx, i))).collect(),
        }
    }

    /// Handle on one queue's firmware model.
    pub fn queue(&self, dir: QueueDir, index: u16) -> Option<Arc<LoopbackQueue>> {
        let queues = match dir {
            QueueDir::Rx => &self.rx,
            QueueDir::Tx => &self.tx,
        };
        queues.get(index as usize).cloned()
    }
}

impl NdpDevice for LoopbackNdp {
    fn rx_queue_count(&self) -> u16 {
        self.rx.len() as u16
    }

    fn tx_queue_count(&self) -> u16 {
        self.tx.len() as u16
    }

    fn open_queue(&self, dir: QueueDir, index: u16) -> Result<Box<dyn NdpController>, HwError> {
        let queue = self.queue(dir, index).ok_or(HwError::NoSuchQueue { dir, index })?;
        if queue.fail_open.load(Ordering::Relaxed) {
            return Err(HwError::Controller("injected open failure".into()));
        }
        {
            let mut hw = queue.hw.lock();
            if hw.opened {
                return Err(HwError::QueueBusy { dir, index });
            }
            hw.opened = true;
        }
        Ok(Box::new(LoopbackController { queue }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Memory
// ═══════════════════════════════════════════════════════════════════════════

/// Heap-backed page allocator with a page limit.
///
/// Page `n` is mapped at `dma_base + n * PAGE_SIZE`, so a base just below a
/// 1 GiB boundary makes consecutive pages straddle an upper-address change.
pub struct HeapPageAllocator {
    limit: AtomicUsize,
    live: AtomicUsize,
    next_id: AtomicU32,
    dma_base: u64,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    releases: AtomicUsize,
}

impl HeapPageAllocator {
    pub fn new(limit: usize) -> Self {
        Self::with_dma_base(limit, 0x1_0000_0000)
    }

    pub fn with_dma_base(limit: usize, dma_base: u64) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            live: AtomicUsize::new(0),
            next_id: AtomicU32::new(0),
            dma_base,
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// Change the page limit; lowering it below `live()` makes every
    /// following allocation fail.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Pages handed out and not released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn maps(&self) -> usize {
        self.maps.load(Ordering::Relaxed)
    }

    pub fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }
}

impl PageAllocator for HeapPageAllocator {
    fn alloc_page(&self) -> Option<Page> {
        let limit = self.limit.load(Ordering::Relaxed);
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(Page::zeroed(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn release_page(&self, page: Page, _can_recycle: bool) {
        drop(page);
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn dma_map(&self, page: &Page) -> Option<DmaAddr> {
        self.maps.fetch_add(1, Ordering::Relaxed);
        Some(DmaAddr::new(self.dma_base + page.id() as u64 * PAGE_SIZE as u64))
    }

    fn dma_unmap(&self, _page: &Page, _addr: DmaAddr) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct XskState {
    available: VecDeque<XskDesc>,
    completed: Vec<u32>,
}

/// Zero-copy pool over one contiguous heap UMEM.
pub struct LoopbackXskPool {
    base: NonNull<u8>,
    frames: u32,
    frame_size: usize,
    headroom: usize,
    dma_base: u64,
    state: spin::Mutex<XskState>,
}

// SAFETY: the UMEM is only reached through raw pointers handed out per
// frame; the bookkeeping lives behind a lock.
unsafe impl Send for LoopbackXskPool {}
unsafe impl Sync for LoopbackXskPool {}

impl LoopbackXskPool {
    pub fn new(frames: u32, frame_size: usize, headroom: usize) -> Self {
        let umem = vec![0u8; frames as usize * frame_size].into_boxed_slice();
        Self {
            base: NonNull::from(Box::leak(umem)).cast::<u8>(),
            frames,
            frame_size,
            headroom,
            dma_base: 0x2_0000_0000,
            state: spin::Mutex::new(XskState::default()),
        }
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Make a frame available to the driver.
    pub fn submit(&self, index: u32, len: u32) {
        self.submit_at(index, 0, len);
    }

    /// Make a frame available with data starting `offset` bytes past the
    /// headroom.
    pub fn submit_at(&self, index: u32, offset: u32, len: u32) {
        self.state.lock().available.push_back(XskDesc { index, offset, len });
    }

    /// Submit every frame of the pool with length 0 (RX fill ring).
    pub fn submit_all(&self) {
        let mut state = self.state.lock();
        state
            .available
            .extend((0..self.frames).map(|index| XskDesc { index, offset: 0, len: 0 }));
    }

    /// Frames submitted and not yet popped.
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Take the completion list.
    pub fn take_completed(&self) -> Vec<u32> {
        core::mem::take(&mut self.state.lock().completed)
    }

    /// Copy `data` into a frame past the headroom.
    ///
    /// # Safety
    /// The frame must not be popped by the driver at the time of the call.
    pub unsafe fn write_frame(&self, index: u32, data: &[u8]) {
        let len = data.len().min(self.frame_size - self.headroom);
        ptr::copy_nonoverlapping(
            data.as_ptr(),
            self.frame_ptr(index).as_ptr().add(self.headroom),
            len,
        );
    }

    /// Copy `len` bytes out of a frame, starting past the headroom.
    ///
    /// # Safety
    /// The frame must not be popped by the driver at the time of the call.
    pub unsafe fn read_frame(&self, index: u32, len: usize) -> Vec<u8> {
        let len = len.min(self.frame_size - self.headroom);
        let mut out = vec![0u8; len];
        ptr::copy_nonoverlapping(
            self.frame_ptr(index).as_ptr().add(self.headroom),
            out.as_mut_ptr(),
            len,
        );
        out
    }
}

impl Drop for LoopbackXskPool {
    fn drop(&mut self) {
        let len = self.frames as usize * self.frame_size;
        // SAFETY: `base` came from `Box::leak` of a slice of exactly `len` bytes.
        unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.base.as_ptr(), len))) };
    }
}

// SAFETY: every frame is a disjoint `frame_size` window of the UMEM, which
// lives as long as the pool.
unsafe impl XskPool for LoopbackXskPool {
    fn pop_available(&self) -> Option<XskDesc> {
        self.state.lock().available.pop_front()
    }

    fn complete(&self, index: u32) {
        self.state.lock().completed.push(index);
    }

    fn address_of(&self, index: u32) -> DmaAddr {
        DmaAddr::new(self.dma_base + index as u64 * self.frame_size as u64)
    }

    fn frame_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.frames);
        // SAFETY: index is inside the UMEM, so the offset stays in bounds.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.frame_size)) }
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn headroom(&self) -> usize {
        self.headroom
    }
}
