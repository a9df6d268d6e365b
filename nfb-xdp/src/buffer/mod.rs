//! Packet buffers and the sources they come from.
//!
//! # Ownership
//! ```text
//!   BufferSource ──allocate()──> XdpBuff ──post──> RX slot ──drain──> dispatcher
//!        ▲                          │                                    │
//!        └──────── drop ────────────┴── TX slot ──reclaim── drop ────────┤
//!                                                                        │
//!                      StackFrame (page kept) / redirect / XskDesc <─────┘
//! ```
//!
//! An [`XdpBuff`] carries a lease on its backing memory. Dropping the buffer
//! returns the memory to its source exactly once; the only ways to end a
//! lease without that release are handing a page to the stack inside a
//! [`StackFrame`] (which releases it when dropped) and handing a zero-copy
//! frame to its owner with [`XdpBuff::into_xsk_desc`].

pub mod page_pool;
pub mod xsk;

use core::fmt;
use core::mem::ManuallyDrop;
use std::sync::Arc;

use crate::dma::DmaAddr;
use crate::error::Exhausted;
use crate::hal::XskDesc;

pub use page_pool::{PagePool, PAGE_FRAME_LEN, SHARED_INFO_LEN, XDP_HEADROOM};
pub use xsk::ZeroCopySource;

use page_pool::{DmaPage, PoolShared};
use xsk::ZcShared;

/// Minimum Ethernet frame length without FCS; shorter TX frames are padded.
pub const ETH_ZLEN: usize = 60;

/// Headroom a page buffer needs to be turned into a [`StackFrame`].
pub const FRAME_METADATA_LEN: usize = 40;

/// Where a buffer's memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    PagePool,
    ZeroCopy,
}

/// A supplier of packet buffers.
pub trait BufferSource: Send + Sync {
    /// Hand out one buffer, or `Exhausted` when none is available.
    fn allocate(&self) -> Result<XdpBuff, Exhausted>;

    /// Give a buffer back. Equivalent to dropping it.
    fn release(&self, buff: XdpBuff) {
        drop(buff);
    }

    /// Bytes a freshly allocated buffer can receive.
    fn frame_len(&self) -> usize;

    fn kind(&self) -> SourceKind;

    /// Buffers handed out and not yet released.
    fn outstanding(&self) -> usize;

    /// Stop caching released memory; later releases go straight back to the
    /// underlying allocator.
    fn close(&self) {}
}

pub(crate) struct PageLease {
    page: ManuallyDrop<DmaPage>,
    pool: Arc<PoolShared>,
}

impl PageLease {
    pub(crate) fn new(page: DmaPage, pool: Arc<PoolShared>) -> Self {
        Self { page: ManuallyDrop::new(page), pool }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        // SAFETY: `page` is not used again after this point.
        let page = unsafe { ManuallyDrop::take(&mut self.page) };
        self.pool.recycle(page);
    }
}

pub(crate) struct XskLease {
    shared: Arc<ZcShared>,
    index: u32,
    armed: bool,
}

impl XskLease {
    pub(crate) fn new(shared: Arc<ZcShared>, index: u32) -> Self {
        Self { shared, index, armed: true }
    }

    fn frame(&self) -> &[u8] {
        let pool = &self.shared.pool;
        // SAFETY: the pool guarantees `frame_size` bytes at `frame_ptr` that
        // nobody else touches while the frame is popped; the lease is the
        // only handle to it.
        unsafe { core::slice::from_raw_parts(pool.frame_ptr(self.index).as_ptr(), pool.frame_size()) }
    }

    fn frame_mut(&mut self) -> &mut [u8] {
        let pool = &self.shared.pool;
        // SAFETY: as in `frame`, and `&mut self` makes the access exclusive.
        unsafe {
            core::slice::from_raw_parts_mut(pool.frame_ptr(self.index).as_ptr(), pool.frame_size())
        }
    }

    /// End the lease without completing the frame.
    fn disarm(&mut self) {
        if self.armed {
            self.armed = false;
            self.shared.forget(self.index);
        }
    }
}

impl Drop for XskLease {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release(self.index);
        }
    }
}

pub(crate) enum Lease {
    Page(PageLease),
    Xsk(XskLease),
}

impl Lease {
    fn frame(&self) -> &[u8] {
        match self {
            Lease::Page(p) => p.page.page.as_slice(),
            Lease::Xsk(x) => x.frame(),
        }
    }

    fn frame_mut(&mut self) -> &mut [u8] {
        match self {
            Lease::Page(p) => p.page.page.as_mut_slice(),
            Lease::Xsk(x) => x.frame_mut(),
        }
    }
}

/// One packet buffer.
///
/// # Layout
/// ```text
/// 0          data_off          data_off + len        frame_end
/// | headroom | ───── data ───── | ────── free ───────── | tailroom |
/// ^ base (DMA)
/// ```
pub struct XdpBuff {
    lease: Lease,
    base: DmaAddr,
    frame_end: usize,
    data_off: usize,
    data_len: usize,
    meta: u8,
}

impl XdpBuff {
    pub(crate) fn new(lease: Lease, base: DmaAddr, frame_end: usize, headroom: usize) -> Self {
        Self {
            lease,
            base,
            frame_end,
            data_off: headroom.min(frame_end),
            data_len: 0,
            meta: 0,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self.lease {
            Lease::Page(_) => SourceKind::PagePool,
            Lease::Xsk(_) => SourceKind::ZeroCopy,
        }
    }

    /// Device address of the first data byte.
    pub fn dma_addr(&self) -> DmaAddr {
        self.base.offset(self.data_off)
    }

    /// Bytes available from the data start to the end of the frame.
    pub fn capacity(&self) -> usize {
        self.frame_end - self.data_off
    }

    /// Bytes in front of the data.
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// `(offset, len)` of the data inside the frame.
    pub fn data_span(&self) -> (usize, usize) {
        (self.data_off, self.data_len)
    }

    pub fn len(&self) -> usize {
        self.data_len
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Metadata flags from the RX header.
    pub fn meta(&self) -> u8 {
        self.meta
    }

    pub(crate) fn set_meta(&mut self, meta: u8) {
        self.meta = meta;
    }

    pub fn data(&self) -> &[u8] {
        &self.lease.frame()[self.data_off..self.data_off + self.data_len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let (off, len) = (self.data_off, self.data_len);
        &mut self.lease.frame_mut()[off..off + len]
    }

    /// Move the data start by `delta` bytes, keeping the data end in place.
    ///
    /// Returns `false` and leaves the buffer untouched when the new start
    /// would leave the frame or pass the data end.
    pub fn adjust_head(&mut self, delta: isize) -> bool {
        let end = self.data_off + self.data_len;
        let Some(off) = self.data_off.checked_add_signed(delta) else {
            return false;
        };
        if off > end {
            return false;
        }
        self.data_off = off;
        self.data_len = end - off;
        true
    }

    /// Set the data length. Fails when it would exceed the capacity.
    pub fn set_len(&mut self, len: usize) -> bool {
        if len > self.capacity() {
            return false;
        }
        self.data_len = len;
        true
    }

    /// Zero-extend the data to at least `min` bytes.
    pub fn pad_to(&mut self, min: usize) -> bool {
        if self.data_len >= min {
            return true;
        }
        if min > self.capacity() {
            return false;
        }
        let (start, end) = (self.data_off + self.data_len, self.data_off + min);
        self.lease.frame_mut()[start..end].fill(0);
        self.data_len = min;
        true
    }

    /// Id of the backing page, for page-pool buffers.
    pub fn page_id(&self) -> Option<u32> {
        match &self.lease {
            Lease::Page(p) => Some(p.page.page.id()),
            Lease::Xsk(_) => None,
        }
    }

    /// Frame index, for zero-copy buffers.
    pub fn xsk_index(&self) -> Option<u32> {
        match &self.lease {
            Lease::Page(_) => None,
            Lease::Xsk(x) => Some(x.index),
        }
    }

    /// Build the frame handed to the network stack.
    ///
    /// Page buffers keep their page; zero-copy buffers are copied out and
    /// the frame goes back to its pool. Fails, returning the buffer, when a
    /// page buffer has less than [`FRAME_METADATA_LEN`] bytes of headroom.
    pub fn into_stack_frame(self, queue: u16) -> Result<StackFrame, XdpBuff> {
        if matches!(self.lease, Lease::Page(_)) && self.data_off < FRAME_METADATA_LEN {
            return Err(self);
        }
        let (data_off, len, meta) = (self.data_off, self.data_len, self.meta);
        let storage = match self.lease {
            Lease::Page(page) => FrameStorage::Page(page),
            lease @ Lease::Xsk(_) => {
                let copy = lease.frame()[data_off..data_off + len].to_vec().into_boxed_slice();
                drop(lease);
                return Ok(StackFrame {
                    storage: FrameStorage::Owned(copy),
                    data_off: 0,
                    len,
                    queue,
                    meta,
                });
            }
        };
        Ok(StackFrame { storage, data_off, len, queue, meta })
    }

    /// Hand a zero-copy frame to its owner without completing it.
    ///
    /// Page buffers, and zero-copy buffers whose data starts inside the pool
    /// headroom, are returned unchanged in `Err`: the descriptor offset
    /// counts from the end of the headroom.
    pub fn into_xsk_desc(self) -> Result<XskDesc, XdpBuff> {
        let Self { lease, base, frame_end, data_off, data_len, meta } = self;
        match lease {
            Lease::Xsk(mut x) if data_off >= x.shared.pool.headroom() => {
                let offset = data_off - x.shared.pool.headroom();
                x.disarm();
                Ok(XskDesc { index: x.index, offset: offset as u32, len: data_len as u32 })
            }
            lease => Err(Self { lease, base, frame_end, data_off, data_len, meta }),
        }
    }
}

impl fmt::Debug for XdpBuff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XdpBuff")
            .field("kind", &self.kind())
            .field("dma", &format_args!("{}", self.base))
            .field("data_off", &self.data_off)
            .field("len", &self.data_len)
            .finish()
    }
}

enum FrameStorage {
    Page(PageLease),
    Owned(Box<[u8]>),
}

/// A received frame delivered to the network stack.
///
/// Page-backed frames return their page to the pool when dropped.
pub struct StackFrame {
    storage: FrameStorage,
    data_off: usize,
    len: usize,
    queue: u16,
    meta: u8,
}

impl StackFrame {
    pub fn data(&self) -> &[u8] {
        let frame: &[u8] = match &self.storage {
            FrameStorage::Page(p) => p.page.page.as_slice(),
            FrameStorage::Owned(b) => b,
        };
        &frame[self.data_off..self.data_off + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ingress queue index.
    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn meta(&self) -> u8 {
        self.meta
    }

    /// Whether the frame still sits in its pool page.
    pub fn is_page_backed(&self) -> bool {
        matches!(self.storage, FrameStorage::Page(_))
    }
}

impl fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackFrame")
            .field("queue", &self.queue)
            .field("len", &self.len)
            .field("page_backed", &self.is_page_backed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::{HeapPageAllocator, LoopbackXskPool};
    use crate::hal::XskPool;

    fn page_pool() -> (Arc<HeapPageAllocator>, PagePool) {
        let alloc = Arc::new(HeapPageAllocator::new(8));
        let pool = PagePool::new(alloc.clone(), 4);
        (alloc, pool)
    }

    #[test]
    fn test_page_buffer_layout() {
        let (_alloc, pool) = page_pool();
        let buff = pool.allocate().unwrap();
        assert_eq!(buff.headroom(), XDP_HEADROOM);
        assert_eq!(buff.capacity(), PAGE_FRAME_LEN);
        assert_eq!(buff.capacity(), 3520);
        assert_eq!(buff.data_span(), (256, 0));
        assert_eq!(buff.kind(), SourceKind::PagePool);
    }

    #[test]
    fn test_adjust_head_bounds() {
        let (_alloc, pool) = page_pool();
        let mut buff = pool.allocate().unwrap();
        assert!(buff.set_len(100));
        assert!(buff.adjust_head(-14));
        assert_eq!(buff.data_span(), (242, 114));
        assert!(buff.adjust_head(114));
        assert!(buff.is_empty());
        assert!(!buff.adjust_head(1));
        assert!(!buff.adjust_head(-1000));
        assert_eq!(buff.data_span(), (356, 0));
    }

    #[test]
    fn test_pad_zeroes_tail() {
        let (_alloc, pool) = page_pool();
        let mut buff = pool.allocate().unwrap();
        assert!(buff.set_len(20));
        buff.data_mut().fill(0xAB);
        assert!(buff.pad_to(ETH_ZLEN));
        assert_eq!(buff.len(), ETH_ZLEN);
        assert!(buff.data()[20..].iter().all(|&b| b == 0));
        assert!(buff.data()[..20].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_stack_frame_keeps_page_until_dropped() {
        let (_alloc, pool) = page_pool();
        let mut buff = pool.allocate().unwrap();
        buff.set_len(64);
        let frame = buff.into_stack_frame(3).unwrap();
        assert!(frame.is_page_backed());
        assert_eq!(frame.queue(), 3);
        assert_eq!(pool.outstanding(), 1);
        drop(frame);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_stack_frame_needs_metadata_headroom() {
        let (_alloc, pool) = page_pool();
        let mut buff = pool.allocate().unwrap();
        buff.set_len(64);
        assert!(buff.adjust_head(-(XDP_HEADROOM as isize) + 8));
        let buff = buff.into_stack_frame(0).unwrap_err();
        assert_eq!(buff.headroom(), 8);
        drop(buff);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_zero_copy_pass_copies_and_completes() {
        let xsk = Arc::new(LoopbackXskPool::new(2, 2048, 0));
        xsk.submit(1, 0);
        let src = ZeroCopySource::new(xsk.clone());
        let mut buff = src.allocate().unwrap();
        buff.set_len(4);
        buff.data_mut().copy_from_slice(b"ping");
        let frame = buff.into_stack_frame(0).unwrap();
        assert!(!frame.is_page_backed());
        assert_eq!(frame.data(), b"ping");
        assert_eq!(xsk.take_completed(), vec![1]);
        assert_eq!(src.outstanding(), 0);
    }

    #[test]
    fn test_into_xsk_desc_disarms_release() {
        let xsk = Arc::new(LoopbackXskPool::new(2, 2048, 128));
        xsk.submit(0, 0);
        let src = ZeroCopySource::new(xsk.clone());
        let mut buff = src.allocate().unwrap();
        assert_eq!(buff.dma_addr(), xsk.address_of(0).offset(128));
        buff.set_len(10);
        let desc = buff.into_xsk_desc().unwrap();
        assert_eq!(desc, XskDesc { index: 0, offset: 0, len: 10 });
        assert!(xsk.take_completed().is_empty());
        assert_eq!(src.outstanding(), 0);
    }

    #[test]
    fn test_into_xsk_desc_keeps_data_offset() {
        let xsk = Arc::new(LoopbackXskPool::new(2, 2048, 128));
        xsk.submit_at(1, 64, 20);
        let src = ZeroCopySource::new(xsk.clone());
        let mut buff = src.allocate().unwrap();
        assert!(buff.adjust_head(10));
        let desc = buff.into_xsk_desc().unwrap();
        assert_eq!(desc, XskDesc { index: 1, offset: 74, len: 10 });
    }

    #[test]
    fn test_into_xsk_desc_rejects_head_grown_into_headroom() {
        let xsk = Arc::new(LoopbackXskPool::new(2, 2048, 128));
        xsk.submit(0, 4);
        let src = ZeroCopySource::new(xsk.clone());
        let mut buff = src.allocate().unwrap();
        buff.data_mut().copy_from_slice(b"DATA");
        assert!(buff.adjust_head(-14));
        buff.data_mut()[..14].fill(0xEE);

        let buff = buff.into_xsk_desc().unwrap_err();
        assert_eq!(buff.len(), 18);
        assert_eq!(src.outstanding(), 1);
        // Still armed: dropping it completes the frame.
        drop(buff);
        assert_eq!(xsk.take_completed(), vec![0]);
        assert_eq!(src.outstanding(), 0);
    }
}
