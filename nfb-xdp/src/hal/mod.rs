//! Hardware abstraction consumed by the driver core.
//!
//! The core never touches PCI, MMIO or a real page allocator directly. It
//! talks to four traits:
//!
//! | Trait             | Provides                                         |
//! |-------------------|--------------------------------------------------|
//! | [`NdpDevice`]     | queue counts, opening queue controllers          |
//! | [`NdpController`] | start/stop, cursor registers, DMA sync           |
//! | [`PageAllocator`] | pages and their DMA mappings (page-pool mode)    |
//! | [`XskPool`]       | externally owned zero-copy frames                |
//!
//! [`loopback`] implements all of them in-process.

pub mod loopback;

use core::fmt;
use core::ptr::NonNull;

use crate::dma::{DmaAddr, RingRegistration};
use crate::error::HwError;

/// Size of one page handed out by a [`PageAllocator`].
pub const PAGE_SIZE: usize = 4096;

/// Queue direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDir {
    Rx,
    Tx,
}

impl fmt::Display for QueueDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => f.write_str("rx"),
            Self::Tx => f.write_str("tx"),
        }
    }
}

/// One NDP-capable card.
pub trait NdpDevice: Send + Sync {
    /// Number of RX DMA queues.
    fn rx_queue_count(&self) -> u16;

    /// Number of TX DMA queues.
    fn tx_queue_count(&self) -> u16;

    /// Open the controller of one queue.
    ///
    /// # Returns
    /// - `Err(HwError::NoSuchQueue)`: index out of range
    /// - `Err(HwError::QueueBusy)`: the queue is already open
    fn open_queue(&self, dir: QueueDir, index: u16) -> Result<Box<dyn NdpController>, HwError>;
}

/// Controller of a single DMA queue.
///
/// # Contract
/// - `start` is only called on a stopped controller with zeroed cursors.
/// - `flush_sdp`/`flush_shp` are register writes; the caller has already
///   issued the release fence that orders ring contents before them.
pub trait NdpController: Send {
    /// Register ring bases and start DMA.
    fn start(&mut self, ring: &RingRegistration) -> Result<(), HwError>;

    /// Request a graceful stop.
    ///
    /// `Err(HwError::StopInProgress)` means the controller still has work in
    /// flight and the caller should retry.
    fn stop(&mut self) -> Result<(), HwError>;

    /// Stop unconditionally. Firmware state may be left inconsistent.
    fn stop_force(&mut self);

    /// Write the software descriptor pointer register.
    fn flush_sdp(&self, sdp: u32);

    /// Write the software header pointer register.
    fn flush_shp(&self, shp: u32);

    /// Make device writes to `[addr, addr + len)` visible to the CPU.
    fn sync_for_cpu(&self, _addr: DmaAddr, _len: usize) {}

    /// Make CPU writes to `[addr, addr + len)` visible to the device.
    fn sync_for_device(&self, _addr: DmaAddr, _len: usize) {}

    /// Release the queue. The controller is not used afterwards.
    fn close(&mut self);
}

/// A page owned by whoever holds this value.
pub struct Page {
    mem: Box<[u8]>,
    id: u32,
}

impl Page {
    /// Zero-filled page tagged with an allocator-chosen id.
    pub fn zeroed(id: u32) -> Self {
        Self {
            mem: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            id,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mem
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("id", &self.id).finish()
    }
}

/// Source of pages for the page-pool buffer source.
pub trait PageAllocator: Send + Sync {
    /// Allocate one page, `None` when out of memory.
    fn alloc_page(&self) -> Option<Page>;

    /// Give a page back. `can_recycle` is false once the pool that used the
    /// page has been closed.
    fn release_page(&self, page: Page, can_recycle: bool);

    /// DMA-map a page for bidirectional use.
    fn dma_map(&self, page: &Page) -> Option<DmaAddr>;

    /// Drop the mapping created by [`dma_map`](Self::dma_map).
    fn dma_unmap(&self, _page: &Page, _addr: DmaAddr) {}
}

/// One frame of a zero-copy pool, as exchanged with its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XskDesc {
    /// Frame index into the pool.
    pub index: u32,
    /// Data offset past the pool headroom.
    pub offset: u32,
    /// Data length (TX) or 0 (fill).
    pub len: u32,
}

/// Externally owned zero-copy frame pool.
///
/// # Safety
/// Implementors guarantee that [`frame_ptr`](Self::frame_ptr) points to
/// `frame_size()` bytes of memory that stay valid for the life of the pool
/// and that nobody else accesses while the frame is popped and not yet
/// completed.
pub unsafe trait XskPool: Send + Sync {
    /// Next frame submitted by the owner, if any.
    fn pop_available(&self) -> Option<XskDesc>;

    /// Hand a frame back to the owner.
    fn complete(&self, index: u32);

    /// Device address of the first byte of a frame.
    fn address_of(&self, index: u32) -> DmaAddr;

    /// CPU address of the first byte of a frame.
    fn frame_ptr(&self, index: u32) -> NonNull<u8>;

    /// Size of every frame in bytes.
    fn frame_size(&self) -> usize;

    /// Bytes reserved at the start of each frame.
    fn headroom(&self) -> usize {
        0
    }
}
