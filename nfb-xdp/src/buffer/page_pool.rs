//! Recycling page pool.
//!
//! # Page layout
//! ```text
//! 0        256                              3776         4096
//! | headroom | ────── frame (3520) ───────── | shared info |
//! ```
//! The frame length posted to hardware is
//! `PAGE_SIZE - align64(XDP_HEADROOM + SHARED_INFO_LEN)`.
//!
//! Pages are DMA-mapped once, when first taken from the allocator, and keep
//! their mapping while they circulate through the recycle cache. A page is
//! unmapped only when it leaves the pool for good.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;

use crate::dma::DmaAddr;
use crate::error::Exhausted;
use crate::hal::{Page, PageAllocator, PAGE_SIZE};
use crate::util::align_up;

use super::{BufferSource, Lease, PageLease, SourceKind, XdpBuff};

/// Headroom reserved in front of every received frame.
pub const XDP_HEADROOM: usize = 256;

/// Tail area reserved for the stack's shared frame info.
pub const SHARED_INFO_LEN: usize = 320;

/// Receive length of one page buffer.
pub const PAGE_FRAME_LEN: usize = PAGE_SIZE - align_up(XDP_HEADROOM + SHARED_INFO_LEN, 64);

/// A page together with its cached DMA mapping.
pub(crate) struct DmaPage {
    pub(crate) page: Page,
    pub(crate) dma: DmaAddr,
}

struct CacheState {
    pages: Vec<DmaPage>,
    closed: bool,
}

pub(crate) struct PoolShared {
    allocator: Arc<dyn PageAllocator>,
    cache: spin::Mutex<CacheState>,
    cache_cap: usize,
    outstanding: AtomicUsize,
}

impl PoolShared {
    /// Take back a page whose lease ended.
    pub(crate) fn recycle(&self, page: DmaPage) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut cache = self.cache.lock();
        if !cache.closed && cache.pages.len() < self.cache_cap {
            cache.pages.push(page);
            return;
        }
        let can_recycle = !cache.closed;
        drop(cache);
        self.give_back(page, can_recycle);
    }

    fn give_back(&self, page: DmaPage, can_recycle: bool) {
        self.allocator.dma_unmap(&page.page, page.dma);
        self.allocator.release_page(page.page, can_recycle);
    }
}

/// Page-pool buffer source.
pub struct PagePool {
    shared: Arc<PoolShared>,
}

impl PagePool {
    /// Create a pool whose recycle cache holds up to `cache_cap` pages.
    ///
    /// `cache_cap` is normally the RX ring size.
    pub fn new(allocator: Arc<dyn PageAllocator>, cache_cap: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                allocator,
                cache: spin::Mutex::new(CacheState {
                    pages: Vec::with_capacity(cache_cap),
                    closed: false,
                }),
                cache_cap,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Pages waiting in the recycle cache.
    pub fn cached(&self) -> usize {
        self.shared.cache.lock().pages.len()
    }

    fn take_page(&self) -> Result<DmaPage, Exhausted> {
        {
            let mut cache = self.shared.cache.lock();
            if cache.closed {
                return Err(Exhausted);
            }
            if let Some(page) = cache.pages.pop() {
                return Ok(page);
            }
        }
        let allocator = &self.shared.allocator;
        let page = allocator.alloc_page().ok_or(Exhausted)?;
        match allocator.dma_map(&page) {
            Some(dma) => Ok(DmaPage { page, dma }),
            None => {
                debug!("page pool: DMA mapping failed");
                allocator.release_page(page, true);
                Err(Exhausted)
            }
        }
    }
}

impl BufferSource for PagePool {
    fn allocate(&self) -> Result<XdpBuff, Exhausted> {
        let page = self.take_page()?;
        let base = page.dma;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let lease = Lease::Page(PageLease::new(page, Arc::clone(&self.shared)));
        Ok(XdpBuff::new(lease, base, XDP_HEADROOM + PAGE_FRAME_LEN, XDP_HEADROOM))
    }

    fn frame_len(&self) -> usize {
        PAGE_FRAME_LEN
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PagePool
    }

    fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    fn close(&self) {
        let pages = {
            let mut cache = self.shared.cache.lock();
            cache.closed = true;
            core::mem::take(&mut cache.pages)
        };
        for page in pages {
            self.shared.give_back(page, false);
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        self.close();
    }
}
