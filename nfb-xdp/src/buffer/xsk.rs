//! Zero-copy buffer source over an externally owned frame pool.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Exhausted;
use crate::hal::XskPool;

use super::{BufferSource, Lease, SourceKind, XdpBuff, XskLease};

pub(crate) struct ZcShared {
    pub(crate) pool: Arc<dyn XskPool>,
    outstanding: AtomicUsize,
}

impl ZcShared {
    /// Lease ended normally: the owner gets its frame back.
    pub(crate) fn release(&self, index: u32) {
        self.pool.complete(index);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Lease ended by handing the frame to the owner some other way.
    pub(crate) fn forget(&self, _index: u32) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Buffer source popping caller-submitted frames from an [`XskPool`].
///
/// Releasing a buffer completes its frame; the memory itself always stays
/// with the pool owner.
pub struct ZeroCopySource {
    shared: Arc<ZcShared>,
}

impl ZeroCopySource {
    pub fn new(pool: Arc<dyn XskPool>) -> Self {
        Self {
            shared: Arc::new(ZcShared { pool, outstanding: AtomicUsize::new(0) }),
        }
    }

    pub fn pool(&self) -> &Arc<dyn XskPool> {
        &self.shared.pool
    }
}

impl BufferSource for ZeroCopySource {
    fn allocate(&self) -> Result<XdpBuff, Exhausted> {
        let pool = &self.shared.pool;
        let desc = pool.pop_available().ok_or(Exhausted)?;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let base = pool.address_of(desc.index);
        let headroom = pool.headroom() + desc.offset as usize;
        let lease = Lease::Xsk(XskLease::new(Arc::clone(&self.shared), desc.index));
        let mut buff = XdpBuff::new(lease, base, pool.frame_size(), headroom);
        let len = (desc.len as usize).min(buff.capacity());
        buff.set_len(len);
        Ok(buff)
    }

    fn frame_len(&self) -> usize {
        let pool = &self.shared.pool;
        pool.frame_size().saturating_sub(pool.headroom())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ZeroCopy
    }

    fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::loopback::LoopbackXskPool;

    #[test]
    fn test_allocate_follows_submission_order() {
        let xsk = Arc::new(LoopbackXskPool::new(4, 2048, 256));
        xsk.submit(3, 0);
        xsk.submit(1, 100);
        let src = ZeroCopySource::new(xsk.clone());
        assert_eq!(src.frame_len(), 1792);

        let a = src.allocate().unwrap();
        let b = src.allocate().unwrap();
        assert_eq!(src.allocate().unwrap_err(), Exhausted);
        assert_eq!(a.xsk_index(), Some(3));
        assert_eq!(b.xsk_index(), Some(1));
        assert_eq!(b.len(), 100);
        assert_eq!(src.outstanding(), 2);

        src.release(b);
        drop(a);
        assert_eq!(xsk.take_completed(), vec![1, 3]);
        assert_eq!(src.outstanding(), 0);
    }
}
