//! Coherent memory shared between the driver and the NDP controller.
//!
//! # Layout (one queue)
//! ```text
//! Table           Entry    Writer      Reader
//! descriptors     u64      software    controller
//! headers (RX)    u32      controller  software
//! shadow          2 × u32  controller  software   (hdp, hhp)
//! ```
//!
//! Every entry is an atomic so that both sides can touch the tables without
//! creating aliasing `&mut` references. Ordering between the table contents
//! and the cursor registers is provided by the fences in
//! [`crate::ndp::ring`].

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Descriptor table, written by software and read by the controller.
#[derive(Debug, Clone)]
pub struct DescTable(Arc<[AtomicU64]>);

impl DescTable {
    /// Allocate a zeroed table of `len` descriptors.
    pub fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicU64::new(0)).collect())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Store a raw descriptor word.
    #[inline]
    pub fn write(&self, idx: u32, raw: u64) {
        self.0[idx as usize].store(raw, Ordering::Relaxed);
    }

    /// Load a raw descriptor word.
    #[inline]
    pub fn read(&self, idx: u32) -> u64 {
        self.0[idx as usize].load(Ordering::Relaxed)
    }
}

/// RX completion header table, written by the controller.
#[derive(Debug, Clone)]
pub struct HeaderTable(Arc<[AtomicU32]>);

impl HeaderTable {
    /// Allocate a zeroed table of `len` headers.
    pub fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicU32::new(0)).collect())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Store a raw header word.
    #[inline]
    pub fn write(&self, idx: u32, raw: u32) {
        self.0[idx as usize].store(raw, Ordering::Relaxed);
    }

    /// Load a raw header word.
    #[inline]
    pub fn read(&self, idx: u32) -> u32 {
        self.0[idx as usize].load(Ordering::Relaxed)
    }
}

/// Cursor shadow area the controller updates after consuming descriptors
/// or writing headers.
#[derive(Debug, Default)]
pub struct ShadowPointers {
    hdp: AtomicU32,
    hhp: AtomicU32,
}

impl ShadowPointers {
    /// Hardware-done descriptor pointer.
    #[inline]
    pub fn hdp(&self) -> u32 {
        self.hdp.load(Ordering::Acquire)
    }

    /// Hardware header pointer.
    #[inline]
    pub fn hhp(&self) -> u32 {
        self.hhp.load(Ordering::Acquire)
    }

    /// Publish new hardware cursors. Controller side only.
    #[inline]
    pub fn publish(&self, hdp: u32, hhp: u32) {
        self.hdp.store(hdp, Ordering::Release);
        self.hhp.store(hhp, Ordering::Release);
    }

    /// Zero both cursors before the controller is (re)started.
    pub fn reset(&self) {
        self.publish(0, 0);
    }
}

/// Everything a controller needs at start: table bases and sizes.
#[derive(Debug, Clone)]
pub struct RingRegistration {
    /// Descriptor table.
    pub descs: DescTable,
    /// Header table, RX only.
    pub headers: Option<HeaderTable>,
    /// Shadow cursor area.
    pub shadow: Arc<ShadowPointers>,
}

impl RingRegistration {
    /// Descriptor pointer mask.
    pub fn mdp(&self) -> u32 {
        self.descs.len() as u32 - 1
    }

    /// Header pointer mask (0 when the queue has no header ring).
    pub fn mhp(&self) -> u32 {
        self.headers.as_ref().map_or(0, |h| h.len() as u32 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_start_zeroed() {
        let descs = DescTable::new(8);
        let hdrs = HeaderTable::new(4);
        assert!((0..8).all(|i| descs.read(i) == 0));
        assert!((0..4).all(|i| hdrs.read(i) == 0));
    }

    #[test]
    fn test_registration_masks() {
        let reg = RingRegistration {
            descs: DescTable::new(16),
            headers: Some(HeaderTable::new(8)),
            shadow: Arc::new(ShadowPointers::default()),
        };
        assert_eq!(reg.mdp(), 15);
        assert_eq!(reg.mhp(), 7);
    }
}
