//! Descriptor ring cursor arithmetic.
//!
//! # Cursors
//! ```text
//! sdp  next descriptor software writes        (software, flushed to hw)
//! hdp  next descriptor hardware has not done  (shadow, read only)
//! fdp  next descriptor to be freed            (software)
//! php  next buffer slot to fill (RX)          (software)
//! shp  next header software reads (RX)        (software, flushed to hw)
//! hhp  next header hardware has not written   (shadow, read only)
//! ```
//!
//! All cursors wrap with the ring mask; capacities must be powers of two.
//!
//! # Ordering
//! Descriptor words are stored with relaxed atomics and published by a
//! release fence placed before every register write in [`flush_producer`]
//! and [`flush_consumer`]. Hardware cursors are loaded with acquire ordering
//! so the headers and buffers they cover are visible once the cursor is.
//!
//! [`flush_producer`]: DescriptorRing::flush_producer
//! [`flush_consumer`]: DescriptorRing::flush_consumer

use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::dma::{DescTable, DmaAddr, HeaderTable, RingRegistration, ShadowPointers};
use crate::error::RingError;
use crate::hal::NdpController;

use super::desc::{NdpDesc, NdpHdr};

/// Slots written by one [`DescriptorRing::post`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posted {
    /// Slot of the address-extension descriptor, when one was needed.
    pub ext_slot: Option<u32>,
    /// Slot of the data descriptor.
    pub data_slot: u32,
}

/// Circular descriptor ring plus the optional RX header ring.
#[derive(Debug)]
pub struct DescriptorRing {
    descs: DescTable,
    headers: Option<HeaderTable>,
    shadow: Arc<ShadowPointers>,
    sdp: u32,
    hdp: u32,
    fdp: u32,
    php: u32,
    shp: u32,
    hhp: u32,
    mdp: u32,
    mhp: u32,
    last_upper: Option<u64>,
}

impl DescriptorRing {
    /// Allocate a ring with `desc_count` descriptors and, for RX queues,
    /// `hdr_count` headers.
    pub fn new(desc_count: u32, hdr_count: Option<u32>) -> Result<Self, RingError> {
        check_pow2(desc_count)?;
        if let Some(h) = hdr_count {
            check_pow2(h)?;
        }
        Ok(Self {
            descs: DescTable::new(desc_count as usize),
            headers: hdr_count.map(|h| HeaderTable::new(h as usize)),
            shadow: Arc::new(ShadowPointers::default()),
            sdp: 0,
            hdp: 0,
            fdp: 0,
            php: 0,
            shp: 0,
            hhp: 0,
            mdp: desc_count - 1,
            mhp: hdr_count.map_or(0, |h| h - 1),
            last_upper: None,
        })
    }

    /// Table bases handed to the controller on start.
    pub fn registration(&self) -> RingRegistration {
        RingRegistration {
            descs: self.descs.clone(),
            headers: self.headers.clone(),
            shadow: Arc::clone(&self.shadow),
        }
    }

    /// Zero every cursor. Only valid while the controller is stopped.
    pub fn reset(&mut self) {
        self.sdp = 0;
        self.hdp = 0;
        self.fdp = 0;
        self.php = 0;
        self.shp = 0;
        self.hhp = 0;
        self.last_upper = None;
        self.shadow.reset();
    }

    pub fn desc_capacity(&self) -> u32 {
        self.mdp + 1
    }

    /// Header capacity; 0 for rings without a header table.
    pub fn hdr_capacity(&self) -> u32 {
        if self.headers.is_some() {
            self.mhp + 1
        } else {
            0
        }
    }

    pub fn sdp(&self) -> u32 {
        self.sdp
    }

    pub fn hdp(&self) -> u32 {
        self.hdp
    }

    pub fn fdp(&self) -> u32 {
        self.fdp
    }

    pub fn php(&self) -> u32 {
        self.php
    }

    pub fn shp(&self) -> u32 {
        self.shp
    }

    pub fn hhp(&self) -> u32 {
        self.hhp
    }

    pub fn mdp(&self) -> u32 {
        self.mdp
    }

    pub fn mhp(&self) -> u32 {
        self.mhp
    }

    // ═══════════════════════════════════════════════════════════════════
    // Occupancy
    // ═══════════════════════════════════════════════════════════════════

    /// Descriptor slots software may still write.
    #[inline]
    pub fn free_producer_slots(&self) -> u32 {
        self.fdp.wrapping_sub(self.sdp).wrapping_sub(1) & self.mdp
    }

    /// Header slots that have no buffer posted yet (RX fill headroom).
    #[inline]
    pub fn free_consumer_slots(&self) -> u32 {
        self.shp.wrapping_sub(self.php).wrapping_sub(1) & self.mhp
    }

    /// Headers written by hardware and not yet consumed.
    #[inline]
    pub fn ready_headers(&self) -> u32 {
        self.hhp.wrapping_sub(self.shp) & self.mhp
    }

    /// Buffers posted to hardware and not yet consumed (RX).
    #[inline]
    pub fn posted_buffers(&self) -> u32 {
        self.php.wrapping_sub(self.shp) & self.mhp
    }

    /// Descriptors written but not yet freed.
    #[inline]
    pub fn in_flight_descriptors(&self) -> u32 {
        self.sdp.wrapping_sub(self.fdp) & self.mdp
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cursor movement
    // ═══════════════════════════════════════════════════════════════════

    pub fn advance_producer(&mut self, n: u32) {
        debug_assert!(n <= self.free_producer_slots());
        self.sdp = self.sdp.wrapping_add(n) & self.mdp;
    }

    pub fn advance_consumer(&mut self, n: u32) {
        debug_assert!(n <= self.ready_headers());
        self.shp = self.shp.wrapping_add(n) & self.mhp;
    }

    pub fn advance_fill(&mut self, n: u32) {
        debug_assert!(n <= self.free_consumer_slots());
        self.php = self.php.wrapping_add(n) & self.mhp;
    }

    /// Mark descriptors up to (not including) `ptr` as freed.
    pub fn release_descriptors_to(&mut self, ptr: u32) {
        self.fdp = ptr & self.mdp;
    }

    /// Reload `hdp` and `hhp` from the shadow area.
    pub fn refresh_hardware_cursors(&mut self) {
        self.hdp = self.shadow.hdp() & self.mdp;
        if self.headers.is_some() {
            self.hhp = self.shadow.hhp() & self.mhp;
        }
    }

    /// Whether posting a buffer at `addr` costs an address-extension
    /// descriptor on top of the data descriptor.
    #[inline]
    pub fn needs_addr_ext(&self, addr: DmaAddr) -> bool {
        self.last_upper != Some(addr.upper())
    }

    /// Descriptors needed to post a buffer at `addr`.
    #[inline]
    pub fn descs_needed(&self, addr: DmaAddr) -> u32 {
        1 + self.needs_addr_ext(addr) as u32
    }

    /// Write the descriptors for one buffer at `sdp` and advance it.
    ///
    /// # Contract
    /// The caller has checked `descs_needed(addr) <= free_producer_slots()`.
    pub fn post(&mut self, addr: DmaAddr, len: u16, meta: u16) -> Posted {
        let ext_slot = if self.needs_addr_ext(addr) {
            let slot = self.sdp;
            self.descs.write(slot, NdpDesc::addr_ext(addr).raw());
            self.advance_producer(1);
            self.last_upper = Some(addr.upper());
            Some(slot)
        } else {
            None
        };
        let data_slot = self.sdp;
        self.descs.write(data_slot, NdpDesc::data(addr, len, meta, false).raw());
        self.advance_producer(1);
        Posted { ext_slot, data_slot }
    }

    /// Header at position `pos` of the header ring.
    pub fn header(&self, pos: u32) -> NdpHdr {
        match &self.headers {
            Some(h) => NdpHdr::from_raw(h.read(pos & self.mhp)),
            None => NdpHdr::default(),
        }
    }

    /// Descriptor word at `pos`.
    pub fn descriptor(&self, pos: u32) -> NdpDesc {
        NdpDesc::from_raw(self.descs.read(pos & self.mdp))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Hardware visibility
    // ═══════════════════════════════════════════════════════════════════

    /// Publish `sdp` after the descriptors it covers.
    pub fn flush_producer(&self, ctrl: &dyn NdpController) {
        fence(Ordering::Release);
        ctrl.flush_sdp(self.sdp);
    }

    /// Publish both `sdp` and `shp`; used after an RX processing pass.
    pub fn flush_consumer(&self, ctrl: &dyn NdpController) {
        fence(Ordering::Release);
        ctrl.flush_sdp(self.sdp);
        ctrl.flush_shp(self.shp);
    }
}

fn check_pow2(n: u32) -> Result<(), RingError> {
    if n >= 2 && n.is_power_of_two() {
        Ok(())
    } else {
        Err(RingError::NotPowerOfTwo(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndp::DescKind;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert_eq!(DescriptorRing::new(12, None).unwrap_err(), RingError::NotPowerOfTwo(12));
        assert_eq!(
            DescriptorRing::new(16, Some(0)).unwrap_err(),
            RingError::NotPowerOfTwo(0)
        );
        assert!(DescriptorRing::new(16, Some(8)).is_ok());
    }

    #[test]
    fn test_empty_ring_has_capacity_minus_one() {
        let ring = DescriptorRing::new(8, Some(8)).unwrap();
        assert_eq!(ring.free_producer_slots(), 7);
        assert_eq!(ring.free_consumer_slots(), 7);
        assert_eq!(ring.ready_headers(), 0);
    }

    #[test]
    fn test_first_post_emits_addr_ext() {
        let mut ring = DescriptorRing::new(8, None).unwrap();
        let addr = DmaAddr::new(0x4000_1000);
        assert_eq!(ring.descs_needed(addr), 2);
        let posted = ring.post(addr, 64, 0);
        assert_eq!(posted, Posted { ext_slot: Some(0), data_slot: 1 });
        assert_eq!(ring.descriptor(0).kind(), DescKind::AddrExt);
        assert_eq!(ring.descriptor(1).kind(), DescKind::Data);

        // Same upper bits: one descriptor.
        let posted = ring.post(addr.offset(4096), 64, 0);
        assert_eq!(posted, Posted { ext_slot: None, data_slot: 2 });
        assert_eq!(ring.sdp(), 3);
        assert_eq!(ring.free_producer_slots(), 4);
    }

    #[test]
    fn test_cursors_wrap() {
        let mut ring = DescriptorRing::new(4, Some(4)).unwrap();
        ring.advance_producer(3);
        ring.release_descriptors_to(3);
        ring.advance_producer(2);
        assert_eq!(ring.sdp(), 1);
        assert_eq!(ring.in_flight_descriptors(), 2);
        assert_eq!(ring.free_producer_slots(), 1);
    }

    #[test]
    fn test_refresh_reads_shadow_only() {
        let mut ring = DescriptorRing::new(8, Some(8)).unwrap();
        ring.advance_producer(5);
        ring.refresh_hardware_cursors();
        assert_eq!(ring.hdp(), 0);
        ring.registration().shadow.publish(3, 2);
        ring.refresh_hardware_cursors();
        assert_eq!(ring.hdp(), 3);
        assert_eq!(ring.hhp(), 2);
    }

    #[test]
    fn test_reset_forgets_upper_bits() {
        let mut ring = DescriptorRing::new(8, None).unwrap();
        let addr = DmaAddr::new(0x1000);
        ring.post(addr, 64, 0);
        assert!(!ring.needs_addr_ext(addr));
        ring.reset();
        assert!(ring.needs_addr_ext(addr));
        assert_eq!(ring.sdp(), 0);
    }
}
