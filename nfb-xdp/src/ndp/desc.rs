//! NDP descriptor and header word formats.
//!
//! # Descriptor (64-bit)
//! ```text
//! type 0, address extension
//!   63:62  00
//!   33:0   addr >> 30
//!
//! type 2, data
//!   63:62  10
//!   61     next (frame continues in the following descriptor)
//!   59:48  meta
//!   47:32  length
//!   29:0   addr & 0x3FFF_FFFF
//! ```
//!
//! # RX header (32-bit)
//! ```text
//!   15:0   frame length
//!   23:16  header length
//!   27:24  metadata flags
//! ```

use crate::dma::{DmaAddr, UPPER_ADDR_SHIFT};

const TYPE_SHIFT: u32 = 62;
const TYPE_ADDR_EXT: u64 = 0b00;
const TYPE_DATA: u64 = 0b10;

const NEXT_BIT: u64 = 1 << 61;
const META_SHIFT: u32 = 48;
const META_MASK: u64 = 0xFFF;
const LEN_SHIFT: u32 = 32;
const LEN_MASK: u64 = 0xFFFF;
const ADDR_LO_MASK: u64 = (1 << UPPER_ADDR_SHIFT) - 1;
const ADDR_HI_MASK: u64 = (1 << 34) - 1;

/// Descriptor kind, decoded from bits 63:62.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescKind {
    /// Sets the upper address bits for the following data descriptors.
    AddrExt,
    /// Describes one DMA transfer.
    Data,
    /// Encodings this driver never produces.
    Reserved(u8),
}

/// One 64-bit NDP descriptor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NdpDesc(u64);

impl NdpDesc {
    /// Address-extension descriptor announcing the upper bits of `addr`.
    #[inline]
    pub const fn addr_ext(addr: DmaAddr) -> Self {
        Self((TYPE_ADDR_EXT << TYPE_SHIFT) | ((addr.as_u64() >> UPPER_ADDR_SHIFT) & ADDR_HI_MASK))
    }

    /// Data descriptor carrying the low address bits, length and metadata.
    #[inline]
    pub const fn data(addr: DmaAddr, len: u16, meta: u16, next: bool) -> Self {
        let mut raw = (TYPE_DATA << TYPE_SHIFT)
            | (((meta as u64) & META_MASK) << META_SHIFT)
            | ((len as u64) << LEN_SHIFT)
            | (addr.lower() as u64 & ADDR_LO_MASK);
        if next {
            raw |= NEXT_BIT;
        }
        Self(raw)
    }

    /// Wrap a raw word read back from a descriptor table.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw word as written to the descriptor table.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Decoded descriptor type.
    pub const fn kind(self) -> DescKind {
        match self.0 >> TYPE_SHIFT {
            TYPE_ADDR_EXT => DescKind::AddrExt,
            TYPE_DATA => DescKind::Data,
            other => DescKind::Reserved(other as u8),
        }
    }

    /// Transfer length of a data descriptor.
    pub const fn len(self) -> u16 {
        ((self.0 >> LEN_SHIFT) & LEN_MASK) as u16
    }

    /// Metadata field of a data descriptor.
    pub const fn meta(self) -> u16 {
        ((self.0 >> META_SHIFT) & META_MASK) as u16
    }

    /// Whether the frame continues in the next descriptor.
    pub const fn has_next(self) -> bool {
        self.0 & NEXT_BIT != 0
    }

    /// Low address bits of a data descriptor.
    pub const fn addr_lo(self) -> u32 {
        (self.0 & ADDR_LO_MASK) as u32
    }

    /// Upper address bits carried by an address-extension descriptor,
    /// already shifted back into place.
    pub const fn addr_hi(self) -> u64 {
        (self.0 & ADDR_HI_MASK) << UPPER_ADDR_SHIFT
    }
}

/// One 32-bit RX completion header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct NdpHdr(u32);

impl NdpHdr {
    /// Pack a header the way the controller writes it.
    pub const fn new(frame_len: u16, hdr_len: u8, meta: u8) -> Self {
        Self(frame_len as u32 | (hdr_len as u32) << 16 | ((meta & 0xF) as u32) << 24)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Received frame length in bytes.
    pub const fn frame_len(self) -> u16 {
        self.0 as u16
    }

    /// Length of the firmware-prepended header.
    pub const fn hdr_len(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Metadata flags.
    pub const fn meta(self) -> u8 {
        ((self.0 >> 24) & 0xF) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_descriptor_fields() {
        let addr = DmaAddr::new(0x2_4000_0100);
        let desc = NdpDesc::data(addr, 3520, 0x5, true);
        assert_eq!(desc.kind(), DescKind::Data);
        assert_eq!(desc.len(), 3520);
        assert_eq!(desc.meta(), 0x5);
        assert!(desc.has_next());
        assert_eq!(desc.addr_lo(), 0x100);
        assert_eq!(desc.raw() >> 62, 0b10);
    }

    #[test]
    fn test_addr_ext_restores_upper_bits() {
        let addr = DmaAddr::new(0x2_4000_0100);
        let ext = NdpDesc::addr_ext(addr);
        assert_eq!(ext.kind(), DescKind::AddrExt);
        assert_eq!(ext.addr_hi(), addr.upper());
        let data = NdpDesc::data(addr, 64, 0, false);
        assert_eq!(ext.addr_hi() | data.addr_lo() as u64, addr.as_u64());
    }

    #[test]
    fn test_meta_is_truncated_to_twelve_bits() {
        let desc = NdpDesc::data(DmaAddr::new(0), 1, 0xFFFF, false);
        assert_eq!(desc.meta(), 0xFFF);
        assert!(!desc.has_next());
        assert_eq!(desc.len(), 1);
    }

    #[test]
    fn test_header_layout() {
        let hdr = NdpHdr::new(1514, 16, 0x3);
        assert_eq!(hdr.raw(), 1514 | 16 << 16 | 0x3 << 24);
        assert_eq!(hdr.frame_len(), 1514);
        assert_eq!(hdr.hdr_len(), 16);
        assert_eq!(hdr.meta(), 0x3);
    }
}
