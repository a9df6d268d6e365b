//! Device-visible address value type.

use core::fmt;

/// Number of low address bits carried inside a data descriptor.
///
/// Everything above this shift has to be announced to the controller with an
/// address-extension descriptor first.
pub const UPPER_ADDR_SHIFT: u32 = 30;

const LOWER_MASK: u64 = (1 << UPPER_ADDR_SHIFT) - 1;

/// Bus address of a DMA-mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DmaAddr(u64);

impl DmaAddr {
    /// Wrap a raw bus address.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw bus address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Upper address bits, as compared against the ring's cached value.
    #[inline]
    pub const fn upper(self) -> u64 {
        self.0 & !LOWER_MASK
    }

    /// Low bits encoded directly in a data descriptor.
    #[inline]
    pub const fn lower(self) -> u32 {
        (self.0 & LOWER_MASK) as u32
    }

    /// Address `bytes` further into the same mapping.
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for DmaAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
