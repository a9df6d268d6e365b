//! NDP descriptor ring: wire formats and cursor bookkeeping.
//!
//! The ring itself knows nothing about buffers. Queue controllers in
//! [`crate::ctrl`] pair every descriptor or header slot with the buffer that
//! backs it.

pub mod desc;
pub mod ring;

pub use desc::{DescKind, NdpDesc, NdpHdr};
pub use ring::{DescriptorRing, Posted};
