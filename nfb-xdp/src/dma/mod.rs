//! DMA address values and memory shared with the NDP controller.
//!
//! Device addresses never travel as raw pointers: they are wrapped in
//! [`DmaAddr`] so that the upper/lower split used by the descriptor format
//! stays in one place.

pub mod addr;
pub mod region;

pub use addr::{DmaAddr, UPPER_ADDR_SHIFT};
pub use region::{DescTable, HeaderTable, RingRegistration, ShadowPointers};
