//! Small helpers shared across the driver.

pub mod ratelimit;

pub use ratelimit::RateLimiter;

/// Round `n` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
