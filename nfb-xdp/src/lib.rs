//! nfb-xdp
//!
//! XDP / AF_XDP channel driver core for NDP DMA rings.
//!
//! ```text
//!   RX poller ─ fill ─> DescriptorRing ─> hardware ─> drain ─> Dispatcher
//!                 ▲                                             │
//!            BufferSource <──── release ──── stack / drop / redirect
//!                 ▲                                             │ Tx
//!                 └──── reclaim ──── TxQueue <──────────────────┘
//! ```
//!
//! Hardware is reached only through the traits in [`hal`];
//! [`hal::loopback`] provides an in-process device for tests.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod ctrl;
pub mod device;
pub mod dma;
pub mod error;
pub mod hal;
pub mod ndp;
pub mod stats;
pub mod util;
pub mod xdp;

pub use buffer::{BufferSource, PagePool, StackFrame, XdpBuff, ZeroCopySource};
pub use channel::{Channel, ChannelMode, XskBinding};
pub use config::{ChannelConfig, StopOrder};
pub use device::{EthdevConfig, NfbXdp, QueueMapping};
pub use error::{ChannelError, DeviceError, HwError, QueueError};
pub use xdp::{LoadedProgram, XdpAction, XdpProgram};
