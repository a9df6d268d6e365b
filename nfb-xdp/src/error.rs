//! Error types, one enum per layer.
//!
//! Per-packet conditions never show up here as fatal errors: a full TX ring
//! hands the frame back in [`TxBusy`], a failed redirect hands it back in
//! [`RedirectFailed`], and an empty buffer source is reported as
//! [`Exhausted`]. Everything else propagates to the caller of a channel
//! transition.

use thiserror::Error;

use crate::buffer::XdpBuff;
use crate::hal::QueueDir;

/// Descriptor ring construction errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring size {0} is not a power of two")]
    NotPowerOfTwo(u32),
}

/// Errors reported by the hardware abstraction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// The device has no such queue.
    #[error("{dir} queue {index} does not exist")]
    NoSuchQueue { dir: QueueDir, index: u16 },
    /// The queue is already opened by someone else.
    #[error("{dir} queue {index} is in use")]
    QueueBusy { dir: QueueDir, index: u16 },
    /// Stop was requested but the controller still has work in flight.
    #[error("stop in progress")]
    StopInProgress,
    /// Anything else the controller reports.
    #[error("controller failure: {0}")]
    Controller(String),
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error("fill batch must be non-zero")]
    ZeroBatch,
    #[error("fill batch {batch} does not fit a ring of {ring}")]
    BatchTooLarge { batch: u32, ring: u32 },
    #[error("poll budget must be non-zero")]
    ZeroBudget,
    #[error("stop retry bound must be non-zero")]
    ZeroStopRetries,
}

/// Queue controller open/start failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("hardware: {0}")]
    Hw(#[from] HwError),
    #[error("buffer source frame length {frame_len} exceeds descriptor limit")]
    FrameTooLarge { frame_len: usize },
}

/// Channel transition failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel already running")]
    AlreadyRunning,
    #[error("channel not running")]
    NotRunning,
    #[error("zero-copy mode requested without an attached pool")]
    NoXskPool,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn poller thread")]
    Spawn(#[source] std::io::Error),
}

/// Device and control plane failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("RX queue count {rx} differs from TX queue count {tx}")]
    QueueCountMismatch { rx: u16, tx: u16 },
    #[error("{requested} channels requested, device has {available}")]
    TooManyChannels { requested: u32, available: u16 },
    #[error("no channel with queue index {0}")]
    NoSuchChannel(u16),
    #[error("no ethdev with index {0}")]
    NoSuchEthdev(usize),
    #[error("no queues selected")]
    NoQueues,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("channel {index}: {source}")]
    Channel {
        index: u16,
        #[source]
        source: ChannelError,
    },
}

/// The buffer source has nothing to hand out right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer source exhausted")]
pub struct Exhausted;

/// TX ring full; the frame is handed back to the caller.
#[derive(Debug, Error)]
#[error("TX ring full")]
pub struct TxBusy(pub XdpBuff);

/// A redirect target refused the frame and handed it back.
#[derive(Debug, Error)]
#[error("redirect failed: {reason}")]
pub struct RedirectFailed {
    pub buff: XdpBuff,
    pub reason: &'static str,
}
