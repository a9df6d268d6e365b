//! Card-level control plane: interfaces, their channels, queue mapping.
//!
//! ```text
//!   NfbXdp ── hw queues 0..N
//!     ├── Ethdev "nfb0p0"  channel_offset 0  channels 0,1
//!     └── Ethdev "nfb0p1"  channel_offset 2  channels 2,3
//! ```
//! Card-wide queue index = `channel_offset + eth_qid`.

use std::sync::Arc;

use log::{info, warn};

use crate::channel::{Channel, ChannelMode};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, DeviceError};
use crate::hal::{NdpDevice, PageAllocator};
use crate::xdp::{LoadedProgram, RedirectSink, StackSink, XdpEnv};

/// Requested layout of one interface.
pub struct EthdevConfig {
    pub ifname: String,
    pub channel_count: u16,
    pub stack: Arc<dyn StackSink>,
    pub redirect: Arc<dyn RedirectSink>,
}

/// One network interface backed by a contiguous run of DMA queues.
pub struct Ethdev {
    index: usize,
    ifname: String,
    channel_offset: u16,
    channels: Vec<Channel>,
    env: Arc<XdpEnv>,
}

impl Ethdev {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    pub fn channel_offset(&self) -> u16 {
        self.channel_offset
    }

    /// Channel by interface queue id.
    pub fn channel(&self, eth_qid: u16) -> Option<&Channel> {
        self.channels.get(eth_qid as usize)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Attach (or detach with `None`) the interface program. Running pollers
    /// pick it up on their next burst. Returns the previous program's name.
    pub fn set_program(&self, prog: Option<LoadedProgram>) -> Option<String> {
        let name = prog.as_ref().map(|p| p.name().to_owned());
        let prev = self.env.program.swap(prog);
        info!(
            "{}: program {} (was {})",
            self.ifname,
            name.as_deref().unwrap_or("detached"),
            prev.as_ref().map_or("none", |p| p.name())
        );
        prev.map(|p| p.name().to_owned())
    }

    fn contains(&self, nfb_qid: u16) -> bool {
        nfb_qid >= self.channel_offset && nfb_qid - self.channel_offset < self.channel_count()
    }
}

/// One queue selected by [`NfbXdp::map_queues`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMapping {
    pub ifname: String,
    pub eth_qid: u16,
    pub nfb_qid: u16,
}

/// A card with its interfaces.
pub struct NfbXdp {
    hw: Arc<dyn NdpDevice>,
    ethdevs: Vec<Ethdev>,
}

impl NfbXdp {
    /// Build the interfaces in order, assigning consecutive queue ranges.
    ///
    /// # Errors
    /// `TooManyChannels` when the interfaces need more channels than the
    /// card has RX/TX queue pairs; `Config` on an invalid `config`.
    pub fn attach(
        hw: Arc<dyn NdpDevice>,
        allocator: Arc<dyn PageAllocator>,
        ethdevs: Vec<EthdevConfig>,
        config: ChannelConfig,
    ) -> Result<Self, DeviceError> {
        config.validate()?;
        let available = hw.rx_queue_count().min(hw.tx_queue_count());
        let requested: u32 = ethdevs.iter().map(|e| u32::from(e.channel_count)).sum();
        if requested > u32::from(available) {
            return Err(DeviceError::TooManyChannels { requested, available });
        }

        let mut offset = 0u16;
        let ethdevs = ethdevs
            .into_iter()
            .enumerate()
            .map(|(index, cfg)| {
                let env = Arc::new(XdpEnv::new(cfg.stack, cfg.redirect));
                let channels = (0..cfg.channel_count)
                    .map(|qid| {
                        Channel::new(
                            qid,
                            offset + qid,
                            cfg.ifname.clone(),
                            Arc::clone(&hw),
                            Arc::clone(&allocator),
                            Arc::clone(&env),
                            config,
                        )
                    })
                    .collect();
                let ethdev = Ethdev { index, ifname: cfg.ifname, channel_offset: offset, channels, env };
                offset += cfg.channel_count;
                info!(
                    "{}: {} channels at queue offset {}",
                    ethdev.ifname,
                    ethdev.channel_count(),
                    ethdev.channel_offset
                );
                ethdev
            })
            .collect();

        Ok(Self { hw, ethdevs })
    }

    pub fn ethdev_count(&self) -> usize {
        self.ethdevs.len()
    }

    pub fn ethdev(&self, index: usize) -> Result<&Ethdev, DeviceError> {
        self.ethdevs.get(index).ok_or(DeviceError::NoSuchEthdev(index))
    }

    pub fn ethdevs(&self) -> impl Iterator<Item = &Ethdev> {
        self.ethdevs.iter()
    }

    /// Queue pairs on the card. Fails when RX and TX counts differ.
    pub fn channel_total(&self) -> Result<u16, DeviceError> {
        let (rx, tx) = (self.hw.rx_queue_count(), self.hw.tx_queue_count());
        if rx != tx {
            return Err(DeviceError::QueueCountMismatch { rx, tx });
        }
        Ok(rx)
    }

    /// Channel by card-wide queue index.
    pub fn channel(&self, nfb_qid: u16) -> Result<&Channel, DeviceError> {
        self.ethdevs
            .iter()
            .find(|e| e.contains(nfb_qid))
            .and_then(|e| e.channel(nfb_qid - e.channel_offset))
            .ok_or(DeviceError::NoSuchChannel(nfb_qid))
    }

    pub fn start_channel(&self, nfb_qid: u16, mode: ChannelMode) -> Result<(), DeviceError> {
        self.channel(nfb_qid)?
            .start(mode)
            .map_err(|source| DeviceError::Channel { index: nfb_qid, source })
    }

    pub fn stop_channel(&self, nfb_qid: u16) -> Result<(), DeviceError> {
        self.channel(nfb_qid)?
            .stop()
            .map_err(|source| DeviceError::Channel { index: nfb_qid, source })
    }

    /// Resolve card-wide queue ids. An empty `selection` means every
    /// channel; otherwise ids are sorted, deduplicated and ids outside every
    /// interface skipped.
    pub fn map_queues(&self, selection: &[u16]) -> Result<Vec<QueueMapping>, DeviceError> {
        let mapping = |ethdev: &Ethdev, eth_qid: u16| QueueMapping {
            ifname: ethdev.ifname.clone(),
            eth_qid,
            nfb_qid: ethdev.channel_offset + eth_qid,
        };

        let out: Vec<QueueMapping> = if selection.is_empty() {
            self.ethdevs
                .iter()
                .flat_map(|e| (0..e.channel_count()).map(move |qid| mapping(e, qid)))
                .collect()
        } else {
            let mut ids = selection.to_vec();
            ids.sort_unstable();
            ids.dedup();
            ids.into_iter()
                .filter_map(|nfb_qid| {
                    let ethdev = self.ethdevs.iter().find(|e| e.contains(nfb_qid))?;
                    Some(mapping(ethdev, nfb_qid - ethdev.channel_offset))
                })
                .collect()
        };

        if out.is_empty() {
            return Err(DeviceError::NoQueues);
        }
        Ok(out)
    }

    /// Stop every running channel. Channels that are not running are
    /// skipped; any other failure is logged and the sweep continues.
    pub fn stop_all(&self) {
        for channel in self.ethdevs.iter().flat_map(|e| e.channels.iter()) {
            match channel.stop() {
                Ok(()) | Err(ChannelError::NotRunning) => {}
                Err(e) => warn!("{}: stop failed: {e}", channel.thread_name()),
            }
        }
    }
}
