//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nfb_xdp::buffer::{StackFrame, XdpBuff};
use nfb_xdp::error::RedirectFailed;
use nfb_xdp::hal::loopback::{HeapPageAllocator, LoopbackNdp};
use nfb_xdp::hal::XskDesc;
use nfb_xdp::xdp::{NoRedirect, RedirectSink, StackSink, XdpEnv};
use nfb_xdp::{Channel, ChannelConfig};

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_micros(200));
    }
}

/// Stack sink recording `(len, queue)` of every delivered frame.
#[derive(Default)]
pub struct CollectStack(pub spin::Mutex<Vec<(usize, u16)>>);

impl StackSink for CollectStack {
    fn deliver(&self, frame: StackFrame, queue: u16) {
        self.0.lock().push((frame.len(), queue));
    }
}

/// Redirect sink playing an AF_XDP socket: keeps zero-copy frames, refuses
/// page buffers.
#[derive(Default)]
pub struct SocketSink {
    pub rx: spin::Mutex<Vec<XskDesc>>,
    pub flushes: spin::Mutex<u32>,
}

impl RedirectSink for SocketSink {
    fn redirect(&self, buff: XdpBuff) -> Result<(), RedirectFailed> {
        match buff.into_xsk_desc() {
            Ok(desc) => {
                self.rx.lock().push(desc);
                Ok(())
            }
            Err(buff) => Err(RedirectFailed { buff, reason: "not a zero-copy frame" }),
        }
    }

    fn flush(&self) {
        *self.flushes.lock() += 1;
    }
}

pub struct Rig {
    pub hw: Arc<LoopbackNdp>,
    pub alloc: Arc<HeapPageAllocator>,
    pub stack: Arc<CollectStack>,
    pub env: Arc<XdpEnv>,
    pub channel: Channel,
}

/// Single-channel card on queue 0 with a small ring configuration.
pub fn rig(config: ChannelConfig) -> Rig {
    rig_with_redirect(config, Arc::new(NoRedirect))
}

pub fn rig_with_redirect(config: ChannelConfig, redirect: Arc<dyn RedirectSink>) -> Rig {
    let hw = Arc::new(LoopbackNdp::new(1, 1));
    let alloc = Arc::new(HeapPageAllocator::new(1024));
    let stack = Arc::new(CollectStack::default());
    let env = Arc::new(XdpEnv::new(stack.clone(), redirect));
    let channel = Channel::new(0, 0, "nfb0p0", hw.clone(), alloc.clone(), env.clone(), config);
    Rig { hw, alloc, stack, env, channel }
}
