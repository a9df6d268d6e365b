//! Per-burst verdict routing.
//!
//! The program is loaded once per burst. Every buffer ends up in exactly one
//! place: the stack, the paired TX ring, the redirect sink, or dropped back
//! to its source.

use std::sync::Arc;

use log::{info, warn};

use crate::buffer::XdpBuff;
use crate::ctrl::TxQueue;
use crate::error::{RedirectFailed, TxBusy};
use crate::stats::QueueStats;
use crate::util::RateLimiter;

use super::{XdpAction, XdpEnv};

/// Verdict counts of one burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstSummary {
    pub pass: u32,
    pub tx: u32,
    pub redirect: u32,
    pub drop: u32,
    pub aborted: u32,
}

/// Routes drained RX buffers according to the attached program.
pub struct Dispatcher {
    queue: u16,
    env: Arc<XdpEnv>,
    tx: Arc<TxQueue>,
    stats: Arc<QueueStats>,
    aborted_log: RateLimiter,
    redirect_log: RateLimiter,
}

impl Dispatcher {
    /// `queue` is the ingress queue index reported with passed frames.
    pub fn new(queue: u16, env: Arc<XdpEnv>, tx: Arc<TxQueue>, stats: Arc<QueueStats>) -> Self {
        Self {
            queue,
            env,
            tx,
            stats,
            aborted_log: RateLimiter::default(),
            redirect_log: RateLimiter::default(),
        }
    }

    /// Run the program over `burst`, emptying it.
    pub fn run(&mut self, burst: &mut Vec<XdpBuff>) -> BurstSummary {
        let mut summary = BurstSummary::default();
        if burst.is_empty() {
            return summary;
        }
        let prog = self.env.program.load();
        for mut buff in burst.drain(..) {
            let action = match &prog {
                Some(prog) => prog.run(&mut buff),
                None => XdpAction::Pass,
            };
            self.apply(action, buff, &mut summary);
        }
        if summary.redirect > 0 {
            self.env.redirect.flush();
        }

        let stats = &self.stats;
        QueueStats::add(&stats.xdp_pass, summary.pass as u64);
        QueueStats::add(&stats.xdp_tx, summary.tx as u64);
        QueueStats::add(&stats.xdp_redirect, summary.redirect as u64);
        QueueStats::add(&stats.xdp_drop, summary.drop as u64);
        QueueStats::add(&stats.xdp_aborted, summary.aborted as u64);
        summary
    }

    fn apply(&mut self, action: XdpAction, buff: XdpBuff, summary: &mut BurstSummary) {
        match action {
            XdpAction::Pass => match buff.into_stack_frame(self.queue) {
                Ok(frame) => {
                    self.env.stack.deliver(frame, self.queue);
                    summary.pass += 1;
                }
                Err(buff) => self.abort(buff, "stack frame conversion failed", summary),
            },
            XdpAction::Tx => match self.tx.enqueue(buff) {
                Ok(()) => summary.tx += 1,
                Err(TxBusy(buff)) => {
                    drop(buff);
                    summary.drop += 1;
                }
            },
            XdpAction::Redirect => match self.env.redirect.redirect(buff) {
                Ok(()) => summary.redirect += 1,
                Err(RedirectFailed { buff, reason }) => {
                    drop(buff);
                    QueueStats::inc(&self.stats.redirect_errors);
                    summary.drop += 1;
                    if let Some(suppressed) = self.redirect_log.check() {
                        info!("rx queue {}: redirect failed: {reason} ({suppressed} suppressed)", self.queue);
                    }
                }
            },
            XdpAction::Drop => {
                drop(buff);
                summary.drop += 1;
            }
            XdpAction::Aborted => self.abort(buff, "program aborted", summary),
        }
    }

    fn abort(&mut self, buff: XdpBuff, why: &str, summary: &mut BurstSummary) {
        drop(buff);
        summary.aborted += 1;
        if let Some(suppressed) = self.aborted_log.check() {
            warn!("rx queue {}: {why} ({suppressed} suppressed)", self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSource, PagePool, StackFrame};
    use crate::config::ChannelConfig;
    use crate::hal::loopback::{HeapPageAllocator, LoopbackNdp};
    use crate::hal::QueueDir;
    use crate::xdp::{LoadedProgram, NoRedirect, StackSink};

    #[derive(Default)]
    struct Collect(spin::Mutex<Vec<(usize, u16)>>);

    impl StackSink for Collect {
        fn deliver(&self, frame: StackFrame, queue: u16) {
            self.0.lock().push((frame.len(), queue));
        }
    }

    struct Fixture {
        dev: LoopbackNdp,
        pool: PagePool,
        stack: Arc<Collect>,
        env: Arc<XdpEnv>,
        dispatcher: Dispatcher,
    }

    fn fixture(tx_ring: u32) -> Fixture {
        let dev = LoopbackNdp::new(1, 1);
        let config = ChannelConfig { desc_count: tx_ring, fill_batch: 2, ..ChannelConfig::compact() };
        let tx = Arc::new(TxQueue::open(&dev, 0, &config, Arc::default()).unwrap());
        tx.start().unwrap();
        let stack = Arc::new(Collect::default());
        let env = Arc::new(XdpEnv::new(stack.clone(), Arc::new(NoRedirect)));
        let dispatcher = Dispatcher::new(5, env.clone(), tx, Arc::default());
        let pool = PagePool::new(Arc::new(HeapPageAllocator::new(64)), 64);
        Fixture { dev, pool, stack, env, dispatcher }
    }

    fn burst(pool: &PagePool, n: usize) -> Vec<XdpBuff> {
        (0..n)
            .map(|i| {
                let mut b = pool.allocate().unwrap();
                b.set_len(64 + i);
                b
            })
            .collect()
    }

    #[test]
    fn test_no_program_passes_everything() {
        let mut fx = fixture(8);
        let mut b = burst(&fx.pool, 3);
        let summary = fx.dispatcher.run(&mut b);
        assert_eq!(summary.pass, 3);
        assert!(b.is_empty());
        assert_eq!(*fx.stack.0.lock(), vec![(64, 5), (65, 5), (66, 5)]);
        assert_eq!(fx.pool.outstanding(), 0);
    }

    #[test]
    fn test_every_verdict_releases_once() {
        let mut fx = fixture(4);
        fx.env.program.swap(Some(LoadedProgram::new("mixed", |b: &mut XdpBuff| {
            XdpAction::from_raw((b.len() - 64) as u32 % 6)
        })));
        // lens 64..76 map to raw codes 0..5, twice over.
        let mut b = burst(&fx.pool, 12);
        let summary = fx.dispatcher.run(&mut b);
        assert_eq!(summary.aborted, 2 + 2);
        assert_eq!(summary.pass, 2);
        // Failed redirects count as drops.
        assert_eq!(summary.tx, 2);
        assert_eq!(summary.drop, 2 + 2);
        assert_eq!(summary.redirect, 0);

        let tx_hw = fx.dev.queue(QueueDir::Tx, 0).unwrap();
        assert_eq!(fx.pool.outstanding(), 2);
        let mut more = burst(&fx.pool, 4);
        // The ring is full now: the Tx verdict (len 67) is dropped.
        let summary = fx.dispatcher.run(&mut more);
        assert_eq!(summary.tx, 0);
        assert_eq!(fx.dispatcher.tx.in_flight(), 2);
        tx_hw.transmit(8);
        fx.dispatcher.tx.reclaim();
        assert_eq!(fx.pool.outstanding(), 0);
    }

    #[test]
    fn test_conversion_failure_counts_as_aborted() {
        let mut fx = fixture(8);
        fx.env.program.swap(Some(LoadedProgram::new("shrink_headroom", |b: &mut XdpBuff| {
            b.adjust_head(-250);
            XdpAction::Pass
        })));
        let mut b = burst(&fx.pool, 1);
        let summary = fx.dispatcher.run(&mut b);
        assert_eq!(summary.aborted, 1);
        assert!(fx.stack.0.lock().is_empty());
        assert_eq!(fx.pool.outstanding(), 0);
    }
}
