//! Verdict programs and the sinks their verdicts route frames to.

pub mod dispatch;

use core::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::buffer::{StackFrame, XdpBuff};
use crate::error::RedirectFailed;

pub use dispatch::Dispatcher;

/// Verdict returned by a program.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpAction {
    Aborted = 0,
    Drop = 1,
    Pass = 2,
    Tx = 3,
    Redirect = 4,
}

impl XdpAction {
    /// Convert a raw verdict code; unknown codes abort.
    pub const fn from_raw(val: u32) -> Self {
        match val {
            1 => XdpAction::Drop,
            2 => XdpAction::Pass,
            3 => XdpAction::Tx,
            4 => XdpAction::Redirect,
            _ => XdpAction::Aborted,
        }
    }
}

impl From<u32> for XdpAction {
    fn from(val: u32) -> Self {
        Self::from_raw(val)
    }
}

/// A packet-processing program.
///
/// Programs may rewrite the buffer (data, head adjustment, length) before
/// returning their verdict.
pub trait XdpProgram: Send + Sync {
    fn run(&self, buff: &mut XdpBuff) -> XdpAction;
}

impl<F> XdpProgram for F
where
    F: Fn(&mut XdpBuff) -> XdpAction + Send + Sync,
{
    fn run(&self, buff: &mut XdpBuff) -> XdpAction {
        self(buff)
    }
}

/// An attached program with a name for diagnostics.
pub struct LoadedProgram {
    name: String,
    prog: Box<dyn XdpProgram>,
}

impl LoadedProgram {
    pub fn new(name: impl Into<String>, prog: impl XdpProgram + 'static) -> Self {
        Self { name: name.into(), prog: Box::new(prog) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn run(&self, buff: &mut XdpBuff) -> XdpAction {
        self.prog.run(buff)
    }
}

impl fmt::Debug for LoadedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedProgram").field("name", &self.name).finish()
    }
}

/// Program attachment point, swapped by the control plane and read once per
/// burst by every poller of the interface.
pub struct ProgramSlot(ArcSwapOption<LoadedProgram>);

impl ProgramSlot {
    pub fn new() -> Self {
        Self(ArcSwapOption::empty())
    }

    /// Attach `prog` (or detach with `None`); returns the previous program.
    pub fn swap(&self, prog: Option<LoadedProgram>) -> Option<Arc<LoadedProgram>> {
        self.0.swap(prog.map(Arc::new))
    }

    pub fn load(&self) -> Option<Arc<LoadedProgram>> {
        self.0.load_full()
    }

    pub fn is_attached(&self) -> bool {
        self.0.load().is_some()
    }
}

impl Default for ProgramSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Network stack entry point for passed frames.
pub trait StackSink: Send + Sync {
    fn deliver(&self, frame: StackFrame, queue: u16);
}

/// Redirect target (device map, socket map, CPU map).
pub trait RedirectSink: Send + Sync {
    /// Take ownership of a frame, or hand it back on failure.
    fn redirect(&self, buff: XdpBuff) -> Result<(), RedirectFailed>;

    /// Push out frames batched during the burst.
    fn flush(&self) {}
}

/// Redirect sink for interfaces with no redirect target.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRedirect;

impl RedirectSink for NoRedirect {
    fn redirect(&self, buff: XdpBuff) -> Result<(), RedirectFailed> {
        Err(RedirectFailed { buff, reason: "no redirect target" })
    }
}

/// Stack sink that drops every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardStack;

impl StackSink for DiscardStack {
    fn deliver(&self, frame: StackFrame, _queue: u16) {
        drop(frame);
    }
}

/// Everything the dispatchers of one interface share.
pub struct XdpEnv {
    pub program: ProgramSlot,
    pub stack: Arc<dyn StackSink>,
    pub redirect: Arc<dyn RedirectSink>,
}

impl XdpEnv {
    pub fn new(stack: Arc<dyn StackSink>, redirect: Arc<dyn RedirectSink>) -> Self {
        Self { program: ProgramSlot::new(), stack, redirect }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_maps_unknown_to_aborted() {
        assert_eq!(XdpAction::from_raw(2), XdpAction::Pass);
        assert_eq!(XdpAction::from_raw(4), XdpAction::Redirect);
        assert_eq!(XdpAction::from_raw(0), XdpAction::Aborted);
        assert_eq!(XdpAction::from(77), XdpAction::Aborted);
        assert_eq!(XdpAction::Tx as u32, 3);
    }

    #[test]
    fn test_program_slot_swap() {
        let slot = ProgramSlot::new();
        assert!(slot.load().is_none());
        let prev = slot.swap(Some(LoadedProgram::new("drop_all", |_: &mut XdpBuff| XdpAction::Drop)));
        assert!(prev.is_none());
        let held = slot.load().unwrap();
        assert_eq!(held.name(), "drop_all");
        let prev = slot.swap(None).unwrap();
        assert_eq!(prev.name(), "drop_all");
        // The old program stays usable by whoever loaded it.
        assert_eq!(held.name(), "drop_all");
        assert!(!slot.is_attached());
    }
}
