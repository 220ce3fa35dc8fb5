//! Signal latch: handlers only record, loops decide

use crate::{BrigError, Result};
use nix::sys::signal::Signal;
use signal_hook::SigId;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Records the last of a set of signals that was delivered
///
/// The installed handlers only store the signal number into an atomic.
/// Everything a signal should cause (forwarding, shutdown, diagnostics)
/// happens in whichever loop polls the latch.
#[derive(Debug)]
pub struct SignalLatch {
    raised: Arc<AtomicUsize>,
    ids: Vec<SigId>,
}

impl SignalLatch {
    /// Install handlers for `signals`
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let raised = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::with_capacity(signals.len());

        for &signal in signals {
            let number = signal as i32;
            let value = usize::try_from(number).unwrap_or(0);
            let id = signal_hook::flag::register_usize(number, Arc::clone(&raised), value)
                .map_err(|e| {
                    BrigError::Process(format!("failed to install {signal} handler: {e}"))
                })?;
            ids.push(id);
        }

        tracing::trace!(?signals, "signal latch installed");
        Ok(Self { raised, ids })
    }

    /// The most recent latched signal, if any
    #[must_use]
    pub fn raised(&self) -> Option<Signal> {
        match self.raised.load(Ordering::SeqCst) {
            0 => None,
            n => i32::try_from(n).ok().and_then(|n| Signal::try_from(n).ok()),
        }
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst) != 0
    }

    /// Forget a latched signal so the next one can be observed
    pub fn clear(&self) {
        self.raised.store(0, Ordering::SeqCst);
    }

    /// Remove the handlers
    ///
    /// Used by forked children so they stop reacting to signals the way
    /// their parent does.
    pub fn release(self) {
        for id in self.ids {
            signal_hook::low_level::unregister(id);
        }
    }
}
