use std::sync::atomic::{AtomicBool, Ordering};

/// Raised once when a server stops listening.
///
/// Every server-side wait polls it, so raising it unblocks the listener and
/// all workers within one poll interval.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    raised: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}
