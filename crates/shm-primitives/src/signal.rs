//! Auto-reset binary signals.
//!
//! [`SignalState`] is the shared word and its state machine; [`Signal`] places
//! one inside its own named segment so another process can open it by name.

use std::io;
use std::time::{Duration, Instant};

use crate::futex;
use crate::sync::{AtomicU32, Ordering};

/// How often a wait re-checks its cancellation condition.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

const CLEAR: u32 = 0;
const SET: u32 = 1;

/// Outcome of a signal wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The signal fired and this waiter consumed it.
    Signaled,
    /// The cancellation condition became true first.
    Cancelled,
    TimedOut,
}

/// A binary signal word: set by one side, consumed by exactly one waiter.
#[repr(transparent)]
pub struct SignalState {
    word: AtomicU32,
}

impl SignalState {
    pub fn new(set: bool) -> Self {
        Self {
            word: AtomicU32::new(if set { SET } else { CLEAR }),
        }
    }

    /// Raise the signal, waking one waiter. Raising a raised signal is a no-op.
    pub fn set(&self) {
        if self.word.swap(SET, Ordering::AcqRel) == CLEAR {
            futex::wake(&self.word, 1);
        }
    }

    pub fn reset(&self) {
        self.word.store(CLEAR, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.word.load(Ordering::Acquire) == SET
    }

    /// Consume the signal if it is raised.
    pub fn try_take(&self) -> bool {
        self.word
            .compare_exchange(SET, CLEAR, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wait up to `timeout` for the signal. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        Ok(self.wait_inner(timeout, timeout, || false)? == Wait::Signaled)
    }

    /// Wait up to `timeout` for the signal while polling `cancelled` every
    /// [`CANCEL_POLL_INTERVAL`].
    ///
    /// A raised signal wins over a simultaneously true cancellation.
    pub fn wait_or(&self, timeout: Duration, cancelled: impl FnMut() -> bool) -> io::Result<Wait> {
        self.wait_inner(timeout, CANCEL_POLL_INTERVAL, cancelled)
    }

    fn wait_inner(
        &self,
        timeout: Duration,
        slice: Duration,
        mut cancelled: impl FnMut() -> bool,
    ) -> io::Result<Wait> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_take() {
                return Ok(Wait::Signaled);
            }
            if cancelled() {
                return Ok(Wait::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Wait::TimedOut);
            }
            futex::wait(&self.word, CLEAR, (deadline - now).min(slice))?;
        }
    }
}

impl std::fmt::Debug for SignalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalState")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Size of the segment backing one named signal.
#[cfg(not(feature = "loom"))]
const SIGNAL_SEGMENT_LEN: usize = 64;

/// A named [`SignalState`] shared between processes.
#[cfg(not(feature = "loom"))]
#[derive(Debug)]
pub struct Signal {
    segment: crate::Segment,
}

#[cfg(not(feature = "loom"))]
impl Signal {
    /// Create the named signal with the given initial state.
    pub fn create(name: &str, initially_set: bool) -> io::Result<Self> {
        let segment = crate::Segment::create(name, SIGNAL_SEGMENT_LEN)?;
        let signal = Self { segment };
        if initially_set {
            signal.state().set();
        }
        Ok(signal)
    }

    /// Open a signal created by another handle.
    pub fn open(name: &str) -> io::Result<Self> {
        let segment = crate::Segment::open(name)?;
        if segment.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{name} is too small to hold a signal"),
            ));
        }
        Ok(Self { segment })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    fn state(&self) -> &SignalState {
        // SAFETY: SignalState is a transparent wrapper around the AtomicU32 at
        // offset 0, which lives as long as the segment.
        unsafe { &*(self.segment.word(0) as *const AtomicU32 as *const SignalState) }
    }

    pub fn set(&self) {
        self.state().set();
    }

    pub fn reset(&self) {
        self.state().reset();
    }

    pub fn is_set(&self) -> bool {
        self.state().is_set()
    }

    pub fn try_take(&self) -> bool {
        self.state().try_take()
    }

    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        self.state().wait(timeout)
    }

    pub fn wait_or(&self, timeout: Duration, cancelled: impl FnMut() -> bool) -> io::Result<Wait> {
        self.state().wait_or(timeout, cancelled)
    }
}
