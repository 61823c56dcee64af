//! Process-aware mutexes.
//!
//! The lock word holds the owning process id, or zero when free. A holder
//! whose process no longer exists is treated as having abandoned the lock,
//! and the next acquirer takes it over. Within one process every thread
//! shares the same id, so ownership is only meaningful through a guard.

#[cfg(not(feature = "loom"))]
use std::io;
#[cfg(not(feature = "loom"))]
use std::time::{Duration, Instant};

use crate::futex;
#[cfg(not(feature = "loom"))]
use crate::signal::CANCEL_POLL_INTERVAL;
use crate::sync::{AtomicU32, Ordering};

const FREE: u32 = 0;

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquire {
    Acquired,
    /// The previous owner died while holding the lock; it is ours now.
    Abandoned { previous: u32 },
    Busy { owner: u32 },
}

impl TryAcquire {
    pub fn is_acquired(self) -> bool {
        !matches!(self, TryAcquire::Busy { .. })
    }
}

/// The shared lock word and its transitions.
#[repr(transparent)]
pub struct LockState {
    owner: AtomicU32,
}

impl LockState {
    pub fn new() -> Self {
        Self {
            owner: AtomicU32::new(FREE),
        }
    }

    /// Try once to take the lock for `pid`, stealing it from an owner for
    /// which `alive` returns `false`.
    pub fn try_acquire(&self, pid: u32, alive: impl Fn(u32) -> bool) -> TryAcquire {
        let mut current = match self
            .owner
            .compare_exchange(FREE, pid, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => return TryAcquire::Acquired,
            Err(owner) => owner,
        };
        loop {
            if current == FREE {
                match self
                    .owner
                    .compare_exchange(FREE, pid, Ordering::Acquire, Ordering::Acquire)
                {
                    Ok(_) => return TryAcquire::Acquired,
                    Err(owner) => current = owner,
                }
                continue;
            }
            if alive(current) {
                return TryAcquire::Busy { owner: current };
            }
            match self
                .owner
                .compare_exchange(current, pid, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return TryAcquire::Abandoned { previous: current },
                Err(owner) => current = owner,
            }
        }
    }

    /// Release the lock if `pid` owns it. Returns whether it was released.
    pub fn release(&self, pid: u32) -> bool {
        let released = self
            .owner
            .compare_exchange(pid, FREE, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        if released {
            futex::wake(&self.owner, i32::MAX);
        }
        released
    }

    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            FREE => None,
            pid => Some(pid),
        }
    }

    /// Block on the word while `owner` still holds it.
    #[cfg(not(feature = "loom"))]
    fn wait_while_owned(&self, owner: u32, timeout: Duration) -> io::Result<()> {
        futex::wait(&self.owner, owner, timeout)
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockState")
            .field("owner", &self.owner())
            .finish()
    }
}

/// Whether a process with this id currently exists.
#[cfg(not(feature = "loom"))]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(feature = "loom"))]
const MUTEX_SEGMENT_LEN: usize = 64;

#[cfg(not(feature = "loom"))]
const OPEN_OR_CREATE_ATTEMPTS: u32 = 200;

/// Outcome of a timed acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Acquired after the previous owner's process died.
    Abandoned,
    TimedOut,
}

/// A [`LockState`] in its own named segment.
#[cfg(not(feature = "loom"))]
#[derive(Debug)]
pub struct NamedMutex {
    segment: crate::Segment,
    pid: u32,
}

#[cfg(not(feature = "loom"))]
impl NamedMutex {
    /// Create the named mutex, optionally already held by this process.
    pub fn create(name: &str, initially_owned: bool) -> io::Result<Self> {
        let segment = crate::Segment::create(name, MUTEX_SEGMENT_LEN)?;
        let mutex = Self {
            segment,
            pid: std::process::id(),
        };
        if initially_owned {
            mutex.state().try_acquire(mutex.pid, process_alive);
        }
        Ok(mutex)
    }

    /// Open a mutex created by another handle.
    pub fn open(name: &str) -> io::Result<Self> {
        let segment = crate::Segment::open(name)?;
        if segment.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{name} is too small to hold a mutex"),
            ));
        }
        Ok(Self {
            segment,
            pid: std::process::id(),
        })
    }

    /// Open the mutex, creating it (unowned) if nobody has yet.
    pub fn open_or_create(name: &str) -> io::Result<Self> {
        for _ in 0..OPEN_OR_CREATE_ATTEMPTS {
            match Self::create(name, false) {
                Ok(mutex) => return Ok(mutex),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            match Self::open(name) {
                Ok(mutex) => return Ok(mutex),
                // Lost a race with a creator that is still sizing the object,
                // or with one that just unlinked it.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::WouldBlock
                    ) =>
                {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("could not open or create mutex {name}"),
        ))
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    fn state(&self) -> &LockState {
        // SAFETY: LockState is a transparent wrapper around the AtomicU32 at
        // offset 0, which lives as long as the segment.
        unsafe { &*(self.segment.word(0) as *const AtomicU32 as *const LockState) }
    }

    /// Try once, without blocking.
    pub fn try_acquire(&self) -> TryAcquire {
        let outcome = self.state().try_acquire(self.pid, process_alive);
        if let TryAcquire::Abandoned { previous } = outcome {
            tracing::debug!(name = %self.name(), previous, "took over abandoned mutex");
        }
        outcome
    }

    /// Acquire the mutex, waiting at most `timeout`.
    pub fn acquire(&self, timeout: Duration) -> io::Result<LockOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire() {
                TryAcquire::Acquired => return Ok(LockOutcome::Acquired),
                TryAcquire::Abandoned { .. } => return Ok(LockOutcome::Abandoned),
                TryAcquire::Busy { owner } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(LockOutcome::TimedOut);
                    }
                    // Sliced so a dead owner is noticed without a wakeup.
                    self.state()
                        .wait_while_owned(owner, (deadline - now).min(CANCEL_POLL_INTERVAL))?;
                }
            }
        }
    }

    /// Acquire with a guard that releases on drop. `None` on timeout.
    pub fn lock(&self, timeout: Duration) -> io::Result<Option<NamedMutexGuard<'_>>> {
        Ok(match self.acquire(timeout)? {
            LockOutcome::TimedOut => None,
            outcome => Some(NamedMutexGuard {
                mutex: self,
                abandoned: outcome == LockOutcome::Abandoned,
            }),
        })
    }

    /// Release the mutex if this process holds it.
    pub fn release(&self) -> bool {
        self.state().release(self.pid)
    }

    /// Whether a live process (possibly this one) holds the mutex.
    pub fn is_held(&self) -> bool {
        self.state().owner().is_some_and(process_alive)
    }

    pub fn owner(&self) -> Option<u32> {
        self.state().owner()
    }
}

/// Releases its [`NamedMutex`] on drop.
#[cfg(not(feature = "loom"))]
#[derive(Debug)]
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
    abandoned: bool,
}

#[cfg(not(feature = "loom"))]
impl NamedMutexGuard<'_> {
    /// Whether the lock was taken over from a dead owner.
    pub fn was_abandoned(&self) -> bool {
        self.abandoned
    }
}

#[cfg(not(feature = "loom"))]
impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
