//! Named shared-memory objects for local IPC.
//!
//! Every object here lives in its own POSIX shared-memory object and can be
//! opened by name from another process:
//!
//! - [`Segment`]: a mapped region, unlinked by its creator on drop
//! - [`Signal`]: an auto-reset binary signal built on [`SignalState`]
//! - [`NamedMutex`]: a mutex that records its owner's process id so a crashed
//!   owner is detected and the lock taken over
//!
//! Blocking waits use futexes on Linux and short sleeps elsewhere.
//!
//! # Loom Testing
//!
//! The signal and lock state machines are checked under loom:
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(not(unix))]
compile_error!("shm-primitives requires a Unix target");

pub mod futex;
pub mod mutex;
#[cfg(not(feature = "loom"))]
pub mod segment;
pub mod signal;
pub mod sync;

#[cfg(not(feature = "loom"))]
pub use mutex::{NamedMutex, NamedMutexGuard, process_alive};
pub use mutex::{LockOutcome, LockState, TryAcquire};
#[cfg(not(feature = "loom"))]
pub use segment::Segment;
#[cfg(not(feature = "loom"))]
pub use signal::Signal;
pub use signal::{CANCEL_POLL_INTERVAL, SignalState, Wait};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
