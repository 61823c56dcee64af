//! Fault injection for testing.
//!
//! Client sinks consult a [`FaultInjector`] at two points: after a request
//! has been staged but before it is transferred, and before a reply is read.
//! An injected fault behaves like a transport failure at that point, which
//! exercises the retry, rewind and pool-flush paths.
//!
//! ```rust
//! use shmchannel::fault::{FaultAction, FaultInjector, FaultPoint};
//!
//! let injector = FaultInjector::new();
//! injector.fail_next(FaultPoint::Send, 1);
//! assert_eq!(injector.check(FaultPoint::Send), FaultAction::Fail);
//! assert_eq!(injector.check(FaultPoint::Send), FaultAction::Pass);
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// After staging a request, before transferring it.
    Send,
    /// Before reading a reply.
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Pass,
    Fail,
}

#[derive(Debug)]
pub struct FaultInjector {
    /// Forced failures still owed at the send point.
    send_failures: AtomicU32,
    /// Forced failures still owed at the reply point.
    reply_failures: AtomicU32,
    /// Random failure rate in basis points (0-10000 = 0.00%-100.00%)
    failure_rate: AtomicU32,
    counter: AtomicU64,
    random_state: RandomState,
    injected: AtomicU64,
}

impl FaultInjector {
    /// Create a fault injector with all faults disabled.
    pub fn new() -> Self {
        FaultInjector {
            send_failures: AtomicU32::new(0),
            reply_failures: AtomicU32::new(0),
            failure_rate: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            random_state: RandomState::new(),
            injected: AtomicU64::new(0),
        }
    }

    fn forced(&self, point: FaultPoint) -> &AtomicU32 {
        match point {
            FaultPoint::Send => &self.send_failures,
            FaultPoint::Reply => &self.reply_failures,
        }
    }

    /// Decide whether the operation at `point` fails.
    pub fn check(&self, point: FaultPoint) -> FaultAction {
        let owed = self
            .forced(point)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let rate = self.failure_rate.load(Ordering::Relaxed);
        if owed || (rate > 0 && self.rand_percent() < rate) {
            self.injected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(?point, "injecting transport fault");
            return FaultAction::Fail;
        }
        FaultAction::Pass
    }

    /// Fail the next `count` operations at `point`.
    pub fn fail_next(&self, point: FaultPoint, count: u32) {
        self.forced(point).store(count, Ordering::Release);
    }

    /// Set the random failure rate, applied at both points.
    ///
    /// Values above 10000 are clamped to 10000.
    pub fn set_failure_rate(&self, rate: u32) {
        self.failure_rate.store(rate.min(10000), Ordering::Relaxed);
    }

    pub fn failure_rate(&self) -> u32 {
        self.failure_rate.load(Ordering::Relaxed)
    }

    /// Faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Pseudo-random value in `[0, 10000)`.
    fn rand_percent(&self) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = self.random_state.build_hasher();
        counter.hash(&mut hasher);
        (hasher.finish() % 10000) as u32
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_injector_passes_all() {
        let injector = FaultInjector::new();
        for _ in 0..100 {
            assert_eq!(injector.check(FaultPoint::Send), FaultAction::Pass);
            assert_eq!(injector.check(FaultPoint::Reply), FaultAction::Pass);
        }
        assert_eq!(injector.injected(), 0);
    }

    #[test]
    fn forced_failures_are_counted_per_point() {
        let injector = FaultInjector::new();
        injector.fail_next(FaultPoint::Send, 2);
        assert_eq!(injector.check(FaultPoint::Reply), FaultAction::Pass);
        assert_eq!(injector.check(FaultPoint::Send), FaultAction::Fail);
        assert_eq!(injector.check(FaultPoint::Send), FaultAction::Fail);
        assert_eq!(injector.check(FaultPoint::Send), FaultAction::Pass);
        assert_eq!(injector.injected(), 2);
    }

    #[test]
    fn set_failure_rate_clamps_to_max() {
        let injector = FaultInjector::new();
        injector.set_failure_rate(20000);
        assert_eq!(injector.failure_rate(), 10000);
    }

    #[test]
    fn failure_rate_100_percent_fails_all() {
        let injector = FaultInjector::new();
        injector.set_failure_rate(10000);
        for _ in 0..100 {
            assert_eq!(injector.check(FaultPoint::Reply), FaultAction::Fail);
        }
    }
}
