//! Shared monotonic clock with cancellable single-shot waits
//!
//! Pacing never sleeps on wall-clock time directly. It registers a
//! [`ClockId`] for the instant it needs and waits on the [`Clock`]; another
//! thread can [`ClockId::unschedule`] the id to wake the waiter early.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a clock wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockReturn {
    /// The deadline was reached
    Ok,
    /// The wait was cancelled through [`ClockId::unschedule`]
    Unscheduled,
}

/// A monotonic clock shared by everything in a stream
pub trait Clock: Send + Sync {
    /// Current time since the clock's epoch
    fn now(&self) -> Duration;

    /// Block until the id's deadline is reached or the id is unscheduled
    fn wait(&self, id: &ClockId) -> ClockReturn;
}

/// A single-shot clock subscription. Cheap to clone; all clones refer to
/// the same subscription.
#[derive(Debug, Clone)]
pub struct ClockId {
    inner: Arc<ClockIdInner>,
}

#[derive(Debug)]
struct ClockIdInner {
    deadline: Duration,
    unscheduled: Mutex<bool>,
    cond: Condvar,
}

impl ClockId {
    pub fn single_shot(deadline: Duration) -> Self {
        Self {
            inner: Arc::new(ClockIdInner {
                deadline,
                unscheduled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.inner.deadline
    }

    /// Cancel the subscription, waking any thread waiting on it
    pub fn unschedule(&self) {
        *self.inner.unscheduled.lock() = true;
        self.inner.cond.notify_all();
    }

    pub fn is_unscheduled(&self) -> bool {
        *self.inner.unscheduled.lock()
    }

    /// Park the calling thread for at most `timeout`. Returns true if the
    /// id is unscheduled.
    fn park(&self, timeout: Duration) -> bool {
        let mut unscheduled = self.inner.unscheduled.lock();
        if !*unscheduled {
            self.inner.cond.wait_for(&mut unscheduled, timeout);
        }
        *unscheduled
    }
}

/// The system monotonic clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn wait(&self, id: &ClockId) -> ClockReturn {
        loop {
            let now = self.now();
            if id.is_unscheduled() {
                return ClockReturn::Unscheduled;
            }
            if now >= id.deadline() {
                return ClockReturn::Ok;
            }
            if id.park(id.deadline() - now) {
                return ClockReturn::Unscheduled;
            }
        }
    }
}

/// A clock that only moves when told to.
///
/// With auto-advance enabled a wait jumps the clock straight to the
/// deadline, which gives deterministic virtual time. Without it, waiters
/// block until [`ManualClock::advance`] moves time past their deadline.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    auto_advance: bool,
}

const MANUAL_POLL: Duration = Duration::from_millis(1);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_advancing() -> Self {
        Self {
            now: Mutex::new(Duration::ZERO),
            auto_advance: true,
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn wait(&self, id: &ClockId) -> ClockReturn {
        loop {
            if id.is_unscheduled() {
                return ClockReturn::Unscheduled;
            }
            {
                let mut now = self.now.lock();
                if *now >= id.deadline() {
                    return ClockReturn::Ok;
                }
                if self.auto_advance {
                    *now = id.deadline();
                    return ClockReturn::Ok;
                }
            }
            if id.park(MANUAL_POLL) {
                return ClockReturn::Unscheduled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_system_clock_waits_for_deadline() {
        let clock = SystemClock::new();
        let id = ClockId::single_shot(clock.now() + Duration::from_millis(20));
        let start = Instant::now();
        assert_eq!(clock.wait(&id), ClockReturn::Ok);
        assert!(start.elapsed() >= Duration::from_millis(19));
        assert!(clock.now() >= id.deadline());
    }

    #[test]
    fn test_unschedule_wakes_waiter() {
        let clock = Arc::new(SystemClock::new());
        let id = ClockId::single_shot(clock.now() + Duration::from_secs(10));

        let waiter = {
            let clock = clock.clone();
            let id = id.clone();
            thread::spawn(move || clock.wait(&id))
        };

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        id.unschedule();
        assert_eq!(waiter.join().unwrap(), ClockReturn::Unscheduled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_unscheduled_before_wait() {
        let clock = SystemClock::new();
        let id = ClockId::single_shot(clock.now() + Duration::from_secs(10));
        id.unschedule();
        assert_eq!(clock.wait(&id), ClockReturn::Unscheduled);
    }

    #[test]
    fn test_manual_clock_auto_advance() {
        let clock = ManualClock::auto_advancing();
        clock.advance(Duration::from_millis(10));
        let id = ClockId::single_shot(Duration::from_millis(40));
        assert_eq!(clock.wait(&id), ClockReturn::Ok);
        assert_eq!(clock.now(), Duration::from_millis(40));

        // A deadline in the past never moves time backwards
        let id = ClockId::single_shot(Duration::from_millis(5));
        assert_eq!(clock.wait(&id), ClockReturn::Ok);
        assert_eq!(clock.now(), Duration::from_millis(40));
    }

    #[test]
    fn test_manual_clock_blocks_until_advanced() {
        let clock = Arc::new(ManualClock::new());
        let id = ClockId::single_shot(Duration::from_millis(100));

        let waiter = {
            let clock = clock.clone();
            let id = id.clone();
            thread::spawn(move || clock.wait(&id))
        };

        thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        clock.advance(Duration::from_millis(100));
        assert_eq!(waiter.join().unwrap(), ClockReturn::Ok);
    }
}
