//! Frame pacing against a shared clock
//!
//! The pacer turns "give me the next frame" pulls into positions on the
//! framerate grid. A pull that lands in a slot that already produced a frame
//! waits for the next slot; a pull that lands later than that takes the slot
//! it falls into without waiting.

use crate::clock::{Clock, ClockId, ClockReturn};
use crate::error::{Error, Result};
use crate::types::Framerate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Timing decision for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacedFrame {
    /// Grid slot since stream start
    pub index: u64,
    /// `index` frame periods after stream start
    pub timestamp: Duration,
    pub duration: Duration,
    /// Clock time at which the frame should be captured
    pub capture_time: Duration,
}

#[derive(Debug, Default)]
struct WaitState {
    flushing: bool,
    pending: Option<ClockId>,
}

/// Cancels a pacer wait from another thread.
#[derive(Debug, Clone)]
pub struct Unlocker {
    state: Arc<Mutex<WaitState>>,
}

impl Unlocker {
    /// Interrupt the current wait, if any, and make every following pull
    /// return [`Error::Cancelled`] until [`Unlocker::unlock_stop`].
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        state.flushing = true;
        if let Some(id) = state.pending.as_ref() {
            tracing::debug!("Unscheduling pending frame wait");
            id.unschedule();
        }
    }

    /// Leave the flushing state
    pub fn unlock_stop(&self) {
        self.state.lock().flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }
}

/// Decides when each frame is due and how it is stamped.
pub struct FramePacer {
    clock: Option<Arc<dyn Clock>>,
    framerate: Framerate,
    startup_delay: Duration,
    /// Clock time of grid slot 0; set once the startup delay has passed
    base_time: Option<Duration>,
    last_index: Option<u64>,
    /// Timestamp of the last slot handed out, on whatever grid it came from
    last_timestamp: Option<Duration>,
    frames_paced: u64,
    wait: Arc<Mutex<WaitState>>,
}

impl FramePacer {
    pub fn new(clock: Option<Arc<dyn Clock>>, framerate: Framerate, startup_delay: Duration) -> Self {
        Self {
            clock,
            framerate,
            startup_delay,
            base_time: None,
            last_index: None,
            last_timestamp: None,
            frames_paced: 0,
            wait: Arc::new(Mutex::new(WaitState::default())),
        }
    }

    pub fn set_clock(&mut self, clock: Option<Arc<dyn Clock>>) {
        self.clock = clock;
    }

    /// Change the target rate. Slots already handed out keep their
    /// timestamps; later slots are placed on the new grid.
    pub fn set_framerate(&mut self, framerate: Framerate) {
        if framerate != self.framerate {
            tracing::debug!("Pacing framerate {} -> {}", self.framerate, framerate);
            self.framerate = framerate;
        }
    }

    pub fn framerate(&self) -> Framerate {
        self.framerate
    }

    pub fn frames_paced(&self) -> u64 {
        self.frames_paced
    }

    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    pub fn unlocker(&self) -> Unlocker {
        Unlocker {
            state: self.wait.clone(),
        }
    }

    /// Forget all stream state; the next pull starts a new stream and
    /// observes the startup delay again.
    pub fn reset(&mut self) {
        self.base_time = None;
        self.last_index = None;
        self.last_timestamp = None;
        self.frames_paced = 0;
    }

    /// Block until the next frame is due and return its timing.
    pub fn pace(&mut self) -> Result<PacedFrame> {
        let clock = self.clock.clone().ok_or(Error::NoClock)?;
        if !self.framerate.is_valid() {
            return Err(Error::InvalidFramerate(self.framerate));
        }
        if self.wait.lock().flushing {
            return Err(Error::Cancelled);
        }

        let base_time = match self.base_time {
            Some(base) => base,
            None => {
                if !self.startup_delay.is_zero() {
                    tracing::debug!("Waiting {:?} before the first frame", self.startup_delay);
                    self.wait_until(clock.as_ref(), clock.now() + self.startup_delay)?;
                }
                let base = clock.now();
                self.base_time = Some(base);
                base
            }
        };

        let rate = self.framerate;
        let now = clock.now();
        let elapsed = now.saturating_sub(base_time);
        let candidate = rate.frame_at(elapsed);

        let mut index = match self.last_index {
            Some(last) if candidate <= last => {
                tracing::debug!("Frame {} already produced", candidate);
                last + 1
            }
            _ => candidate,
        };

        // After a rate increase the new grid can place this slot before the
        // previous frame's timestamp.
        if let Some(last_ts) = self.last_timestamp {
            if rate.time_of(index) < last_ts {
                let first = rate.frame_at(last_ts);
                index = if rate.time_of(first) < last_ts {
                    first + 1
                } else {
                    first
                };
            }
        }

        let frame = if index == candidate {
            tracing::debug!("Frame {} is due now", index);
            PacedFrame {
                index,
                timestamp: rate.time_of(index),
                duration: rate.time_of(index + 1).saturating_sub(elapsed),
                capture_time: now,
            }
        } else {
            let due = base_time + rate.time_of(index);
            tracing::debug!("Waiting for frame {} at {:?}", index, due);
            self.wait_until(clock.as_ref(), due)?;
            PacedFrame {
                index,
                timestamp: rate.time_of(index),
                duration: rate.frame_duration(),
                capture_time: due,
            }
        };

        self.last_index = Some(frame.index);
        self.last_timestamp = Some(frame.timestamp);
        self.frames_paced += 1;
        Ok(frame)
    }

    fn wait_until(&self, clock: &dyn Clock, deadline: Duration) -> Result<()> {
        let id = ClockId::single_shot(deadline);
        {
            let mut state = self.wait.lock();
            if state.flushing {
                return Err(Error::Cancelled);
            }
            state.pending = Some(id.clone());
        }

        let ret = clock.wait(&id);
        self.wait.lock().pending = None;

        match ret {
            ClockReturn::Ok => Ok(()),
            ClockReturn::Unscheduled => {
                tracing::debug!("Frame wait cancelled");
                Err(Error::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::thread;
    use std::time::Instant;

    const STARTUP: Duration = Duration::from_secs(5);

    fn manual_pacer(rate: Framerate) -> (Arc<ManualClock>, FramePacer) {
        let clock = Arc::new(ManualClock::auto_advancing());
        let pacer = FramePacer::new(Some(clock.clone()), rate, STARTUP);
        (clock, pacer)
    }

    #[test]
    fn test_first_frame_after_startup_delay() {
        let (clock, mut pacer) = manual_pacer(Framerate::FPS_25);

        let frame = pacer.pace().unwrap();
        assert_eq!(clock.now(), STARTUP);
        assert_eq!(frame.index, 0);
        assert_eq!(frame.timestamp, Duration::ZERO);
        assert_eq!(frame.duration, Duration::from_millis(40));
        assert_eq!(pacer.frames_paced(), 1);
    }

    #[test]
    fn test_same_slot_waits_for_next() {
        let (clock, mut pacer) = manual_pacer(Framerate::FPS_25);
        pacer.pace().unwrap();

        clock.advance(Duration::from_millis(10));
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 1);
        assert_eq!(frame.timestamp, Duration::from_millis(40));
        assert_eq!(frame.duration, Duration::from_millis(40));
        // Blocked for the remaining 30ms of the slot
        assert_eq!(clock.now(), STARTUP + Duration::from_millis(40));
        assert_eq!(frame.capture_time, clock.now());
    }

    #[test]
    fn test_late_pull_takes_current_slot() {
        let (clock, mut pacer) = manual_pacer(Framerate::FPS_25);
        pacer.pace().unwrap();

        clock.advance(Duration::from_millis(90));
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 2);
        assert_eq!(frame.timestamp, Duration::from_millis(80));
        assert_eq!(frame.duration, Duration::from_millis(30));
        // No wait
        assert_eq!(clock.now(), STARTUP + Duration::from_millis(90));
    }

    #[test]
    fn test_indices_strictly_increase() {
        let (clock, mut pacer) = manual_pacer(Framerate::new(30000, 1001));
        let mut last: Option<PacedFrame> = None;

        for step in [0u64, 3, 50, 7, 120, 1, 33, 34, 0, 200] {
            clock.advance(Duration::from_millis(step));
            let frame = pacer.pace().unwrap();
            if let Some(prev) = last {
                assert!(frame.index > prev.index);
                assert!(frame.timestamp >= prev.timestamp);
            }
            last = Some(frame);
        }
        assert_eq!(pacer.frames_paced(), 10);
    }

    #[test]
    fn test_rate_change_keeps_indices_increasing() {
        let (clock, mut pacer) = manual_pacer(Framerate::FPS_25);
        pacer.pace().unwrap();
        clock.advance(Duration::from_millis(90));
        assert_eq!(pacer.pace().unwrap().index, 2);

        // Faster grid: slot 4 of 50fps covers 80-100ms
        pacer.set_framerate(Framerate::new(50, 1));
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 4);
        assert_eq!(frame.timestamp, Duration::from_millis(80));

        // Slower grid: the current slot is behind the last index, so the
        // pull waits for the slot after it
        pacer.set_framerate(Framerate::new(10, 1));
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 5);
        assert_eq!(frame.timestamp, Duration::from_millis(500));
        assert_eq!(frame.duration, Duration::from_millis(100));
        assert_eq!(clock.now(), STARTUP + Duration::from_millis(500));
    }

    #[test]
    fn test_rate_increase_never_moves_pts_backwards() {
        let (clock, mut pacer) = manual_pacer(Framerate::FPS_25);
        pacer.pace().unwrap();
        clock.advance(Duration::from_millis(10));
        let before = pacer.pace().unwrap();
        assert_eq!(before.timestamp, Duration::from_millis(40));

        // Slot 2 of 60fps starts at 33.3ms, before the last frame; the first
        // slot at or after 40ms is 3 (50ms), which is still ahead
        pacer.set_framerate(Framerate::FPS_60);
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 3);
        assert_eq!(frame.timestamp, Duration::from_millis(50));
        assert_eq!(frame.duration, Framerate::FPS_60.frame_duration());
        assert_eq!(clock.now(), STARTUP + Duration::from_millis(50));
        assert!(frame.timestamp >= before.timestamp);

        // Back on the 60fps grid
        clock.advance(Duration::from_millis(20));
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 4);
        assert_eq!(frame.timestamp, Framerate::FPS_60.time_of(4));
    }

    #[test]
    fn test_no_clock() {
        let mut pacer = FramePacer::new(None, Framerate::FPS_25, STARTUP);
        assert!(matches!(pacer.pace(), Err(Error::NoClock)));
        assert_eq!(pacer.frames_paced(), 0);
    }

    #[test]
    fn test_zero_framerate_fails_before_waiting() {
        let (clock, mut pacer) = manual_pacer(Framerate::new(0, 1));
        assert!(matches!(pacer.pace(), Err(Error::InvalidFramerate(_))));
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_reset_restarts_stream() {
        let (clock, mut pacer) = manual_pacer(Framerate::FPS_25);
        pacer.pace().unwrap();
        clock.advance(Duration::from_millis(500));
        pacer.pace().unwrap();

        pacer.reset();
        let frame = pacer.pace().unwrap();
        assert_eq!(frame.index, 0);
        assert_eq!(pacer.frames_paced(), 1);
        assert_eq!(clock.now(), STARTUP * 2 + Duration::from_millis(500));
    }

    #[test]
    fn test_unlock_cancels_wait() {
        let clock = Arc::new(SystemClock::new());
        let mut pacer = FramePacer::new(Some(clock), Framerate::new(1, 1), Duration::ZERO);
        assert_eq!(pacer.pace().unwrap().index, 0);

        let unlocker = pacer.unlocker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            unlocker.unlock();
        });

        let start = Instant::now();
        assert!(matches!(pacer.pace(), Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
        handle.join().unwrap();

        // Stays cancelled until the flushing state is cleared
        assert!(matches!(pacer.pace(), Err(Error::Cancelled)));
        pacer.unlocker().unlock_stop();
        assert!(!pacer.unlocker().is_flushing());
    }

    #[test]
    fn test_unlock_during_startup_delay() {
        let clock = Arc::new(SystemClock::new());
        let mut pacer =
            FramePacer::new(Some(clock), Framerate::FPS_25, Duration::from_secs(10));

        let unlocker = pacer.unlocker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            unlocker.unlock();
        });

        let start = Instant::now();
        assert!(matches!(pacer.pace(), Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
        assert_eq!(pacer.last_index(), None);
    }

    #[test]
    fn test_unlock_before_pull_is_not_lost() {
        let (_clock, mut pacer) = manual_pacer(Framerate::FPS_25);
        pacer.unlocker().unlock();
        assert!(matches!(pacer.pace(), Err(Error::Cancelled)));

        pacer.unlocker().unlock_stop();
        assert_eq!(pacer.pace().unwrap().index, 0);
    }
}
