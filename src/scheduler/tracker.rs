use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::config::Config;
use crate::SCHEDULE_QUEUES;

const RAN_ORDER_BITS: u64 = 8;
const RAN_ORDER_MASK: u64 = (1 << RAN_ORDER_BITS) - 1;

/// Uplink scheduling of the current frame is complete.
pub const UPLINK_COMPLETE: u8 = 0b01;
/// Downlink scheduling of the current frame is complete.
pub const DOWNLINK_COMPLETE: u8 = 0b10;
const PROCESSING_COMPLETE: u8 = UPLINK_COMPLETE | DOWNLINK_COMPLETE;

/// Deferred downlink starts the queue will hold before reporting a stuck
/// pipeline.
const DEFERRAL_CAPACITY: usize = 36;
/// Overflow occurrences tolerated before the condition is fatal.
const DEFERRAL_OVERFLOW_LIMIT: usize = 8;

/// The two frame-window cursors. The master is the only writer; workers
/// read them to pick a parity bucket.
#[derive(Debug, Default)]
pub struct FrameCursors {
    sche: AtomicU64,
    proc: AtomicU64,
}

impl FrameCursors {
    pub fn new() -> FrameCursors {
        FrameCursors::default()
    }

    /// Newest frame whose work is being scheduled.
    pub fn sche(&self) -> u64 {
        self.sche.load(Ordering::Relaxed)
    }

    /// Oldest frame still processing.
    pub fn proc(&self) -> u64 {
        self.proc.load(Ordering::Relaxed)
    }

    /// Master only.
    pub fn advance_sche(&self) {
        self.sche.fetch_add(1, Ordering::Relaxed);
    }

    /// Master only.
    pub fn advance_proc(&self) {
        self.proc.fetch_add(1, Ordering::Relaxed);
    }
}

/// The uplink modulation order in effect per frame, switchable at a frame
/// boundary. The master stages switches; workers and streamers read.
///
/// `next` packs `(boundary << 8) | order` in one word so readers always
/// see a boundary with its matching order. A staged switch settles once
/// every live frame is past its boundary; only then may the next one be
/// staged, which keeps `current` valid for all frames still in flight.
#[derive(Debug)]
pub struct RanState {
    current: AtomicU64,
    next: AtomicU64,
}

impl RanState {
    pub fn new(order: usize) -> RanState {
        RanState {
            current: AtomicU64::new(order as u64),
            next: AtomicU64::new(order as u64),
        }
    }

    /// Active uplink modulation order for a frame.
    pub fn ul_mod_order(&self, frame: u64) -> usize {
        let next = self.next.load(Ordering::Acquire);
        if frame >= next >> RAN_ORDER_BITS {
            (next & RAN_ORDER_MASK) as usize
        } else {
            self.current.load(Ordering::Acquire) as usize
        }
    }

    /// Master only: stage `order` to take effect from `boundary`. Refuses
    /// while a frame older than the previously staged boundary may still
    /// be live (`oldest_live` is the processing cursor).
    #[must_use]
    pub fn try_stage(&self, order: usize, boundary: u64, oldest_live: u64) -> bool {
        debug_assert!(order as u64 <= RAN_ORDER_MASK);
        let staged = self.next.load(Ordering::Acquire);
        if oldest_live < staged >> RAN_ORDER_BITS {
            return false;
        }
        // fold the settled order first so readers between the two stores
        // keep a valid view of every live frame
        self.current.store(staged & RAN_ORDER_MASK, Ordering::Release);
        self.next
            .store((boundary << RAN_ORDER_BITS) | order as u64, Ordering::Release);
        true
    }
}

/// Master-only frame window state: schedule-completion flags for the
/// current schedule frame and the deferred downlink starts.
pub struct ScheduleTracker {
    flags: u8,
    absent: u8,
    deferral: VecDeque<u64>,
    overflows: usize,
}

impl ScheduleTracker {
    pub fn new(cfg: &Config) -> ScheduleTracker {
        // a direction with no symbols is pre-asserted complete
        let mut absent = 0;
        if cfg.frame().num_ul_syms() == 0 {
            absent |= UPLINK_COMPLETE;
        }
        if cfg.frame().num_dl_syms() == 0 {
            absent |= DOWNLINK_COMPLETE;
        }
        ScheduleTracker {
            flags: absent,
            absent,
            deferral: VecDeque::new(),
            overflows: 0,
        }
    }

    /// Record a direction's scheduling completion for the current schedule
    /// frame; advance the schedule cursor when both directions are done.
    pub fn complete_schedule(&mut self, cursors: &FrameCursors, frame: u64, completed: u8) {
        debug_assert_eq!(cursors.sche(), frame, "schedule completion out of order");
        self.flags |= completed;
        if self.flags == PROCESSING_COMPLETE {
            cursors.advance_sche();
            self.flags = self.absent;
        }
    }

    /// Whether a frame's downlink start must be postponed: the window is
    /// saturated or earlier frames are already waiting.
    pub fn should_defer(&self, cursors: &FrameCursors, frame: u64) -> bool {
        !self.deferral.is_empty() || frame >= cursors.proc() + SCHEDULE_QUEUES as u64
    }

    /// Queue a deferred frame. Returns false once overflow passes the
    /// fatal threshold, which indicates a stuck frame.
    #[must_use]
    pub fn push_deferral(&mut self, frame: u64) -> bool {
        if self.deferral.len() >= DEFERRAL_CAPACITY {
            self.overflows += 1;
            warn!(
                "deferral queue at capacity ({DEFERRAL_CAPACITY}), dropping frame {frame} (overflow {})",
                self.overflows
            );
            return self.overflows <= DEFERRAL_OVERFLOW_LIMIT;
        }
        self.deferral.push_back(frame);
        true
    }

    /// Release the oldest deferred frame if it now fits the window.
    pub fn pop_deferral_if_ready(&mut self, cursors: &FrameCursors) -> Option<u64> {
        let head = *self.deferral.front()?;
        if head < cursors.proc() + SCHEDULE_QUEUES as u64 {
            self.deferral.pop_front()
        } else {
            None
        }
    }

    pub fn deferral_len(&self) -> usize {
        self.deferral.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ul_dl_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.bs_ant_num = 2;
        cfg.ue_ant_num = 2;
        cfg.frame_schedule = "PPUD".into();
        cfg.fft_size = 64;
        cfg.ofdm_data_num = 48;
        cfg.cb_bytes = 8;
        cfg.finalize().unwrap();
        cfg
    }

    #[test]
    fn schedule_cursor_needs_both_directions() {
        let cfg = ul_dl_cfg();
        let cursors = FrameCursors::new();
        let mut tracker = ScheduleTracker::new(&cfg);
        tracker.complete_schedule(&cursors, 0, UPLINK_COMPLETE);
        assert_eq!(cursors.sche(), 0);
        tracker.complete_schedule(&cursors, 0, DOWNLINK_COMPLETE);
        assert_eq!(cursors.sche(), 1);
    }

    #[test]
    fn absent_direction_is_preasserted() {
        let mut cfg = Config::default();
        cfg.bs_ant_num = 2;
        cfg.ue_ant_num = 2;
        cfg.frame_schedule = "PPUU".into();
        cfg.fft_size = 64;
        cfg.ofdm_data_num = 48;
        cfg.cb_bytes = 8;
        cfg.finalize().unwrap();
        let cursors = FrameCursors::new();
        let mut tracker = ScheduleTracker::new(&cfg);
        tracker.complete_schedule(&cursors, 0, UPLINK_COMPLETE);
        assert_eq!(cursors.sche(), 1);
        tracker.complete_schedule(&cursors, 1, UPLINK_COMPLETE);
        assert_eq!(cursors.sche(), 2);
    }

    #[test]
    fn ran_switch_applies_at_boundary() {
        let ran = RanState::new(16);
        assert_eq!(ran.ul_mod_order(0), 16);
        assert_eq!(ran.ul_mod_order(100), 16);

        assert!(ran.try_stage(64, 5, 0));
        assert_eq!(ran.ul_mod_order(4), 16);
        assert_eq!(ran.ul_mod_order(5), 64);

        // a second switch must wait until frame 5 is the oldest live frame
        assert!(!ran.try_stage(4, 9, 4));
        assert!(ran.try_stage(4, 9, 5));
        assert_eq!(ran.ul_mod_order(8), 64);
        assert_eq!(ran.ul_mod_order(9), 4);
    }

    #[test]
    fn deferral_is_fifo_and_window_gated() {
        let cfg = ul_dl_cfg();
        let cursors = FrameCursors::new();
        let mut tracker = ScheduleTracker::new(&cfg);
        assert!(!tracker.should_defer(&cursors, 1));
        assert!(tracker.should_defer(&cursors, 2));
        assert!(tracker.push_deferral(5));
        assert!(tracker.push_deferral(6));
        // frame 1 must now defer too: earlier frames are waiting
        assert!(tracker.should_defer(&cursors, 1));
        assert!(tracker.pop_deferral_if_ready(&cursors).is_none());
        for _ in 0..4 {
            cursors.advance_proc();
        }
        assert_eq!(tracker.pop_deferral_if_ready(&cursors), Some(5));
        // frame 6 is still outside the release horizon
        assert_eq!(tracker.pop_deferral_if_ready(&cursors), None);
        cursors.advance_proc();
        assert_eq!(tracker.pop_deferral_if_ready(&cursors), Some(6));
        assert_eq!(tracker.pop_deferral_if_ready(&cursors), None);
    }
}
