//! Stage closure counters
//!
//! Fixed-size tallies indexed by (frame slot, symbol) that the master uses
//! to detect stage transitions. Single writer, no locks.

use crate::FRAME_WND;

/// Per-stage completion grid.
///
/// `complete_task` counts task completions toward a symbol's task limit;
/// `complete_symbol` counts closed symbols toward the frame's symbol limit.
/// `reset` runs exactly once per frame on the retirement path; any
/// completion arriving for a closed symbol or a retired frame is a bug and
/// asserts.
#[derive(Debug)]
pub struct FrameCounters {
    tasks_done: Vec<usize>,
    symbols_done: [usize; FRAME_WND],
    cur_frame: [Option<u64>; FRAME_WND],
    num_symbols: usize,
    symbol_limit: usize,
    task_limit: usize,
}

impl FrameCounters {
    /// `num_symbols` is the grid width (symbols are addressed by their raw
    /// schedule index); `symbol_limit` and `task_limit` are the closure
    /// thresholds. A zero `symbol_limit` marks a stage absent from the run,
    /// which counts as vacuously complete.
    pub fn new(num_symbols: usize, symbol_limit: usize, task_limit: usize) -> FrameCounters {
        FrameCounters {
            tasks_done: vec![0; FRAME_WND * num_symbols.max(1)],
            symbols_done: [0; FRAME_WND],
            cur_frame: [None; FRAME_WND],
            num_symbols: num_symbols.max(1),
            symbol_limit,
            task_limit,
        }
    }

    /// One-dimensional stage: a single tally per frame.
    pub fn per_frame(task_limit: usize) -> FrameCounters {
        FrameCounters::new(1, 1, task_limit)
    }

    fn slot(&self, frame: u64) -> usize {
        (frame % FRAME_WND as u64) as usize
    }

    fn track(&mut self, frame: u64) -> usize {
        let slot = self.slot(frame);
        match self.cur_frame[slot] {
            None => self.cur_frame[slot] = Some(frame),
            Some(cur) => assert_eq!(
                cur, frame,
                "counter event for frame {frame} while slot {slot} tracks frame {cur}"
            ),
        }
        slot
    }

    /// Count one task completion; true exactly when the symbol closes.
    pub fn complete_task(&mut self, frame: u64, symbol: usize) -> bool {
        let slot = self.track(frame);
        let idx = slot * self.num_symbols + symbol;
        assert!(
            self.tasks_done[idx] < self.task_limit,
            "task completion on closed symbol {symbol} of frame {frame}"
        );
        self.tasks_done[idx] += 1;
        self.tasks_done[idx] == self.task_limit
    }

    /// Count one closed symbol; true exactly when the frame's last symbol
    /// of this stage closes.
    pub fn complete_symbol(&mut self, frame: u64) -> bool {
        let slot = self.track(frame);
        assert!(
            self.symbols_done[slot] < self.symbol_limit,
            "symbol completion past limit for frame {frame}"
        );
        self.symbols_done[slot] += 1;
        self.symbols_done[slot] == self.symbol_limit
    }

    pub fn is_last_symbol(&self, frame: u64) -> bool {
        self.symbols_done[self.slot(frame)] == self.symbol_limit
    }

    pub fn task_count(&self, frame: u64, symbol: usize) -> usize {
        self.tasks_done[self.slot(frame) * self.num_symbols + symbol]
    }

    pub fn symbol_count(&self, frame: u64) -> usize {
        self.symbols_done[self.slot(frame)]
    }

    pub fn max_symbol_count(&self) -> usize {
        self.symbol_limit
    }

    /// Clear the frame's column for slot reuse.
    pub fn reset(&mut self, frame: u64) {
        let slot = self.slot(frame);
        let base = slot * self.num_symbols;
        self.tasks_done[base..base + self.num_symbols].fill(0);
        self.symbols_done[slot] = 0;
        self.cur_frame[slot] = None;
    }
}

/// Packet arrival tallies per frame slot, reset as each expectation is met.
#[derive(Debug)]
pub struct RxCounters {
    num_pkts: [usize; FRAME_WND],
    num_pilot_pkts: [usize; FRAME_WND],
    num_cal_pkts: [usize; FRAME_WND],
    pkts_per_frame: usize,
    pilot_pkts_per_frame: usize,
    cal_pkts_per_frame: usize,
}

/// What a newly counted packet means for its frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct RxProgress {
    /// First packet of the frame observed.
    pub first_of_frame: bool,
    /// All packets of the frame observed.
    pub frame_complete: bool,
}

impl RxCounters {
    pub fn new(
        pkts_per_frame: usize,
        pilot_pkts_per_frame: usize,
        cal_pkts_per_frame: usize,
    ) -> RxCounters {
        RxCounters {
            num_pkts: [0; FRAME_WND],
            num_pilot_pkts: [0; FRAME_WND],
            num_cal_pkts: [0; FRAME_WND],
            pkts_per_frame,
            pilot_pkts_per_frame,
            cal_pkts_per_frame,
        }
    }

    fn slot(frame: u64) -> usize {
        (frame % FRAME_WND as u64) as usize
    }

    /// Count a pilot packet; true when the frame's pilots are all in.
    pub fn add_pilot(&mut self, frame: u64) -> bool {
        let slot = Self::slot(frame);
        self.num_pilot_pkts[slot] += 1;
        if self.num_pilot_pkts[slot] == self.pilot_pkts_per_frame {
            self.num_pilot_pkts[slot] = 0;
            true
        } else {
            false
        }
    }

    /// Count a calibration packet; true when the frame's calibration
    /// packets are all in.
    pub fn add_cal(&mut self, frame: u64) -> bool {
        let slot = Self::slot(frame);
        self.num_cal_pkts[slot] += 1;
        if self.num_cal_pkts[slot] == self.cal_pkts_per_frame {
            self.num_cal_pkts[slot] = 0;
            true
        } else {
            false
        }
    }

    /// Count any packet toward the frame total.
    pub fn add_pkt(&mut self, frame: u64) -> RxProgress {
        let slot = Self::slot(frame);
        let first_of_frame = self.num_pkts[slot] == 0;
        self.num_pkts[slot] += 1;
        let frame_complete = self.num_pkts[slot] == self.pkts_per_frame;
        if frame_complete {
            self.num_pkts[slot] = 0;
        }
        RxProgress {
            first_of_frame,
            frame_complete,
        }
    }

    pub fn remaining(&self, frame: u64) -> usize {
        self.num_pkts[Self::slot(frame)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_closes_exactly_once() {
        let mut c = FrameCounters::new(4, 2, 3);
        assert!(!c.complete_task(0, 1));
        assert!(!c.complete_task(0, 1));
        assert!(c.complete_task(0, 1));
        assert!(!c.complete_symbol(0));
        for _ in 0..2 {
            c.complete_task(0, 3);
        }
        assert!(c.complete_task(0, 3));
        assert!(c.complete_symbol(0));
        assert!(c.is_last_symbol(0));
    }

    #[test]
    #[should_panic(expected = "closed symbol")]
    fn completion_on_closed_symbol_asserts() {
        let mut c = FrameCounters::new(2, 1, 1);
        assert!(c.complete_task(0, 0));
        c.complete_task(0, 0);
    }

    #[test]
    #[should_panic(expected = "slot 1 tracks frame 1")]
    fn stale_frame_in_live_slot_asserts() {
        let mut c = FrameCounters::new(2, 2, 1);
        c.complete_task(1, 0);
        c.complete_task(5, 0);
    }

    #[test]
    fn reset_reopens_the_slot() {
        let mut c = FrameCounters::new(2, 1, 1);
        assert!(c.complete_task(2, 0));
        assert!(c.complete_symbol(2));
        assert!(c.is_last_symbol(2));
        c.reset(2);
        assert!(!c.is_last_symbol(2));
        // slot reusable by the successor frame
        assert!(c.complete_task(6, 0));
    }

    #[test]
    fn absent_stage_is_vacuously_complete() {
        let c = FrameCounters::new(1, 0, 0);
        assert!(c.is_last_symbol(0));
        assert!(c.is_last_symbol(3));
    }

    #[test]
    fn rx_progress_flags() {
        let mut rx = RxCounters::new(4, 2, 0);
        let p = rx.add_pkt(0);
        assert!(p.first_of_frame && !p.frame_complete);
        assert!(!rx.add_pilot(0));
        assert!(rx.add_pilot(0));
        rx.add_pkt(0);
        rx.add_pkt(0);
        let p = rx.add_pkt(0);
        assert!(!p.first_of_frame && p.frame_complete);
        // tally reset for slot reuse
        assert!(rx.add_pkt(4).first_of_frame);
    }
}
