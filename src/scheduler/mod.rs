//! Master scheduler
//!
//! A single-threaded event loop that owns the frame window. It alternates
//! between the streamer lanes and the worker completion lanes, advances
//! per-frame counters, and emits the tasks the dependency graph unlocks.
//! Handlers never block and never run DSP; they only update counters and
//! enqueue events.

mod tracker;

pub use tracker::FrameCursors;
pub use tracker::RanState;
pub use tracker::ScheduleTracker;
pub use tracker::DOWNLINK_COMPLETE;
pub use tracker::UPLINK_COMPLETE;

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::config::SymbolType;
use crate::config::UL_MCS_TABLE;
use crate::counters::FrameCounters;
use crate::counters::RxCounters;
use crate::mac::MacQueues;
use crate::message::Event;
use crate::message::EventKind;
use crate::message::MessageFabric;
use crate::message::Tag;
use crate::message::DEQUEUE_BULK_SIZE_TXRX;
use crate::message::MAX_EVENT_TAGS;
use crate::stats::PhyStats;
use crate::stats::Stats;
use crate::stats::TsType;
use crate::worker::Worker;
use crate::FRAME_WND;

const TX_DATA_FILENAME: &str = "tx_data.bin";
const DECODE_DATA_FILENAME: &str = "decode_data.bin";

pub struct Scheduler {
    config: Arc<Config>,
    fabric: Arc<MessageFabric>,
    buffers: Arc<BufferPool>,
    mac: Option<Arc<MacQueues>>,
    running: Arc<AtomicBool>,
    cursors: Arc<FrameCursors>,
    tracker: ScheduleTracker,
    stats: Stats,
    phy_stats: PhyStats,

    rx_counters: RxCounters,
    pilot_fft_counters: FrameCounters,
    uplink_fft_counters: FrameCounters,
    rc_counters: FrameCounters,
    beam_counters: FrameCounters,
    demul_counters: FrameCounters,
    decode_counters: FrameCounters,
    tomac_counters: FrameCounters,
    mac_to_phy_counters: FrameCounters,
    encode_counters: FrameCounters,
    precode_counters: FrameCounters,
    ifft_counters: FrameCounters,
    tx_counters: FrameCounters,

    /// RX packet tags awaiting FFT batching, one FIFO per frame slot.
    fft_queues: Vec<VecDeque<Tag>>,
    /// FFT tags already emitted for the current schedule frame.
    fft_created_count: usize,
    /// Newest frame whose beam matrices are complete.
    beam_last_frame: Option<u64>,
    /// Newest frame whose calibration round is complete.
    rc_last_frame: Option<u64>,
    /// Frame whose beam start waits on its calibration round.
    pending_beam_frame: Option<u64>,
    /// Newest frame whose uplink FFT closed, per uplink symbol.
    fft_cur_frame_for_symbol: Vec<Option<u64>>,
    /// Newest frame whose encode closed, per downlink symbol.
    encode_cur_frame_for_symbol: Vec<Option<u64>>,
    /// Newest frame whose IFFT closed, per downlink symbol.
    ifft_cur_frame_for_symbol: Vec<Option<u64>>,
    /// Next downlink symbol eligible for in-order TX.
    ifft_next_symbol: usize,
    /// Uplink modulation in effect, shared with workers and streamers.
    ran: Arc<RanState>,
    /// MCS index awaiting a settled frame boundary.
    pending_ran: Option<usize>,
    /// Last MCS index staged from a RAN update.
    ran_mcs_index: Option<usize>,

    inline_worker: Option<Worker>,
    events_buf: Vec<Event>,
    io_turn: bool,
    finish: bool,
    stalled: bool,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        fabric: Arc<MessageFabric>,
        buffers: Arc<BufferPool>,
        mac: Option<Arc<MacQueues>>,
        running: Arc<AtomicBool>,
    ) -> Scheduler {
        let frame = config.frame();
        let total = frame.num_total_syms();
        let ul = frame.num_ul_syms();
        let dl = frame.num_dl_syms();
        let streams = config.spatial_streams();

        let max_events = (DEQUEUE_BULK_SIZE_TXRX * (config.socket_thread_num + 1))
            .max(crate::message::DEQUEUE_BULK_SIZE_WORKER * fabric.num_workers());

        Scheduler {
            tracker: ScheduleTracker::new(&config),
            stats: Stats::new(&config),
            phy_stats: PhyStats::new(&config),
            rx_counters: RxCounters::new(
                config.num_rx_pkts_per_frame(),
                config.num_pilot_pkts_per_frame(),
                config.num_cal_pkts_per_frame(),
            ),
            pilot_fft_counters: FrameCounters::new(
                total,
                frame.num_pilot_syms(),
                config.bs_ant_num,
            ),
            uplink_fft_counters: FrameCounters::new(total, ul, config.bs_ant_num),
            rc_counters: FrameCounters::per_frame(config.num_cal_pkts_per_frame()),
            beam_counters: FrameCounters::per_frame(config.beam_events_per_symbol()),
            demul_counters: FrameCounters::new(total, ul, config.demul_events_per_symbol()),
            decode_counters: FrameCounters::new(
                total,
                ul,
                config.code_blocks_per_symbol(false) * streams,
            ),
            tomac_counters: FrameCounters::new(total, ul, streams),
            mac_to_phy_counters: FrameCounters::per_frame(streams),
            encode_counters: FrameCounters::new(
                total,
                dl,
                config.code_blocks_per_symbol(true) * streams,
            ),
            precode_counters: FrameCounters::new(total, dl, config.demul_events_per_symbol()),
            ifft_counters: FrameCounters::new(total, dl, config.bs_ant_num),
            tx_counters: FrameCounters::new(total, frame.num_dl_tx_syms(), config.bs_ant_num),
            fft_queues: (0..FRAME_WND).map(|_| VecDeque::new()).collect(),
            fft_created_count: 0,
            beam_last_frame: None,
            rc_last_frame: None,
            pending_beam_frame: None,
            fft_cur_frame_for_symbol: vec![None; ul],
            encode_cur_frame_for_symbol: vec![None; dl],
            ifft_cur_frame_for_symbol: vec![None; dl],
            ifft_next_symbol: 0,
            ran: Arc::new(RanState::new(config.ul_mcs.modulation)),
            pending_ran: None,
            ran_mcs_index: None,
            inline_worker: None,
            events_buf: Vec::with_capacity(max_events),
            io_turn: true,
            finish: false,
            stalled: false,
            cursors: Arc::new(FrameCursors::new()),
            config,
            fabric,
            buffers,
            mac,
            running,
        }
    }

    /// Run one inline worker on the master thread between dispatches
    /// (single-thread mode).
    pub fn set_inline_worker(&mut self, worker: Worker) {
        self.inline_worker = Some(worker);
    }

    pub fn cursors(&self) -> Arc<FrameCursors> {
        self.cursors.clone()
    }

    pub fn cur_sche_frame(&self) -> u64 {
        self.cursors.sche()
    }

    pub fn cur_proc_frame(&self) -> u64 {
        self.cursors.proc()
    }

    pub fn deferral_len(&self) -> usize {
        self.tracker.deferral_len()
    }

    pub fn is_finished(&self) -> bool {
        self.finish
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// The uplink modulation state shared with workers and streamers.
    pub fn ran_state(&self) -> Arc<RanState> {
        self.ran.clone()
    }

    /// MCS index last staged from a RAN update, if any.
    pub fn ran_mcs_index(&self) -> Option<usize> {
        self.ran_mcs_index
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn phy_stats(&self) -> &PhyStats {
        &self.phy_stats
    }

    /// The event loop. Returns once `frames_to_test` frames retired, the
    /// running token was cleared, or a fatal condition stalled the run.
    pub fn run(&mut self) {
        info!(
            "master: frame window {FRAME_WND}, {} symbols/frame, {} workers, {} streamer threads",
            self.config.frame().num_total_syms(),
            self.fabric.num_workers(),
            self.config.socket_thread_num
        );
        while self.running.load(Ordering::Acquire) && !self.finish {
            self.tick();
        }
        self.stats.print_summary();
        self.phy_stats.print_summary();
        if self.config.save_decode_data {
            self.save_decode_data();
        }
        if self.config.save_tx_data {
            self.save_tx_data();
        }
    }

    /// One alternation turn: drain one event source, dispatch each event,
    /// and batch any FFT work that became available.
    pub fn tick(&mut self) {
        let mut events = std::mem::take(&mut self.events_buf);
        events.clear();

        if self.io_turn {
            self.fabric.drain_rx(&mut events);
            if let Some(mac) = &self.mac {
                mac.drain_response(&mut events, DEQUEUE_BULK_SIZE_TXRX);
            }
        } else {
            let qid = (self.cursors.proc() & 1) as usize;
            self.fabric.drain_comp(qid, &mut events);
        }
        self.io_turn = !self.io_turn;

        for i in 0..events.len() {
            self.handle_event(events[i]);
            if self.finish {
                break;
            }
            if let Some(worker) = &mut self.inline_worker {
                worker.run_once();
            }
        }
        if events.is_empty() {
            if let Some(worker) = &mut self.inline_worker {
                worker.run_once();
            }
        }
        self.events_buf = events;
    }

    fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::PacketRx => self.handle_packet_rx(event),
            EventKind::Fft => {
                for tag in event.tags() {
                    self.handle_fft_done(*tag);
                }
            }
            EventKind::Beam => self.handle_beam_done(event),
            EventKind::Demul => self.handle_demul_done(event),
            EventKind::Decode => self.handle_decode_done(event),
            EventKind::PacketToMac => self.handle_tomac_done(event),
            EventKind::PacketFromMac => self.handle_packet_from_mac(event),
            EventKind::Encode => self.handle_encode_done(event),
            EventKind::Precode => self.handle_precode_done(event),
            EventKind::Ifft => self.handle_ifft_done(event),
            EventKind::Broadcast => self.handle_broadcast_done(event),
            EventKind::PacketTx => self.handle_packet_tx_done(event),
            EventKind::RanUpdate => self.handle_ran_update(event),
            // outbound-only kinds on an inbound lane are a programming error
            other => unreachable!("event kind {other:?} on a master lane"),
        }
        // packets accumulated above may now form full FFT batches
        self.try_schedule_fft();
    }

    fn fatal(&mut self, msg: &str) {
        error!("fatal: {msg}");
        self.stalled = true;
        self.running.store(false, Ordering::Release);
    }

    fn qid(frame: u64) -> usize {
        (frame & 1) as usize
    }

    // ---- boundary handlers -------------------------------------------

    fn handle_packet_rx(&mut self, event: Event) {
        let tag = event.tag();
        let ring = &self.buffers.rx_rings[tag.tid()];
        // Safety: the slot was published by its streamer and stays ours
        // until the FFT stage frees it.
        let pkt = unsafe { ring.packet(tag.slot()) };
        let frame = pkt.frame_id as u64;
        let symbol = pkt.symbol_id as usize;

        if frame >= self.cursors.sche() + FRAME_WND as u64 {
            self.fatal(&format!(
                "received packet for future frame {frame} beyond the frame window \
                 ({} + {FRAME_WND}); the pipeline cannot keep up",
                self.cursors.sche()
            ));
            return;
        }

        self.update_rx_counters(frame, symbol);
        self.fft_queues[(frame % FRAME_WND as u64) as usize].push_back(tag);
    }

    fn update_rx_counters(&mut self, frame: u64, symbol: usize) {
        match self.config.frame().symbol_type(symbol) {
            SymbolType::Pilot => {
                if self.rx_counters.add_pilot(frame) {
                    self.stats.set_ts(TsType::PilotAllRx, frame);
                    self.stats.print_frame_done("pilot rx", frame);
                }
            }
            SymbolType::CalUl | SymbolType::CalDl => {
                self.rx_counters.add_cal(frame);
            }
            _ => {}
        }

        let progress = self.rx_counters.add_pkt(frame);
        if progress.first_of_frame {
            self.stats.set_ts(TsType::FirstSymbolRx, frame);
            // without a MAC the downlink payload is static, so the frame's
            // downlink processing starts at first sight of the frame
            if !self.config.enable_mac && self.config.frame().num_dl_tx_syms() > 0 {
                self.start_or_defer_downlink(frame);
            }
        }
        if progress.frame_complete {
            self.stats.set_ts(TsType::RxDone, frame);
            self.stats.print_frame_done("rx", frame);
        }
    }

    fn start_or_defer_downlink(&mut self, frame: u64) {
        if self.tracker.should_defer(&self.cursors, frame) {
            debug!("deferring downlink start of frame {frame}");
            if !self.tracker.push_deferral(frame) {
                self.fatal("deferral queue overflow, a frame is stuck");
            }
        } else {
            self.schedule_downlink_processing(frame);
        }
    }

    fn handle_packet_from_mac(&mut self, event: Event) {
        let frame = event.tag().frame();
        if self.mac_to_phy_counters.complete_task(frame, 0) {
            self.start_or_defer_downlink(frame);
            self.mac_to_phy_counters.reset(frame);
            self.stats.print_frame_done("mac dl payload", frame);
        }
    }

    fn handle_ran_update(&mut self, event: Event) {
        let mcs_index = event.tags()[0].raw() as usize;
        let Some(&order) = UL_MCS_TABLE.get(mcs_index) else {
            warn!("ran update: unknown mcs index {mcs_index}, ignoring");
            return;
        };
        if self.config.ul_subcarriers_at(order).is_none() {
            warn!(
                "ran update: modulation {order} does not fit the symbol layout, ignoring"
            );
            return;
        }
        self.pending_ran = Some(mcs_index);
        self.apply_pending_ran();
    }

    /// Stage a pending MCS change once the previous switch has settled.
    /// The boundary is past every frame already admitted or synthesized.
    fn apply_pending_ran(&mut self) {
        let Some(mcs_index) = self.pending_ran else {
            return;
        };
        let order = UL_MCS_TABLE[mcs_index];
        let boundary = self.cursors.sche() + FRAME_WND as u64;
        if self.ran.try_stage(order, boundary, self.cursors.proc()) {
            self.pending_ran = None;
            self.ran_mcs_index = Some(mcs_index);
            info!("ran update: uplink modulation {order} takes effect at frame {boundary}");
        }
    }

    // ---- pipeline completion handlers --------------------------------

    fn handle_fft_done(&mut self, tag: Tag) {
        let frame = tag.frame();
        let symbol = tag.symbol();
        match self.config.frame().symbol_type(symbol) {
            SymbolType::Pilot => {
                if self.pilot_fft_counters.complete_task(frame, symbol) {
                    if self.pilot_fft_counters.complete_symbol(frame) {
                        self.stats.set_ts(TsType::FftPilotsDone, frame);
                        self.stats.print_frame_done("pilot fft", frame);
                        self.pilot_fft_counters.reset(frame);
                        if self.config.enable_mac {
                            self.send_snr_report(frame);
                        }
                        let cal_gated = self.config.frame().num_cal_syms() > 0
                            && self.rc_last_frame != Some(frame);
                        if cal_gated {
                            self.pending_beam_frame = Some(frame);
                        } else {
                            self.schedule_subcarriers(EventKind::Beam, frame, 0);
                        }
                    }
                }
            }
            SymbolType::Uplink => {
                let ul_idx = self.config.frame().ul_symbol_idx(symbol);
                if self.uplink_fft_counters.complete_task(frame, symbol) {
                    self.fft_cur_frame_for_symbol[ul_idx] = Some(frame);
                    if self.beam_done_for(frame) {
                        self.schedule_subcarriers(EventKind::Demul, frame, symbol);
                    }
                    if self.uplink_fft_counters.complete_symbol(frame) {
                        self.uplink_fft_counters.reset(frame);
                    }
                }
            }
            SymbolType::CalUl | SymbolType::CalDl => {
                if self.rc_counters.complete_task(frame, 0) {
                    self.rc_counters.reset(frame);
                    self.stats.set_ts(TsType::RcDone, frame);
                    self.stats.print_frame_done("calibration", frame);
                    self.rc_last_frame = Some(frame);
                    if self.pending_beam_frame == Some(frame) {
                        self.pending_beam_frame = None;
                        self.schedule_subcarriers(EventKind::Beam, frame, 0);
                    }
                }
            }
            other => unreachable!("fft completion on {other:?} symbol {symbol}"),
        }
    }

    /// Beam matrices are written in frame order, so any newer last-frame
    /// marker implies this frame's beam is complete.
    fn beam_done_for(&self, frame: u64) -> bool {
        self.beam_last_frame.is_some_and(|b| b >= frame)
    }

    fn handle_beam_done(&mut self, event: Event) {
        for tag in event.tags() {
            let frame = tag.frame();
            trace!(
                "beam task done, frame {frame}, {} of {}",
                self.beam_counters.task_count(frame, 0) + 1,
                self.config.beam_events_per_symbol()
            );
            if self.beam_counters.complete_task(frame, 0) {
                self.stats.set_ts(TsType::BeamDone, frame);
                self.beam_last_frame = Some(frame);
                self.stats.print_frame_done("beam", frame);
                self.beam_counters.reset(frame);

                // uplink symbols whose FFT already closed
                for i in 0..self.config.frame().num_ul_syms() {
                    if self.fft_cur_frame_for_symbol[i] == Some(frame) {
                        let symbol = self.config.frame().ul_symbol(i);
                        self.schedule_subcarriers(EventKind::Demul, frame, symbol);
                    }
                }
                // downlink symbols whose encode already closed
                for i in 0..self.config.frame().num_dl_syms() {
                    if self.encode_cur_frame_for_symbol[i].is_some_and(|e| e >= frame) {
                        let symbol = self.config.frame().dl_symbol(i);
                        self.schedule_subcarriers(EventKind::Precode, frame, symbol);
                    }
                }
            }
        }
    }

    fn handle_demul_done(&mut self, event: Event) {
        let tag = event.tag();
        let frame = tag.frame();
        let symbol = tag.symbol();
        if self.demul_counters.complete_task(frame, symbol) {
            if !self.config.ul_hard_demod {
                self.schedule_codeblocks(EventKind::Decode, false, frame, symbol);
            }
            if self.demul_counters.complete_symbol(frame) {
                self.stats.set_ts(TsType::DemulDone, frame);
                self.stats.print_frame_done("demul", frame);
                let order = self.ran.ul_mod_order(frame);
                self.phy_stats
                    .record_evm(frame, order, &self.config, &self.buffers);
                if self.config.ul_hard_demod {
                    debug_assert_eq!(self.cursors.proc(), frame);
                    self.tracker
                        .complete_schedule(&self.cursors, frame, UPLINK_COMPLETE);
                    if self.check_frame_complete(frame) {
                        self.finish = true;
                    }
                } else {
                    self.demul_counters.reset(frame);
                    self.tracker
                        .complete_schedule(&self.cursors, frame, UPLINK_COMPLETE);
                }
            }
        }
    }

    fn handle_decode_done(&mut self, event: Event) {
        let tag = event.tag();
        let frame = tag.frame();
        let symbol = tag.symbol();
        if self.decode_counters.complete_task(frame, symbol) {
            if self.config.enable_mac {
                self.schedule_users(frame, symbol);
            }
            if self.decode_counters.complete_symbol(frame) {
                self.stats.set_ts(TsType::DecodeDone, frame);
                self.stats.print_frame_done("decode", frame);
                let blocks = self.config.code_blocks_per_symbol(false)
                    * self.config.spatial_streams()
                    * self.config.frame().num_ul_syms();
                self.phy_stats.add_decoded_blocks(blocks as u64);
                if !self.config.enable_mac && self.check_frame_complete(frame) {
                    self.finish = true;
                }
            }
        }
    }

    fn handle_tomac_done(&mut self, event: Event) {
        let tag = event.tag();
        let frame = tag.frame();
        if self.tomac_counters.complete_task(frame, tag.symbol()) {
            if self.tomac_counters.complete_symbol(frame) {
                self.stats.print_frame_done("to-mac", frame);
                debug_assert_eq!(self.cursors.proc(), frame);
                if self.check_frame_complete(frame) {
                    self.finish = true;
                }
            }
        }
    }

    fn handle_encode_done(&mut self, event: Event) {
        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            if self.encode_counters.complete_task(frame, symbol) {
                let dl_idx = self.config.frame().dl_symbol_idx(symbol);
                self.encode_cur_frame_for_symbol[dl_idx] = Some(frame);
                if self.beam_done_for(frame) {
                    self.schedule_subcarriers(EventKind::Precode, frame, symbol);
                }
                if self.encode_counters.complete_symbol(frame) {
                    self.encode_counters.reset(frame);
                    self.stats.set_ts(TsType::EncodeDone, frame);
                    self.stats.print_frame_done("encode", frame);
                }
            }
        }
    }

    fn handle_precode_done(&mut self, event: Event) {
        let tag = event.tag();
        let frame = tag.frame();
        let symbol = tag.symbol();
        if self.precode_counters.complete_task(frame, symbol) {
            self.schedule_antennas(EventKind::Ifft, frame, symbol);
            if self.precode_counters.complete_symbol(frame) {
                self.precode_counters.reset(frame);
                self.stats.set_ts(TsType::PrecodeDone, frame);
                self.stats.print_frame_done("precode", frame);
            }
        }
    }

    fn handle_ifft_done(&mut self, event: Event) {
        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            let dl_idx = self.config.frame().dl_symbol_idx(symbol);
            if self.ifft_counters.complete_task(frame, symbol) {
                self.ifft_cur_frame_for_symbol[dl_idx] = Some(frame);
                // transmit in symbol order: release the contiguous run
                if dl_idx == self.ifft_next_symbol {
                    while self.ifft_next_symbol < self.config.frame().num_dl_syms()
                        && self.ifft_cur_frame_for_symbol[self.ifft_next_symbol] == Some(frame)
                    {
                        let symbol = self.config.frame().dl_symbol(self.ifft_next_symbol);
                        self.schedule_antennas_tx(frame, symbol);
                        self.ifft_next_symbol += 1;
                    }
                }
                if self.ifft_counters.complete_symbol(frame) {
                    self.ifft_next_symbol = 0;
                    self.stats.set_ts(TsType::IfftDone, frame);
                    self.stats.print_frame_done("ifft", frame);
                    debug_assert_eq!(self.cursors.proc(), frame);
                    self.tracker
                        .complete_schedule(&self.cursors, frame, DOWNLINK_COMPLETE);
                    if self.check_frame_complete(frame) {
                        self.finish = true;
                        return;
                    }
                }
            }
        }
    }

    fn handle_broadcast_done(&mut self, event: Event) {
        let frame = event.tag().frame();
        self.stats.set_ts(TsType::BroadcastDone, frame);
        for idx in 0..self.config.frame().num_dl_ctrl_syms() {
            let symbol = self.config.frame().dl_ctrl_symbol(idx);
            self.schedule_antennas_tx(frame, symbol);
        }
        self.stats.print_frame_done("broadcast", frame);
    }

    fn handle_packet_tx_done(&mut self, event: Event) {
        let tag = event.tag();
        let frame = tag.frame();
        let symbol = tag.symbol();
        if self.tx_counters.complete_task(frame, symbol) {
            if self.config.frame().dl_tx_symbol_idx(symbol) == 0 {
                self.stats.set_ts(TsType::TxFirst, frame);
                self.stats.print_frame_done("first tx symbol", frame);
            }
            if self.tx_counters.complete_symbol(frame) {
                self.stats.set_ts(TsType::TxDone, frame);
                self.stats.print_frame_done("tx", frame);
                if self.check_frame_complete(frame) {
                    self.finish = true;
                }
            }
        }
    }

    // ---- frame retirement --------------------------------------------

    /// Retire the frame if every terminal stage closed. Safe to call for a
    /// frame that already retired (the reset counters read not-last).
    /// Returns true when this was the last test frame.
    pub fn check_frame_complete(&mut self, frame: u64) -> bool {
        let cfg = self.config.clone();
        let uplink_terminal = if cfg.enable_mac {
            self.tomac_counters.is_last_symbol(frame)
        } else if cfg.ul_hard_demod {
            self.demul_counters.is_last_symbol(frame)
        } else {
            self.decode_counters.is_last_symbol(frame)
        };
        if !(self.ifft_counters.is_last_symbol(frame)
            && self.tx_counters.is_last_symbol(frame)
            && uplink_terminal)
        {
            return false;
        }

        self.stats.update_stats(frame);
        debug_assert_eq!(frame, self.cursors.proc());
        if cfg.ul_hard_demod {
            self.demul_counters.reset(frame);
        }
        self.decode_counters.reset(frame);
        self.tomac_counters.reset(frame);
        self.ifft_counters.reset(frame);
        self.tx_counters.reset(frame);
        self.cursors.advance_proc();
        debug!(
            "frame {frame} retired (proc {}, sche {})",
            self.cursors.proc(),
            self.cursors.sche()
        );
        self.apply_pending_ran();

        if frame == cfg.frames_to_test - 1 {
            return true;
        }
        if let Some(deferred) = self.tracker.pop_deferral_if_ready(&self.cursors) {
            debug_assert!(deferred >= self.cursors.proc());
            debug!("releasing deferred frame {deferred}");
            self.schedule_downlink_processing(deferred);
        }
        false
    }

    // ---- task emission -----------------------------------------------

    /// Batch queued RX packets of the current schedule frame into FFT
    /// tasks. Full blocks go out immediately; the frame's tail goes out
    /// as one remainder event.
    fn try_schedule_fft(&mut self) {
        let sche = self.cursors.sche();
        let block = self.config.fft_block_size.min(MAX_EVENT_TAGS);
        let pkts_per_frame = self.config.num_rx_pkts_per_frame();
        let qid = Self::qid(sche);
        let slot = (sche % FRAME_WND as u64) as usize;

        loop {
            let queued = self.fft_queues[slot].len();
            let take = if queued >= block {
                block
            } else if queued > 0 && self.fft_created_count + queued == pkts_per_frame {
                // the frame's tail goes out short rather than waiting
                queued
            } else {
                break;
            };

            if self.fft_created_count == 0 {
                self.stats.set_ts(TsType::ProcessingStarted, sche);
                self.stats.print_frame_done("processing start", sche);
            }
            let mut event = Event::empty(EventKind::Fft);
            for _ in 0..take {
                event.push(self.fft_queues[slot].pop_front().expect("fft queue underflow"));
            }
            self.fft_created_count += take;
            if self.fft_created_count == pkts_per_frame {
                self.fft_created_count = 0;
            }
            self.fabric.enqueue_task(qid, event);
        }
    }

    /// Emit subcarrier-partitioned tasks in ascending base order.
    fn schedule_subcarriers(&mut self, kind: EventKind, frame: u64, symbol: usize) {
        let (num_events, block) = match kind {
            EventKind::Demul | EventKind::Precode => (
                self.config.demul_events_per_symbol(),
                self.config.demul_block_size,
            ),
            EventKind::Beam => (
                self.config.beam_events_per_symbol(),
                self.config.beam_block_size,
            ),
            other => unreachable!("{other:?} is not subcarrier-partitioned"),
        };
        let qid = Self::qid(frame);
        for i in 0..num_events {
            let tag = Tag::frm_sym_sc(frame, symbol, i * block);
            self.fabric.enqueue_task(qid, Event::new(kind, tag));
        }
    }

    /// Emit code-block tasks coalesced up to the encode block size.
    fn schedule_codeblocks(&mut self, kind: EventKind, dl: bool, frame: u64, symbol: usize) {
        let num_tasks =
            self.config.spatial_streams() * self.config.code_blocks_per_symbol(dl);
        let batch = self.config.encode_block_size.min(MAX_EVENT_TAGS);
        let qid = Self::qid(frame);
        let mut cb = 0;
        while cb < num_tasks {
            let take = batch.min(num_tasks - cb);
            let mut event = Event::empty(kind);
            for _ in 0..take {
                event.push(Tag::frm_sym_cb(frame, symbol, cb));
                cb += 1;
            }
            self.fabric.enqueue_task(qid, event);
        }
    }

    /// Emit antenna-partitioned tasks coalesced up to the FFT block size.
    fn schedule_antennas(&mut self, kind: EventKind, frame: u64, symbol: usize) {
        debug_assert!(matches!(kind, EventKind::Fft | EventKind::Ifft));
        let batch = self.config.fft_block_size.min(MAX_EVENT_TAGS);
        let qid = Self::qid(frame);
        let mut ant = 0;
        while ant < self.config.bs_ant_num {
            let take = batch.min(self.config.bs_ant_num - ant);
            let mut event = Event::empty(kind);
            for _ in 0..take {
                event.push(Tag::frm_sym_ant(frame, symbol, ant));
                ant += 1;
            }
            self.fabric.enqueue_task(qid, event);
        }
    }

    /// Hand one TX task per antenna to the streamer thread owning it.
    fn schedule_antennas_tx(&mut self, frame: u64, symbol: usize) {
        for ant in 0..self.config.bs_ant_num {
            let tid = self.config.ant_to_socket_thread(ant);
            let event = Event::new(EventKind::PacketTx, Tag::frm_sym_ant(frame, symbol, ant));
            self.fabric.enqueue_tx(tid, event);
        }
    }

    /// Tell the MAC a symbol's decoded payload is ready, per stream.
    fn schedule_users(&mut self, frame: u64, symbol: usize) {
        let mac = self.mac.as_ref().expect("mac enabled without queues");
        for ue in 0..self.config.spatial_streams() {
            mac.send_request(Event::new(
                EventKind::PacketToMac,
                Tag::frm_sym_ue(frame, symbol, ue),
            ));
        }
    }

    fn send_snr_report(&mut self, frame: u64) {
        let mac = self.mac.as_ref().expect("mac enabled without queues");
        for ue in 0..self.config.spatial_streams() {
            let snr = self.phy_stats.evm_snr_db(ue);
            let mut event = Event::new(EventKind::SnrReport, Tag::frm_sym_ue(frame, 0, ue));
            event.push(Tag::from_raw(snr.to_bits() as u64));
            mac.send_request(event);
        }
    }

    /// Start a frame's downlink chain: control symbol generation plus the
    /// encode of every downlink data symbol.
    fn schedule_downlink_processing(&mut self, frame: u64) {
        if self.config.frame().num_dl_ctrl_syms() > 0 {
            let qid = Self::qid(frame);
            self.fabric
                .enqueue_task(qid, Event::new(EventKind::Broadcast, Tag::frm_sym(frame, 0)));
        }
        for i in 0..self.config.frame().num_dl_syms() {
            let symbol = self.config.frame().dl_symbol(i);
            self.schedule_codeblocks(EventKind::Encode, true, frame, symbol);
        }
    }

    // ---- persisted output --------------------------------------------

    fn save_decode_data(&self) {
        let frame = self.stats.last_frame();
        info!("saving decoded uplink bits of frame {frame} to {DECODE_DATA_FILENAME}");
        let result = File::create(DECODE_DATA_FILENAME).and_then(|mut f| {
            for ul_idx in 0..self.config.frame().num_ul_syms() {
                for ue in 0..self.config.spatial_streams() {
                    let row = self.buffers.decoded_row(frame, ul_idx, ue);
                    // Safety: the run is over, no writers remain.
                    let bytes = unsafe { self.buffers.decoded.row(row) };
                    f.write_all(bytes)?;
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            error!("writing {DECODE_DATA_FILENAME}: {e}");
        }
    }

    fn save_tx_data(&self) {
        let frame = self.stats.last_frame();
        info!("saving transmitted samples of frame {frame} to {TX_DATA_FILENAME}");
        let result = File::create(TX_DATA_FILENAME).and_then(|mut f| {
            for idx in 0..self.config.frame().num_dl_tx_syms() {
                for ant in 0..self.config.bs_ant_num {
                    let row = self.buffers.dl_socket_row(frame, idx, ant);
                    // Safety: the run is over, no writers remain.
                    let samples = unsafe { self.buffers.dl_socket.row(row) };
                    for s in samples {
                        f.write_all(&s.to_le_bytes())?;
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            error!("writing {TX_DATA_FILENAME}: {e}");
        }
    }
}
