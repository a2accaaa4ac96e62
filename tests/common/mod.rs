//! Shared harness: a base station assembled without I/O threads, so tests
//! can inject packets and completions deterministically.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mimosa::buffers::BufferPool;
use mimosa::config::Config;
use mimosa::config::SymbolType;
use mimosa::message::Event;
use mimosa::message::EventKind;
use mimosa::message::MessageFabric;
use mimosa::message::Tag;
use mimosa::message::TagType;
use mimosa::message::WORK_LANE_ORDER;
use mimosa::scheduler::RanState;
use mimosa::scheduler::Scheduler;
use mimosa::streamer::RxSynth;
use mimosa::worker::Worker;
use mimosa::FRAME_WND;
use mimosa::SCHEDULE_QUEUES;

pub struct TestBed {
    pub cfg: Arc<Config>,
    pub fabric: Arc<MessageFabric>,
    pub buffers: Arc<BufferPool>,
    pub sched: Scheduler,
    pub running: Arc<AtomicBool>,
    pub ran: Arc<RanState>,
    synth: RxSynth,
}

#[allow(dead_code)]
impl TestBed {
    /// Build a bed from a finalized config. With `inline_worker` the
    /// master runs the kernels itself; without it, tasks pile up in the
    /// fabric for inspection or for `pump_tasks`.
    pub fn new(cfg: Config, inline_worker: bool) -> TestBed {
        TestBed::with_task_capacity(cfg, None, inline_worker)
    }

    /// Like `new`, with an explicit task-lane capacity to force the
    /// blocking-enqueue fallback.
    pub fn with_task_capacity(
        mut cfg: Config,
        task_capacity: Option<usize>,
        inline_worker: bool,
    ) -> TestBed {
        cfg.finalize().expect("invalid test config");
        let cfg = Arc::new(cfg);
        let running = Arc::new(AtomicBool::new(true));
        let fabric = Arc::new(match task_capacity {
            Some(cap) => MessageFabric::with_capacity(&cfg, cap, 4096),
            None => MessageFabric::new(&cfg),
        });
        let buffers = Arc::new(BufferPool::new(&cfg));
        let mut sched = Scheduler::new(
            cfg.clone(),
            fabric.clone(),
            buffers.clone(),
            None,
            running.clone(),
        );
        let ran = sched.ran_state();
        if inline_worker {
            let worker = Worker::new(
                cfg.clone(),
                buffers.clone(),
                fabric.clone(),
                sched.cursors(),
                ran.clone(),
                0,
            );
            sched.set_inline_worker(worker);
        }
        TestBed {
            synth: RxSynth::new(&cfg),
            cfg,
            fabric,
            buffers,
            sched,
            running,
            ran,
        }
    }

    /// Inject one synthesized RX packet through streamer lane 0, modulated
    /// at the uplink order in effect for the frame.
    pub fn inject_rx(&mut self, frame: u64, symbol: usize, ant: usize) {
        let ul_order = self.ran.ul_mod_order(frame);
        let ring = &self.buffers.rx_rings[0];
        let slot = ring.try_alloc().expect("rx ring exhausted");
        let pkt = unsafe { ring.packet_mut(slot) };
        pkt.frame_id = frame as u32;
        pkt.symbol_id = symbol as u32;
        pkt.cell_id = 0;
        pkt.ant_id = ant as u32;
        self.synth
            .render(&self.cfg, ul_order, frame, symbol, ant, &mut pkt.iq);
        self.fabric
            .enqueue_rx(0, Event::new(EventKind::PacketRx, Tag::rx_slot(0, slot)));
    }

    /// Inject every RX packet of one frame in schedule order.
    pub fn inject_rx_frame(&mut self, frame: u64) {
        for symbol in 0..self.cfg.frame().num_total_syms() {
            if !matches!(
                self.cfg.frame().symbol_type(symbol),
                SymbolType::Pilot | SymbolType::Uplink | SymbolType::CalUl | SymbolType::CalDl
            ) {
                continue;
            }
            for ant in 0..self.cfg.bs_ant_num {
                self.inject_rx(frame, symbol, ant);
            }
        }
    }

    /// Play the streamer's TX side: every pending TX task is treated as
    /// transmitted and echoed back as a completion.
    pub fn echo_tx(&mut self) -> usize {
        let mut n = 0;
        for tid in 0..self.cfg.socket_thread_num {
            while let Some(ev) = self.fabric.try_dequeue_tx(tid) {
                self.fabric.enqueue_rx(tid, ev);
                n += 1;
            }
        }
        n
    }

    /// Window-bound invariant, checked after every step.
    pub fn assert_window(&self) {
        let proc = self.sched.cur_proc_frame();
        let sche = self.sched.cur_sche_frame();
        assert!(
            proc <= sche && sche < proc + FRAME_WND as u64,
            "window bound violated: proc {proc}, sche {sche}"
        );
    }

    /// Drive ticks (echoing TX) until the predicate holds.
    pub fn run_until<F: Fn(&Scheduler) -> bool>(&mut self, max_ticks: usize, pred: F) -> bool {
        for _ in 0..max_ticks {
            if pred(&self.sched) {
                return true;
            }
            self.echo_tx();
            self.sched.tick();
            self.assert_window();
        }
        pred(&self.sched)
    }

    /// Stand-in worker: complete every queued task of the kinds not in
    /// `skip`, without touching any buffer. Asserts parity routing on the
    /// way. Returns how many tasks completed.
    pub fn pump_tasks(&mut self, skip: &[EventKind]) -> usize {
        let mut n = 0;
        for qid in 0..SCHEDULE_QUEUES {
            for kind in WORK_LANE_ORDER {
                if skip.contains(&kind) {
                    continue;
                }
                while let Some(task) = self.fabric.try_dequeue_task(qid, kind) {
                    let comp = self.fake_complete(qid, task);
                    self.fabric.enqueue_comp(qid, 0, comp);
                    n += 1;
                }
            }
        }
        n
    }

    /// How many tasks of one kind are queued across both buckets.
    pub fn queued_tasks(&self, kind: EventKind) -> usize {
        (0..SCHEDULE_QUEUES)
            .map(|qid| self.fabric.task_lane_len(qid, kind))
            .sum()
    }

    fn fake_complete(&self, qid: usize, task: Event) -> Event {
        if task.kind == EventKind::Fft {
            // translate ring-slot tags the way the FFT kernel does
            let mut comp = Event::empty(EventKind::Fft);
            for tag in task.tags() {
                assert_eq!(tag.tag_type(), TagType::RxSlot);
                let ring = &self.buffers.rx_rings[tag.tid()];
                let pkt = unsafe { ring.packet(tag.slot()) };
                assert_eq!(
                    (pkt.frame_id & 1) as usize,
                    qid,
                    "task for frame {} on bucket {qid}",
                    pkt.frame_id
                );
                comp.push(Tag::frm_sym(pkt.frame_id as u64, pkt.symbol_id as usize));
                ring.free(tag.slot());
            }
            comp
        } else {
            for tag in task.tags() {
                assert_eq!(
                    (tag.frame() & 1) as usize,
                    qid,
                    "task for frame {} on bucket {qid}",
                    tag.frame()
                );
            }
            task
        }
    }
}

/// Four antennas, four users, four pilots plus four uplink symbols.
#[allow(dead_code)]
pub fn ul_cfg() -> Config {
    let mut cfg = Config::default();
    cfg.bs_ant_num = 4;
    cfg.ue_ant_num = 4;
    cfg.frame_schedule = "PPPPUUUU".into();
    cfg.fft_size = 256;
    cfg.ofdm_data_num = 192;
    cfg.cp_size = 16;
    cfg.cb_bytes = 16;
    cfg.fft_block_size = 2;
    cfg.encode_block_size = 4;
    cfg.demul_block_size = 64;
    cfg.beam_block_size = 64;
    cfg.worker_thread_num = 0;
    cfg.socket_thread_num = 1;
    cfg.frames_to_test = 1;
    cfg.finalize().unwrap();
    cfg
}

/// Two users, downlink data plus one control symbol, no uplink.
#[allow(dead_code)]
pub fn dl_cfg() -> Config {
    let mut cfg = Config::default();
    cfg.bs_ant_num = 2;
    cfg.ue_ant_num = 2;
    cfg.frame_schedule = "PPCDDDD".into();
    cfg.fft_size = 256;
    cfg.ofdm_data_num = 192;
    cfg.cp_size = 16;
    cfg.cb_bytes = 16;
    cfg.fft_block_size = 2;
    cfg.encode_block_size = 4;
    cfg.demul_block_size = 64;
    cfg.beam_block_size = 64;
    cfg.worker_thread_num = 0;
    cfg.socket_thread_num = 1;
    cfg.frames_to_test = 1;
    cfg.finalize().unwrap();
    cfg
}

/// Both directions, used by the window and deferral scenarios.
#[allow(dead_code)]
pub fn ul_dl_cfg() -> Config {
    let mut cfg = Config::default();
    cfg.bs_ant_num = 2;
    cfg.ue_ant_num = 2;
    cfg.frame_schedule = "PPUUDD".into();
    cfg.fft_size = 256;
    cfg.ofdm_data_num = 192;
    cfg.cp_size = 16;
    cfg.cb_bytes = 16;
    cfg.fft_block_size = 2;
    cfg.encode_block_size = 4;
    cfg.demul_block_size = 64;
    cfg.beam_block_size = 64;
    cfg.worker_thread_num = 0;
    cfg.socket_thread_num = 1;
    cfg.frames_to_test = 8;
    cfg.finalize().unwrap();
    cfg
}
