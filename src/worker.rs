//! Worker pool
//!
//! Long-running pinned threads, each owning a private instance of every
//! DSP kernel. A worker polls the task lanes of one parity bucket in a
//! fixed kernel order, runs at most one task per sweep, and reports the
//! completion on its own lane. Five consecutive empty sweeps flip the
//! parity bucket so both in-flight frames make progress.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::kernels::BeamWeights;
use crate::kernels::Broadcast;
use crate::kernels::Decode;
use crate::kernels::Demul;
use crate::kernels::Doer;
use crate::kernels::Encode;
use crate::kernels::Fft;
use crate::kernels::Ifft;
use crate::kernels::Precode;
use crate::message::MessageFabric;
use crate::scheduler::FrameCursors;
use crate::scheduler::RanState;

/// Empty sweeps of one bucket before checking the other.
const EMPTY_POLLS_BEFORE_FLIP: usize = 5;

/// Pin the calling thread to the core at `index` (wrapping over the
/// machine's core list).
pub fn pin_to_core(index: usize) {
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => {
            let id = ids[index % ids.len()];
            if !core_affinity::set_for_current(id) {
                warn!("could not pin thread to core {}", id.id);
            }
        }
        _ => warn!("no core ids available, thread left unpinned"),
    }
}

/// One worker: kernels plus bucket-polling state. Also usable inline on
/// the master thread in single-thread mode.
pub struct Worker {
    fabric: Arc<MessageFabric>,
    cursors: Arc<FrameCursors>,
    doers: Vec<Box<dyn Doer>>,
    wid: usize,
    cur_qid: usize,
    empty_polls: usize,
}

impl Worker {
    pub fn new(
        config: Arc<Config>,
        buffers: Arc<BufferPool>,
        fabric: Arc<MessageFabric>,
        cursors: Arc<FrameCursors>,
        ran: Arc<RanState>,
        wid: usize,
    ) -> Worker {
        let frame = config.frame();
        // polling order fixes the priority between stages
        let mut doers: Vec<Box<dyn Doer>> = vec![
            Box::new(BeamWeights::new(config.clone(), buffers.clone())),
            Box::new(Fft::new(config.clone(), buffers.clone())),
        ];
        if frame.num_ul_syms() > 0 {
            doers.push(Box::new(Decode::new(config.clone(), buffers.clone())));
            doers.push(Box::new(Demul::new(config.clone(), buffers.clone(), ran)));
        }
        if frame.num_dl_syms() > 0 {
            doers.push(Box::new(Ifft::new(config.clone(), buffers.clone())));
            doers.push(Box::new(Precode::new(config.clone(), buffers.clone())));
            doers.push(Box::new(Encode::new(config.clone(), buffers.clone())));
        }
        if frame.num_dl_ctrl_syms() > 0 {
            doers.push(Box::new(Broadcast::new(config.clone(), buffers.clone())));
        }
        Worker {
            fabric,
            cursors,
            doers,
            wid,
            cur_qid: 0,
            empty_polls: 0,
        }
    }

    /// One sweep over the kernel order: run at most one task. Returns
    /// whether any work was found.
    pub fn run_once(&mut self) -> bool {
        for doer in self.doers.iter_mut() {
            if let Some(task) = self.fabric.try_dequeue_task(self.cur_qid, doer.kind()) {
                let comp = doer.launch(task);
                self.fabric.enqueue_comp(self.cur_qid, self.wid, comp);
                self.empty_polls = 0;
                return true;
            }
        }
        self.empty_polls += 1;
        if self.empty_polls == EMPTY_POLLS_BEFORE_FLIP {
            let sche = self.cursors.sche();
            if sche != self.cursors.proc() {
                self.cur_qid ^= 1;
            } else {
                self.cur_qid = (sche & 1) as usize;
            }
            self.empty_polls = 0;
        }
        false
    }
}

/// The pinned worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_thread_num` pinned workers. Cores follow the streamer
    /// threads: master, streamers, then workers.
    pub fn spawn(
        config: Arc<Config>,
        buffers: Arc<BufferPool>,
        fabric: Arc<MessageFabric>,
        cursors: Arc<FrameCursors>,
        ran: Arc<RanState>,
        running: Arc<AtomicBool>,
    ) -> WorkerPool {
        let base_core = config.core_offset + 1 + config.socket_thread_num;
        let mut handles = Vec::new();
        for wid in 0..config.worker_thread_num {
            let mut worker = Worker::new(
                config.clone(),
                buffers.clone(),
                fabric.clone(),
                cursors.clone(),
                ran.clone(),
                wid,
            );
            let running = running.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{wid}"))
                .spawn(move || {
                    pin_to_core(base_core + wid);
                    debug!("worker {wid} started");
                    while running.load(Ordering::Acquire) {
                        worker.run_once();
                    }
                    debug!("worker {wid} exiting");
                })
                .expect("cannot spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}
