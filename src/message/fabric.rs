use concurrent_queue::ConcurrentQueue;
use concurrent_queue::PushError;

use crate::config::Config;
use crate::message::Event;
use crate::message::EventKind;
use crate::message::NUM_WORK_LANES;
use crate::SCHEDULE_QUEUES;

/// Per-lane cap on events the master pulls from one streamer lane per turn.
pub const DEQUEUE_BULK_SIZE_TXRX: usize = 8;
/// Per-lane cap on events the master pulls from one worker lane per turn.
pub const DEQUEUE_BULK_SIZE_WORKER: usize = 8;

/// Task-lane slots per data symbol in flight.
const TASK_QUEUE_SLACK: usize = 64;
/// Boundary-lane slots per data symbol in flight.
const MESSAGE_QUEUE_SLACK: usize = 64;

/// The bounded lock-free lanes connecting master, workers, and streamers.
///
/// Every producer owns a dedicated lane: workers and streamers never share a
/// tail pointer, bulk transfers touch one lane at a time, and per-producer
/// FIFO order is structural. Task lanes are split per parity bucket and per
/// worker event kind; the master fills bucket `frame % 2` while workers may
/// still be draining the other.
pub struct MessageFabric {
    /// `[parity][work lane]`, master to workers.
    task: Vec<Vec<ConcurrentQueue<Event>>>,
    /// `[parity][worker]`, workers to master.
    comp: Vec<Vec<ConcurrentQueue<Event>>>,
    /// Per streamer thread, streamer to master.
    rx: Vec<ConcurrentQueue<Event>>,
    /// Per streamer thread, master to streamer.
    tx: Vec<ConcurrentQueue<Event>>,
}

impl MessageFabric {
    pub fn new(cfg: &Config) -> MessageFabric {
        let syms = cfg.frame().num_data_syms().max(1);
        MessageFabric::with_capacity(
            cfg,
            TASK_QUEUE_SLACK * syms,
            MESSAGE_QUEUE_SLACK * syms,
        )
    }

    /// Explicit lane capacities; `new` derives them from the frame layout.
    pub fn with_capacity(
        cfg: &Config,
        task_capacity: usize,
        message_capacity: usize,
    ) -> MessageFabric {
        let num_workers = cfg.worker_thread_num.max(1);
        let task = (0..SCHEDULE_QUEUES)
            .map(|_| {
                (0..NUM_WORK_LANES)
                    .map(|_| ConcurrentQueue::bounded(task_capacity))
                    .collect()
            })
            .collect();
        let comp = (0..SCHEDULE_QUEUES)
            .map(|_| {
                (0..num_workers)
                    .map(|_| ConcurrentQueue::bounded(message_capacity))
                    .collect()
            })
            .collect();
        let rx = (0..cfg.socket_thread_num)
            .map(|_| ConcurrentQueue::bounded(message_capacity))
            .collect();
        let tx = (0..cfg.socket_thread_num)
            .map(|_| ConcurrentQueue::bounded(message_capacity))
            .collect();
        MessageFabric { task, comp, rx, tx }
    }

    pub fn num_workers(&self) -> usize {
        self.comp[0].len()
    }

    pub fn num_socket_threads(&self) -> usize {
        self.rx.len()
    }

    /// Master side: place a task on the parity bucket's lane for its kind.
    pub fn enqueue_task(&self, qid: usize, event: Event) {
        let lane = event
            .kind
            .work_lane()
            .unwrap_or_else(|| panic!("{:?} is not a worker task", event.kind));
        send(&self.task[qid][lane], event, "task");
    }

    /// Worker side: poll one task of `kind` from a parity bucket.
    pub fn try_dequeue_task(&self, qid: usize, kind: EventKind) -> Option<Event> {
        let lane = kind.work_lane().expect("not a worker task kind");
        self.task[qid][lane].pop().ok()
    }

    pub fn task_lane_len(&self, qid: usize, kind: EventKind) -> usize {
        let lane = kind.work_lane().expect("not a worker task kind");
        self.task[qid][lane].len()
    }

    /// Worker side: report a completion on this worker's own lane.
    pub fn enqueue_comp(&self, qid: usize, worker: usize, event: Event) {
        send(&self.comp[qid][worker], event, "completion");
    }

    /// Master side: drain every worker's completion lane of one bucket,
    /// up to [`DEQUEUE_BULK_SIZE_WORKER`] events per lane.
    pub fn drain_comp(&self, qid: usize, out: &mut Vec<Event>) -> usize {
        let mut total = 0;
        for lane in &self.comp[qid] {
            for _ in 0..DEQUEUE_BULK_SIZE_WORKER {
                match lane.pop() {
                    Ok(ev) => {
                        out.push(ev);
                        total += 1;
                    }
                    Err(_) => break,
                }
            }
        }
        total
    }

    /// Streamer side: deliver an RX packet event or a TX-done notification.
    pub fn enqueue_rx(&self, tid: usize, event: Event) {
        send(&self.rx[tid], event, "rx");
    }

    /// Master side: drain every streamer lane round-robin, up to
    /// [`DEQUEUE_BULK_SIZE_TXRX`] events per lane.
    pub fn drain_rx(&self, out: &mut Vec<Event>) -> usize {
        let mut total = 0;
        for lane in &self.rx {
            for _ in 0..DEQUEUE_BULK_SIZE_TXRX {
                match lane.pop() {
                    Ok(ev) => {
                        out.push(ev);
                        total += 1;
                    }
                    Err(_) => break,
                }
            }
        }
        total
    }

    /// Master side: hand a TX task to the streamer thread owning the antenna.
    pub fn enqueue_tx(&self, tid: usize, event: Event) {
        send(&self.tx[tid], event, "tx");
    }

    /// Streamer side: poll this thread's TX lane.
    pub fn try_dequeue_tx(&self, tid: usize) -> Option<Event> {
        self.tx[tid].pop().ok()
    }

    pub fn tx_lane_len(&self, tid: usize) -> usize {
        self.tx[tid].len()
    }
}

/// Push with the blocking fallback. A full lane is a capacity
/// misconfiguration signal, so the fallback is logged; losing the event is
/// never an option.
pub(crate) fn send(queue: &ConcurrentQueue<Event>, event: Event, what: &str) {
    let mut event = match queue.push(event) {
        Ok(()) => return,
        Err(PushError::Full(ev)) => {
            warn!(
                "{what} lane full (capacity {:?}), falling back to blocking enqueue",
                queue.capacity()
            );
            ev
        }
        Err(PushError::Closed(_)) => panic!("{what} lane closed while running"),
    };
    loop {
        match queue.push(event) {
            Ok(()) => return,
            Err(PushError::Full(ev)) => {
                event = ev;
                std::thread::yield_now();
            }
            Err(PushError::Closed(_)) => panic!("{what} lane closed while running"),
        }
    }
}
