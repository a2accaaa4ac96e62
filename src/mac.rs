//! MAC boundary
//!
//! The MAC runs its own event loop and talks to the core over two bounded
//! single-producer/single-consumer lanes: decoded uplink payloads and SNR
//! reports go up, downlink frame payloads and RAN updates come back. The
//! loopback MAC here consumes uplink data and sources deterministic
//! downlink frames; a real MAC replaces it behind the same queues.

use concurrent_queue::ConcurrentQueue;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::config::UL_MCS_TABLE;
use crate::message::send;
use crate::message::Event;
use crate::message::EventKind;
use crate::message::Tag;
use crate::scheduler::FrameCursors;
use crate::worker::pin_to_core;
use crate::FRAME_WND;

const MAC_QUEUE_CAPACITY: usize = 512;

/// SNR (dB) above which the next uplink MCS table entry is requested.
const MCS_SNR_THRESHOLDS_DB: [f32; 2] = [12.0, 22.0];

/// Link adaptation: pick an uplink MCS index for a reported SNR.
fn mcs_index_for_snr(snr_db: f32) -> usize {
    MCS_SNR_THRESHOLDS_DB
        .iter()
        .filter(|t| snr_db >= **t)
        .count()
}

/// The two SPSC lanes between the core and the MAC.
pub struct MacQueues {
    request: ConcurrentQueue<Event>,
    response: ConcurrentQueue<Event>,
}

impl Default for MacQueues {
    fn default() -> Self {
        MacQueues {
            request: ConcurrentQueue::bounded(MAC_QUEUE_CAPACITY),
            response: ConcurrentQueue::bounded(MAC_QUEUE_CAPACITY),
        }
    }
}

impl MacQueues {
    pub fn new() -> MacQueues {
        MacQueues::default()
    }

    /// Core to MAC: decoded payload ready or SNR report.
    pub fn send_request(&self, event: Event) {
        send(&self.request, event, "mac request");
    }

    pub fn try_recv_request(&self) -> Option<Event> {
        self.request.pop().ok()
    }

    /// MAC to core: downlink payload ready or RAN update.
    pub fn send_response(&self, event: Event) {
        send(&self.response, event, "mac response");
    }

    /// Master side: pull up to `max` responses per turn.
    pub fn drain_response(&self, out: &mut Vec<Event>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.response.pop() {
                Ok(ev) => {
                    out.push(ev);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}

/// Loopback MAC event loop: consumes uplink payloads, sources downlink
/// frames, and adapts the uplink MCS to the reported SNR.
pub struct MacThread {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    queues: Arc<MacQueues>,
    cursors: Arc<FrameCursors>,
    running: Arc<AtomicBool>,
    next_dl_frame: u64,
    ul_bytes_received: u64,
    /// Last uplink MCS index requested over the response lane.
    ul_mcs_index: Option<usize>,
}

impl MacThread {
    pub fn spawn(
        config: Arc<Config>,
        buffers: Arc<BufferPool>,
        queues: Arc<MacQueues>,
        cursors: Arc<FrameCursors>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let core = config.core_offset + 1 + config.socket_thread_num + config.worker_thread_num;
        let configured_index = UL_MCS_TABLE
            .iter()
            .position(|o| *o == config.ul_mcs.modulation);
        let mut mac = MacThread {
            config,
            buffers,
            queues,
            cursors,
            running,
            next_dl_frame: 0,
            ul_bytes_received: 0,
            ul_mcs_index: configured_index,
        };
        thread::Builder::new()
            .name("mac".to_string())
            .spawn(move || {
                pin_to_core(core);
                mac.run();
            })
            .expect("cannot spawn mac thread")
    }

    fn run(&mut self) {
        info!("mac: loopback event loop started");
        while self.running.load(Ordering::Acquire) {
            let mut idle = true;
            while let Some(ev) = self.queues.try_recv_request() {
                idle = false;
                self.handle_request(ev);
            }
            if self.produce_downlink() {
                idle = false;
            }
            if idle {
                thread::yield_now();
            }
        }
        info!(
            "mac: exiting, received {} uplink payload bytes",
            self.ul_bytes_received
        );
    }

    fn handle_request(&mut self, event: Event) {
        match event.kind {
            EventKind::PacketToMac => {
                let tag = event.tag();
                let cfg = &self.config;
                let ul_idx = cfg.frame().ul_symbol_idx(tag.symbol());
                let row = self.buffers.decoded_row(tag.frame(), ul_idx, tag.ue());
                // Safety: decode closed for this symbol before the event
                // was sent.
                let payload = unsafe { self.buffers.decoded.row(row) };
                self.ul_bytes_received += payload.len() as u64;
                // acknowledge consumption so the core can retire the frame
                self.queues.send_response(event);
            }
            EventKind::SnrReport => {
                let snr = f32::from_bits(event.tags()[1].raw() as u32);
                trace!(
                    "mac: snr report user {} frame {}: {snr:.1} dB",
                    event.tag().ue(),
                    event.tag().frame()
                );
                let index = mcs_index_for_snr(snr);
                if self.ul_mcs_index != Some(index) {
                    self.ul_mcs_index = Some(index);
                    info!("mac: requesting uplink mcs index {index} at {snr:.1} dB");
                    self.queues
                        .send_response(Event::new(EventKind::RanUpdate, Tag::from_raw(index as u64)));
                }
            }
            other => panic!("unexpected event kind {other:?} on mac request lane"),
        }
    }

    /// Source the next downlink frame payload once its slot is free.
    fn produce_downlink(&mut self) -> bool {
        let cfg = &self.config;
        if cfg.frame().num_dl_syms() == 0
            || self.next_dl_frame >= cfg.frames_to_test
            || self.next_dl_frame >= self.cursors.proc() + FRAME_WND as u64
        {
            return false;
        }
        let frame = self.next_dl_frame;
        let offset = self.buffers.dl_bits_offset(frame);
        let mut payload = vec![0u8; cfg.mac_bytes_per_frame()];
        for ue in 0..cfg.spatial_streams() {
            fill_payload(&mut payload, frame, ue as u64);
            // Safety: the slot's previous frame has retired, and encode for
            // this frame is not scheduled until our event arrives; no other
            // writer touches this slot range.
            unsafe {
                self.buffers.dl_bits.write_slice_at(ue, offset, &payload);
            }
            self.queues
                .send_response(Event::new(EventKind::PacketFromMac, Tag::frm_sym_ue(frame, 0, ue)));
        }
        self.next_dl_frame += 1;
        true
    }
}

/// Deterministic downlink payload for one (frame, user).
pub fn fill_payload(out: &mut [u8], frame: u64, ue: u64) {
    let mut state = (frame << 16) ^ (ue << 8) ^ 0xace1;
    for b in out.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *b = state as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snr_selects_mcs_index() {
        assert_eq!(mcs_index_for_snr(3.0), 0);
        assert_eq!(mcs_index_for_snr(12.0), 1);
        assert_eq!(mcs_index_for_snr(21.9), 1);
        assert_eq!(mcs_index_for_snr(40.0), 2);
        assert!(mcs_index_for_snr(f32::MAX) < UL_MCS_TABLE.len());
    }
}
