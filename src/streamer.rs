//! Streamer boundary
//!
//! The radio I/O side of the core: RX producers push `PacketRx` events
//! tagged with a packet ring slot, and a TX consumer drains `PacketTx`
//! events, transmits the addressed socket buffer row, and echoes the event
//! back as a completion. Hardware streamers (radio, DPDK) live behind the
//! same trait; the crate ships the channel simulator used for bring-up.

use num_complex::Complex32;
use rustfft::FftPlanner;
use std::f32::consts::TAU;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::buffers::BufferPool;
use crate::config::mod_bits_of;
use crate::config::Config;
use crate::config::SymbolType;
use crate::kernels::modulation;
use crate::kernels::scramble;
use crate::mac::fill_payload;
use crate::message::Event;
use crate::message::EventKind;
use crate::message::MessageFabric;
use crate::message::Tag;
use crate::scheduler::FrameCursors;
use crate::scheduler::RanState;
use crate::worker::pin_to_core;
use crate::FRAME_WND;

/// Transmit amplitude of synthesized packets.
const SIM_TX_GAIN: f32 = 4096.0;

/// Little-endian wire header preceding each packet's interleaved i16 I/Q.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub symbol_id: u32,
    pub cell_id: u32,
    pub ant_id: u32,
}

impl PacketHeader {
    pub const LEN: usize = 16;

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.frame_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.symbol_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.cell_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.ant_id.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> PacketHeader {
        let field = |i: usize| {
            u32::from_le_bytes(bytes[i * 4..(i + 1) * 4].try_into().expect("short header"))
        };
        PacketHeader {
            frame_id: field(0),
            symbol_id: field(1),
            cell_id: field(2),
            ant_id: field(3),
        }
    }
}

/// Boundary contract between the radio I/O pool and the core.
pub trait Streamer: Send {
    /// Arm hardware and start the I/O threads. `Ok(false)` means the radio
    /// failed to start and the core must terminate cleanly.
    fn start_txrx(&mut self) -> anyhow::Result<bool>;

    /// Join the I/O threads. The running token must already be cleared.
    fn stop(&mut self);

    /// Packets transmitted so far.
    fn tx_count(&self) -> u64;
}

/// Deterministic frequency-flat channel gain between a base-station
/// antenna and a user. The per-user columns are orthogonal (phase-ramped
/// DFT columns), so the simulated array response is always invertible.
pub fn channel_gain(ant: usize, ue: usize, bs_ant_num: usize) -> Complex32 {
    let phase = TAU
        * ((ant * ue) as f32 / bs_ant_num as f32
            + 0.137 * ue as f32
            + 0.053 * ant as f32);
    Complex32::new(phase.cos(), phase.sin())
}

/// Reusable renderer for simulated RX packets: an inverse FFT plan plus
/// its scratch row.
pub struct RxSynth {
    plan: Arc<dyn rustfft::Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl RxSynth {
    pub fn new(cfg: &Config) -> RxSynth {
        let mut planner = FftPlanner::<f32>::new();
        RxSynth {
            plan: planner.plan_fft_inverse(cfg.fft_size),
            scratch: vec![Complex32::default(); cfg.fft_size],
        }
    }

    pub fn render(
        &mut self,
        cfg: &Config,
        ul_order: usize,
        frame: u64,
        symbol: usize,
        ant: usize,
        out: &mut [i16],
    ) {
        synthesize_rx_iq(cfg, ul_order, &*self.plan, &mut self.scratch, frame, symbol, ant, out);
    }
}

/// The uplink payload a user transmits in one (frame, symbol); the decoded
/// output must reproduce it.
pub fn ul_payload(cfg: &Config, frame: u64, ul_idx: usize, ue: usize) -> Vec<u8> {
    let mut out = vec![0u8; cfg.data_bytes_per_symbol(false)];
    fill_payload(&mut out, frame.wrapping_mul(64).wrapping_add(ul_idx as u64), ue as u64);
    out
}

/// Channel-simulator streamer: pinned I/O threads that synthesize the
/// over-the-air uplink and consume the downlink.
pub struct SimStreamer {
    config: Arc<Config>,
    fabric: Arc<MessageFabric>,
    buffers: Arc<BufferPool>,
    cursors: Arc<FrameCursors>,
    ran: Arc<RanState>,
    running: Arc<AtomicBool>,
    tx_count: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl SimStreamer {
    pub fn new(
        config: Arc<Config>,
        fabric: Arc<MessageFabric>,
        buffers: Arc<BufferPool>,
        cursors: Arc<FrameCursors>,
        ran: Arc<RanState>,
        running: Arc<AtomicBool>,
    ) -> SimStreamer {
        SimStreamer {
            config,
            fabric,
            buffers,
            cursors,
            ran,
            running,
            tx_count: Arc::new(AtomicU64::new(0)),
            handles: Vec::new(),
        }
    }
}

impl Streamer for SimStreamer {
    fn start_txrx(&mut self) -> anyhow::Result<bool> {
        for tid in 0..self.config.socket_thread_num {
            let mut worker = SimThread {
                synth: RxSynth::new(&self.config),
                config: self.config.clone(),
                fabric: self.fabric.clone(),
                buffers: self.buffers.clone(),
                cursors: self.cursors.clone(),
                ran: self.ran.clone(),
                running: self.running.clone(),
                tx_count: self.tx_count.clone(),
                tid,
            };
            let core = self.config.core_offset + 1 + tid;
            let handle = thread::Builder::new()
                .name(format!("stream-{tid}"))
                .spawn(move || {
                    pin_to_core(core);
                    worker.run();
                })
                .expect("cannot spawn streamer thread");
            self.handles.push(handle);
        }
        Ok(true)
    }

    fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("streamer thread panicked");
            }
        }
    }

    fn tx_count(&self) -> u64 {
        self.tx_count.load(Ordering::Relaxed)
    }
}

struct SimThread {
    config: Arc<Config>,
    fabric: Arc<MessageFabric>,
    buffers: Arc<BufferPool>,
    cursors: Arc<FrameCursors>,
    ran: Arc<RanState>,
    running: Arc<AtomicBool>,
    tx_count: Arc<AtomicU64>,
    tid: usize,
    synth: RxSynth,
}

impl SimThread {
    fn run(&mut self) {
        let frames = self.config.frames_to_test;

        'frames: for frame in 0..frames {
            // respect the frame window: never inject a packet the master
            // would treat as a pipeline stall
            while frame >= self.cursors.sche() + FRAME_WND as u64 {
                if !self.running.load(Ordering::Acquire) {
                    break 'frames;
                }
                self.drain_tx();
                thread::yield_now();
            }
            for symbol in 0..self.config.frame().num_total_syms() {
                let ty = self.config.frame().symbol_type(symbol);
                if !matches!(
                    ty,
                    SymbolType::Pilot | SymbolType::Uplink | SymbolType::CalUl | SymbolType::CalDl
                ) {
                    continue;
                }
                for ant in 0..self.config.bs_ant_num {
                    if self.config.ant_to_socket_thread(ant) != self.tid {
                        continue;
                    }
                    if !self.running.load(Ordering::Acquire) {
                        break 'frames;
                    }
                    self.inject_packet(frame, symbol, ant);
                }
                self.drain_tx();
            }
        }

        // keep consuming the downlink until shutdown
        while self.running.load(Ordering::Acquire) {
            if !self.drain_tx() {
                thread::yield_now();
            }
        }
        debug!("streamer {} exiting", self.tid);
    }

    /// Synthesize what the antenna would receive for one symbol and
    /// publish it as an RX packet event.
    fn inject_packet(&mut self, frame: u64, symbol: usize, ant: usize) {
        let cfg = self.config.clone();
        let slot = loop {
            match self.buffers.rx_rings[self.tid].try_alloc() {
                Some(slot) => break slot,
                None => {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    self.drain_tx();
                    thread::yield_now();
                }
            }
        };

        // the modulation a user applies is fixed per frame by the RAN
        let ul_order = self.ran.ul_mod_order(frame);
        // Safety: we own the slot between alloc and the event publish.
        let pkt = unsafe { self.buffers.rx_rings[self.tid].packet_mut(slot) };
        pkt.frame_id = frame as u32;
        pkt.symbol_id = symbol as u32;
        pkt.cell_id = 0;
        pkt.ant_id = ant as u32;
        self.synth.render(&cfg, ul_order, frame, symbol, ant, &mut pkt.iq);

        self.fabric
            .enqueue_rx(self.tid, Event::new(EventKind::PacketRx, Tag::rx_slot(self.tid, slot)));
    }

    /// Transmit pending downlink packets; each transmission is echoed back
    /// to the master as a completion. Returns whether anything was sent.
    fn drain_tx(&mut self) -> bool {
        let mut any = false;
        while let Some(event) = self.fabric.try_dequeue_tx(self.tid) {
            let tag = event.tag();
            let tx_idx = self.config.frame().dl_tx_symbol_idx(tag.symbol());
            let row = self.buffers.dl_socket_row(tag.frame(), tx_idx, tag.ant());
            // Safety: IFFT (or broadcast) closed for this symbol before the
            // TX task was issued.
            let samples = unsafe { self.buffers.dl_socket.row(row) };
            debug_assert_eq!(samples.len(), self.config.samps_per_symbol() * 2);
            self.tx_count.fetch_add(1, Ordering::Relaxed);
            self.fabric.enqueue_rx(self.tid, event);
            any = true;
        }
        any
    }
}

/// Render the time-domain i16 I/Q an antenna would receive for one symbol
/// over the simulated channel, cyclic prefix included. `ul_order` is the
/// modulation the users apply to uplink data this frame.
pub fn synthesize_rx_iq(
    cfg: &Config,
    ul_order: usize,
    plan: &dyn rustfft::Fft<f32>,
    scratch: &mut [Complex32],
    frame: u64,
    symbol: usize,
    ant: usize,
    out: &mut [i16],
) {
    debug_assert_eq!(scratch.len(), cfg.fft_size);
    debug_assert_eq!(out.len(), cfg.samps_per_symbol() * 2);
    scratch.fill(Complex32::default());
    let start = cfg.ofdm_start();

    match cfg.frame().symbol_type(symbol) {
        SymbolType::Pilot | SymbolType::CalUl | SymbolType::CalDl => {
            // one user sounds the channel per pilot symbol
            let ue = if cfg.frame().symbol_type(symbol) == SymbolType::Pilot {
                cfg.frame().pilot_symbol_idx(symbol)
            } else {
                0
            };
            let h = channel_gain(ant, ue, cfg.bs_ant_num);
            for sc in 0..cfg.ofdm_data_num {
                scratch[start + sc] = h * cfg.pilot(sc);
            }
        }
        SymbolType::Uplink => {
            let ul_idx = cfg.frame().ul_symbol_idx(symbol);
            for ue in 0..cfg.spatial_streams() {
                let h = channel_gain(ant, ue, cfg.bs_ant_num);
                let points = ul_symbol_points(cfg, ul_order, frame, ul_idx, ue);
                for (sc, point) in points.into_iter().enumerate() {
                    scratch[start + sc] += h * modulation::modulate(point as usize, ul_order);
                }
            }
        }
        other => unreachable!("synthesizing {other:?} symbol"),
    }

    plan.process(scratch);
    let norm = SIM_TX_GAIN / cfg.fft_size as f32;
    let n = cfg.fft_size;
    let cp = cfg.cp_size;
    for (i, s) in scratch.iter().enumerate() {
        out[(cp + i) * 2] = (s.re * norm).clamp(-32767.0, 32767.0) as i16;
        out[(cp + i) * 2 + 1] = (s.im * norm).clamp(-32767.0, 32767.0) as i16;
    }
    for i in 0..cp * 2 {
        out[i] = out[(n - cp) * 2 + i];
    }
}

/// Constellation point indices a user transmits on one uplink symbol at
/// `ul_order`, mirrored by the decode pipeline. Subcarriers past the coded
/// footprint stay at point zero.
pub fn ul_symbol_points(cfg: &Config, ul_order: usize, frame: u64, ul_idx: usize, ue: usize) -> Vec<u8> {
    let rep = cfg.mcs(false).code_rep();
    let mod_bits = mod_bits_of(ul_order);
    let payload = ul_payload(cfg, frame, ul_idx, ue);
    let blocks = cfg.code_blocks_per_symbol(false);
    let sc_per_cb = cfg.cb_bytes * 8 * rep / mod_bits;
    debug_assert!(blocks * sc_per_cb <= cfg.ofdm_data_num);

    let mut points = vec![0u8; cfg.ofdm_data_num];
    for blk in 0..blocks {
        let mut block = payload[blk * cfg.cb_bytes..(blk + 1) * cfg.cb_bytes].to_vec();
        scramble::scramble(&mut block);
        for sc in 0..sc_per_cb {
            let mut index = 0usize;
            for b in 0..mod_bits {
                let coded = sc * mod_bits + b;
                let data_bit = coded / rep;
                index = (index << 1)
                    | (((block[data_bit / 8] >> (7 - data_bit % 8)) & 1) as usize);
            }
            points[blk * sc_per_cb + sc] = index as u8;
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = PacketHeader {
            frame_id: 7,
            symbol_id: 3,
            cell_id: 0,
            ant_id: 63,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(bytes[0], 7);
        assert_eq!(PacketHeader::from_bytes(&bytes), hdr);
    }

    #[test]
    fn channel_columns_are_orthogonal() {
        let bs = 8;
        for a in 0..4usize {
            for b in 0..4usize {
                let dot: Complex32 = (0..bs)
                    .map(|ant| channel_gain(ant, a, bs) * channel_gain(ant, b, bs).conj())
                    .sum();
                if a == b {
                    assert!((dot.norm() - bs as f32).abs() < 1e-3);
                } else {
                    assert!(dot.norm() < 1e-3, "columns {a},{b}: {dot:?}");
                }
            }
        }
    }
}
