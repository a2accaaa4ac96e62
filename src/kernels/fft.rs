use num_complex::Complex32;
use rustfft::FftPlanner;
use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::config::SymbolType;
use crate::kernels::Doer;
use crate::message::Event;
use crate::message::EventKind;
use crate::message::Tag;

const I16_SCALE: f32 = 1.0 / 32768.0;
const TX_SCALE: f32 = 16384.0;

/// Forward FFT over received packets. Pilot symbols land in the CSI grid,
/// uplink data symbols in the frequency-domain data grid; calibration
/// symbols are counted only.
pub struct Fft {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    plan: Arc<dyn rustfft::Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl Fft {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> Fft {
        let mut planner = FftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(config.fft_size);
        let scratch = vec![Complex32::default(); config.fft_size];
        Fft {
            config,
            buffers,
            plan,
            scratch,
        }
    }
}

impl Doer for Fft {
    fn kind(&self) -> EventKind {
        EventKind::Fft
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = &self.config;
        let mut comp = Event::empty(EventKind::Fft);

        for tag in event.tags() {
            let ring = &self.buffers.rx_rings[tag.tid()];
            let slot = tag.slot();
            // Safety: the slot was published through the fabric and is not
            // freed until this task completes.
            let pkt = unsafe { ring.packet(slot) };
            let frame = pkt.frame_id as u64;
            let symbol = pkt.symbol_id as usize;
            let ant = pkt.ant_id as usize;

            // strip the cyclic prefix and convert to floats
            let time = &pkt.iq[cfg.cp_size * 2..];
            for (i, s) in self.scratch.iter_mut().enumerate() {
                *s = Complex32::new(
                    time[2 * i] as f32 * I16_SCALE,
                    time[2 * i + 1] as f32 * I16_SCALE,
                );
            }
            self.plan.process(&mut self.scratch);

            let bins = &self.scratch[cfg.ofdm_start()..cfg.ofdm_start() + cfg.ofdm_data_num];
            match cfg.frame().symbol_type(symbol) {
                SymbolType::Pilot => {
                    let ue = cfg.frame().pilot_symbol_idx(symbol);
                    let row = self.buffers.csi_row(frame, ue, ant);
                    // Safety: sole writer of this (user, antenna) row while
                    // the pilot FFT counter is open.
                    let csi = unsafe { self.buffers.csi.row_mut(row) };
                    for (sc, bin) in bins.iter().enumerate() {
                        csi[sc] = bin * cfg.pilot(sc).conj();
                    }
                }
                SymbolType::Uplink => {
                    let ul_idx = cfg.frame().ul_symbol_idx(symbol);
                    let row = self.buffers.fft_row(frame, ul_idx, ant);
                    // Safety: sole writer of this (symbol, antenna) row
                    // while the uplink FFT counter is open.
                    let out = unsafe { self.buffers.fft_data.row_mut(row) };
                    out.copy_from_slice(bins);
                }
                SymbolType::CalUl | SymbolType::CalDl => {
                    // counted by the master; no grid output
                }
                other => panic!("FFT task on {other:?} symbol {symbol}"),
            }

            ring.free(slot);
            comp.push(Tag::frm_sym(frame, symbol));
        }
        comp
    }
}

/// Inverse FFT of a precoded downlink symbol into time-domain TX samples
/// with cyclic prefix.
pub struct Ifft {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    plan: Arc<dyn rustfft::Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl Ifft {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> Ifft {
        let mut planner = FftPlanner::<f32>::new();
        let plan = planner.plan_fft_inverse(config.fft_size);
        let scratch = vec![Complex32::default(); config.fft_size];
        Ifft {
            config,
            buffers,
            plan,
            scratch,
        }
    }
}

impl Doer for Ifft {
    fn kind(&self) -> EventKind {
        EventKind::Ifft
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = &self.config;
        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            let ant = tag.ant();
            let dl_idx = cfg.frame().dl_symbol_idx(symbol);

            let grid_row = self.buffers.dl_ifft_row(frame, dl_idx, ant);
            // Safety: precode closed for this symbol before IFFT was
            // scheduled.
            let freq = unsafe { self.buffers.dl_ifft.row(grid_row) };
            self.scratch.copy_from_slice(freq);
            self.plan.process(&mut self.scratch);
            let norm = 1.0 / cfg.fft_size as f32;

            let tx_idx = cfg.frame().dl_tx_symbol_idx(symbol);
            let sock_row = self.buffers.dl_socket_row(frame, tx_idx, ant);
            // Safety: sole writer of this TX packet row while the IFFT
            // counter is open.
            let out = unsafe { self.buffers.dl_socket.row_mut(sock_row) };
            let n = cfg.fft_size;
            let cp = cfg.cp_size;
            for i in 0..n {
                let s = self.scratch[i] * norm * TX_SCALE;
                out[(cp + i) * 2] = s.re.clamp(-32767.0, 32767.0) as i16;
                out[(cp + i) * 2 + 1] = s.im.clamp(-32767.0, 32767.0) as i16;
            }
            // cyclic prefix from the symbol tail
            let (head, tail) = out.split_at_mut(cp * 2);
            head.copy_from_slice(&tail[(n - cp) * 2..]);
        }
        event
    }
}
