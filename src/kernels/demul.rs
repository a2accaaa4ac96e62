use num_complex::Complex32;
use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::mod_bits_of;
use crate::config::Config;
use crate::kernels::modulation;
use crate::kernels::Doer;
use crate::message::Event;
use crate::message::EventKind;
use crate::scheduler::RanState;

/// LLR magnitude scaling applied to max-log metrics before i8 saturation.
const LLR_SCALE: f32 = 32.0;

/// Equalize one subcarrier group of an uplink symbol with the frame's
/// detector matrix and demap the result to soft bits at the modulation
/// order the frame runs at.
pub struct Demul {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    ran: Arc<RanState>,
    streams: Vec<Complex32>,
    /// Sized for the widest constellation; only the active order's bits
    /// are used.
    llr: Vec<i8>,
}

impl Demul {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>, ran: Arc<RanState>) -> Demul {
        let n = config.spatial_streams();
        Demul {
            config,
            buffers,
            ran,
            streams: vec![Complex32::default(); n],
            llr: vec![0i8; mod_bits_of(64)],
        }
    }
}

impl Doer for Demul {
    fn kind(&self) -> EventKind {
        EventKind::Demul
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = self.config.clone();
        let bs = cfg.bs_ant_num;
        let n = cfg.spatial_streams();
        let coded_bits = cfg.ul_coded_bits_per_symbol();

        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            let base = tag.sc();
            let ul_idx = cfg.frame().ul_symbol_idx(symbol);
            let end = (base + cfg.demul_block_size).min(cfg.ofdm_data_num);

            let order = self.ran.ul_mod_order(frame);
            let mod_bits = mod_bits_of(order);
            debug_assert_eq!(coded_bits % mod_bits, 0);
            // subcarriers carrying coded bits at this order; the rest of
            // the symbol is filler
            let covered_sc = coded_bits / mod_bits;

            for sc in base..end {
                let beam_row = self.buffers.beam_row(frame, sc);
                // Safety: beam closed for this frame before demul tasks
                // were scheduled.
                let w = unsafe { self.buffers.ul_beam.row(beam_row) };

                for stream in 0..n {
                    let mut acc = Complex32::default();
                    for ant in 0..bs {
                        let fft_row = self.buffers.fft_row(frame, ul_idx, ant);
                        // Safety: uplink FFT closed for this symbol before
                        // demul tasks were scheduled.
                        let y = unsafe { self.buffers.fft_data.row(fft_row) };
                        acc += w[stream * bs + ant] * y[sc];
                    }
                    self.streams[stream] = acc;
                }

                let equal_row = self.buffers.equal_row(frame, ul_idx);
                for (stream, s) in self.streams.iter().enumerate() {
                    // Safety: this task is the only writer of these
                    // subcarrier columns while the demul counter is open.
                    unsafe {
                        self.buffers.equal.write_at(equal_row, sc * n + stream, *s);
                    }
                    if sc >= covered_sc {
                        continue;
                    }
                    let llr = &mut self.llr[..mod_bits];
                    if cfg.ul_hard_demod {
                        modulation::demod_hard_llr(*s, order, llr);
                    } else {
                        modulation::demod_soft(*s, order, LLR_SCALE, llr);
                    }
                    let demod_row = self.buffers.demod_row(frame, ul_idx, stream);
                    // Safety: same exclusive-columns discipline as above.
                    unsafe {
                        self.buffers
                            .demod
                            .write_slice_at(demod_row, sc * mod_bits, llr);
                    }
                }
            }
        }
        event
    }
}
