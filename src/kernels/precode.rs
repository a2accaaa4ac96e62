use num_complex::Complex32;
use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::kernels::modulation;
use crate::kernels::Doer;
use crate::message::Event;
use crate::message::EventKind;

/// Map one subcarrier group of an encoded downlink symbol onto the antenna
/// array with the frame's precoder matrix.
pub struct Precode {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    streams: Vec<Complex32>,
}

impl Precode {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> Precode {
        let n = config.spatial_streams();
        Precode {
            config,
            buffers,
            streams: vec![Complex32::default(); n],
        }
    }
}

impl Doer for Precode {
    fn kind(&self) -> EventKind {
        EventKind::Precode
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = self.config.clone();
        let bs = cfg.bs_ant_num;
        let n = cfg.spatial_streams();
        let order = cfg.mcs(true).modulation;
        let ofdm_start = cfg.ofdm_start();

        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            let base = tag.sc();
            let dl_idx = cfg.frame().dl_symbol_idx(symbol);
            let end = (base + cfg.demul_block_size).min(cfg.ofdm_data_num);

            for sc in base..end {
                for stream in 0..n {
                    let row = self.buffers.dl_mod_row(frame, dl_idx, stream);
                    // Safety: encode closed for this symbol before precode
                    // was scheduled.
                    let points = unsafe { self.buffers.dl_mod.row(row) };
                    self.streams[stream] = modulation::modulate(points[sc] as usize, order);
                }

                let beam_row = self.buffers.beam_row(frame, sc);
                // Safety: beam closed for this frame before precode tasks
                // were scheduled.
                let p = unsafe { self.buffers.dl_beam.row(beam_row) };

                for ant in 0..bs {
                    let mut acc = Complex32::default();
                    for (stream, s) in self.streams.iter().enumerate() {
                        acc += p[ant * n + stream] * s;
                    }
                    let grid_row = self.buffers.dl_ifft_row(frame, dl_idx, ant);
                    // Safety: this task is the only writer of this
                    // subcarrier column while the precode counter is open.
                    unsafe {
                        self.buffers.dl_ifft.write_at(grid_row, ofdm_start + sc, acc);
                    }
                }
            }
        }
        event
    }
}
