use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::kernels::scramble;
use crate::kernels::Doer;
use crate::message::Event;
use crate::message::EventKind;

/// Code-block encoder for downlink symbols: scramble, repetition-expand to
/// the coded rate, and map coded bits onto constellation point indices.
pub struct Encode {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    block: Vec<u8>,
    points: Vec<u8>,
}

impl Encode {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> Encode {
        let sc_per_cb = subcarriers_per_block(&config, true);
        Encode {
            block: vec![0u8; config.cb_bytes],
            points: vec![0u8; sc_per_cb],
            config,
            buffers,
        }
    }
}

/// Subcarriers covered by one code block.
fn subcarriers_per_block(cfg: &Config, dl: bool) -> usize {
    let mcs = cfg.mcs(dl);
    cfg.cb_bytes * 8 * mcs.code_rep() / mcs.mod_bits()
}

fn bit(block: &[u8], idx: usize) -> usize {
    ((block[idx / 8] >> (7 - idx % 8)) & 1) as usize
}

impl Doer for Encode {
    fn kind(&self) -> EventKind {
        EventKind::Encode
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = self.config.clone();
        let mcs = cfg.mcs(true);
        let rep = mcs.code_rep();
        let mod_bits = mcs.mod_bits();
        let blocks_per_stream = cfg.code_blocks_per_symbol(true);
        let sc_per_cb = self.points.len();

        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            let cb = tag.cb();
            let stream = cb / blocks_per_stream;
            let blk = cb % blocks_per_stream;
            let dl_idx = cfg.frame().dl_symbol_idx(symbol);

            let offset = self.buffers.dl_bits_offset(frame)
                + dl_idx * cfg.data_bytes_per_symbol(true)
                + blk * cfg.cb_bytes;
            // Safety: the MAC finished writing this frame's payload before
            // encode was scheduled, and other readers touch other ranges.
            let src = unsafe {
                self.buffers
                    .dl_bits
                    .read_slice_at(stream, offset, cfg.cb_bytes)
            };
            self.block.copy_from_slice(src);
            scramble::scramble(&mut self.block);

            // repetition-expand and group coded bits into point indices
            for (sc, point) in self.points.iter_mut().enumerate() {
                let mut index = 0usize;
                for b in 0..mod_bits {
                    let coded = sc * mod_bits + b;
                    index = (index << 1) | bit(&self.block, coded / rep);
                }
                *point = index as u8;
            }

            let row = self.buffers.dl_mod_row(frame, dl_idx, stream);
            // Safety: this task is the only writer of the block's
            // subcarrier range while the encode counter is open.
            unsafe {
                self.buffers
                    .dl_mod
                    .write_slice_at(row, blk * sc_per_cb, &self.points);
            }

            // the last block also clears the symbol's filler tones, which
            // would otherwise replay the slot's previous frame
            let covered = blocks_per_stream * sc_per_cb;
            if blk == blocks_per_stream - 1 && covered < cfg.ofdm_data_num {
                let filler = vec![0u8; cfg.ofdm_data_num - covered];
                // Safety: same exclusive-range discipline; only this task
                // addresses the filler range.
                unsafe {
                    self.buffers.dl_mod.write_slice_at(row, covered, &filler);
                }
            }
        }
        event
    }
}

/// Code-block decoder for uplink symbols: collapse repetitions by LLR sum,
/// hard-decide, and descramble.
pub struct Decode {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    block: Vec<u8>,
}

impl Decode {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> Decode {
        Decode {
            block: vec![0u8; config.cb_bytes],
            config,
            buffers,
        }
    }
}

impl Doer for Decode {
    fn kind(&self) -> EventKind {
        EventKind::Decode
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = self.config.clone();
        let mcs = cfg.mcs(false);
        let rep = mcs.code_rep();
        let blocks_per_stream = cfg.code_blocks_per_symbol(false);
        let coded_bits_per_cb = cfg.cb_bytes * 8 * rep;

        for tag in event.tags() {
            let frame = tag.frame();
            let symbol = tag.symbol();
            let cb = tag.cb();
            let stream = cb / blocks_per_stream;
            let blk = cb % blocks_per_stream;
            let ul_idx = cfg.frame().ul_symbol_idx(symbol);

            let demod_row = self.buffers.demod_row(frame, ul_idx, stream);
            // Safety: demul closed for this symbol before decode was
            // scheduled; the block's coded range is read-only now.
            let llrs = unsafe {
                self.buffers
                    .demod
                    .read_slice_at(demod_row, blk * coded_bits_per_cb, coded_bits_per_cb)
            };

            self.block.fill(0);
            for data_bit in 0..cfg.cb_bytes * 8 {
                let mut metric: i32 = 0;
                for r in 0..rep {
                    metric += llrs[data_bit * rep + r] as i32;
                }
                if metric < 0 {
                    self.block[data_bit / 8] |= 1 << (7 - data_bit % 8);
                }
            }
            scramble::scramble(&mut self.block);

            let row = self.buffers.decoded_row(frame, ul_idx, stream);
            // Safety: this task is the only writer of the block's byte
            // range while the decode counter is open.
            unsafe {
                self.buffers
                    .decoded
                    .write_slice_at(row, blk * cfg.cb_bytes, &self.block);
            }
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_bit_expansion_is_rate_consistent() {
        let mut cfg = Config::default();
        cfg.bs_ant_num = 2;
        cfg.ue_ant_num = 2;
        cfg.frame_schedule = "PPUD".into();
        cfg.fft_size = 2048;
        cfg.ofdm_data_num = 1200;
        cfg.cb_bytes = 64;
        cfg.finalize().unwrap();
        let sc = subcarriers_per_block(&cfg, true);
        let mcs = cfg.mcs(true);
        assert_eq!(sc * mcs.mod_bits(), cfg.cb_bytes * 8 * mcs.code_rep());
        assert!(sc * cfg.code_blocks_per_symbol(true) <= cfg.ofdm_data_num);
    }
}
