use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::kernels::Doer;
use crate::message::Event;
use crate::message::EventKind;

/// Generate the frame's downlink control symbols directly into the TX
/// socket buffer. One task per frame covers every control symbol and
/// antenna.
pub struct Broadcast {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
}

impl Broadcast {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> Broadcast {
        Broadcast { config, buffers }
    }
}

impl Doer for Broadcast {
    fn kind(&self) -> EventKind {
        EventKind::Broadcast
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = self.config.clone();
        for tag in event.tags() {
            let frame = tag.frame();
            for idx in 0..cfg.frame().num_dl_ctrl_syms() {
                let symbol = cfg.frame().dl_ctrl_symbol(idx);
                let tx_idx = cfg.frame().dl_tx_symbol_idx(symbol);
                for ant in 0..cfg.bs_ant_num {
                    let row = self.buffers.dl_socket_row(frame, tx_idx, ant);
                    // Safety: sole writer of this control packet row while
                    // the broadcast stage of the frame is in flight.
                    let out = unsafe { self.buffers.dl_socket.row_mut(row) };
                    fill_control_sequence(out, frame, symbol as u64, ant as u64);
                }
            }
        }
        event
    }
}

/// Deterministic per-(frame, symbol, antenna) control waveform, so a
/// receiver can resolve frame timing without decoding data.
fn fill_control_sequence(out: &mut [i16], frame: u64, symbol: u64, ant: u64) {
    let mut state = (frame << 20) ^ (symbol << 8) ^ ant ^ 0x9e37_79b9;
    for s in out.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *s = (state as i16) >> 2;
    }
}
