use num_complex::Complex32;
use std::sync::Arc;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::kernels::Doer;
use crate::message::Event;
use crate::message::EventKind;

/// Diagonal loading applied before inversion to keep ill-conditioned
/// channels invertible.
const REGULARIZATION: f32 = 1e-5;

/// Zero-forcing beam weights for one subcarrier group: the uplink detector
/// and the downlink precoder from the frame's channel estimates.
pub struct BeamWeights {
    config: Arc<Config>,
    buffers: Arc<BufferPool>,
    /// Gathered channel, antennas x streams.
    csi_gather: Vec<Complex32>,
    gram: Vec<Complex32>,
    inverse: Vec<Complex32>,
}

impl BeamWeights {
    pub fn new(config: Arc<Config>, buffers: Arc<BufferPool>) -> BeamWeights {
        let n = config.spatial_streams();
        let gather = config.bs_ant_num * n;
        BeamWeights {
            config,
            buffers,
            csi_gather: vec![Complex32::default(); gather],
            gram: vec![Complex32::default(); n * n],
            inverse: vec![Complex32::default(); n * n],
        }
    }

    fn compute_one(&mut self, frame: u64, sc: usize) {
        let cfg = &self.config;
        let bs = cfg.bs_ant_num;
        let n = cfg.spatial_streams();

        // H[ant][ue] for this subcarrier
        for ue in 0..n {
            for ant in 0..bs {
                let row = self.buffers.csi_row(frame, ue, ant);
                // Safety: pilot FFT closed for this frame before beam
                // tasks were scheduled.
                let csi = unsafe { self.buffers.csi.row(row) };
                self.csi_gather[ant * n + ue] = csi[sc];
            }
        }

        // gram = H^H H + eps I
        for i in 0..n {
            for j in 0..n {
                let mut acc = Complex32::default();
                for ant in 0..bs {
                    acc += self.csi_gather[ant * n + i].conj() * self.csi_gather[ant * n + j];
                }
                if i == j {
                    acc += REGULARIZATION;
                }
                self.gram[i * n + j] = acc;
            }
        }

        self.inverse.copy_from_slice(&self.gram);
        invert_in_place(&mut self.inverse, n);

        let beam_row = self.buffers.beam_row(frame, sc);
        // Safety: sole writer of this subcarrier's rows while the beam
        // counter is open.
        let ul = unsafe { self.buffers.ul_beam.row_mut(beam_row) };
        let dl = unsafe { self.buffers.dl_beam.row_mut(beam_row) };

        // detector W = (H^H H)^-1 H^H, streams x antennas
        for stream in 0..n {
            for ant in 0..bs {
                let mut acc = Complex32::default();
                for k in 0..n {
                    acc += self.inverse[stream * n + k] * self.csi_gather[ant * n + k].conj();
                }
                ul[stream * bs + ant] = acc;
            }
        }

        // precoder P = conj(H (H^H H)^-1), antennas x streams
        for ant in 0..bs {
            for stream in 0..n {
                let mut acc = Complex32::default();
                for k in 0..n {
                    acc += self.csi_gather[ant * n + k] * self.inverse[k * n + stream];
                }
                dl[ant * n + stream] = acc.conj();
            }
        }
    }
}

impl Doer for BeamWeights {
    fn kind(&self) -> EventKind {
        EventKind::Beam
    }

    fn launch(&mut self, event: Event) -> Event {
        let cfg = self.config.clone();
        for tag in event.tags() {
            let frame = tag.frame();
            let base = tag.sc();
            let end = (base + cfg.beam_block_size).min(cfg.ofdm_data_num);
            for sc in base..end {
                self.compute_one(frame, sc);
            }
        }
        event
    }
}

/// Gauss-Jordan inversion with partial pivoting, in place. `m` is a dense
/// n x n row-major complex matrix. Singular inputs (which diagonal loading
/// prevents) leave the matrix unusable but do not diverge.
fn invert_in_place(m: &mut [Complex32], n: usize) {
    debug_assert_eq!(m.len(), n * n);
    let mut aug = vec![Complex32::default(); n * 2 * n];
    for r in 0..n {
        aug[r * 2 * n..r * 2 * n + n].copy_from_slice(&m[r * n..(r + 1) * n]);
        aug[r * 2 * n + n + r] = Complex32::new(1.0, 0.0);
    }
    let w = 2 * n;
    for col in 0..n {
        // pivot on the largest magnitude in this column
        let mut pivot = col;
        let mut best = aug[col * w + col].norm_sqr();
        for r in col + 1..n {
            let mag = aug[r * w + col].norm_sqr();
            if mag > best {
                best = mag;
                pivot = r;
            }
        }
        if best == 0.0 {
            return;
        }
        if pivot != col {
            for c in 0..w {
                aug.swap(col * w + c, pivot * w + c);
            }
        }
        let inv_p = Complex32::new(1.0, 0.0) / aug[col * w + col];
        for c in 0..w {
            aug[col * w + c] *= inv_p;
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = aug[r * w + col];
            if factor.norm_sqr() == 0.0 {
                continue;
            }
            for c in 0..w {
                let sub = factor * aug[col * w + c];
                aug[r * w + c] -= sub;
            }
        }
    }
    for r in 0..n {
        m[r * n..(r + 1) * n].copy_from_slice(&aug[r * w + n..r * w + w]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mul(a: &[Complex32], b: &[Complex32], n: usize) -> Vec<Complex32> {
        let mut out = vec![Complex32::default(); n * n];
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    out[i * n + j] += a[i * n + k] * b[k * n + j];
                }
            }
        }
        out
    }

    #[test]
    fn inversion_round_trip() {
        let n = 3;
        let m: Vec<Complex32> = [
            (2.0, 0.5),
            (0.1, -0.3),
            (0.0, 0.2),
            (-0.4, 0.0),
            (1.5, 0.1),
            (0.3, 0.3),
            (0.2, -0.1),
            (0.0, 0.0),
            (3.0, -0.5),
        ]
        .iter()
        .map(|(re, im)| Complex32::new(*re, *im))
        .collect();
        let mut inv = m.clone();
        invert_in_place(&mut inv, n);
        let prod = mul(&m, &inv, n);
        for i in 0..n {
            for j in 0..n {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (prod[i * n + j] - Complex32::new(expect, 0.0)).norm() < 1e-4,
                    "element ({i},{j}) = {:?}",
                    prod[i * n + j]
                );
            }
        }
    }
}
