//! Gray-coded square QAM mapping and demapping.

use num_complex::Complex32;

/// Per-axis Gray-coded PAM levels, unit average symbol energy.
fn pam_levels(order: usize) -> (&'static [f32], f32) {
    const PAM2: [f32; 2] = [-1.0, 1.0];
    const PAM4: [f32; 4] = [-3.0, -1.0, 1.0, 3.0];
    const PAM8: [f32; 8] = [-7.0, -5.0, -3.0, -1.0, 1.0, 3.0, 5.0, 7.0];
    match order {
        4 => (&PAM2, std::f32::consts::FRAC_1_SQRT_2),
        16 => (&PAM4, 1.0 / 10f32.sqrt()),
        64 => (&PAM8, 1.0 / 42f32.sqrt()),
        other => panic!("unsupported modulation order {other}"),
    }
}

fn gray_to_level(bits: usize, width: usize) -> usize {
    // Gray decode: msb passes through, the rest accumulate xor
    let mut level = 0;
    let mut acc = 0;
    for i in (0..width).rev() {
        acc ^= (bits >> i) & 1;
        level = (level << 1) | acc;
    }
    level
}

fn level_to_gray(level: usize) -> usize {
    level ^ (level >> 1)
}

/// Map a point index (Gray-coded bits, I bits high, Q bits low) onto the
/// constellation.
pub fn modulate(index: usize, order: usize) -> Complex32 {
    let (levels, scale) = pam_levels(order);
    let half = order.trailing_zeros() as usize / 2;
    let i_bits = index >> half;
    let q_bits = index & ((1 << half) - 1);
    Complex32::new(
        levels[gray_to_level(i_bits, half)] * scale,
        levels[gray_to_level(q_bits, half)] * scale,
    )
}

/// Nearest constellation point index for a received sample.
pub fn demod_hard(sample: Complex32, order: usize) -> usize {
    let (levels, scale) = pam_levels(order);
    let half = order.trailing_zeros() as usize / 2;
    let slice = |x: f32| -> usize {
        let mut best = 0;
        let mut best_d = f32::MAX;
        for (lvl, v) in levels.iter().enumerate() {
            let d = (x - v * scale).abs();
            if d < best_d {
                best_d = d;
                best = lvl;
            }
        }
        best
    };
    (level_to_gray(slice(sample.re)) << half) | level_to_gray(slice(sample.im))
}

/// Max-log LLRs for each bit of a received sample, most significant bit
/// first. Positive means bit 0. Output is saturated to i8.
pub fn demod_soft(sample: Complex32, order: usize, snr_scale: f32, out: &mut [i8]) {
    let bits = order.trailing_zeros() as usize;
    debug_assert_eq!(out.len(), bits);
    for (b, llr) in out.iter_mut().enumerate() {
        let mask = 1 << (bits - 1 - b);
        let mut d0 = f32::MAX;
        let mut d1 = f32::MAX;
        for index in 0..order {
            let d = (sample - modulate(index, order)).norm_sqr();
            if index & mask == 0 {
                d0 = d0.min(d);
            } else {
                d1 = d1.min(d);
            }
        }
        *llr = ((d1 - d0) * snr_scale).clamp(-127.0, 127.0) as i8;
    }
}

/// Pack hard bit decisions as saturated LLRs.
pub fn demod_hard_llr(sample: Complex32, order: usize, out: &mut [i8]) {
    let bits = order.trailing_zeros() as usize;
    let index = demod_hard(sample, order);
    for (b, llr) in out.iter_mut().enumerate() {
        let mask = 1 << (bits - 1 - b);
        *llr = if index & mask == 0 { 127 } else { -127 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_demod_inverts_modulate() {
        for order in [4usize, 16, 64] {
            for index in 0..order {
                let s = modulate(index, order);
                assert_eq!(demod_hard(s, order), index, "order {order}");
            }
        }
    }

    #[test]
    fn unit_average_energy() {
        for order in [4usize, 16, 64] {
            let e: f32 = (0..order).map(|i| modulate(i, order).norm_sqr()).sum();
            assert!((e / order as f32 - 1.0).abs() < 1e-3, "order {order}");
        }
    }

    #[test]
    fn soft_llr_sign_matches_hard_decision() {
        let order = 16;
        for index in 0..order {
            let s = modulate(index, order);
            let mut llr = [0i8; 4];
            demod_soft(s, order, 8.0, &mut llr);
            for (b, l) in llr.iter().enumerate() {
                let bit = (index >> (3 - b)) & 1;
                if bit == 0 {
                    assert!(*l > 0);
                } else {
                    assert!(*l < 0);
                }
            }
        }
    }
}
