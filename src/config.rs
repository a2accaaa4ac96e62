//! Run configuration
//!
//! A single JSON document, parsed once at startup into a plain value that is
//! passed by reference into every component. Nothing here is global or
//! mutable on the hot path.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use num_complex::Complex32;
use serde::Deserialize;
use std::path::Path;

/// Kind of one OFDM symbol in the frame schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolType {
    Pilot,
    Uplink,
    Downlink,
    DlControl,
    CalUl,
    CalDl,
    Guard,
}

/// The fixed symbol schedule of a radio frame, parsed from the
/// `frame_schedule` string (`P` pilot, `U` uplink, `D` downlink data,
/// `C` downlink control, `L` calibration uplink, `A` calibration downlink,
/// `G` guard).
#[derive(Clone, Debug, Default)]
pub struct Frame {
    symbols: Vec<SymbolType>,
    pilot_syms: Vec<usize>,
    ul_syms: Vec<usize>,
    dl_syms: Vec<usize>,
    dl_ctrl_syms: Vec<usize>,
    cal_syms: Vec<usize>,
    dl_tx_syms: Vec<usize>,
}

impl Frame {
    pub fn parse(schedule: &str) -> Result<Frame> {
        let mut frame = Frame::default();
        for (idx, c) in schedule.chars().enumerate() {
            let ty = match c {
                'P' => SymbolType::Pilot,
                'U' => SymbolType::Uplink,
                'D' => SymbolType::Downlink,
                'C' => SymbolType::DlControl,
                'L' => SymbolType::CalUl,
                'A' => SymbolType::CalDl,
                'G' => SymbolType::Guard,
                other => bail!("invalid frame schedule character {other:?}"),
            };
            match ty {
                SymbolType::Pilot => frame.pilot_syms.push(idx),
                SymbolType::Uplink => frame.ul_syms.push(idx),
                SymbolType::Downlink => frame.dl_syms.push(idx),
                SymbolType::DlControl => frame.dl_ctrl_syms.push(idx),
                SymbolType::CalUl | SymbolType::CalDl => frame.cal_syms.push(idx),
                SymbolType::Guard => {}
            }
            frame.symbols.push(ty);
        }
        if frame.symbols.len() > 8192 {
            bail!("frame schedule longer than 8192 symbols");
        }
        // transmitted downlink symbols (control and data) in schedule order
        frame.dl_tx_syms = frame
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t, SymbolType::Downlink | SymbolType::DlControl))
            .map(|(i, _)| i)
            .collect();
        Ok(frame)
    }

    pub fn symbol_type(&self, symbol_id: usize) -> SymbolType {
        self.symbols[symbol_id]
    }

    pub fn num_total_syms(&self) -> usize {
        self.symbols.len()
    }

    /// Symbols that carry per-task pipeline work (everything but guards).
    pub fn num_data_syms(&self) -> usize {
        self.ul_syms.len() + self.dl_syms.len() + self.dl_ctrl_syms.len()
    }

    pub fn num_pilot_syms(&self) -> usize {
        self.pilot_syms.len()
    }

    pub fn num_ul_syms(&self) -> usize {
        self.ul_syms.len()
    }

    pub fn num_dl_syms(&self) -> usize {
        self.dl_syms.len()
    }

    pub fn num_dl_ctrl_syms(&self) -> usize {
        self.dl_ctrl_syms.len()
    }

    pub fn num_cal_syms(&self) -> usize {
        self.cal_syms.len()
    }

    pub fn pilot_symbol(&self, i: usize) -> usize {
        self.pilot_syms[i]
    }

    pub fn ul_symbol(&self, i: usize) -> usize {
        self.ul_syms[i]
    }

    pub fn dl_symbol(&self, i: usize) -> usize {
        self.dl_syms[i]
    }

    pub fn dl_ctrl_symbol(&self, i: usize) -> usize {
        self.dl_ctrl_syms[i]
    }

    /// Position of `symbol_id` among the pilot symbols.
    pub fn pilot_symbol_idx(&self, symbol_id: usize) -> usize {
        index_of(&self.pilot_syms, symbol_id)
    }

    /// Position of `symbol_id` among the uplink symbols.
    pub fn ul_symbol_idx(&self, symbol_id: usize) -> usize {
        index_of(&self.ul_syms, symbol_id)
    }

    /// Position of `symbol_id` among the downlink data symbols.
    pub fn dl_symbol_idx(&self, symbol_id: usize) -> usize {
        index_of(&self.dl_syms, symbol_id)
    }

    /// All transmitted downlink symbols (control and data) in order.
    pub fn num_dl_tx_syms(&self) -> usize {
        self.dl_tx_syms.len()
    }

    /// Position of `symbol_id` among the transmitted downlink symbols.
    pub fn dl_tx_symbol_idx(&self, symbol_id: usize) -> usize {
        index_of(&self.dl_tx_syms, symbol_id)
    }
}

fn index_of(list: &[usize], symbol_id: usize) -> usize {
    list.iter()
        .position(|s| *s == symbol_id)
        .unwrap_or_else(|| panic!("symbol {symbol_id} not in schedule list"))
}

/// Uplink modulation orders addressed by RAN update MCS indices.
pub const UL_MCS_TABLE: [usize; 3] = [4, 16, 64];

/// Bits carried by one constellation point.
pub fn mod_bits_of(order: usize) -> usize {
    match order {
        4 => 2,
        16 => 4,
        64 => 6,
        other => panic!("unsupported modulation order {other}"),
    }
}

/// Modulation and coding scheme for one direction.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct Mcs {
    /// Constellation order: 4, 16, or 64.
    pub modulation: usize,
    /// Code rate as a fraction in (0, 1].
    pub code_rate: f64,
}

impl Default for Mcs {
    fn default() -> Self {
        Mcs {
            modulation: 16,
            code_rate: 0.5,
        }
    }
}

impl Mcs {
    pub fn mod_bits(&self) -> usize {
        mod_bits_of(self.modulation)
    }

    /// Repetition factor of the code: coded bits per data bit.
    pub fn code_rep(&self) -> usize {
        ((1.0 / self.code_rate).round() as usize).max(1)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bs_radio_num: usize,
    pub ue_radio_num: usize,
    pub bs_ant_num: usize,
    pub ue_ant_num: usize,
    pub fft_size: usize,
    pub ofdm_data_num: usize,
    pub cp_size: usize,
    pub sample_rate: f64,
    pub frame_schedule: String,
    pub ul_mcs: Mcs,
    pub dl_mcs: Mcs,
    /// Raw data bytes carried by one code block.
    pub cb_bytes: usize,
    /// 0 runs a single inline worker on the master thread.
    pub worker_thread_num: usize,
    pub socket_thread_num: usize,
    pub core_offset: usize,
    pub beam_block_size: usize,
    pub demul_block_size: usize,
    pub fft_block_size: usize,
    pub encode_block_size: usize,
    pub frames_to_test: u64,
    pub enable_mac: bool,
    /// Hard demodulation: demultiplexing emits bits directly and the
    /// decode stage is skipped.
    pub ul_hard_demod: bool,
    pub save_tx_data: bool,
    pub save_decode_data: bool,
    #[serde(skip)]
    frame: Frame,
    #[serde(skip)]
    pilots: Vec<Complex32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bs_radio_num: 8,
            ue_radio_num: 8,
            bs_ant_num: 8,
            ue_ant_num: 8,
            fft_size: 2048,
            ofdm_data_num: 1200,
            cp_size: 160,
            sample_rate: 5e6,
            frame_schedule: "PPPPPPPPGUUUUUUUUUUUUG".to_string(),
            ul_mcs: Mcs::default(),
            dl_mcs: Mcs::default(),
            cb_bytes: 64,
            worker_thread_num: 4,
            socket_thread_num: 1,
            core_offset: 0,
            beam_block_size: 48,
            demul_block_size: 48,
            fft_block_size: 4,
            encode_block_size: 4,
            frames_to_test: 10,
            enable_mac: false,
            ul_hard_demod: false,
            save_tx_data: false,
            save_decode_data: false,
            frame: Frame::default(),
            pilots: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config> {
        let mut cfg: Config = serde_json::from_str(json).context("parsing configuration")?;
        cfg.finalize()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let data = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Config::from_json(&data)
    }

    /// Parse the frame schedule, generate the pilot sequence, and validate
    /// cross-field constraints. Must be called before the config is used.
    pub fn finalize(&mut self) -> Result<()> {
        self.frame = Frame::parse(&self.frame_schedule)?;

        if self.frame.num_data_syms() == 0 && self.frame.num_pilot_syms() == 0 {
            bail!("frame schedule carries no work");
        }
        if self.frame.num_pilot_syms() > 0 && self.frame.num_pilot_syms() != self.ue_ant_num {
            bail!(
                "schedule has {} pilot symbols but {} user antennas; one pilot symbol per user is required",
                self.frame.num_pilot_syms(),
                self.ue_ant_num
            );
        }
        if self.ofdm_data_num > self.fft_size {
            bail!("ofdm_data_num exceeds fft_size");
        }
        if self.fft_block_size == 0
            || self.encode_block_size == 0
            || self.demul_block_size == 0
            || self.beam_block_size == 0
        {
            bail!("task block sizes must be nonzero");
        }
        if self.fft_block_size > crate::message::MAX_EVENT_TAGS
            || self.encode_block_size > crate::message::MAX_EVENT_TAGS
        {
            bail!(
                "coalesced block sizes are capped at {} tags per event",
                crate::message::MAX_EVENT_TAGS
            );
        }
        if self.socket_thread_num == 0 {
            bail!("at least one socket thread is required");
        }
        for (dir, mcs) in [("uplink", &self.ul_mcs), ("downlink", &self.dl_mcs)] {
            if !matches!(mcs.modulation, 4 | 16 | 64) {
                bail!("{dir} modulation order must be 4, 16, or 64");
            }
            if mcs.code_rate <= 0.0 || mcs.code_rate > 1.0 {
                bail!("{dir} code rate must be in (0, 1]");
            }
            let coded_bits = self.cb_bytes * 8 * mcs.code_rep();
            if coded_bits > self.ofdm_data_num * mcs.mod_bits() {
                bail!("{dir} code block does not fit one OFDM symbol");
            }
            if coded_bits % mcs.mod_bits() != 0 {
                bail!("{dir} code block is not a whole number of constellation symbols");
            }
        }
        if self.frames_to_test == 0 {
            bail!("frames_to_test must be nonzero");
        }

        self.pilots = pilot_sequence(self.ofdm_data_num);
        Ok(())
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Known frequency-domain pilot per data subcarrier.
    pub fn pilot(&self, sc: usize) -> Complex32 {
        self.pilots[sc]
    }

    /// Number of spatial streams served per data symbol.
    pub fn spatial_streams(&self) -> usize {
        self.ue_ant_num
    }

    pub fn samps_per_symbol(&self) -> usize {
        self.fft_size + self.cp_size
    }

    /// First bin of the data subcarriers inside the FFT grid.
    pub fn ofdm_start(&self) -> usize {
        (self.fft_size - self.ofdm_data_num) / 2
    }

    /// Bytes of one wire packet: 16-byte header plus interleaved i16 I/Q.
    pub fn packet_length(&self) -> usize {
        16 + self.samps_per_symbol() * 2 * 2
    }

    pub fn mcs(&self, dl: bool) -> &Mcs {
        if dl {
            &self.dl_mcs
        } else {
            &self.ul_mcs
        }
    }

    /// Code blocks carried by one (symbol, stream).
    pub fn code_blocks_per_symbol(&self, dl: bool) -> usize {
        let mcs = self.mcs(dl);
        let coded_bits_per_cb = self.cb_bytes * 8 * mcs.code_rep();
        (self.ofdm_data_num * mcs.mod_bits() / coded_bits_per_cb).max(1)
    }

    /// Raw data bytes carried by one (symbol, stream).
    pub fn data_bytes_per_symbol(&self, dl: bool) -> usize {
        self.code_blocks_per_symbol(dl) * self.cb_bytes
    }

    /// Raw downlink MAC bytes per frame per stream.
    pub fn mac_bytes_per_frame(&self) -> usize {
        self.frame.num_dl_syms() * self.data_bytes_per_symbol(true)
    }

    /// Coded bits per (uplink symbol, stream). The code geometry is fixed
    /// at startup; only the modulation order may change at runtime.
    pub fn ul_coded_bits_per_symbol(&self) -> usize {
        self.code_blocks_per_symbol(false) * self.cb_bytes * 8 * self.ul_mcs.code_rep()
    }

    /// Data subcarriers an uplink symbol occupies at `order`, or `None`
    /// when the coded bits do not map onto whole points inside the symbol.
    pub fn ul_subcarriers_at(&self, order: usize) -> Option<usize> {
        let bits = mod_bits_of(order);
        let coded = self.ul_coded_bits_per_symbol();
        if coded % bits != 0 {
            return None;
        }
        let sc = coded / bits;
        (sc <= self.ofdm_data_num).then_some(sc)
    }

    pub fn demul_events_per_symbol(&self) -> usize {
        self.ofdm_data_num.div_ceil(self.demul_block_size)
    }

    pub fn beam_events_per_symbol(&self) -> usize {
        self.ofdm_data_num.div_ceil(self.beam_block_size)
    }

    pub fn num_pilot_pkts_per_frame(&self) -> usize {
        self.bs_ant_num * self.frame.num_pilot_syms()
    }

    pub fn num_cal_pkts_per_frame(&self) -> usize {
        self.bs_ant_num * self.frame.num_cal_syms()
    }

    pub fn num_rx_pkts_per_frame(&self) -> usize {
        self.num_pilot_pkts_per_frame()
            + self.num_cal_pkts_per_frame()
            + self.bs_ant_num * self.frame.num_ul_syms()
    }

    /// Streamer thread that owns transmission for an antenna.
    pub fn ant_to_socket_thread(&self, ant: usize) -> usize {
        ant % self.socket_thread_num
    }
}

/// Deterministic QPSK pilot sequence from a 7-bit LFSR, two bits per
/// subcarrier.
fn pilot_sequence(len: usize) -> Vec<Complex32> {
    let mut state: u8 = 0x5d;
    let mut bit = move || {
        let b = ((state >> 6) ^ (state >> 3)) & 1;
        state = (state << 1) | b;
        b
    };
    let a = std::f32::consts::FRAC_1_SQRT_2;
    (0..len)
        .map(|_| {
            let re = if bit() == 0 { a } else { -a };
            let im = if bit() == 0 { a } else { -a };
            Complex32::new(re, im)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parsing() -> Result<()> {
        let frame = Frame::parse("PPGUUDDC")?;
        assert_eq!(frame.num_total_syms(), 8);
        assert_eq!(frame.num_pilot_syms(), 2);
        assert_eq!(frame.num_ul_syms(), 2);
        assert_eq!(frame.num_dl_syms(), 2);
        assert_eq!(frame.num_dl_ctrl_syms(), 1);
        assert_eq!(frame.ul_symbol(0), 3);
        assert_eq!(frame.ul_symbol_idx(4), 1);
        assert_eq!(frame.dl_symbol_idx(6), 1);
        assert_eq!(frame.symbol_type(2), SymbolType::Guard);
        Ok(())
    }

    #[test]
    fn schedule_rejects_unknown() {
        assert!(Frame::parse("PX").is_err());
    }

    #[test]
    fn defaults_finalize() -> Result<()> {
        let mut cfg = Config::default();
        cfg.finalize()?;
        assert_eq!(cfg.frame().num_pilot_syms(), cfg.ue_ant_num);
        assert!(cfg.num_rx_pkts_per_frame() > 0);
        assert_eq!(cfg.pilot(0).norm_sqr().round() as usize, 1);
        Ok(())
    }

    #[test]
    fn json_overrides() -> Result<()> {
        let cfg = Config::from_json(
            r#"{
                "bs_ant_num": 4,
                "ue_ant_num": 2,
                "frame_schedule": "PPUU",
                "fft_size": 64,
                "ofdm_data_num": 48,
                "cb_bytes": 8,
                "demul_block_size": 16,
                "beam_block_size": 16,
                "fft_block_size": 2
            }"#,
        )?;
        assert_eq!(cfg.bs_ant_num, 4);
        assert_eq!(cfg.demul_events_per_symbol(), 3);
        assert_eq!(cfg.num_rx_pkts_per_frame(), 2 * 4 + 2 * 4);
        Ok(())
    }

    #[test]
    fn ul_subcarrier_footprint_per_order() -> Result<()> {
        let mut cfg = Config {
            bs_ant_num: 4,
            ue_ant_num: 4,
            frame_schedule: "PPPPUUUU".into(),
            fft_size: 256,
            ofdm_data_num: 192,
            cb_bytes: 24,
            ..Config::default()
        };
        cfg.finalize()?;
        // coded bits per symbol: 2 blocks x 24 bytes x 8 x rep 2
        assert_eq!(cfg.ul_coded_bits_per_symbol(), 768);
        assert_eq!(cfg.ul_subcarriers_at(16), Some(192));
        assert_eq!(cfg.ul_subcarriers_at(64), Some(128));
        // QPSK needs 384 subcarriers and does not fit
        assert_eq!(cfg.ul_subcarriers_at(4), None);
        Ok(())
    }

    #[test]
    fn mcs_rejects_oversized_code_block() {
        let mut cfg = Config {
            fft_size: 64,
            ofdm_data_num: 48,
            frame_schedule: "PPUU".into(),
            ue_ant_num: 2,
            cb_bytes: 512,
            ..Config::default()
        };
        assert!(cfg.finalize().is_err());
    }
}
