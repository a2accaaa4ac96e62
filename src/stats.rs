//! Runtime statistics
//!
//! All timestamps are taken and written by the master thread; shutdown
//! reads a snapshot. Nothing here is touched by workers.

use std::time::Instant;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::kernels::modulation;

/// Master-side frame milestones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum TsType {
    FirstSymbolRx = 0,
    PilotAllRx,
    RxDone,
    ProcessingStarted,
    FftPilotsDone,
    BeamDone,
    DemulDone,
    DecodeDone,
    EncodeDone,
    PrecodeDone,
    IfftDone,
    BroadcastDone,
    RcDone,
    TxFirst,
    TxDone,
}

pub const NUM_TS_TYPES: usize = TsType::TxDone as usize + 1;

/// Frames beyond this many keep running but stop being recorded.
const MAX_STAT_FRAMES: usize = 10_000;

pub struct Stats {
    epoch: Instant,
    /// Microseconds since epoch, `[frame][ts]`; zero means unset.
    ts_us: Vec<[f64; NUM_TS_TYPES]>,
    last_frame: u64,
    frames_measured: usize,
    latency_sum_us: f64,
}

impl Stats {
    pub fn new(cfg: &Config) -> Stats {
        let frames = (cfg.frames_to_test as usize).min(MAX_STAT_FRAMES);
        Stats {
            epoch: Instant::now(),
            ts_us: vec![[0.0; NUM_TS_TYPES]; frames],
            last_frame: 0,
            frames_measured: 0,
            latency_sum_us: 0.0,
        }
    }

    fn now_us(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1e6
    }

    pub fn set_ts(&mut self, ts: TsType, frame: u64) {
        let now = self.now_us();
        if let Some(row) = self.ts_us.get_mut(frame as usize) {
            row[ts as usize] = now;
        }
    }

    pub fn get_us(&self, ts: TsType, frame: u64) -> f64 {
        self.ts_us
            .get(frame as usize)
            .map(|row| row[ts as usize])
            .unwrap_or(0.0)
    }

    /// Milestone delta from the frame's first received symbol.
    pub fn since_first_rx_us(&self, ts: TsType, frame: u64) -> f64 {
        self.get_us(ts, frame) - self.get_us(TsType::FirstSymbolRx, frame)
    }

    /// Per-frame done line for one stage.
    pub fn print_frame_done(&self, label: &str, frame: u64) {
        debug!(
            "frame {frame}: {label} done, +{:.1} us",
            self.now_us() - self.get_us(TsType::FirstSymbolRx, frame)
        );
    }

    /// Fold a retired frame into the run aggregates.
    pub fn update_stats(&mut self, frame: u64) {
        self.last_frame = self.last_frame.max(frame);
        if (frame as usize) < self.ts_us.len() {
            let first = self.get_us(TsType::FirstSymbolRx, frame);
            let done = self
                .get_us(TsType::TxDone, frame)
                .max(self.get_us(TsType::DecodeDone, frame))
                .max(self.get_us(TsType::DemulDone, frame));
            if first > 0.0 && done > first {
                self.frames_measured += 1;
                self.latency_sum_us += done - first;
            }
        }
    }

    pub fn last_frame(&self) -> u64 {
        self.last_frame
    }

    pub fn print_summary(&self) {
        if self.frames_measured == 0 {
            info!("no complete frames measured");
            return;
        }
        info!(
            "processed {} frames, avg frame latency {:.1} us",
            self.frames_measured,
            self.latency_sum_us / self.frames_measured as f64
        );
        let avg = |ts: TsType| -> f64 {
            let mut sum = 0.0;
            let mut n = 0;
            for frame in 0..self.ts_us.len() as u64 {
                let d = self.since_first_rx_us(ts, frame);
                if self.get_us(ts, frame) > 0.0 && d > 0.0 {
                    sum += d;
                    n += 1;
                }
            }
            if n == 0 {
                0.0
            } else {
                sum / n as f64
            }
        };
        info!(
            "stage breakdown (avg us after first RX): pilots {:.1}, beam {:.1}, demul {:.1}, decode {:.1}, encode {:.1}, precode {:.1}, ifft {:.1}, tx {:.1}",
            avg(TsType::FftPilotsDone),
            avg(TsType::BeamDone),
            avg(TsType::DemulDone),
            avg(TsType::DecodeDone),
            avg(TsType::EncodeDone),
            avg(TsType::PrecodeDone),
            avg(TsType::IfftDone),
            avg(TsType::TxDone),
        );
    }
}

/// Signal-quality tallies, computed by the master from closed buffers.
pub struct PhyStats {
    /// Latest error-vector-magnitude SNR per stream, dB.
    evm_snr_db: Vec<f32>,
    snr_sum_db: Vec<f64>,
    snr_frames: usize,
    decoded_blocks: u64,
}

impl PhyStats {
    pub fn new(cfg: &Config) -> PhyStats {
        PhyStats {
            evm_snr_db: vec![0.0; cfg.spatial_streams()],
            snr_sum_db: vec![0.0; cfg.spatial_streams()],
            snr_frames: 0,
            decoded_blocks: 0,
        }
    }

    /// Measure per-stream EVM over the frame's first equalized uplink
    /// symbol, against the modulation order the frame ran at. Called at
    /// demul frame closure, when the buffer is read-only.
    pub fn record_evm(&mut self, frame: u64, order: usize, cfg: &Config, buffers: &BufferPool) {
        if cfg.frame().num_ul_syms() == 0 {
            return;
        }
        let n = cfg.spatial_streams();
        let row = buffers.equal_row(frame, 0);
        // Safety: demul closed for this frame.
        let equal = unsafe { buffers.equal.row(row) };
        let num_sc = cfg.ofdm_data_num.min(128);

        for stream in 0..n {
            let mut err = 0.0f32;
            let mut sig = 0.0f32;
            for sc in 0..num_sc {
                let s = equal[sc * n + stream];
                let ideal = modulation::modulate(modulation::demod_hard(s, order), order);
                err += (s - ideal).norm_sqr();
                sig += ideal.norm_sqr();
            }
            let evm = (err / sig.max(1e-12)).max(1e-9);
            self.evm_snr_db[stream] = -10.0 * evm.log10();
            self.snr_sum_db[stream] += self.evm_snr_db[stream] as f64;
        }
        self.snr_frames += 1;
    }

    pub fn evm_snr_db(&self, stream: usize) -> f32 {
        self.evm_snr_db[stream]
    }

    pub fn add_decoded_blocks(&mut self, n: u64) {
        self.decoded_blocks += n;
    }

    pub fn print_summary(&self) {
        if self.snr_frames > 0 {
            let avg: Vec<String> = self
                .snr_sum_db
                .iter()
                .map(|s| format!("{:.1}", s / self.snr_frames as f64))
                .collect();
            info!("avg evm snr per stream (dB): [{}]", avg.join(", "));
        }
        info!("decoded code blocks: {}", self.decoded_blocks);
    }
}
