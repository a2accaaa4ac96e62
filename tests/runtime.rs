//! Whole-station runs: pinned workers, simulator streamer threads, and
//! (optionally) the loopback MAC, driven to completion for real.

use mimosa::config::Config;
use mimosa::runtime::BaseStation;
use mimosa::Result;

fn station_cfg() -> Config {
    let mut cfg = Config::default();
    cfg.bs_ant_num = 2;
    cfg.ue_ant_num = 2;
    cfg.frame_schedule = "PPUUDD".into();
    cfg.fft_size = 256;
    cfg.ofdm_data_num = 192;
    cfg.cp_size = 16;
    cfg.cb_bytes = 16;
    cfg.fft_block_size = 2;
    cfg.encode_block_size = 4;
    cfg.demul_block_size = 64;
    cfg.beam_block_size = 64;
    cfg.worker_thread_num = 2;
    cfg.socket_thread_num = 2;
    cfg.frames_to_test = 4;
    cfg
}

#[test]
fn station_runs_to_completion() -> Result<()> {
    let mut bs = BaseStation::new(station_cfg())?;
    bs.run()?;

    assert!(bs.scheduler().is_finished());
    assert!(!bs.scheduler().is_stalled());
    assert_eq!(bs.scheduler().cur_proc_frame(), 4);
    // every downlink symbol of every frame went out on every antenna
    assert_eq!(bs.tx_count(), 4 * 2 * 2);
    Ok(())
}

#[test]
fn station_with_mac_runs_to_completion() -> Result<()> {
    let mut cfg = station_cfg();
    cfg.enable_mac = true;
    // room for the SNR-driven MCS upshift to land inside the run
    cfg.cb_bytes = 24;
    cfg.frames_to_test = 8;
    let mut bs = BaseStation::new(cfg)?;
    bs.run()?;

    assert!(bs.scheduler().is_finished());
    assert_eq!(bs.scheduler().cur_proc_frame(), 8);
    assert_eq!(bs.tx_count(), 8 * 2 * 2);
    // the clean simulated link drives the MAC to the top MCS entry
    assert_eq!(bs.scheduler().ran_mcs_index(), Some(2));
    Ok(())
}

#[test]
fn single_thread_mode_runs_to_completion() -> Result<()> {
    let mut cfg = station_cfg();
    cfg.worker_thread_num = 0;
    cfg.socket_thread_num = 1;
    cfg.frames_to_test = 2;
    let mut bs = BaseStation::new(cfg)?;
    bs.run()?;

    assert!(bs.scheduler().is_finished());
    assert_eq!(bs.scheduler().cur_proc_frame(), 2);
    Ok(())
}
