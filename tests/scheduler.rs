//! End-to-end scheduler scenarios driven through the fabric, with the
//! kernels either running inline or replaced by a stand-in pump.

mod common;

use common::TestBed;
use mimosa::message::Event;
use mimosa::message::EventKind;
use mimosa::message::Tag;
use mimosa::streamer;
use mimosa::Result;

/// Uplink-only single frame: every symbol decodes back to the payload the
/// simulated users transmitted, the frame retires, and nothing is queued
/// for transmission.
#[test]
fn ul_single_frame_end_to_end() -> Result<()> {
    let mut bed = TestBed::new(common::ul_cfg(), true);
    bed.inject_rx_frame(0);
    assert!(bed.run_until(200_000, |s| s.is_finished()), "pipeline stuck");

    assert_eq!(bed.sched.cur_proc_frame(), 1);
    assert_eq!(bed.fabric.tx_lane_len(0), 0);
    assert!(!bed.sched.is_stalled());

    for ul_idx in 0..bed.cfg.frame().num_ul_syms() {
        for ue in 0..bed.cfg.spatial_streams() {
            let row = bed.buffers.decoded_row(0, ul_idx, ue);
            let got = unsafe { bed.buffers.decoded.row(row) };
            let want = streamer::ul_payload(&bed.cfg, 0, ul_idx, ue);
            assert_eq!(got, &want[..], "uplink symbol {ul_idx}, user {ue}");
        }
    }
    Ok(())
}

/// Downlink-only, MAC disabled: pilots alone drive the frame through
/// encode, precode, IFFT, and TX, with the stage milestones in order and
/// the first TX strictly before the last.
#[test]
fn dl_only_stage_order() -> Result<()> {
    let mut bed = TestBed::new(common::dl_cfg(), true);
    bed.inject_rx_frame(0);
    assert!(bed.run_until(200_000, |s| s.is_finished()), "pipeline stuck");

    let stats = bed.sched.stats();
    use mimosa::stats::TsType::*;
    for ts in [EncodeDone, PrecodeDone, IfftDone, BroadcastDone, TxFirst, TxDone] {
        assert!(stats.get_us(ts, 0) > 0.0, "{ts:?} never recorded");
    }
    assert!(stats.get_us(EncodeDone, 0) <= stats.get_us(PrecodeDone, 0));
    assert!(stats.get_us(PrecodeDone, 0) <= stats.get_us(IfftDone, 0));
    assert!(stats.get_us(TxFirst, 0) < stats.get_us(TxDone, 0));
    Ok(())
}

/// A stuck decode keeps the oldest frame alive: downlink starts of frames
/// beyond the schedule horizon are deferred, and retirement releases them
/// in arrival order.
#[test]
fn deferral_fifo_under_stuck_decode() -> Result<()> {
    let mut bed = TestBed::new(common::ul_dl_cfg(), false);

    let step = |bed: &mut TestBed, skip: &[EventKind]| {
        bed.pump_tasks(skip);
        bed.echo_tx();
        bed.sched.tick();
        bed.assert_window();
    };

    for frame in 0..5u64 {
        for _ in 0..10_000 {
            if frame < bed.sched.cur_sche_frame() + mimosa::FRAME_WND as u64 {
                break;
            }
            step(&mut bed, &[EventKind::Decode]);
        }
        bed.inject_rx_frame(frame);
        for _ in 0..2_000 {
            step(&mut bed, &[EventKind::Decode]);
        }
    }

    // frames 0 and 1 started their downlink; 2, 3, 4 wait
    assert_eq!(bed.sched.cur_proc_frame(), 0);
    assert_eq!(bed.sched.deferral_len(), 3);

    // a not-yet-complete frame is not retired by asking
    assert!(!bed.sched.check_frame_complete(0));
    assert_eq!(bed.sched.cur_proc_frame(), 0);

    // unstick decode: everything drains, deferred frames release in order
    let mut last_deferred = bed.sched.deferral_len();
    for _ in 0..200_000 {
        if bed.sched.cur_proc_frame() == 5 {
            break;
        }
        step(&mut bed, &[]);
        let now = bed.sched.deferral_len();
        assert!(now <= last_deferred, "deferral queue grew while draining");
        last_deferred = now;
    }
    assert_eq!(bed.sched.cur_proc_frame(), 5);
    assert_eq!(bed.sched.deferral_len(), 0);

    // retirement of an already-retired frame is a no-op
    assert!(!bed.sched.check_frame_complete(0));
    assert_eq!(bed.sched.cur_proc_frame(), 5);
    Ok(())
}

/// The dependency graph gates every stage: no task lane fills before its
/// upstream closure events are delivered.
#[test]
fn dependency_graph_is_respected() -> Result<()> {
    let mut cfg = common::ul_dl_cfg();
    cfg.frames_to_test = 1;
    let mut bed = TestBed::new(cfg, false);

    let tick_n = |bed: &mut TestBed, n: usize| {
        for _ in 0..n {
            bed.echo_tx();
            bed.sched.tick();
            bed.assert_window();
        }
    };

    bed.inject_rx_frame(0);
    tick_n(&mut bed, 16);

    // packets in, FFT scheduled; nothing downstream yet
    assert!(bed.queued_tasks(EventKind::Fft) > 0);
    assert_eq!(bed.queued_tasks(EventKind::Beam), 0);
    assert_eq!(bed.queued_tasks(EventKind::Demul), 0);
    assert_eq!(bed.queued_tasks(EventKind::Decode), 0);
    // downlink encode starts with the frame, but precode must wait
    assert!(bed.queued_tasks(EventKind::Encode) > 0);
    assert_eq!(bed.queued_tasks(EventKind::Precode), 0);

    let pump_only = |bed: &mut TestBed, kind: EventKind| {
        let skip: Vec<EventKind> = mimosa::message::WORK_LANE_ORDER
            .iter()
            .copied()
            .filter(|k| *k != kind)
            .collect();
        bed.pump_tasks(&skip);
    };

    // pilot FFT closure unlocks beam, and only beam
    pump_only(&mut bed, EventKind::Fft);
    tick_n(&mut bed, 16);
    assert!(bed.queued_tasks(EventKind::Beam) > 0);
    assert_eq!(bed.queued_tasks(EventKind::Demul), 0);

    // beam closure unlocks demul for the FFT-complete uplink symbols
    pump_only(&mut bed, EventKind::Beam);
    tick_n(&mut bed, 16);
    assert!(bed.queued_tasks(EventKind::Demul) > 0);
    assert_eq!(bed.queued_tasks(EventKind::Decode), 0);

    // demul closure unlocks decode
    pump_only(&mut bed, EventKind::Demul);
    tick_n(&mut bed, 16);
    assert!(bed.queued_tasks(EventKind::Decode) > 0);

    // encode closure (beam already done) unlocks precode, then IFFT, TX
    pump_only(&mut bed, EventKind::Encode);
    tick_n(&mut bed, 16);
    assert!(bed.queued_tasks(EventKind::Precode) > 0);
    assert_eq!(bed.queued_tasks(EventKind::Ifft), 0);

    pump_only(&mut bed, EventKind::Precode);
    tick_n(&mut bed, 16);
    assert!(bed.queued_tasks(EventKind::Ifft) > 0);

    // drain everything remaining; the frame must retire
    for _ in 0..50_000 {
        if bed.sched.is_finished() {
            break;
        }
        bed.pump_tasks(&[]);
        bed.echo_tx();
        bed.sched.tick();
        bed.assert_window();
    }
    assert!(bed.sched.is_finished());
    Ok(())
}

/// Randomized arrival order: whatever order stages complete in, the run
/// converges and the window bound holds at every step.
#[test]
fn randomized_completion_order_converges() -> Result<()> {
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    for seed in 0..4u64 {
        let mut cfg = common::ul_dl_cfg();
        cfg.frames_to_test = 3;
        let mut bed = TestBed::new(cfg, false);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut injected = 0u64;
        let mut iterations = 0usize;
        while !bed.sched.is_finished() {
            iterations += 1;
            assert!(iterations < 500_000, "seed {seed}: did not converge");

            if injected < 3 && injected < bed.sched.cur_sche_frame() + mimosa::FRAME_WND as u64 {
                bed.inject_rx_frame(injected);
                injected += 1;
            }
            // complete a random subset of stages this round
            let kinds = mimosa::message::WORK_LANE_ORDER;
            let pick = kinds[rng.gen_range(0..kinds.len())];
            let skip: Vec<EventKind> =
                kinds.iter().copied().filter(|k| *k != pick).collect();
            bed.pump_tasks(&skip);
            bed.echo_tx();
            bed.sched.tick();
            bed.assert_window();
        }
        assert_eq!(bed.sched.cur_proc_frame(), 3, "seed {seed}");
    }
    Ok(())
}

/// FFT batching: full blocks carry exactly `fft_block_size` tags, the
/// frame tail carries the remainder, and the tag total matches the packet
/// count.
#[test]
fn fft_batching_with_remainder() -> Result<()> {
    let mut bed = TestBed::new(five_antenna_cfg(), false);
    bed.inject_rx_frame(0);
    for _ in 0..16 {
        bed.sched.tick();
    }

    let mut sizes = Vec::new();
    while let Some(ev) = bed.fabric.try_dequeue_task(0, EventKind::Fft) {
        sizes.push(ev.num_tags());
    }
    let pkts = bed.cfg.num_rx_pkts_per_frame();
    assert_eq!(sizes.iter().sum::<usize>(), pkts);
    for (i, size) in sizes.iter().enumerate() {
        if i + 1 < sizes.len() {
            assert_eq!(*size, bed.cfg.fft_block_size, "event {i}");
        } else {
            assert_eq!(*size, pkts % bed.cfg.fft_block_size);
        }
    }
    Ok(())
}

/// Divisible case: every FFT event is exactly one full block.
#[test]
fn fft_batching_divisible() -> Result<()> {
    let mut cfg = common::ul_cfg();
    cfg.fft_block_size = 2;
    let mut bed = TestBed::new(cfg, false);
    bed.inject_rx_frame(0);
    for _ in 0..32 {
        bed.sched.tick();
    }

    let mut total = 0;
    while let Some(ev) = bed.fabric.try_dequeue_task(0, EventKind::Fft) {
        assert_eq!(ev.num_tags(), 2);
        total += ev.num_tags();
    }
    assert_eq!(total, bed.cfg.num_rx_pkts_per_frame());
    Ok(())
}

/// A RAN update from the MAC lane switches the uplink modulation at a
/// frame boundary: earlier frames keep the configured order, frames past
/// the boundary run and decode bit-exactly at the new one.
#[test]
fn ran_update_switches_uplink_mcs() -> Result<()> {
    let mut cfg = common::ul_cfg();
    cfg.cb_bytes = 24;
    cfg.frames_to_test = 6;
    let mut bed = TestBed::new(cfg, true);

    bed.inject_rx_frame(0);
    assert!(bed.run_until(200_000, |s| s.cur_proc_frame() == 1));
    assert_eq!(bed.ran.ul_mod_order(0), 16);

    // the MAC requests the top table entry
    bed.fabric
        .enqueue_rx(0, Event::new(EventKind::RanUpdate, Tag::from_raw(2)));
    assert!(bed.run_until(1_000, |s| s.ran_mcs_index() == Some(2)));

    let boundary = (0..64u64)
        .find(|f| bed.ran.ul_mod_order(*f) == 64)
        .expect("switch never staged");
    assert!(boundary >= bed.sched.cur_proc_frame());
    assert!(boundary < 6, "switch must land inside the run");

    for frame in 1..6u64 {
        for _ in 0..200_000 {
            if frame < bed.sched.cur_sche_frame() + mimosa::FRAME_WND as u64 {
                break;
            }
            bed.echo_tx();
            bed.sched.tick();
        }
        bed.inject_rx_frame(frame);
    }
    assert!(bed.run_until(400_000, |s| s.is_finished()), "pipeline stuck");

    // the last frame ran at the new modulation and still round-trips
    assert_eq!(bed.ran.ul_mod_order(5), 64);
    for ul_idx in 0..bed.cfg.frame().num_ul_syms() {
        for ue in 0..bed.cfg.spatial_streams() {
            let row = bed.buffers.decoded_row(5, ul_idx, ue);
            let got = unsafe { bed.buffers.decoded.row(row) };
            let want = streamer::ul_payload(&bed.cfg, 5, ul_idx, ue);
            assert_eq!(got, &want[..], "uplink symbol {ul_idx}, user {ue}");
        }
    }
    Ok(())
}

/// An MCS entry whose subcarrier footprint does not fit the symbol is
/// rejected and the active order is unchanged.
#[test]
fn ran_update_rejects_unfitting_mcs() -> Result<()> {
    let mut cfg = common::ul_cfg();
    cfg.cb_bytes = 24;
    let mut bed = TestBed::new(cfg, true);
    bed.inject_rx_frame(0);
    assert!(bed.run_until(200_000, |s| s.cur_proc_frame() == 1));

    // QPSK needs more subcarriers than a symbol carries
    bed.fabric
        .enqueue_rx(0, Event::new(EventKind::RanUpdate, Tag::from_raw(0)));
    for _ in 0..64 {
        bed.sched.tick();
    }
    assert_eq!(bed.sched.ran_mcs_index(), None);
    for frame in 0..16u64 {
        assert_eq!(bed.ran.ul_mod_order(frame), 16);
    }
    Ok(())
}

/// A packet beyond the frame window is a fatal stall: shutdown with no
/// task emission.
#[test]
fn out_of_window_rx_is_fatal() -> Result<()> {
    let mut bed = TestBed::new(common::ul_cfg(), false);
    bed.inject_rx(mimosa::FRAME_WND as u64 + 1, 0, 0);
    bed.sched.tick();

    assert!(bed.sched.is_stalled());
    assert!(!bed.running.load(std::sync::atomic::Ordering::Acquire));
    for kind in mimosa::message::WORK_LANE_ORDER {
        assert_eq!(bed.queued_tasks(kind), 0, "{kind:?} emitted after stall");
    }
    Ok(())
}

/// 5 antennas with a block of 4 leaves a remainder tail.
fn five_antenna_cfg() -> mimosa::config::Config {
    let mut cfg = mimosa::config::Config::default();
    cfg.bs_ant_num = 5;
    cfg.ue_ant_num = 1;
    cfg.frame_schedule = "PU".into();
    cfg.fft_size = 256;
    cfg.ofdm_data_num = 192;
    cfg.cp_size = 16;
    cfg.cb_bytes = 16;
    cfg.fft_block_size = 4;
    cfg.encode_block_size = 4;
    cfg.demul_block_size = 64;
    cfg.beam_block_size = 64;
    cfg.worker_thread_num = 0;
    cfg.socket_thread_num = 1;
    cfg.frames_to_test = 1;
    cfg.finalize().unwrap();
    cfg
}
