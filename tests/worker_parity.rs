//! Worker bucket fairness: a worker drains one parity bucket, and after
//! five empty sweeps moves to the other, so neither in-flight frame
//! starves.

mod common;

use mimosa::buffers::BufferPool;
use mimosa::config::Config;
use mimosa::message::Event;
use mimosa::message::EventKind;
use mimosa::message::MessageFabric;
use mimosa::message::Tag;
use mimosa::scheduler::FrameCursors;
use mimosa::scheduler::RanState;
use mimosa::worker::Worker;
use mimosa::Result;
use std::sync::Arc;

#[test]
fn worker_flips_between_parity_buckets() -> Result<()> {
    let mut cfg = Config::default();
    cfg.bs_ant_num = 2;
    cfg.ue_ant_num = 2;
    cfg.frame_schedule = "PPUU".into();
    cfg.fft_size = 64;
    cfg.ofdm_data_num = 48;
    cfg.cp_size = 8;
    cfg.cb_bytes = 8;
    cfg.worker_thread_num = 1;
    cfg.socket_thread_num = 1;
    cfg.finalize()?;
    let cfg = Arc::new(cfg);
    let fabric = Arc::new(MessageFabric::new(&cfg));
    let buffers = Arc::new(BufferPool::new(&cfg));
    let cursors = Arc::new(FrameCursors::new());
    // two frames in flight: schedule cursor one ahead of processing
    cursors.advance_sche();

    fabric.enqueue_task(0, Event::new(EventKind::Beam, Tag::frm_sym_sc(0, 0, 0)));
    fabric.enqueue_task(1, Event::new(EventKind::Beam, Tag::frm_sym_sc(1, 0, 0)));

    let mut worker = Worker::new(
        cfg.clone(),
        buffers.clone(),
        fabric.clone(),
        cursors.clone(),
        Arc::new(RanState::new(cfg.ul_mcs.modulation)),
        0,
    );
    // plenty of sweeps: one per task plus the empty-poll flips
    for _ in 0..40 {
        worker.run_once();
    }

    let mut even = Vec::new();
    let mut odd = Vec::new();
    fabric.drain_comp(0, &mut even);
    fabric.drain_comp(1, &mut odd);
    assert_eq!(even.len(), 1, "frame 0 completion missing");
    assert_eq!(odd.len(), 1, "frame 1 completion missing");
    assert_eq!(even[0].tag().frame(), 0);
    assert_eq!(odd[0].tag().frame(), 1);
    Ok(())
}
