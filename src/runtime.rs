//! Base station runtime
//!
//! Wires the buffer pool, the message fabric, the scheduler, the worker
//! pool, the streamer, and the optional MAC loop together, and owns the
//! cancellation token every loop observes.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

use crate::buffers::BufferPool;
use crate::config::Config;
use crate::mac::MacQueues;
use crate::mac::MacThread;
use crate::message::MessageFabric;
use crate::scheduler::Scheduler;
use crate::streamer::SimStreamer;
use crate::streamer::Streamer;
use crate::worker::pin_to_core;
use crate::worker::Worker;
use crate::worker::WorkerPool;

#[derive(Error, Debug)]
pub enum FatalError {
    /// The CPU cannot keep up: a packet arrived beyond the frame window.
    #[error("pipeline stalled: the frame window was overrun")]
    PipelineStall,
    /// The streamer could not arm its hardware.
    #[error("radio startup failed")]
    RadioStartup,
}

/// Bridge OS exit signals onto the shared cancellation token.
pub fn install_signal_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::Release);
    }) {
        warn!("could not install signal handler: {e}");
    }
}

pub struct BaseStation {
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    scheduler: Scheduler,
    streamer: Box<dyn Streamer>,
    workers: Option<WorkerPool>,
    mac_handle: Option<JoinHandle<()>>,
}

impl BaseStation {
    /// Allocate buffers and queues and stand up every thread except the
    /// master loop, which [`BaseStation::run`] drives on the caller.
    /// Configuration errors surface here, before any thread starts.
    pub fn new(mut config: Config) -> anyhow::Result<BaseStation> {
        config.finalize()?;
        let config = Arc::new(config);
        let running = Arc::new(AtomicBool::new(true));
        let buffers = Arc::new(BufferPool::new(&config));
        let fabric = Arc::new(MessageFabric::new(&config));
        let mac_queues = config.enable_mac.then(|| Arc::new(MacQueues::new()));

        let mut scheduler = Scheduler::new(
            config.clone(),
            fabric.clone(),
            buffers.clone(),
            mac_queues.clone(),
            running.clone(),
        );
        let cursors = scheduler.cursors();
        let ran = scheduler.ran_state();

        let workers = if config.worker_thread_num == 0 {
            info!("single-thread mode: running one worker inline on the master");
            scheduler.set_inline_worker(Worker::new(
                config.clone(),
                buffers.clone(),
                fabric.clone(),
                cursors.clone(),
                ran.clone(),
                0,
            ));
            None
        } else {
            Some(WorkerPool::spawn(
                config.clone(),
                buffers.clone(),
                fabric.clone(),
                cursors.clone(),
                ran.clone(),
                running.clone(),
            ))
        };

        let streamer = Box::new(SimStreamer::new(
            config.clone(),
            fabric.clone(),
            buffers.clone(),
            cursors.clone(),
            ran,
            running.clone(),
        ));

        let mac_handle = mac_queues.as_ref().map(|queues| {
            MacThread::spawn(
                config.clone(),
                buffers.clone(),
                queues.clone(),
                cursors,
                running.clone(),
            )
        });

        Ok(BaseStation {
            config,
            running,
            scheduler,
            streamer,
            workers,
            mac_handle,
        })
    }

    pub fn running_token(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn tx_count(&self) -> u64 {
        self.streamer.tx_count()
    }

    /// Drive the pipeline to completion on the calling thread. Errors mean
    /// a nonzero exit; shutdown is clean either way.
    pub fn run(&mut self) -> anyhow::Result<()> {
        pin_to_core(self.config.core_offset);

        let started = self.streamer.start_txrx()?;
        if !started {
            self.running.store(false, Ordering::Release);
            self.shutdown();
            return Err(FatalError::RadioStartup.into());
        }

        self.scheduler.run();

        let stalled = self.scheduler.is_stalled();
        self.shutdown();
        info!("transmitted {} packets", self.streamer.tx_count());
        if stalled {
            return Err(FatalError::PipelineStall.into());
        }
        Ok(())
    }

    /// Clear the token and join every pinned thread.
    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        self.streamer.stop();
        if let Some(handle) = self.mac_handle.take() {
            if handle.join().is_err() {
                warn!("mac thread panicked");
            }
        }
    }
}
