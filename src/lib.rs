#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate log;

pub mod buffers;
pub mod config;
pub mod counters;
pub mod kernels;
pub mod logging;
pub mod mac;
pub mod message;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod streamer;
pub mod worker;

pub use anyhow::Context;
pub use anyhow::Result;
pub use num_complex::Complex32;

/// Depth of the frame window: number of frames that may be in flight.
/// Per-frame buffers and counters are sized by this; a frame whose slot
/// collides with an unfinished predecessor is never admitted.
pub const FRAME_WND: usize = 4;

/// Number of parity buckets in the message fabric. Tasks for frame `f`
/// land in bucket `f % SCHEDULE_QUEUES`.
pub const SCHEDULE_QUEUES: usize = 2;
