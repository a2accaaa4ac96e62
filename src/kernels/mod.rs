//! DSP kernels
//!
//! One compute unit per pipeline stage. A kernel takes a task event,
//! performs DSP on its buffer slice, and returns the completion event.
//! Kernels are stateless across frames except for private scratch; their
//! only synchronization with the scheduler is the message fabric.

mod beam;
mod broadcast;
mod codec;
mod demul;
mod fft;
pub mod modulation;
mod precode;
pub mod scramble;

pub use beam::BeamWeights;
pub use broadcast::Broadcast;
pub use codec::Decode;
pub use codec::Encode;
pub use demul::Demul;
pub use fft::Fft;
pub use fft::Ifft;
pub use precode::Precode;

use crate::message::Event;
use crate::message::EventKind;

/// A stage compute unit: tag in, DSP on a buffer slice, completion out.
pub trait Doer: Send {
    fn kind(&self) -> EventKind;

    /// Run one task. The returned event reports the same work items back
    /// to the master.
    fn launch(&mut self, event: Event) -> Event;
}
