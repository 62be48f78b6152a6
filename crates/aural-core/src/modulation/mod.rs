//! Parameter modulation - LFOs, envelopes and envelope followers
//!
//! Every time-varying effect parameter (delay offset, filter cutoff,
//! ring-modulator frequency, distortion drive, ...) is driven by a
//! [`Modulator`]. The control thread configures it; the audio thread calls
//! [`Modulator::get`] once per block and track, which evaluates the current
//! value and advances the per-track phase.

mod envelope;
mod lfo;
mod waveform;

pub use envelope::{Curve, Envelope, EnvelopeState, Stage};
pub use lfo::{ModulationConfig, Modulator};
pub use waveform::{ModulationFlags, Waveform};
