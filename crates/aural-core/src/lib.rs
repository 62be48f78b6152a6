//! Aural Core - real-time spatial audio effects and mixing engine
//!
//! - `buffer`: planar sample buffers with a history reservoir
//! - `modulation`: LFOs, envelopes and signal followers driving parameters
//! - `effect`: the effect state objects and the fixed-order chain applier
//! - `engine`: sources, the renderer worker pool, mixer and mixer thread
//! - `backend`: the output device interface and a null backend
//! - `config`: YAML engine configuration

pub mod backend;
pub mod buffer;
pub mod config;
pub mod effect;
pub mod engine;
pub mod error;
pub mod modulation;
pub mod types;

pub use types::*;
