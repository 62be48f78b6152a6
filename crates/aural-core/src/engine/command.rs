//! Lock-free command queue for renderer control
//!
//! The control thread never touches the renderer's sources or chains
//! directly. It pushes commands into an `rtrb` ringbuffer and the mixer
//! applies them at the top of the next block, so state transitions take
//! effect at block boundaries and never mid-block.
//!
//! - **No allocations** on the mixer side: the ringbuffer is allocated once
//! - **Wait-free**: push and pop are O(1) and never block
//! - **Single-producer single-consumer**: one control thread, one mixer
//!
//! # Usage
//!
//! ```ignore
//! let (mut tx, rx) = command_channel(COMMAND_QUEUE_CAPACITY);
//! let mut renderer = Renderer::new(config, Box::new(NullBackend::new()), rx)?;
//!
//! // Control thread
//! tx.push(RendererCommand::Play { id })?;
//!
//! // Mixer thread
//! renderer.render_block();
//! ```

use super::source::{Source, SourceId};
use crate::effect::{EffectKind, EffectState};

/// Commands sent from the control thread to the mixer
///
/// Large payloads are boxed so the enum stays small inside the ringbuffer.
pub enum RendererCommand {
    // ─────────────────────────────────────────────────────────────
    // Source Management
    // ─────────────────────────────────────────────────────────────
    /// Attach a source; it starts in whatever state it was built with
    AddSource(Box<Source>),
    /// Detach a source at the next block boundary
    RemoveSource { id: SourceId },

    // ─────────────────────────────────────────────────────────────
    // Playback Control
    // ─────────────────────────────────────────────────────────────
    Play { id: SourceId },
    Pause { id: SourceId },
    /// Stop and rewind
    Stop { id: SourceId },
    SetPitch { id: SourceId, pitch: f32 },
    SetGain { id: SourceId, gain: f32 },

    // ─────────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────────
    /// Install an effect on a source, or on the output bus when `id` is
    /// `None`. An effect of the same kind swaps parameters with the new
    /// one and keeps its history.
    InstallEffect {
        id: Option<SourceId>,
        effect: Box<EffectState>,
    },
    /// Remove an effect from a source or the output bus
    RemoveEffect { id: Option<SourceId>, kind: EffectKind },
}

/// Default capacity of the command queue
///
/// Loading a scene sends one command per source plus one per effect in a
/// burst; 1024 leaves headroom without noticeable memory.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Create a new command channel (producer/consumer pair)
///
/// The producer belongs to the control thread, the consumer to the
/// renderer.
pub fn command_channel(
    capacity: usize,
) -> (rtrb::Producer<RendererCommand>, rtrb::Consumer<RendererCommand>) {
    rtrb::RingBuffer::new(capacity.max(1))
}
