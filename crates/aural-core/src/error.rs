//! Error types and the process-wide last-error code
//!
//! Algorithmic errors are local to one effect: the effect falls back to
//! disabled and the reason is recorded in a process-wide code that the
//! control side can poll. Nothing here aborts the audio thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or configuring DSP state
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    /// Sample storage could not be reserved
    #[error("Failed to allocate {samples} samples")]
    Allocation { samples: usize },

    /// A parameter is outside its valid range
    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f32 },

    /// The modulation source bitmask names no supported mode
    #[error("Unsupported modulation flags: {0:#06x}")]
    UnsupportedFlags(u32),

    /// Track index outside the buffer's track count
    #[error("Track {track} out of range (buffer has {tracks} tracks)")]
    InvalidTrack { track: usize, tracks: usize },

    /// Filter order is not one of 1..=4 sections
    #[error("Unsupported filter order: {0}")]
    FilterOrder(usize),

    /// Convolution requested without an impulse response
    #[error("Impulse response is empty")]
    EmptyImpulse,

    /// New parameters read further back than the effect's history reaches
    #[error("Parameters need {needed} history samples, effect holds {capacity}")]
    HistoryCapacity { needed: usize, capacity: usize },
}

impl DspError {
    /// Map this error onto the process-wide error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Allocation { .. } => ErrorCode::OutOfMemory,
            Self::InvalidParameter { .. } | Self::FilterOrder(_) | Self::EmptyImpulse => {
                ErrorCode::InvalidParameter
            }
            Self::UnsupportedFlags(_) => ErrorCode::InvalidEnum,
            Self::InvalidTrack { .. } => ErrorCode::InvalidReference,
            Self::HistoryCapacity { .. } => ErrorCode::InvalidState,
        }
    }
}

/// Result type for DSP operations
pub type DspResult<T> = Result<T, DspError>;

/// Errors raised by the renderer scheduler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// No worker became available within the bounded wait
    #[error("No renderer worker available after {0:?}")]
    DispatchTimeout(Duration),

    /// The pool has been stopped
    #[error("Renderer scheduler is stopped")]
    Stopped,

    /// A worker thread could not be spawned
    #[error("Failed to spawn renderer worker: {0}")]
    Spawn(String),

    /// A worker exited and no longer accepts jobs
    #[error("Renderer worker {0} is gone")]
    WorkerLost(usize),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors reported by an output backend
///
/// Xruns are recovered inside the backend; what reaches the renderer is a
/// dropped block or an unavailable device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The device is gone or was never opened
    #[error("Output device unavailable: {0}")]
    Unavailable(String),

    /// The requested layout can't be satisfied even approximately
    #[error("Unsupported output configuration: {0}")]
    Unsupported(String),

    /// A block was not accepted
    #[error("Output block dropped: {0}")]
    Dropped(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised while starting the renderer
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Dsp(#[from] DspError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result type for renderer setup
pub type EngineResult<T> = Result<T, EngineError>;

/// Process-wide error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    InvalidReference = 1,
    InvalidParameter = 2,
    InvalidEnum = 3,
    InvalidState = 4,
    OutOfMemory = 5,
}

impl ErrorCode {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::InvalidReference,
            2 => Self::InvalidParameter,
            3 => Self::InvalidEnum,
            4 => Self::InvalidState,
            5 => Self::OutOfMemory,
            _ => Self::None,
        }
    }
}

static LAST_ERROR: AtomicU32 = AtomicU32::new(ErrorCode::None as u32);

/// Record an error code; the first error sticks until it is read
pub fn set_last_error(code: ErrorCode) {
    let _ = LAST_ERROR.compare_exchange(
        ErrorCode::None as u32,
        code as u32,
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
}

/// Read and clear the last recorded error code
pub fn last_error() -> ErrorCode {
    ErrorCode::from_u32(LAST_ERROR.swap(ErrorCode::None as u32, Ordering::AcqRel))
}

pub fn clear_last_error() {
    LAST_ERROR.store(ErrorCode::None as u32, Ordering::Release);
}

/// Record a DSP error and pass it through
pub fn record(err: DspError) -> DspError {
    log::warn!("{}", err);
    set_last_error(err.code());
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DspError::Allocation { samples: 4 }.code(), ErrorCode::OutOfMemory);
        assert_eq!(DspError::UnsupportedFlags(0xff).code(), ErrorCode::InvalidEnum);
        assert_eq!(DspError::FilterOrder(9).code(), ErrorCode::InvalidParameter);
        assert_eq!(
            DspError::HistoryCapacity {
                needed: 10,
                capacity: 4
            }
            .code(),
            ErrorCode::InvalidState
        );
    }

    #[test]
    fn test_error_display() {
        let err = DspError::InvalidTrack { track: 3, tracks: 2 };
        assert_eq!(err.to_string(), "Track 3 out of range (buffer has 2 tracks)");
    }

    #[test]
    fn test_record_sets_last_error() {
        clear_last_error();
        let err = record(DspError::UnsupportedFlags(0x40));
        assert_eq!(err, DspError::UnsupportedFlags(0x40));
        // Other tests may record concurrently; the first code sticks either way
        assert_ne!(last_error(), ErrorCode::None);
    }

    #[test]
    fn test_engine_error_wraps() {
        let err: EngineError = SchedulerError::Stopped.into();
        assert_eq!(err.to_string(), "Renderer scheduler is stopped");
        let err: EngineError = BackendError::Unavailable("null".into()).into();
        assert!(matches!(err, EngineError::Backend(_)));
    }
}
