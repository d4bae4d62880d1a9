use thiserror::Error;

use crate::frame::PixelFormat;

/// Errors surfaced by the frame engine. Nothing here may block or crash the
/// producer thread; callers skip the cycle or fix their configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame pool exhausted: all {capacity} buffers in flight")]
    PoolExhausted { capacity: usize },

    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("stale frame handle: underlying buffer was recycled")]
    StaleHandle,

    #[error("frozen frame already released")]
    AlreadyReleased,

    #[error("processor {0:?} already registered")]
    AlreadyRegistered(String),

    #[error("no processor named {0:?}")]
    UnknownProcessor(String),

    #[error("frame data is not backed by the requested representation")]
    WrongRepresentation,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}
