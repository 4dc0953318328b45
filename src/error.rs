//! Error kinds raised by the mixer, per the engine's error handling design.

use thiserror::Error;

/// Errors raised by [`crate::Engine`] and the types it owns.
///
/// `CapacityExceeded` is only ever constructed internally; admission entry
/// points (`play`, `fade_in`) translate it into the non-exceptional `-1`
/// return value documented on those functions rather than surfacing it as an
/// `Err`.
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("mixer is not initialized")]
    NotInitialized,

    #[error("invalid mixer state: {0}")]
    InvalidState(&'static str),

    #[error("value out of range: {0}")]
    OutOfRange(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("no channel available under the current play policy")]
    CapacityExceeded,

    #[error("audio device error: {0}")]
    DeviceError(String),
}

pub type Result<T> = std::result::Result<T, MixerError>;
