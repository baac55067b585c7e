//! Engine-wide error type.
//!
//! This module exposes the single `Error` enum that the [`crate::Handle`]
//! API surfaces. The partial-success case of speaker selection gets its own
//! variant ([`Error::SpeakerPassword`]) because callers are expected to
//! treat it differently from a plain failure: the speakers we could apply
//! were applied, only the password-protected ones were skipped.

use crate::{media, volume};

/// Result alias using the engine-wide [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Central engine error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the queue is empty")]
    EmptyQueue,

    #[error("no track in the queue could be opened")]
    Exhausted,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("no output is selected or none could be started")]
    NoOutput,

    #[error("a selected speaker requires a password we don't have")]
    SpeakerPassword,

    #[error("a speaker operation failed")]
    Speaker,

    #[error("couldn't read the playback clock")]
    Clock,

    #[error("decoder failure")]
    Decode(#[from] media::DecodeError),

    #[error("unable to load/save the persistent volume")]
    PersistentVolume(#[from] volume::Error),

    #[error("the player is shutting down")]
    Shutdown,
}
