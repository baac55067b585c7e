//! Media collaborator traits.
//!
//! The engine never reads files itself: a [`MediaLibrary`] resolves track
//! ids to metadata and produces [`Decoder`]s, which hand back linear PCM
//! (16-bit stereo at 44.1 kHz) and support millisecond seeking. Both are
//! injected at spawn time, which is also what makes the engine testable
//! without any media on disk.

use bytes::BytesMut;

/// A stable track identifier, assigned by the media library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What the library knows about a track, enough to open it.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    /// The track's id, echoed back from the lookup.
    pub id: TrackId,

    /// Display title.
    pub title: String,

    /// Where the media lives; opaque to the engine.
    pub path: String,

    /// Disabled tracks are refused and skipped over during navigation.
    pub disabled: bool,
}

/// Errors produced by the media library and its decoders.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown track id {0}")]
    Unknown(TrackId),

    #[error("the track is disabled")]
    Disabled,

    #[error("unsupported or corrupt media: {0}")]
    Unsupported(String),

    #[error("decode failed: {0}")]
    Failed(String),

    #[error("seek failed: {0}")]
    Seek(String),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// An open decoding session for one track.
///
/// Decoders are dropped to clean up; there is no explicit close.
pub trait Decoder: Send {
    /// Appends roughly `want` bytes of PCM to `out`.
    ///
    /// A decoder is free to produce more than `want` (whole frames); the
    /// engine buffers the excess. Returns the number of bytes appended,
    /// with `0` meaning end of stream.
    fn fill(&mut self, out: &mut BytesMut, want: usize) -> Result<usize, DecodeError>;

    /// Seeks to `ms`, returning the millisecond actually reached.
    ///
    /// Decoders may only be able to land on frame boundaries, so the
    /// returned position can differ from the request; the engine anchors
    /// the timeline on the returned value.
    fn seek(&mut self, ms: u64) -> Result<u64, DecodeError>;
}

/// The media database collaborator.
pub trait MediaLibrary: Send {
    /// Resolves a track id to its metadata, `None` when unknown.
    fn fetch(&self, id: TrackId) -> Option<TrackMeta>;

    /// Opens a decoder for a track.
    fn open(&self, meta: &TrackMeta) -> Result<Box<dyn Decoder>, DecodeError>;
}
