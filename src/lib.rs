//! The playback engine of a multi-room audio server.
//!
//! roomtone keeps an ordered queue of tracks, runs a sample-accurate
//! 44.1 kHz clock, decodes and packetizes audio on a strict cadence, and
//! fans the packet stream out to any number of remote speakers plus an
//! optional local output while keeping them in sync.
//!
//! All mutable playback state is owned by a single player task. Everything
//! else talks to it over channels: control clients through the [`Handle`]
//! RPC surface, and the collaborator drivers (media library, decoder,
//! remote & local outputs, discovery agent) through the [`outputs::EventBus`].
//! The drivers themselves are injected as trait objects, so the engine
//! never touches the network or an audio device directly.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod clock;
pub mod command;
pub mod error;
pub mod media;
mod notify;
pub mod outputs;
pub mod player;
mod queue;
pub mod volume;

#[cfg(test)]
mod tests;

pub use command::{SpeakerInfo, Status, TrackStatus};
pub use error::{Error, Result};
pub use media::{DecodeError, Decoder, MediaLibrary, TrackId, TrackMeta};
pub use outputs::{
    Discovery, Event, EventBus, EventSender, LocalOutput, LocalState, OutputError, RemoteOutput,
    SessionId, SessionStatus, SpeakerDesc, SpeakerId,
};
pub use player::{Handle, PlayState, Player, Repeat, PACKET_SAMPLES};
