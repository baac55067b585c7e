//! Commands and their replies.
//!
//! Control clients talk to the player task through the [`Command`] enum:
//! each variant carries a oneshot reply sender, and the command channel is
//! bounded at a single slot so at most one command is ever in flight. Some
//! commands can't complete until remote speakers have acknowledged; those
//! park here as a [`Pending`] record, whose bottom half runs once the last
//! outstanding speaker has reported in.

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::media::TrackId;
use crate::outputs::SpeakerId;
use crate::player::{PlayState, Repeat};

/// A point-in-time description of the player, as reported to clients.
#[derive(Debug, Clone)]
pub struct Status {
    /// Playback state.
    pub state: PlayState,

    /// Repeat mode.
    pub repeat: Repeat,

    /// Whether shuffle is on.
    pub shuffle: bool,

    /// Volume as an integer percent.
    pub volume: u8,

    /// The current track, absent when stopped.
    pub track: Option<TrackStatus>,
}

/// Status details of the current track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackStatus {
    /// The track's id.
    pub id: TrackId,

    /// Position within the track, in milliseconds.
    pub pos_ms: u64,

    /// 0-based position within the playlist order.
    pub index: usize,
}

/// One row of a speaker enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerInfo {
    /// The speaker's id; [`SpeakerId::LOCAL`] for the local output.
    pub id: SpeakerId,

    /// Display name.
    pub name: String,

    /// Whether it is currently selected for output.
    pub selected: bool,

    /// Whether it demands a password.
    pub wants_password: bool,
}

/// Reply sender shorthand.
pub(crate) type Reply<T> = oneshot::Sender<T>;

/// A control-client request, with its reply channel.
pub(crate) enum Command {
    /// Report the full player status.
    Status(Reply<Status>),

    /// Report the id of the audible (or soon-audible) track.
    NowPlaying(Reply<Result<TrackId>>),

    /// Start playback; `idx` jumps to a 1-based playlist position, `None`
    /// resumes. Replies with the chosen track.
    Start {
        idx: Option<u32>,
        reply: Reply<Result<TrackId>>,
    },

    /// Stop playback entirely.
    Stop(Reply<Result<()>>),

    /// Pause, keeping the position.
    Pause(Reply<Result<()>>),

    /// Seek within the current track to a millisecond offset.
    Seek { ms: u64, reply: Reply<Result<()>> },

    /// Skip to the next track.
    Next(Reply<Result<()>>),

    /// Skip to the previous track.
    Prev(Reply<Result<()>>),

    /// Enumerate known speakers.
    Speakers(Reply<Vec<SpeakerInfo>>),

    /// Select exactly the given speakers for output.
    SetSpeakers {
        ids: Vec<SpeakerId>,
        reply: Reply<Result<()>>,
    },

    /// Set the volume (integer percent).
    SetVolume { volume: u8, reply: Reply<Result<()>> },

    /// Set the repeat mode.
    SetRepeat {
        mode: Repeat,
        reply: Reply<Result<()>>,
    },

    /// Enable or disable shuffle.
    SetShuffle {
        enable: bool,
        reply: Reply<Result<()>>,
    },

    /// Append tracks to the queue.
    Enqueue {
        tracks: Vec<TrackId>,
        reply: Reply<Result<()>>,
    },

    /// Drop the whole queue.
    ClearQueue(Reply<()>),
}

/// The deferred work of an asynchronous command.
///
/// Runs on the player task once every speaker the top half contacted has
/// reported back.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BottomHalf {
    /// Arm the timer and go audible ([`crate::Player`]'s start path).
    Start,

    /// Seek back to the pause position and hold.
    Pause,

    /// Seek to a commanded millisecond offset.
    Seek {
        /// Target offset within the track.
        ms: u64,
    },

    /// Open the next queue entry.
    Next,

    /// Open the previous queue entry.
    Prev,
}

/// What a command handler produced.
pub(crate) enum Step {
    /// The command completed synchronously.
    Done(Result<()>),

    /// The command is waiting on speaker acknowledgements.
    Async {
        /// How many speakers still owe us a report.
        outstanding: usize,

        /// Work to run once the last report lands.
        bottom_half: Option<BottomHalf>,

        /// Result accumulated by the top half so far.
        ret: Result<()>,
    },
}

/// Reply channel of a parked command.
pub(crate) enum PendingReply {
    /// Replies with the chosen track on success.
    Track(Reply<Result<TrackId>>),

    /// Replies with a bare result.
    Unit(Reply<Result<()>>),
}

/// A command waiting for its speakers.
pub(crate) struct Pending {
    /// Where to answer the caller.
    pub reply: PendingReply,

    /// Speakers that still owe a report.
    pub outstanding: usize,

    /// Deferred work for the final report.
    pub bottom_half: Option<BottomHalf>,

    /// Accumulated result.
    pub ret: Result<()>,
}

impl Pending {
    /// Records a failure without clobbering a password verdict.
    ///
    /// The password case wins over generic failure because it is the one
    /// the caller can act on.
    pub fn fail(&mut self, error: Error) {
        if matches!(error, Error::SpeakerPassword) || !matches!(self.ret, Err(Error::SpeakerPassword))
        {
            self.ret = Err(error);
        }
    }
}

/// Same accumulation rule as [`Pending::fail`], for top halves that are
/// still building their [`Step`].
pub(crate) fn accumulate(ret: &mut Result<()>, error: Error) {
    if matches!(error, Error::SpeakerPassword) || !matches!(ret, Err(Error::SpeakerPassword)) {
        *ret = Err(error);
    }
}
