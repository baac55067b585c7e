//! Output collaborators: remote speakers, the local device, discovery.
//!
//! Remote and local sink drivers run their own I/O; the engine only issues
//! requests and consumes completions. Everything a driver (or the
//! service-discovery agent) wants to tell the engine travels as an
//! [`Event`] through the [`EventBus`], which marshals it onto the player
//! task. That one channel is the reason no driver ever needs a lock on
//! player state.

use tokio::sync::mpsc;
use tokio::time::Instant;

/// A stable speaker identifier.
///
/// `0` is reserved for the local output; remote speakers use whatever
/// 64-bit id discovery derived for them (typically from the hardware
/// address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpeakerId(pub u64);

impl SpeakerId {
    /// The reserved id of the local output.
    pub const LOCAL: Self = Self(0);

    /// Whether this id names the local output.
    pub const fn is_local(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// An established streaming session on a remote speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// What discovery knows about a remote speaker.
#[derive(Debug, Clone)]
pub struct SpeakerDesc {
    /// The speaker's stable id; never [`SpeakerId::LOCAL`].
    pub id: SpeakerId,

    /// Display name from the advertisement.
    pub name: String,

    /// Network address, opaque to the engine.
    pub address: String,

    /// Whether the speaker demands a password.
    pub wants_password: bool,

    /// The password configured for it, if any.
    pub password: Option<String>,
}

/// A remote speaker as tracked by the engine.
///
/// Discovery creates these; they are only removed once the speaker is both
/// un-advertised and sessionless.
#[derive(Debug)]
pub(crate) struct Speaker {
    /// The discovery-provided description, refreshed on re-advertisement.
    pub desc: SpeakerDesc,

    /// Whether discovery currently advertises the speaker.
    pub advertised: bool,

    /// Whether the user has selected it for output.
    pub selected: bool,

    /// The active streaming session, if any.
    pub session: Option<SessionId>,
}

impl Speaker {
    /// A freshly discovered, unselected speaker.
    pub fn new(desc: SpeakerDesc) -> Self {
        Self {
            desc,
            advertised: true,
            selected: false,
            session: None,
        }
    }
}

/// Session state reported by the remote sink driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The requested operation succeeded.
    Ok,

    /// The session ended in an orderly fashion.
    Stopped,

    /// The session (or the operation) failed.
    Failed,

    /// The speaker refused us for lack of a valid password.
    Password,
}

/// Local output state, engine-tracked and driver-reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Closed,
    Open,

    /// Told to start; the device hasn't confirmed it is running yet.
    Started,

    /// Running, and its hardware position is the clock's ground truth.
    Running,

    /// Draining towards a stop.
    Stopping,

    Failed,
}

impl LocalState {
    /// Whether packets should be written to the device.
    pub(crate) const fn is_started(self) -> bool {
        matches!(self, Self::Started | Self::Running)
    }
}

/// Driver-side failures on the request path.
///
/// Anything that happens after the request was accepted is reported
/// asynchronously through an [`Event`] instead.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("output unavailable: {0}")]
    Unavailable(String),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Anything a collaborator can tell the player task.
#[derive(Debug)]
pub enum Event {
    /// Remote session state: operation completions and unsolicited drops.
    Session {
        /// The speaker the session belongs to.
        speaker: SpeakerId,

        /// The session handle, when one exists.
        session: Option<SessionId>,

        /// What happened.
        status: SessionStatus,
    },

    /// Local output state change.
    Local(LocalState),

    /// Discovery advertised (or re-advertised) a remote speaker.
    Discovered(SpeakerDesc),

    /// Discovery withdrew a remote speaker.
    Retracted(SpeakerId),
}

/// The sending half of the collaborator event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    /// The underlying channel.
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Delivers an event to the player task.
    ///
    /// Sending is infallible from the collaborator's point of view; events
    /// sent during engine teardown are simply dropped.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Shorthand for a session event.
    pub fn session(&self, speaker: SpeakerId, session: Option<SessionId>, status: SessionStatus) {
        self.send(Event::Session {
            speaker,
            session,
            status,
        });
    }

    /// Shorthand for a local state event.
    pub fn local(&self, state: LocalState) {
        self.send(Event::Local(state));
    }
}

/// The event channel connecting collaborators to the player task.
///
/// Create one, hand [`EventBus::sender`] clones to the driver constructors,
/// then give the bus to [`crate::Player::spawn`].
#[derive(Debug)]
pub struct EventBus {
    /// Sender, cloned out to collaborators.
    tx: mpsc::UnboundedSender<Event>,

    /// Receiver, consumed by the player loop.
    pub(crate) rx: mpsc::UnboundedReceiver<Event>,
}

impl EventBus {
    /// A fresh bus.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self { tx, rx }
    }

    /// A clonable sender for collaborators.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The service-discovery agent's feed into the engine.
///
/// The agent does its own protocol work (browsing, record parsing,
/// password lookup) and reports fully typed results here. A withdrawal is
/// a retraction; the engine reaps the speaker once it is also sessionless.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// The underlying event sender.
    events: EventSender,
}

impl Discovery {
    /// Wraps an event sender.
    pub(crate) const fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// A speaker was advertised, or its advertisement changed.
    pub fn advertised(&self, desc: SpeakerDesc) {
        self.events.send(Event::Discovered(desc));
    }

    /// A speaker's advertisement was withdrawn.
    pub fn retracted(&self, id: SpeakerId) {
        self.events.send(Event::Retracted(id));
    }
}

/// The remote sink driver collaborator.
///
/// Session establishment and teardown are asynchronous: the driver accepts
/// the request, does its protocol work on its own time, and reports through
/// the event bus. Writes and transport control are fire-and-forget.
pub trait RemoteOutput: Send {
    /// Starts a streaming session; first packet will carry `first_rtp`.
    fn start(&mut self, speaker: &SpeakerDesc, first_rtp: u64) -> Result<(), OutputError>;

    /// Validates that a session could be established, without keeping one.
    fn probe(&mut self, speaker: &SpeakerDesc) -> Result<(), OutputError>;

    /// Tears down a session.
    fn stop(&mut self, session: SessionId) -> Result<(), OutputError>;

    /// Flushes every active session for a pause/seek, to resume at
    /// `resume_rtp`. Returns the speakers whose sessions are flushing;
    /// each will complete with a session event.
    fn flush(&mut self, resume_rtp: u64) -> Vec<SpeakerId>;

    /// Applies `volume` (0..=100) to every active session. Returns the
    /// speakers that will confirm with a session event.
    fn set_volume(&mut self, volume: u8) -> Vec<SpeakerId>;

    /// Writes one packet, timestamped `rtp`, to every active session.
    fn write(&mut self, packet: &[u8], rtp: u64);

    /// Kicks off the synchronized transport: the packet carrying
    /// `first_rtp` plays at `at` on every session.
    fn playback_start(&mut self, first_rtp: u64, at: Instant);

    /// Halts the transport without tearing sessions down.
    fn playback_stop(&mut self);
}

/// The local audio device collaborator.
pub trait LocalOutput: Send {
    /// Acquires the device.
    fn open(&mut self) -> Result<(), OutputError>;

    /// Releases the device.
    fn close(&mut self);

    /// Starts playback: the device position counter begins at `pos` and
    /// the first packet it will be handed carries `first_rtp`.
    fn start(&mut self, pos: u64, first_rtp: u64) -> Result<(), OutputError>;

    /// Stops playback, keeping the device open.
    fn stop(&mut self);

    /// Writes one packet, timestamped `rtp`.
    fn write(&mut self, packet: &[u8], rtp: u64);

    /// The device's current hardware sample position.
    fn pos(&self) -> u64;

    /// Applies `volume` (0..=100).
    fn set_volume(&mut self, volume: u8);
}
