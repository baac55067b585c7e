//! The player task and its control surface.
//!
//! One task owns every piece of mutable playback state. Its loop waits on
//! exactly four things: the shutdown token, collaborator events, the
//! single-slot command channel, and the packet timer. Commands arrive with
//! a reply channel; handlers either answer on the spot or park the command
//! until the speakers it touched have all reported back (see
//! [`crate::command`]).
//!
//! The command channel is masked while a command is parked, which is what
//! serializes every externally visible state change without a single lock
//! around player state.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use log::warn;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::{self, Clock, SyncSource, SAMPLE_RATE};
use crate::command::{
    Command, Pending, PendingReply, Reply, SpeakerInfo, Status, Step, TrackStatus,
};
use crate::error::{Error, Result};
use crate::media::{MediaLibrary, TrackId};
use crate::notify::Notifier;
use crate::outputs::{
    Discovery, Event, EventBus, EventSender, LocalOutput, LocalState, RemoteOutput, Speaker,
    SpeakerId,
};
use crate::queue::Queue;
use crate::volume::PersistentVolume;

use self::speakers::SinkOp;

mod playback;
mod source;
mod speakers;

/// Samples per packet (16-bit stereo, 44.1 kHz).
pub const PACKET_SAMPLES: u64 = 352;

/// Bytes per packet.
pub(crate) const PACKET_BYTES: usize = PACKET_SAMPLES as usize * 4;

/// Audio duration of one packet; also the timer period.
pub(crate) const PACKET_PERIOD: Duration =
    Duration::from_nanos(PACKET_SAMPLES * 1_000_000_000 / SAMPLE_RATE);

/// Display name reported for the local output.
const LOCAL_NAME: &str = "Computer";

/// Playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Paused,
    Playing,
}

/// Repeat mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Off,

    /// Repeat the current track.
    Song,

    /// Repeat the whole queue.
    All,
}

/// The playback engine. Owns all mutable state; lives on its own task.
pub struct Player {
    /// Resolves track ids and opens decoders.
    media: Box<dyn MediaLibrary>,

    /// The remote sink driver.
    remote: Box<dyn RemoteOutput>,

    /// The local sink driver.
    local: Box<dyn LocalOutput>,

    /// The play queue (both orders).
    queue: Queue,

    /// Entry the listener currently hears, once audible.
    playing: Option<usize>,

    /// Entry currently being decoded.
    streaming: Option<usize>,

    /// Playback state as last announced.
    state: PlayState,

    /// Repeat mode.
    repeat: Repeat,

    /// Whether navigation walks the shuffle order.
    shuffle: bool,

    /// Volume, integer percent.
    volume: u8,

    /// The playback clock.
    clock: Clock,

    /// Timestamp of the packet emitted last.
    last_rtp: u64,

    /// Dedicated RNG for the shuffle order.
    rng: fastrand::Rng,

    /// Decoder staging buffer; holds whatever a decoder produced beyond
    /// the current packet.
    staging: BytesMut,

    /// Known remote speakers.
    speakers: Vec<Speaker>,

    /// Number of established remote sessions.
    sessions: usize,

    /// Outstanding driver operations, at most one per speaker.
    ops: HashMap<SpeakerId, SinkOp>,

    /// Local output state.
    local_state: LocalState,

    /// Whether the local output is selected.
    local_selected: bool,

    /// The parked command, when one is waiting on speakers.
    pending: Option<Pending>,

    /// The packet timer; armed exactly while playing.
    timer: Option<Interval>,

    /// Status-change notifier.
    notifier: Arc<Notifier>,
}

/// What woke the player loop up.
enum Wake {
    /// Shutdown was requested.
    Shutdown,

    /// A collaborator event arrived.
    Event(Event),

    /// A command arrived (`None`: every handle is gone).
    Command(Option<Command>),

    /// The packet timer fired.
    Tick,
}

/// Waits for the packet timer, or forever while playback is stopped.
async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Player {
    /// Spawns the player task and returns its control handle.
    ///
    /// Collaborator drivers are built by the caller around
    /// [`EventBus::sender`] clones of the same `events` bus handed in
    /// here. The persisted volume is restored (falling back to the
    /// default when absent or unreadable) and pushed to the drivers
    /// before the first command can land.
    pub async fn spawn(
        media: Box<dyn MediaLibrary>,
        mut remote: Box<dyn RemoteOutput>,
        mut local: Box<dyn LocalOutput>,
        events: EventBus,
    ) -> Handle {
        let volume = match PersistentVolume::load().await {
            Ok(volume) => volume.get(),
            Err(error) => {
                warn!("couldn't load persisted volume: {error}");

                PersistentVolume::default().get()
            }
        };

        let _ = remote.set_volume(volume);
        local.set_volume(volume);

        let mut rng = fastrand::Rng::new();

        // Random timeline start, with bit 32 set so that wraparound of the
        // 32-bit half shows up early in testing.
        let last_rtp = (1_u64 << 32) | u64::from(rng.u32(..));

        let notifier = Notifier::new();
        let sender = events.sender();

        let (commands, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let player = Self {
            media,
            remote,
            local,
            queue: Queue::new(),
            playing: None,
            streaming: None,
            state: PlayState::Stopped,
            repeat: Repeat::Off,
            shuffle: false,
            volume,
            clock: Clock::new(),
            last_rtp,
            rng,
            staging: BytesMut::new(),
            speakers: Vec::new(),
            sessions: 0,
            ops: HashMap::new(),
            local_state: LocalState::Closed,
            local_selected: false,
            pending: None,
            timer: None,
            notifier: Arc::clone(&notifier),
        };

        tracker.spawn(player.run(rx, events.rx, shutdown.clone()));
        tracker.close();

        Handle {
            commands,
            events: sender,
            notifier,
            shutdown,
            tracker,
        }
    }

    /// The event loop.
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        shutdown: CancellationToken,
    ) {
        loop {
            let busy = self.pending.is_some();

            let wake = {
                let timer = &mut self.timer;

                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => Wake::Shutdown,

                    Some(event) = events.recv() => Wake::Event(event),

                    // While a command is parked, leave the channel alone:
                    // the next caller stays blocked in the single slot.
                    command = commands.recv(), if !busy => Wake::Command(command),

                    () = tick(timer) => Wake::Tick,
                }
            };

            match wake {
                Wake::Shutdown | Wake::Command(None) => break,
                Wake::Event(event) => self.on_event(event),
                Wake::Command(Some(command)) => self.on_command(command),
                Wake::Tick => self.playback_write(),
            }
        }

        // Teardown: silence every output, drop the queue.
        let _ = self.playback_stop();
        self.queue.clear();
    }

    /// Routes a collaborator event.
    fn on_event(&mut self, event: Event) {
        match event {
            Event::Session {
                speaker,
                session,
                status,
            } => self.on_session(speaker, session, status),
            Event::Local(state) => self.on_local(state),
            Event::Discovered(desc) => self.on_discovered(desc),
            Event::Retracted(id) => self.on_retracted(id),
        }
    }

    /// Executes one command, answering now or parking it.
    fn on_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let status = self.status();
                let _ = reply.send(status);
            }

            Command::NowPlaying(reply) => {
                let _ = reply.send(self.current_id().ok_or(Error::NotPlaying));
            }

            Command::Start { idx, reply } => {
                let step = self.playback_start(idx);
                self.finish_step(step, PendingReply::Track(reply));
            }

            Command::Stop(reply) => {
                let _ = reply.send(self.playback_stop());
            }

            Command::Pause(reply) => match self.state {
                PlayState::Stopped => {
                    let _ = reply.send(Err(Error::NotPlaying));
                }
                PlayState::Paused => {
                    let _ = reply.send(Ok(()));
                }
                PlayState::Playing => {
                    let step = self.playback_pause(crate::command::BottomHalf::Pause);
                    self.finish_step(step, PendingReply::Unit(reply));
                }
            },

            Command::Seek { ms, reply } => {
                self.transport(crate::command::BottomHalf::Seek { ms }, reply);
            }

            Command::Next(reply) => {
                self.transport(crate::command::BottomHalf::Next, reply);
            }

            Command::Prev(reply) => {
                self.transport(crate::command::BottomHalf::Prev, reply);
            }

            Command::Speakers(reply) => {
                let list = self.enumerate();
                let _ = reply.send(list);
            }

            Command::SetSpeakers { ids, reply } => {
                let step = self.speaker_set(&ids);
                self.finish_step(step, PendingReply::Unit(reply));
            }

            Command::SetVolume { volume, reply } => {
                let step = self.volume_set(volume);
                self.finish_step(step, PendingReply::Unit(reply));
            }

            Command::SetRepeat { mode, reply } => {
                self.repeat = mode;
                let _ = reply.send(Ok(()));
            }

            Command::SetShuffle { enable, reply } => {
                if enable && !self.shuffle {
                    self.queue.reshuffle(self.streaming, &mut self.rng);
                }

                self.shuffle = enable;
                let _ = reply.send(Ok(()));
            }

            Command::Enqueue { tracks, reply } => {
                self.queue.append(&tracks, &mut self.rng);
                let _ = reply.send(Ok(()));
            }

            Command::ClearQueue(reply) => {
                // The arena indices die with the queue, so playback can't
                // be left pointing into it.
                if self.streaming.is_some() || self.playing.is_some() {
                    let _ = self.playback_stop();
                }

                self.queue.clear();
                let _ = reply.send(());
            }
        }
    }

    /// Shared dispatch for the pause-alike transport commands
    /// (seek/next/prev), which are refused while stopped.
    fn transport(&mut self, half: crate::command::BottomHalf, reply: Reply<Result<()>>) {
        if self.state == PlayState::Stopped {
            let _ = reply.send(Err(Error::NotPlaying));

            return;
        }

        let step = self.playback_pause(half);
        self.finish_step(step, PendingReply::Unit(reply));
    }

    /// Answers a finished command, or parks an asynchronous one.
    fn finish_step(&mut self, step: Step, reply: PendingReply) {
        match step {
            Step::Done(result) => self.answer(reply, result),
            Step::Async {
                outstanding,
                bottom_half,
                ret,
            } => {
                self.pending = Some(Pending {
                    reply,
                    outstanding,
                    bottom_half,
                    ret,
                });
            }
        }
    }

    /// Sends a command's final result to its caller.
    fn answer(&mut self, reply: PendingReply, result: Result<()>) {
        match reply {
            PendingReply::Unit(tx) => {
                let _ = tx.send(result);
            }
            PendingReply::Track(tx) => {
                let _ = tx.send(result.and_then(|()| self.current_id().ok_or(Error::NotPlaying)));
            }
        }
    }

    /// One speaker acknowledgement towards the parked command.
    ///
    /// On the last one, the bottom half (when the command has one) decides
    /// the final result; otherwise the result the top half accumulated is
    /// reported as-is.
    pub(crate) fn op_done(&mut self) {
        let finished = match self.pending.as_mut() {
            Some(pending) => {
                pending.outstanding = pending.outstanding.saturating_sub(1);
                pending.outstanding == 0
            }
            None => false,
        };

        if !finished {
            return;
        }

        if let Some(mut pending) = self.pending.take() {
            let result = match pending.bottom_half.take() {
                Some(half) => self.run_bottom_half(half),
                None => pending.ret,
            };

            self.answer(pending.reply, result);
        }
    }

    /// Records a failure on the parked command, if one exists.
    pub(crate) fn pending_fail(&mut self, error: Error) {
        if let Some(pending) = self.pending.as_mut() {
            pending.fail(error);
        }
    }

    /// The id of the track the listener hears (or is about to hear).
    fn current_id(&self) -> Option<TrackId> {
        self.playing.or(self.streaming).map(|ix| self.queue[ix].id)
    }

    /// The current playback position in samples.
    ///
    /// Ground truth is the wall-clock extrapolation or the local device's
    /// hardware position, per the active sync source. `commit` stores the
    /// reading as the clock's new reference pair.
    pub(crate) fn current_pos(&mut self, commit: bool) -> u64 {
        let (pos, stamp) = match self.clock.sync {
            SyncSource::WallClock => self.clock.extrapolate(),
            SyncSource::LocalAudio => (self.local.pos(), Instant::now()),
        };

        if commit {
            self.clock.commit(pos, stamp);
        }

        pos
    }

    /// Announces a state transition and signals the notifier fd.
    pub(crate) fn status_update(&mut self, state: PlayState) {
        self.state = state;
        self.notifier.signal();
    }

    /// Builds the status report.
    fn status(&mut self) -> Status {
        let (state, track) = match self.state {
            PlayState::Stopped => (PlayState::Stopped, None),

            PlayState::Paused => {
                let track = self.streaming.map(|ix| {
                    let entry = &self.queue[ix];
                    let pos = self
                        .last_rtp
                        .wrapping_add(PACKET_SAMPLES)
                        .wrapping_sub(entry.stream_start);

                    TrackStatus {
                        id: entry.id,
                        pos_ms: clock::samples_to_ms(pos),
                        index: self.queue.position(ix),
                    }
                });

                (PlayState::Paused, track)
            }

            PlayState::Playing => {
                if let Some(ix) = self.playing {
                    let pos = self.current_pos(false);
                    let entry = &self.queue[ix];

                    let rel = if clock::reached(pos, entry.stream_start) {
                        pos.wrapping_sub(entry.stream_start)
                    } else {
                        0
                    };

                    let track = TrackStatus {
                        id: entry.id,
                        pos_ms: clock::samples_to_ms(rel),
                        index: self.queue.position(ix),
                    };

                    (PlayState::Playing, Some(track))
                } else if let Some(ix) = self.streaming {
                    // Still pre-rolling: report the position the listener
                    // will hear first, as paused, to avoid a visible
                    // two-second jump backwards.
                    let entry = &self.queue[ix];
                    let rel = entry.output_start.wrapping_sub(entry.stream_start);

                    let track = TrackStatus {
                        id: entry.id,
                        pos_ms: clock::samples_to_ms(rel),
                        index: self.queue.position(ix),
                    };

                    (PlayState::Paused, Some(track))
                } else {
                    (PlayState::Playing, None)
                }
            }
        };

        Status {
            state,
            repeat: self.repeat,
            shuffle: self.shuffle,
            volume: self.volume,
            track,
        }
    }

    /// Enumerates the local output plus every advertised speaker.
    fn enumerate(&mut self) -> Vec<SpeakerInfo> {
        // With no remote speakers around there is only one sensible
        // output, so select it.
        if self.speakers.is_empty() {
            self.local_selected = true;
        }

        let mut list = vec![SpeakerInfo {
            id: SpeakerId::LOCAL,
            name: LOCAL_NAME.to_owned(),
            selected: self.local_selected,
            wants_password: false,
        }];

        list.extend(
            self.speakers
                .iter()
                .filter(|speaker| speaker.advertised)
                .map(|speaker| SpeakerInfo {
                    id: speaker.desc.id,
                    name: speaker.desc.name.clone(),
                    selected: speaker.selected,
                    wants_password: speaker.desc.wants_password,
                }),
        );

        list
    }
}

/// A clonable control handle to a spawned [`Player`].
///
/// Every method that goes through the command channel serializes behind
/// whatever command is currently in flight, so a successful return has
/// observed all the state the command mutated.
#[derive(Debug, Clone)]
pub struct Handle {
    /// The single-slot command channel.
    commands: mpsc::Sender<Command>,

    /// Collaborator event sender, for [`Handle::discovery`].
    events: EventSender,

    /// Shared notifier fd slot.
    notifier: Arc<Notifier>,

    /// Shutdown token for the player task.
    shutdown: CancellationToken,

    /// Tracks the player task for joining.
    tracker: TaskTracker,
}

impl Handle {
    /// Sends a command and awaits its reply.
    async fn send<T>(&self, command: Command, reply: oneshot::Receiver<T>) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Shutdown)?;

        reply.await.map_err(|_| Error::Shutdown)
    }

    /// The full player status.
    pub async fn status(&self) -> Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx), rx).await
    }

    /// The id of the track currently heard (or opening).
    pub async fn now_playing(&self) -> Result<TrackId> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::NowPlaying(tx), rx).await?
    }

    /// Starts playback and reports the chosen track.
    ///
    /// `idx` jumps to a 1-based playlist position; `None` resumes the
    /// current stream, or starts from the head when there is none.
    pub async fn play(&self, idx: Option<u32>) -> Result<TrackId> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start { idx, reply: tx }, rx).await?
    }

    /// Stops playback.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx), rx).await?
    }

    /// Pauses playback, holding the position sample-accurately.
    pub async fn pause(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Pause(tx), rx).await?
    }

    /// Seeks within the current track. The engine stays paused afterwards;
    /// follow up with [`Handle::play`] to resume.
    pub async fn seek(&self, ms: u64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Seek { ms, reply: tx }, rx).await?
    }

    /// Skips to the next track (paused; resume with [`Handle::play`]).
    pub async fn next(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Next(tx), rx).await?
    }

    /// Skips to the previous track (paused; resume with [`Handle::play`]).
    pub async fn prev(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Prev(tx), rx).await?
    }

    /// Enumerates the local output and every advertised speaker.
    pub async fn speakers(&self) -> Result<Vec<SpeakerInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Speakers(tx), rx).await
    }

    /// Selects exactly the given speakers ([`SpeakerId::LOCAL`] for the
    /// local output).
    ///
    /// [`Error::SpeakerPassword`] is a partial success: everything that
    /// could be applied was, only password-protected speakers we hold no
    /// password for were skipped.
    pub async fn set_speakers(&self, ids: &[SpeakerId]) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(
            Command::SetSpeakers {
                ids: ids.to_vec(),
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Sets the volume (integer percent, clamped to 100).
    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetVolume { volume, reply: tx }, rx)
            .await?
    }

    /// Sets the repeat mode.
    pub async fn set_repeat(&self, mode: Repeat) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetRepeat { mode, reply: tx }, rx).await?
    }

    /// Enables or disables shuffle; enabling deals a fresh permutation.
    pub async fn set_shuffle(&self, enable: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetShuffle { enable, reply: tx }, rx)
            .await?
    }

    /// Appends tracks to the queue.
    pub async fn enqueue(&self, tracks: Vec<TrackId>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Enqueue { tracks, reply: tx }, rx).await?
    }

    /// Drops the whole queue, stopping playback if it was using it.
    pub async fn clear_queue(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ClearQueue(tx), rx).await
    }

    /// Installs (or clears) the status-update fd. Does not block and does
    /// not go through the command channel.
    pub fn set_update_fd(&self, fd: Option<i32>) {
        self.notifier.set(fd);
    }

    /// A feed for the service-discovery agent.
    pub fn discovery(&self) -> Discovery {
        Discovery::new(self.events.clone())
    }

    /// Asks the player task to exit and waits for it.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
    }
}
