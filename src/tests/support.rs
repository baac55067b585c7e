//! Mock collaborators for driving the engine in tests.
//!
//! The mocks answer driver requests synchronously and report completions
//! through the event bus, the same way a real driver would, just without
//! the latency. Every interaction is recorded in a shared log the tests
//! assert against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};

use crate::media::{DecodeError, Decoder, MediaLibrary, TrackId, TrackMeta};
use crate::outputs::{
    EventBus, EventSender, LocalOutput, OutputError, RemoteOutput, SessionId, SessionStatus,
    SpeakerDesc, SpeakerId,
};
use crate::player::{Handle, Player};

/// Bytes of 16-bit stereo 44.1 kHz PCM in `ms` milliseconds.
pub fn ms_to_bytes(ms: u64) -> usize {
    (ms * 44_100 / 1000) as usize * 4
}

/// A scripted track.
#[derive(Clone)]
pub struct MockTrack {
    /// Audio length.
    pub duration_ms: u64,

    /// Refused at fetch time.
    pub disabled: bool,

    /// Refused at open time.
    pub undecodable: bool,

    /// Seek grid: requests land on the nearest lower multiple.
    pub seek_snap_ms: u64,
}

/// A scripted media library.
pub struct MockLibrary {
    /// Tracks by id.
    tracks: HashMap<TrackId, MockTrack>,

    /// Every successful open, in order.
    pub opens: Arc<Mutex<Vec<TrackId>>>,
}

impl MockLibrary {
    /// A library of `(id, duration_ms)` tracks.
    pub fn new(tracks: &[(u32, u64)]) -> Self {
        let tracks = tracks
            .iter()
            .map(|&(id, duration_ms)| {
                (
                    TrackId(id),
                    MockTrack {
                        duration_ms,
                        disabled: false,
                        undecodable: false,
                        seek_snap_ms: 1,
                    },
                )
            })
            .collect();

        Self {
            tracks,
            opens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Marks a track disabled.
    pub fn disable(mut self, id: u32) -> Self {
        if let Some(track) = self.tracks.get_mut(&TrackId(id)) {
            track.disabled = true;
        }

        self
    }

    /// Gives a track a coarse seek grid.
    pub fn snap(mut self, id: u32, ms: u64) -> Self {
        if let Some(track) = self.tracks.get_mut(&TrackId(id)) {
            track.seek_snap_ms = ms;
        }

        self
    }
}

impl MediaLibrary for MockLibrary {
    fn fetch(&self, id: TrackId) -> Option<TrackMeta> {
        self.tracks.get(&id).map(|track| TrackMeta {
            id,
            title: format!("track {id}"),
            path: format!("/music/{id}.flac"),
            disabled: track.disabled,
        })
    }

    fn open(&self, meta: &TrackMeta) -> Result<Box<dyn Decoder>, DecodeError> {
        let track = self
            .tracks
            .get(&meta.id)
            .ok_or(DecodeError::Unknown(meta.id))?;

        if track.undecodable {
            return Err(DecodeError::Unsupported("scripted refusal".into()));
        }

        self.opens.lock().unwrap().push(meta.id);

        Ok(Box::new(MockDecoder {
            fill_byte: meta.id.0 as u8,
            total: ms_to_bytes(track.duration_ms),
            pos: 0,
            snap_ms: track.seek_snap_ms.max(1),
        }))
    }
}

/// Produces `total` bytes of a recognizable fill pattern.
struct MockDecoder {
    /// Byte value identifying the track in output buffers.
    fill_byte: u8,

    /// Total PCM bytes.
    total: usize,

    /// Bytes already produced.
    pos: usize,

    /// Seek grid in milliseconds.
    snap_ms: u64,
}

impl Decoder for MockDecoder {
    fn fill(&mut self, out: &mut BytesMut, want: usize) -> Result<usize, DecodeError> {
        let n = want.min(self.total - self.pos);
        out.put_bytes(self.fill_byte, n);
        self.pos += n;

        Ok(n)
    }

    fn seek(&mut self, ms: u64) -> Result<u64, DecodeError> {
        let snapped = ms - ms % self.snap_ms;
        let target = ms_to_bytes(snapped);

        if target > self.total {
            return Err(DecodeError::Seek(format!("{ms} ms is past the end")));
        }

        self.pos = target;

        Ok(snapped)
    }
}

/// Everything the remote mock saw and did.
#[derive(Default)]
pub struct RemoteLog {
    /// Session start requests: `(speaker, first_rtp)`.
    pub starts: Vec<(SpeakerId, u64)>,

    /// Probe requests.
    pub probes: Vec<SpeakerId>,

    /// Session teardown requests.
    pub stops: Vec<SessionId>,

    /// Flush requests (resume timestamps).
    pub flushes: Vec<u64>,

    /// Volume applications.
    pub volumes: Vec<u8>,

    /// Timestamps of written packets.
    pub writes: Vec<u64>,

    /// Transport kicks: first timestamps.
    pub transport_starts: Vec<u64>,

    /// Transport halts.
    pub transport_stops: usize,

    /// Live sessions: raw session id to speaker.
    pub sessions: HashMap<u64, SpeakerId>,

    /// Scripted outcome per raw speaker id for start/probe
    /// (default [`SessionStatus::Ok`]).
    pub outcomes: HashMap<u64, SessionStatus>,
}

/// A remote sink driver that completes everything instantly.
pub struct MockRemote {
    /// Shared log.
    log: Arc<Mutex<RemoteLog>>,

    /// Completion channel into the engine.
    events: EventSender,

    /// Session id counter.
    next_session: u64,
}

impl MockRemote {
    /// A fresh driver reporting on `events`.
    pub fn new(events: EventSender) -> (Self, Arc<Mutex<RemoteLog>>) {
        let log = Arc::new(Mutex::new(RemoteLog::default()));

        (
            Self {
                log: Arc::clone(&log),
                events,
                next_session: 0,
            },
            log,
        )
    }
}

impl RemoteOutput for MockRemote {
    fn start(&mut self, speaker: &SpeakerDesc, first_rtp: u64) -> Result<(), OutputError> {
        let mut log = self.log.lock().unwrap();
        log.starts.push((speaker.id, first_rtp));

        let outcome = log
            .outcomes
            .get(&speaker.id.0)
            .copied()
            .unwrap_or(SessionStatus::Ok);

        if outcome == SessionStatus::Ok {
            self.next_session += 1;
            log.sessions.insert(self.next_session, speaker.id);
            self.events
                .session(speaker.id, Some(SessionId(self.next_session)), outcome);
        } else {
            self.events.session(speaker.id, None, outcome);
        }

        Ok(())
    }

    fn probe(&mut self, speaker: &SpeakerDesc) -> Result<(), OutputError> {
        let mut log = self.log.lock().unwrap();
        log.probes.push(speaker.id);

        let outcome = log
            .outcomes
            .get(&speaker.id.0)
            .copied()
            .unwrap_or(SessionStatus::Ok);

        self.events.session(speaker.id, None, outcome);

        Ok(())
    }

    fn stop(&mut self, session: SessionId) -> Result<(), OutputError> {
        let mut log = self.log.lock().unwrap();
        log.stops.push(session);

        if let Some(speaker) = log.sessions.remove(&session.0) {
            self.events
                .session(speaker, Some(session), SessionStatus::Stopped);
        }

        Ok(())
    }

    fn flush(&mut self, resume_rtp: u64) -> Vec<SpeakerId> {
        let mut log = self.log.lock().unwrap();
        log.flushes.push(resume_rtp);

        for (&session, &speaker) in &log.sessions {
            self.events
                .session(speaker, Some(SessionId(session)), SessionStatus::Ok);
        }

        log.sessions.values().copied().collect()
    }

    fn set_volume(&mut self, volume: u8) -> Vec<SpeakerId> {
        let mut log = self.log.lock().unwrap();
        log.volumes.push(volume);

        for (&session, &speaker) in &log.sessions {
            self.events
                .session(speaker, Some(SessionId(session)), SessionStatus::Ok);
        }

        log.sessions.values().copied().collect()
    }

    fn write(&mut self, _packet: &[u8], rtp: u64) {
        self.log.lock().unwrap().writes.push(rtp);
    }

    fn playback_start(&mut self, first_rtp: u64, _at: tokio::time::Instant) {
        self.log.lock().unwrap().transport_starts.push(first_rtp);
    }

    fn playback_stop(&mut self) {
        self.log.lock().unwrap().transport_stops += 1;
    }
}

/// Everything the local mock saw.
#[derive(Default)]
pub struct LocalLog {
    /// Device acquisitions.
    pub opens: usize,

    /// Device releases.
    pub closes: usize,

    /// Start requests: `(pos, first_rtp)`.
    pub starts: Vec<(u64, u64)>,

    /// Stop requests.
    pub stops: usize,

    /// Timestamps of written packets.
    pub writes: Vec<u64>,

    /// Last applied volume.
    pub volume: Option<u8>,

    /// The reported hardware position.
    pub pos: u64,

    /// Scripted open failure.
    pub fail_open: bool,

    /// Scripted start failure.
    pub fail_start: bool,
}

/// A local sink driver with a driveable hardware position.
pub struct MockLocal {
    /// Shared log.
    log: Arc<Mutex<LocalLog>>,
}

impl MockLocal {
    /// A fresh driver.
    pub fn new() -> (Self, Arc<Mutex<LocalLog>>) {
        let log = Arc::new(Mutex::new(LocalLog::default()));

        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl LocalOutput for MockLocal {
    fn open(&mut self) -> Result<(), OutputError> {
        let mut log = self.log.lock().unwrap();

        if log.fail_open {
            return Err(OutputError::Unavailable("scripted open failure".into()));
        }

        log.opens += 1;

        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }

    fn start(&mut self, pos: u64, first_rtp: u64) -> Result<(), OutputError> {
        let mut log = self.log.lock().unwrap();

        if log.fail_start {
            return Err(OutputError::Unavailable("scripted start failure".into()));
        }

        log.starts.push((pos, first_rtp));
        log.pos = pos;

        Ok(())
    }

    fn stop(&mut self) {
        self.log.lock().unwrap().stops += 1;
    }

    fn write(&mut self, _packet: &[u8], rtp: u64) {
        self.log.lock().unwrap().writes.push(rtp);
    }

    fn pos(&self) -> u64 {
        self.log.lock().unwrap().pos
    }

    fn set_volume(&mut self, volume: u8) {
        self.log.lock().unwrap().volume = Some(volume);
    }
}

/// A spawned engine plus every observation point the tests need.
pub struct Rig {
    /// The engine's control surface.
    pub handle: Handle,

    /// Remote driver log.
    pub remote: Arc<Mutex<RemoteLog>>,

    /// Local driver log.
    pub local: Arc<Mutex<LocalLog>>,

    /// Raw event injection (for unsolicited driver events).
    pub events: EventSender,

    /// Library open log.
    pub opens: Arc<Mutex<Vec<TrackId>>>,
}

/// Spawns an engine over a fresh library of `(id, duration_ms)` tracks.
pub async fn rig(tracks: &[(u32, u64)]) -> Rig {
    rig_with(MockLibrary::new(tracks)).await
}

/// Spawns an engine over a prepared library.
pub async fn rig_with(library: MockLibrary) -> Rig {
    let bus = EventBus::new();
    let events = bus.sender();
    let opens = Arc::clone(&library.opens);

    let (remote, remote_log) = MockRemote::new(bus.sender());
    let (local, local_log) = MockLocal::new();

    let handle = Player::spawn(
        Box::new(library),
        Box::new(remote),
        Box::new(local),
        bus,
    )
    .await;

    Rig {
        handle,
        remote: remote_log,
        local: local_log,
        events,
        opens,
    }
}

/// A plain advertised speaker.
pub fn desc(id: u64, name: &str) -> SpeakerDesc {
    SpeakerDesc {
        id: SpeakerId(id),
        name: name.to_owned(),
        address: format!("10.0.0.{id}"),
        wants_password: false,
        password: None,
    }
}

/// A password-protected speaker we hold no password for.
pub fn locked_desc(id: u64, name: &str) -> SpeakerDesc {
    SpeakerDesc {
        wants_password: true,
        ..desc(id, name)
    }
}
