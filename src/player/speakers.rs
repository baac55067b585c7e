//! Speaker selection and session bookkeeping.
//!
//! Selection is declarative: `speaker_set` receives the full set of wanted
//! outputs and derives who needs a session started, probed, or torn down.
//! Every asynchronous driver request is recorded as the speaker's pending
//! [`SinkOp`]; when the driver reports back, the op decides how the event
//! is interpreted. An event for a speaker with no pending op is the
//! driver talking on its own (a session dropping mid-stream).
//!
//! Speakers are created by discovery and reaped only when both
//! un-advertised and sessionless.

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::clock::SyncSource;
use crate::command::{accumulate, Step};
use crate::error::{Error, Result};
use crate::outputs::{
    LocalState, OutputError, SessionId, SessionStatus, Speaker, SpeakerDesc, SpeakerId,
};
use crate::volume::PersistentVolume;

use super::{PlayState, Player, PACKET_SAMPLES};

/// The operation a speaker currently owes us an answer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkOp {
    /// Session start while playing.
    Activate,

    /// Validation while stopped; no session kept.
    Probe,

    /// Session start on the way from stopped into playing.
    Restart,

    /// Session teardown after deselection.
    Shutdown,

    /// Flush for the pause family.
    Flush,

    /// Volume application.
    Volume,

    /// Teardown of a session whose speaker vanished mid-operation;
    /// nobody is waiting on the outcome.
    Lost,
}

impl Player {
    /// Selects exactly the speakers in `ids` for output.
    ///
    /// Selected speakers without a session are activated (started while
    /// playing, probed while stopped); deselected speakers with a session
    /// are shut down. A speaker that wants a password we don't hold is
    /// skipped and turns the result into the partial-success password
    /// error, without affecting the others.
    pub(super) fn speaker_set(&mut self, ids: &[SpeakerId]) -> Step {
        debug!("speaker set: {} wanted", ids.len());

        let mut ret: Result<()> = Ok(());
        let mut outstanding = 0;
        let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);

        for i in 0..self.speakers.len() {
            let id = self.speakers[i].desc.id;

            if ids.contains(&id) {
                if self.speakers[i].desc.wants_password && self.speakers[i].desc.password.is_none()
                {
                    info!(
                        "speaker {} is password-protected, but we don't have it",
                        self.speakers[i].desc.name
                    );

                    accumulate(&mut ret, Error::SpeakerPassword);
                    continue;
                }

                debug!("speaker {} selected", self.speakers[i].desc.name);
                self.speakers[i].selected = true;

                if self.speakers[i].session.is_none() {
                    match self.speaker_activate(i, first_rtp) {
                        Ok(()) => outstanding += 1,
                        Err(error) => {
                            warn!(
                                "could not activate speaker {}: {error}",
                                self.speakers[i].desc.name
                            );

                            self.speakers[i].selected = false;
                            accumulate(&mut ret, Error::Speaker);
                        }
                    }
                }
            } else {
                debug!("speaker {} not selected", self.speakers[i].desc.name);
                self.speakers[i].selected = false;

                if let Some(session) = self.speakers[i].session {
                    match self.remote.stop(session) {
                        Ok(()) => {
                            self.ops.insert(id, SinkOp::Shutdown);
                            outstanding += 1;
                        }
                        Err(error) => {
                            warn!(
                                "could not deactivate speaker {}: {error}",
                                self.speakers[i].desc.name
                            );

                            accumulate(&mut ret, Error::Speaker);
                        }
                    }
                }
            }
        }

        // Local audio.
        if ids.iter().any(|id| id.is_local()) {
            debug!("local audio selected");
            self.local_selected = true;

            if !self.local_state.is_started() {
                if let Err(error) = self.local_activate() {
                    warn!("could not activate local audio: {error}");

                    self.local_selected = false;
                    accumulate(&mut ret, Error::Speaker);
                }
            }
        } else {
            debug!("local audio not selected");
            self.local_selected = false;

            if self.local_state != LocalState::Closed {
                self.local_deactivate();
            }
        }

        if outstanding > 0 {
            return Step::Async {
                outstanding,
                bottom_half: None,
                ret,
            };
        }

        Step::Done(ret)
    }

    /// Starts (while playing) or probes (while stopped) a speaker's
    /// session, recording the pending op.
    fn speaker_activate(&mut self, i: usize, first_rtp: u64) -> std::result::Result<(), OutputError> {
        let id = self.speakers[i].desc.id;

        if self.state == PlayState::Playing {
            debug!("activating speaker {}", self.speakers[i].desc.name);

            self.remote.start(&self.speakers[i].desc, first_rtp)?;
            self.ops.insert(id, SinkOp::Activate);
        } else {
            debug!("probing speaker {}", self.speakers[i].desc.name);

            self.remote.probe(&self.speakers[i].desc)?;
            self.ops.insert(id, SinkOp::Probe);
        }

        Ok(())
    }

    /// Brings the local output up, joining a running stream mid-flight.
    fn local_activate(&mut self) -> std::result::Result<(), OutputError> {
        debug!("activating local audio");

        if self.local_state == LocalState::Closed {
            self.local.open()?;
            self.local_state = LocalState::Open;
        }

        if self.state == PlayState::Playing {
            self.local.set_volume(self.volume);

            let pos = self.current_pos(false);
            let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);

            if let Err(error) = self.local.start(pos, first_rtp) {
                warn!("local playback failed to start: {error}");

                self.local.close();
                self.local_state = LocalState::Closed;

                return Err(error);
            }

            self.local_state = LocalState::Started;
        }

        Ok(())
    }

    /// Takes the local output down.
    fn local_deactivate(&mut self) {
        debug!("deactivating local audio");

        if self.local_state == LocalState::Closed {
            return;
        }

        if self.local_state.is_started() {
            self.local_stop();
        }

        self.local.close();
        self.local_state = LocalState::Closed;
        self.clock.sync = SyncSource::WallClock;
    }

    /// Local output state reported by the driver.
    ///
    /// These transitions also steer the sync source: the device clock is
    /// ground truth while it runs, and its last position is committed
    /// before it goes away so the wall clock picks up without a jump.
    pub(super) fn on_local(&mut self, state: LocalState) {
        match state {
            LocalState::Stopping => {
                debug!("local audio stopping");

                // Capture the hardware position while the device still
                // reports it.
                let pos = self.local.pos();
                self.clock.commit(pos, Instant::now());
                self.clock.sync = SyncSource::WallClock;

                self.local_state = LocalState::Stopping;
            }

            LocalState::Running => {
                debug!("local audio running");

                self.local_state = LocalState::Running;
                self.clock.sync = SyncSource::LocalAudio;
            }

            LocalState::Failed => {
                warn!("local audio failed");

                self.clock.sync = SyncSource::WallClock;

                self.local.close();
                self.local_state = LocalState::Closed;
                self.local_selected = false;

                // A dead local output only ends the session when no
                // remote speaker is carrying it either.
                if self.sessions == 0 {
                    let _ = self.playback_stop();
                }
            }

            other => self.local_state = other,
        }
    }

    /// Applies a volume across every output and persists it.
    pub(super) fn volume_set(&mut self, volume: u8) -> Step {
        let volume = volume.min(100);
        self.volume = volume;

        let confirming = self.remote.set_volume(volume);
        let outstanding = confirming.len();

        for id in confirming {
            self.ops.insert(id, SinkOp::Volume);
        }

        self.local.set_volume(volume);

        // Fire-and-forget persistence; a failed save only costs the level
        // across a restart.
        tokio::spawn(async move {
            if let Err(error) = PersistentVolume::save(volume).await {
                warn!("could not save volume setting: {error}");
            }
        });

        if outstanding > 0 {
            return Step::Async {
                outstanding,
                bottom_half: None,
                ret: Ok(()),
            };
        }

        Step::Done(Ok(()))
    }

    /// A session event from the remote driver.
    pub(super) fn on_session(
        &mut self,
        speaker: SpeakerId,
        session: Option<SessionId>,
        status: SessionStatus,
    ) {
        match self.ops.remove(&speaker) {
            None => self.streaming_event(speaker, status),
            Some(op) => self.op_event(op, speaker, session, status),
        }
    }

    /// An unsolicited event: a streaming session changed state on its own.
    fn streaming_event(&mut self, speaker: SpeakerId, status: SessionStatus) {
        if !matches!(status, SessionStatus::Failed | SessionStatus::Stopped) {
            return;
        }

        self.sessions = self.sessions.saturating_sub(1);

        let Some(i) = self.speaker_index(speaker) else {
            warn!("speaker disappeared during streaming");

            return;
        };

        if status == SessionStatus::Failed {
            warn!("speaker {} failed", self.speakers[i].desc.name);

            // A speaker that dies mid-play is dropped from the selection;
            // the rest of the stream carries on without it.
            if self.state == PlayState::Playing {
                self.speakers[i].selected = false;
            }
        } else {
            info!("speaker {} stopped", self.speakers[i].desc.name);
        }

        self.speakers[i].session = None;
        self.reap(i);
    }

    /// Resolves an event against the speaker's pending op.
    fn op_event(
        &mut self,
        op: SinkOp,
        speaker: SpeakerId,
        session: Option<SessionId>,
        status: SessionStatus,
    ) {
        match op {
            SinkOp::Flush | SinkOp::Volume => {
                // A failure during a broadcast command is also the session
                // dropping.
                if status == SessionStatus::Failed {
                    self.streaming_event(speaker, status);
                }

                self.op_done();
            }

            SinkOp::Activate => self.activate_event(speaker, session, status, true),
            SinkOp::Restart => self.activate_event(speaker, session, status, false),

            SinkOp::Probe => {
                self.probe_event(speaker, status);
                self.op_done();
            }

            SinkOp::Shutdown => {
                self.shutdown_event(speaker);
                self.op_done();
            }

            SinkOp::Lost => {
                debug!("lost speaker {speaker} finished shutting down");
            }
        }
    }

    /// Completion of a session start (activate or restart).
    ///
    /// `activate` marks the mid-play selection path, which also owns the
    /// command result and kicks the transport for the first session;
    /// the restart path leaves both to the start bottom half.
    fn activate_event(
        &mut self,
        speaker: SpeakerId,
        session: Option<SessionId>,
        mut status: SessionStatus,
        activate: bool,
    ) {
        let Some(i) = self.speaker_index(speaker) else {
            warn!("speaker disappeared during session startup");

            if let Some(session) = session {
                self.ops.insert(speaker, SinkOp::Lost);
                let _ = self.remote.stop(session);
            }

            if activate {
                self.pending_fail(Error::Speaker);
            }

            self.op_done();
            return;
        };

        if status == SessionStatus::Password {
            status = SessionStatus::Failed;

            if activate {
                self.pending_fail(Error::SpeakerPassword);
            }
        }

        if status == SessionStatus::Failed {
            self.speakers[i].selected = false;
            self.reap(i);

            if activate {
                self.pending_fail(Error::Speaker);
            }

            self.op_done();
            return;
        }

        self.speakers[i].session = session;
        self.sessions += 1;

        // Joining a stream that is already running: the transport needs a
        // kick only when this is the very first session. Later joiners
        // ride the running one.
        if activate && self.state == PlayState::Playing && self.sessions == 1 {
            self.remote
                .playback_start(self.last_rtp.wrapping_add(PACKET_SAMPLES), Instant::now());
        }

        self.op_done();
    }

    /// Completion of a probe.
    fn probe_event(&mut self, speaker: SpeakerId, mut status: SessionStatus) {
        let Some(i) = self.speaker_index(speaker) else {
            warn!("speaker disappeared during probe");

            self.pending_fail(Error::Speaker);
            return;
        };

        if status == SessionStatus::Password {
            status = SessionStatus::Failed;
            self.pending_fail(Error::SpeakerPassword);
        }

        if status == SessionStatus::Failed {
            self.speakers[i].selected = false;
            self.reap(i);
            self.pending_fail(Error::Speaker);
        }
    }

    /// Completion of a deselected speaker's session teardown.
    fn shutdown_event(&mut self, speaker: SpeakerId) {
        if self.sessions > 0 {
            self.sessions -= 1;
        }

        let Some(i) = self.speaker_index(speaker) else {
            warn!("speaker disappeared before shutdown completion");

            self.pending_fail(Error::Speaker);
            return;
        };

        self.speakers[i].session = None;
        self.reap(i);
    }

    /// Discovery advertised a speaker: refresh it in place, or add it.
    pub(super) fn on_discovered(&mut self, desc: SpeakerDesc) {
        if desc.id.is_local() {
            warn!("discovery advertised the reserved local id, ignoring");

            return;
        }

        match self.speaker_index(desc.id) {
            Some(i) => {
                debug!("updating speaker {} already in list", desc.name);

                self.speakers[i].desc = desc;
                self.speakers[i].advertised = true;
            }
            None => {
                debug!(
                    "adding speaker {} (password: {})",
                    desc.name, desc.wants_password
                );

                self.speakers.push(Speaker::new(desc));
            }
        }
    }

    /// Discovery withdrew a speaker.
    pub(super) fn on_retracted(&mut self, id: SpeakerId) {
        let Some(i) = self.speaker_index(id) else {
            warn!("speaker {id} stopped advertising, but wasn't in our list");

            return;
        };

        self.speakers[i].advertised = false;
        self.reap(i);
    }

    /// Finds a speaker by id.
    fn speaker_index(&self, id: SpeakerId) -> Option<usize> {
        self.speakers.iter().position(|s| s.desc.id == id)
    }

    /// Removes a speaker when it is both un-advertised and sessionless.
    fn reap(&mut self, i: usize) {
        if !self.speakers[i].advertised && self.speakers[i].session.is_none() {
            let speaker = self.speakers.remove(i);
            debug!("removed speaker {}; stopped advertising", speaker.desc.name);
        }
    }
}
