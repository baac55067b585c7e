//! Playback orchestration.
//!
//! Start, stop, and the pause family (pause/seek/next/prev all share one
//! top half: capture the position, flush the speakers, disarm the timer;
//! only the bottom half differs). Also home to the per-tick packet write.
//!
//! The timeline rules live here. On a cold start the internal clock is
//! rewound two seconds behind the stream so slow-joining speakers have
//! audio buffered by the time it becomes audible; every bottom half
//! re-anchors the current entry at `last_rtp + PACKET_SAMPLES`, which is
//! the timestamp of the very next packet to be emitted.

use log::warn;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::{ms_to_samples, samples_to_ms, SyncSource, SAMPLE_RATE};
use crate::command::{BottomHalf, Step};
use crate::error::{Error, Result};
use crate::media::DecodeError;
use crate::outputs::LocalState;

use super::speakers::SinkOp;
use super::{PlayState, Player, PACKET_BYTES, PACKET_PERIOD, PACKET_SAMPLES};

impl Player {
    /// Emits one packet: reconcile, stamp, fill, fan out.
    pub(super) fn playback_write(&mut self) {
        self.source_check();

        // The check may have ended playback (end of queue).
        if self.state == PlayState::Stopped {
            return;
        }

        self.last_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);

        let mut buf = [0_u8; PACKET_BYTES];
        let rtp = self.last_rtp;
        self.source_read(&mut buf, rtp);

        if self.local_state.is_started() {
            self.local.write(&buf, rtp);
        }

        if self.sessions > 0 {
            self.remote.write(&buf, rtp);
        }
    }

    /// Starts playback.
    ///
    /// `idx = Some(n)` resets the stream and jumps to the 1-based playlist
    /// position `n` (reshuffling first when shuffle is on); `None` resumes
    /// the current stream, or opens the first playable entry when there is
    /// none. Asynchronous whenever selected speakers need sessions
    /// established; the bottom half then arms the timer and goes audible.
    pub(super) fn playback_start(&mut self, idx: Option<u32>) -> Step {
        if self.queue.is_empty() {
            warn!("nothing to play");

            return Step::Done(Err(Error::EmptyQueue));
        }

        if self.state == PlayState::Playing {
            self.status_update(PlayState::Playing);

            return Step::Done(Ok(()));
        }

        // Pre-roll: let the clock trail the stream by two seconds so
        // remote speakers can buffer before anything is audible.
        self.clock.set_pos(
            self.last_rtp
                .wrapping_add(PACKET_SAMPLES)
                .wrapping_sub(2 * SAMPLE_RATE),
        );

        let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);

        if let Some(n) = idx {
            // Explicit jump: drop the current stream and walk there.
            if let Some(cur) = self.playing.or(self.streaming) {
                self.source_stop(cur);
            }

            self.playing = None;
            self.streaming = None;

            if self.shuffle {
                self.queue.reshuffle(None, &mut self.rng);
            }

            let Some(head) = self.queue.head() else {
                return Step::Done(Err(Error::EmptyQueue));
            };

            let mut target = head;
            for _ in 0..n.saturating_sub(1) {
                target = self.queue.next_of(target, false);
            }

            if self.shuffle {
                self.queue.anchor_shuffle(target);
            }

            if let Err(error) = self.source_open(target) {
                warn!("couldn't jump to queue position {n}: {error}");

                return Step::Done(Err(Error::Exhausted));
            }

            self.streaming = Some(target);

            let entry = &mut self.queue[target];
            entry.stream_start = first_rtp;
            entry.output_start = first_rtp;
        } else if self.streaming.is_none() {
            if self.shuffle {
                self.queue.reshuffle(None, &mut self.rng);
            }

            if self.source_next(false).is_err() {
                warn!("couldn't find anything to play");

                return Step::Done(Err(Error::Exhausted));
            }

            if let Some(st) = self.streaming {
                let entry = &mut self.queue[st];
                entry.stream_start = first_rtp;
                entry.output_start = first_rtp;
            }
        }

        // Open local audio if it is wanted and not yet acquired.
        if self.local_selected && self.local_state == LocalState::Closed {
            match self.local.open() {
                Ok(()) => self.local_state = LocalState::Open,
                Err(error) => {
                    warn!("could not open local audio: {error}");

                    return Step::Done(Err(Error::NoOutput));
                }
            }
        }

        // Request sessions for selected speakers that have none.
        let mut outstanding = 0;
        for i in 0..self.speakers.len() {
            if !self.speakers[i].selected || self.speakers[i].session.is_some() {
                continue;
            }

            match self.remote.start(&self.speakers[i].desc, first_rtp) {
                Ok(()) => {
                    self.ops.insert(self.speakers[i].desc.id, SinkOp::Restart);
                    outstanding += 1;
                }
                Err(error) => {
                    warn!(
                        "could not start selected speaker {}: {error}",
                        self.speakers[i].desc.name
                    );
                }
            }
        }

        if self.local_state == LocalState::Closed && outstanding == 0 && self.sessions == 0 {
            warn!("could not start playback: no output selected or none could start");

            return Step::Done(Err(Error::NoOutput));
        }

        if outstanding > 0 {
            return Step::Async {
                outstanding,
                bottom_half: Some(BottomHalf::Start),
                ret: Ok(()),
            };
        }

        Step::Done(self.start_bh())
    }

    /// Playback startup bottom half: start outputs, arm the timer, go.
    pub(super) fn start_bh(&mut self) -> Result<()> {
        if self.local_state == LocalState::Closed && self.sessions == 0 {
            warn!("cannot start playback: no output started");

            let _ = self.playback_stop();
            return Err(Error::NoOutput);
        }

        let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);

        // Local audio first: it can fail, and is easy to stop if the rest
        // of the startup doesn't work out.
        if self.local_state == LocalState::Open {
            self.local.set_volume(self.volume);

            if let Err(error) = self.local.start(self.clock.pos(), first_rtp) {
                warn!("local audio failed to start: {error}");

                let _ = self.playback_stop();
                return Err(Error::NoOutput);
            }

            self.local_state = LocalState::Started;
        }

        let stamp = Instant::now();
        self.clock.restamp(stamp);

        // Absolute cadence: tick k fires at stamp + k * period, and missed
        // ticks burst to catch up rather than shifting the schedule.
        let mut timer = tokio::time::interval_at(stamp, PACKET_PERIOD);
        timer.set_missed_tick_behavior(MissedTickBehavior::Burst);
        self.timer = Some(timer);

        if self.sessions > 0 {
            self.remote.playback_start(first_rtp, stamp);
        }

        self.status_update(PlayState::Playing);

        Ok(())
    }

    /// Stops playback and releases the stream.
    ///
    /// Established remote sessions stay attached; only the transport is
    /// halted. Idempotent.
    pub(super) fn playback_stop(&mut self) -> Result<()> {
        if self.local_state != LocalState::Closed {
            self.local.close();
            self.local_state = LocalState::Closed;
            self.clock.sync = SyncSource::WallClock;
        }

        if self.sessions > 0 {
            self.remote.playback_stop();
        }

        self.timer = None;

        if let Some(cur) = self.playing.or(self.streaming) {
            self.source_stop(cur);
        }

        self.playing = None;
        self.streaming = None;
        self.staging.clear();

        self.status_update(PlayState::Stopped);

        Ok(())
    }

    /// The shared top half of pause, seek, next and prev.
    ///
    /// Captures the clock as the current entry's `end`, flushes every
    /// remote session, stops local audio, disarms the timer, and tears
    /// down the opened-ahead tail. The supplied bottom half runs once all
    /// flushes have been acknowledged (immediately when there are none).
    pub(super) fn playback_pause(&mut self, half: BottomHalf) -> Step {
        let pos = self.source_check();
        if pos == 0 {
            warn!("could not retrieve current position for pause");

            let _ = self.playback_stop();
            return Step::Done(Err(Error::Clock));
        }

        // The check may have ended playback under us.
        if self.state == PlayState::Stopped {
            return Step::Done(Err(Error::NotPlaying));
        }

        let Some(ps) = self.playing.or(self.streaming) else {
            return Step::Done(Err(Error::NotPlaying));
        };

        // Park the pause position on the entry itself.
        self.queue[ps].end = pos;

        let resume_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);
        let flushing = self.remote.flush(resume_rtp);
        let outstanding = flushing.len();

        for id in flushing {
            self.ops.insert(id, SinkOp::Flush);
        }

        if self.local_state != LocalState::Closed {
            self.local_stop();
        }

        self.timer = None;

        if let Some(next) = self.queue[ps].play_next.take() {
            if next != ps {
                self.source_stop(next);
            }
        }

        self.playing = None;
        self.streaming = Some(ps);
        self.staging.clear();

        if outstanding > 0 {
            return Step::Async {
                outstanding,
                bottom_half: Some(half),
                ret: Ok(()),
            };
        }

        Step::Done(self.run_bottom_half(half))
    }

    /// Runs a parked command's bottom half.
    pub(super) fn run_bottom_half(&mut self, half: BottomHalf) -> Result<()> {
        match half {
            BottomHalf::Start => self.start_bh(),
            BottomHalf::Pause => self.pause_bh(),
            BottomHalf::Seek { ms } => self.seek_bh(ms),
            BottomHalf::Next => self.skip_bh(true),
            BottomHalf::Prev => self.skip_bh(false),
        }
    }

    /// Pause bottom half: seek back to the captured position and hold.
    fn pause_bh(&mut self) -> Result<()> {
        let Some(ps) = self.streaming else {
            return Err(Error::NotPlaying);
        };

        let pos = self.queue[ps].end;
        self.queue[ps].end = 0;

        // Seek the decoder back to where the listener actually was.
        let ms = samples_to_ms(pos.wrapping_sub(self.queue[ps].stream_start));
        let actual = self.seek_decoder(ps, ms)?;

        let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);
        let entry = &mut self.queue[ps];
        entry.stream_start = first_rtp.wrapping_sub(ms_to_samples(actual));
        entry.output_start = first_rtp;

        self.playing = None;
        self.status_update(PlayState::Paused);

        Ok(())
    }

    /// Seek bottom half: seek to the commanded position.
    ///
    /// Leaves the player quietly paused; the follow-up start announces
    /// the real state change.
    fn seek_bh(&mut self, ms: u64) -> Result<()> {
        let Some(ps) = self.streaming else {
            return Err(Error::NotPlaying);
        };

        self.queue[ps].end = 0;

        let actual = self.seek_decoder(ps, ms)?;

        let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);
        let entry = &mut self.queue[ps];
        entry.stream_start = first_rtp.wrapping_sub(ms_to_samples(actual));
        entry.output_start = first_rtp;

        self.playing = None;
        self.state = PlayState::Paused;

        Ok(())
    }

    /// Next/prev bottom half: open a neighbour and hold, quietly paused.
    fn skip_bh(&mut self, forward: bool) -> Result<()> {
        if let Some(cur) = self.playing.or(self.streaming) {
            self.source_stop(cur);
        }

        let moved = if forward {
            self.source_next(true)
        } else {
            self.source_prev()
        };

        if let Err(error) = moved {
            let _ = self.playback_stop();

            return Err(error);
        }

        // Navigation may have ended the playlist instead of moving.
        if self.state == PlayState::Stopped {
            return Err(Error::NotPlaying);
        }

        let Some(st) = self.streaming else {
            return Err(Error::NotPlaying);
        };

        let first_rtp = self.last_rtp.wrapping_add(PACKET_SAMPLES);
        let entry = &mut self.queue[st];
        entry.stream_start = first_rtp;
        entry.output_start = first_rtp;

        self.playing = None;
        self.state = PlayState::Paused;

        Ok(())
    }

    /// Seeks an entry's open decoder, stopping playback when it fails.
    fn seek_decoder(&mut self, ix: usize, ms: u64) -> Result<u64> {
        let seeked = match self.queue[ix].decoder.as_mut() {
            Some(decoder) => decoder.seek(ms),
            None => Err(DecodeError::Failed("no open decoder".into())),
        };

        match seeked {
            Ok(actual) => Ok(actual),
            Err(error) => {
                warn!("seek failed: {error}");

                let _ = self.playback_stop();
                Err(Error::Decode(error))
            }
        }
    }

    /// Stops the local device, first committing its position so the wall
    /// clock takes over exactly where the hardware left off.
    pub(super) fn local_stop(&mut self) {
        if self.clock.sync == SyncSource::LocalAudio {
            let pos = self.local.pos();
            self.clock.commit(pos, Instant::now());
            self.clock.sync = SyncSource::WallClock;
        }

        if self.local_state.is_started() {
            self.local.stop();
        }

        self.local_state = LocalState::Open;
    }
}
