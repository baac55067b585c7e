//! The source pipeline.
//!
//! Feeds the mixer: opens queue entries through the media library, walks
//! the queue in either order with repeat/shuffle semantics, concatenates
//! PCM across track boundaries, and reconciles "what the listener hears"
//! with "what is being decoded" before every packet.
//!
//! Navigation is open-or-exhaust: a track the library refuses (unknown,
//! disabled, undecodable) is skipped by continuing in the same direction
//! until the walk arrives back where it started.

use log::{debug, warn};

use crate::clock::reached;
use crate::error::{Error, Result};
use crate::media::DecodeError;

use super::{PlayState, Player, Repeat};

impl Player {
    /// Opens an entry's decoder, resetting its timeline anchors.
    pub(super) fn source_open(&mut self, ix: usize) -> std::result::Result<(), DecodeError> {
        self.queue[ix].reset();

        let id = self.queue[ix].id;
        let meta = self.media.fetch(id).ok_or(DecodeError::Unknown(id))?;

        if meta.disabled {
            debug!("track {id} is disabled, skipping");

            return Err(DecodeError::Disabled);
        }

        debug!("opening {}", meta.path);

        let decoder = self.media.open(&meta)?;
        self.queue[ix].decoder = Some(decoder);

        Ok(())
    }

    /// Tears down the opened-ahead chain starting at `ix`.
    pub(super) fn source_stop(&mut self, ix: usize) {
        let mut cur = Some(ix);

        while let Some(p) = cur {
            let entry = &mut self.queue[p];
            entry.decoder = None;
            cur = entry.play_next.take();
        }
    }

    /// Restarts an entry from the top, re-seeking its open decoder or
    /// reopening it when the decoder is already gone.
    fn restart_entry(&mut self, ix: usize) -> Result<()> {
        if self.queue[ix].decoder.is_some() {
            let entry = &mut self.queue[ix];

            if let Some(decoder) = entry.decoder.as_mut() {
                decoder.seek(0).map_err(Error::Decode)?;
            }

            Ok(())
        } else {
            self.source_open(ix).map_err(Error::Decode)
        }
    }

    /// Advances the stream to the next entry.
    ///
    /// `force` marks an explicit user skip, which demotes song repeat to
    /// playlist repeat and will stop playback at the end of the playlist
    /// under [`Repeat::Off`]. A non-forced advance links the old entry's
    /// `play_next` to the new one, extending the opened-ahead chain.
    pub(super) fn source_next(&mut self, force: bool) -> Result<()> {
        let head = if self.shuffle {
            self.queue.shuffle_head()
        } else {
            self.queue.head()
        };
        let Some(head) = head else {
            return Err(Error::EmptyQueue);
        };

        let mut r_mode = self.repeat;

        // Force repeat mode at user request.
        if force && r_mode == Repeat::Song {
            r_mode = Repeat::All;
        }

        // A single-entry playlist repeats as a single song; without
        // repeat and without user action, restart it anyway and let the
        // mixer decide end-of-stream.
        if r_mode == Repeat::All && self.queue.is_single() {
            r_mode = Repeat::Song;
        } else if !force && r_mode == Repeat::Off && self.queue.is_single() {
            r_mode = Repeat::Song;
        }

        let mut ps = match self.streaming {
            None => head,
            Some(cur) => self.queue.next_of(cur, self.shuffle),
        };

        let limit = match r_mode {
            Repeat::Song => {
                if let Some(cur) = self.streaming {
                    if let Err(error) = self.restart_entry(cur) {
                        warn!("failed to restart track for song repeat: {error}");

                        return Err(error);
                    }

                    return Ok(());
                }

                head
            }

            Repeat::All => {
                if self.shuffle {
                    // Reshuffle before repeating the playlist.
                    if self.streaming.is_some() && Some(ps) == self.queue.shuffle_head() {
                        self.queue.reshuffle(self.streaming, &mut self.rng);
                        ps = self.queue.shuffle_head().unwrap_or(ps);
                    }

                    self.queue.shuffle_head().unwrap_or(head)
                } else {
                    ps
                }
            }

            Repeat::Off => {
                if force && ps == head {
                    debug!("end of playlist reached and repeat is off");

                    let _ = self.playback_stop();
                    return Ok(());
                }

                head
            }
        };

        // Open-or-exhaust.
        let mut opened = false;
        loop {
            if self.source_open(ps).is_ok() {
                opened = true;
                break;
            }

            ps = self.queue.next_of(ps, self.shuffle);
            if ps == limit {
                break;
            }
        }

        if !opened {
            warn!("could not open any file in the queue (next)");

            return Err(Error::Exhausted);
        }

        if !force {
            if let Some(cur) = self.streaming {
                self.queue[cur].play_next = Some(ps);
            }
        }

        self.streaming = Some(ps);

        Ok(())
    }

    /// Steps the stream back to the previous entry.
    pub(super) fn source_prev(&mut self) -> Result<()> {
        let Some(cur) = self.streaming else {
            return Err(Error::NotPlaying);
        };

        let head = if self.shuffle {
            self.queue.shuffle_head()
        } else {
            self.queue.head()
        };
        let Some(head) = head else {
            return Err(Error::EmptyQueue);
        };

        if self.repeat == Repeat::Off && cur == head {
            debug!("start of playlist reached and repeat is off");

            let _ = self.playback_stop();
            return Ok(());
        }

        let mut ps = self.queue.prev_of(cur, self.shuffle);
        let limit = ps;

        // Open-or-exhaust, walking backwards. No reshuffle on the way
        // back through a shuffle round.
        let mut opened = false;
        loop {
            if self.source_open(ps).is_ok() {
                opened = true;
                break;
            }

            ps = self.queue.prev_of(ps, self.shuffle);
            if ps == limit {
                break;
            }
        }

        if !opened {
            warn!("could not open any file in the queue (prev)");

            return Err(Error::Exhausted);
        }

        self.streaming = Some(ps);

        Ok(())
    }

    /// Reconciles the audible track with the playback clock.
    ///
    /// Runs before every packet. Promotes the streaming entry once the
    /// clock crosses its `output_start`, hops along the opened-ahead chain
    /// when the clock passes a track's `end` (several hops if the mixer
    /// ran ahead), restarts in place under song repeat, and stops playback
    /// at the end of the line. Returns the clock position, or 0 when
    /// there is no stream or the clock has nothing to say yet.
    pub(super) fn source_check(&mut self) -> u64 {
        if self.streaming.is_none() {
            return 0;
        }

        let pos = self.current_pos(false);

        let Some(mut cur) = self.playing else {
            if let Some(st) = self.streaming {
                if reached(pos, self.queue[st].output_start) {
                    self.playing = Some(st);
                    self.status_update(PlayState::Playing);
                }
            }

            return pos;
        };

        let end = self.queue[cur].end;
        if end == 0 || !reached(pos, end) {
            return pos;
        }

        let mut r_mode = self.repeat;
        if r_mode == Repeat::All && self.queue.is_single() {
            r_mode = Repeat::Song;
        }

        if r_mode == Repeat::Song {
            let ps = cur;

            // We may have opened ahead into the next track already (song
            // repeat toggled in the last seconds of a track).
            if let Some(next) = self.queue[ps].play_next {
                self.playing = Some(next);
                cur = next;

                self.queue[ps].decoder = None;
                self.queue[ps].play_next = None;
            }

            let start = self.queue[ps].end.wrapping_add(1);
            let entry = &mut self.queue[cur];
            entry.stream_start = start;
            entry.output_start = start;

            // The end is reset on the old entry; the current one may have
            // its own by now.
            self.queue[ps].end = 0;

            self.status_update(PlayState::Playing);

            return pos;
        }

        let head = if self.shuffle {
            self.queue.shuffle_head()
        } else {
            self.queue.head()
        };

        let mut hops = 0;
        loop {
            let end = self.queue[cur].end;
            if end == 0 || !reached(pos, end.wrapping_add(1)) {
                break;
            }

            hops += 1;

            // Stop at the end of the chain, or on a repeat-off wrap back
            // to the head.
            let next = self.queue[cur].play_next;
            let stop = match next {
                None => true,
                Some(nx) => r_mode == Repeat::Off && Some(nx) == head,
            };

            if stop {
                let _ = self.playback_stop();

                return pos;
            }

            if let Some(nx) = next {
                let start = self.queue[cur].end.wrapping_add(1);

                self.queue[cur].decoder = None;
                self.queue[cur].play_next = None;

                let entry = &mut self.queue[nx];
                entry.stream_start = start;
                entry.output_start = start;

                self.playing = Some(nx);
                cur = nx;
            }
        }

        if hops > 0 {
            debug!("playback switched to next song");

            self.status_update(PlayState::Playing);
        }

        pos
    }

    /// Fills `buf` with PCM for the packet stamped `rtptime`, crossing
    /// track boundaries transparently.
    ///
    /// The first byte that falls past a track's end fixes that track's
    /// `end` timestamp; the stream then advances via a non-forced
    /// [`Player::source_next`] and keeps filling. Whatever the decoder
    /// produced beyond the packet stays in the staging buffer for the
    /// next one.
    pub(super) fn source_read(&mut self, buf: &mut [u8], rtptime: u64) {
        if self.streaming.is_none() {
            return;
        }

        let len = buf.len();
        let mut nbytes = 0;
        let mut advance = false;

        while nbytes < len {
            if advance {
                debug!("switching to next track");

                advance = false;

                if self.source_next(false).is_err() {
                    return;
                }

                if self.streaming.is_none() {
                    return;
                }
            }

            if self.staging.is_empty() {
                let Some(ix) = self.streaming else {
                    return;
                };

                let want = len - nbytes;
                let produced = match self.queue[ix].decoder.as_mut() {
                    Some(decoder) => decoder.fill(&mut self.staging, want),
                    None => Ok(0),
                };

                let done = match produced {
                    Ok(0) => true,
                    Err(error) => {
                        warn!("decode error, ending track: {error}");

                        true
                    }
                    Ok(_) => false,
                };

                if done {
                    // End of stream: the last of this track's samples is
                    // the one just before the first we couldn't fill.
                    self.queue[ix].end = rtptime.wrapping_add(nbytes as u64 / 4).wrapping_sub(1);

                    advance = true;
                    continue;
                }
            }

            let take = std::cmp::min(self.staging.len(), len - nbytes);
            buf[nbytes..nbytes + take].copy_from_slice(&self.staging.split_to(take));
            nbytes += take;
        }
    }
}
