//! The playback clock.
//!
//! The engine labels every packet with a 64-bit sample counter at 44.1 kHz.
//! Between packets, "where are we now" is answered by extrapolating from a
//! committed `(samples, instant)` pair. When the local audio device is
//! running, its reported hardware position is trusted instead, since the
//! device's DAC is the only clock listeners actually hear.
//!
//! The counter wraps modulo 2^64, so ordering on the timeline is decided
//! with unsigned-difference comparisons rather than plain `<`.

use tokio::time::Instant;

/// Samples per second of the packet timeline.
pub const SAMPLE_RATE: u64 = 44_100;

/// Which clock is ground truth for the playback position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Extrapolate from the last committed pair using the monotonic clock.
    WallClock,

    /// Trust the local audio device's reported hardware position.
    LocalAudio,
}

/// The committed sample position and the instant it was committed at.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// Sample count at the last commit.
    pos: u64,

    /// When [`Self::pos`] was committed.
    stamp: Instant,

    /// The active synchronisation source.
    pub sync: SyncSource,
}

impl Clock {
    /// A fresh clock, synced to the wall clock at position zero.
    pub fn new() -> Self {
        Self {
            pos: 0,
            stamp: Instant::now(),
            sync: SyncSource::WallClock,
        }
    }

    /// The committed sample position.
    pub const fn pos(&self) -> u64 {
        self.pos
    }

    /// Extrapolates the current sample position from the committed pair.
    ///
    /// Only meaningful under [`SyncSource::WallClock`]; the caller is
    /// responsible for asking the local device instead when it is the
    /// sync source.
    pub fn extrapolate(&self) -> (u64, Instant) {
        let now = Instant::now();
        let micros = now.saturating_duration_since(self.stamp).as_micros() as u64;

        (self.pos.wrapping_add(to_samples(micros)), now)
    }

    /// Commits a `(samples, instant)` pair as the new reference.
    pub fn commit(&mut self, pos: u64, stamp: Instant) {
        self.pos = pos;
        self.stamp = stamp;
    }

    /// Moves the committed position without touching the stamp.
    ///
    /// Used for the startup pre-roll, where the position is rewound two
    /// seconds behind the stream so remote speakers get time to buffer.
    pub fn set_pos(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Re-stamps the committed position at `stamp`.
    pub fn restamp(&mut self, stamp: Instant) {
        self.stamp = stamp;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap-safe `pos >= mark` on the sample timeline.
///
/// Positions are compared through their unsigned difference so that the
/// ordering survives the counter wrapping modulo 2^64.
pub(crate) const fn reached(pos: u64, mark: u64) -> bool {
    pos.wrapping_sub(mark) < u64::MAX / 2
}

/// Microseconds to samples, truncating.
pub(crate) const fn to_samples(micros: u64) -> u64 {
    micros * SAMPLE_RATE / 1_000_000
}

/// Milliseconds to samples, truncating.
pub(crate) const fn ms_to_samples(ms: u64) -> u64 {
    ms * SAMPLE_RATE / 1000
}

/// Samples to milliseconds, truncating.
pub(crate) const fn samples_to_ms(samples: u64) -> u64 {
    samples * 1000 / SAMPLE_RATE
}
