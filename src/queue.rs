//! The play queue.
//!
//! Two cyclic orders over one set of tracks: the playlist order (as the
//! user queued them) and the shuffle order (a permutation the engine deals
//! itself). Rather than literal linked cells, entries live in an
//! arena-style `Vec` and link to each other by index, four links per
//! entry (two per order). Entries are only ever removed wholesale by
//! [`Queue::clear`], so indices stay valid for an entry's whole life.
//!
//! Entries also carry their timeline anchors and open decoder, because the
//! queue is where a track's identity lives; the source pipeline reads and
//! writes those fields while streaming.

use crate::media::{Decoder, TrackId};

/// A queued track.
pub(crate) struct Entry {
    /// The track this entry plays.
    pub id: TrackId,

    /// Packet timestamp of this track's first sample.
    pub stream_start: u64,

    /// Packet timestamp at which the track becomes audible; differs from
    /// `stream_start` only when silence was pre-rolled ahead of it.
    pub output_start: u64,

    /// Last packet timestamp carrying this track's samples; 0 = unknown.
    pub end: u64,

    /// The open decoder, present exactly while the entry is on the
    /// opened-ahead chain.
    pub decoder: Option<Box<dyn Decoder>>,

    /// The opened-ahead chain link.
    pub play_next: Option<usize>,

    /// Playlist-order neighbours.
    pl_prev: usize,
    pl_next: usize,

    /// Shuffle-order neighbours.
    sh_prev: usize,
    sh_next: usize,
}

impl Entry {
    /// Resets the timeline anchors and opened-ahead link.
    pub fn reset(&mut self) {
        self.stream_start = 0;
        self.output_start = 0;
        self.end = 0;
        self.play_next = None;
    }
}

/// The queue: an arena of entries threaded into two cycles.
#[derive(Default)]
pub(crate) struct Queue {
    /// Entry storage; indices into this vec are the link currency.
    entries: Vec<Entry>,

    /// First entry in playlist order.
    head: Option<usize>,

    /// Anchor of the current shuffle epoch.
    shuffle_head: Option<usize>,
}

impl Queue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tracks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no tracks.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The playlist head, if the queue is non-empty.
    pub const fn head(&self) -> Option<usize> {
        self.head
    }

    /// The shuffle-order head.
    pub const fn shuffle_head(&self) -> Option<usize> {
        self.shuffle_head
    }

    /// Whether the playlist is a single-entry cycle.
    pub fn is_single(&self) -> bool {
        self.head
            .is_some_and(|head| self.entries[head].pl_next == head)
    }

    /// The next entry after `ix` in the chosen order.
    pub fn next_of(&self, ix: usize, shuffle: bool) -> usize {
        if shuffle {
            self.entries[ix].sh_next
        } else {
            self.entries[ix].pl_next
        }
    }

    /// The entry before `ix` in the chosen order.
    pub fn prev_of(&self, ix: usize, shuffle: bool) -> usize {
        if shuffle {
            self.entries[ix].sh_prev
        } else {
            self.entries[ix].pl_prev
        }
    }

    /// 0-based playlist position of `ix`.
    pub fn position(&self, ix: usize) -> usize {
        let mut pos = 0;
        let mut cur = self.head;

        while let Some(p) = cur {
            if p == ix {
                break;
            }

            pos += 1;
            cur = Some(self.entries[p].pl_next);
        }

        pos
    }

    /// Appends a batch of tracks.
    ///
    /// The batch joins the playlist cycle at its tail, and a freshly
    /// shuffled copy of the batch joins the shuffle cycle just before the
    /// shuffle head, i.e. at the end of the current shuffle round.
    pub fn append(&mut self, ids: &[TrackId], rng: &mut fastrand::Rng) {
        if ids.is_empty() {
            return;
        }

        let base = self.entries.len();
        let n = ids.len();

        // The batch starts out as a self-contained cycle in both orders.
        for (i, &id) in ids.iter().enumerate() {
            let prev = base + (i + n - 1) % n;
            let next = base + (i + 1) % n;

            self.entries.push(Entry {
                id,
                stream_start: 0,
                output_start: 0,
                end: 0,
                decoder: None,
                play_next: None,
                pl_prev: prev,
                pl_next: next,
                sh_prev: prev,
                sh_next: next,
            });
        }

        // Deal the batch its own shuffle order.
        let mut perm: Vec<usize> = (base..base + n).collect();
        rng.shuffle(&mut perm);

        for i in 0..n {
            let prev = perm[(i + n - 1) % n];
            let next = perm[(i + 1) % n];

            let entry = &mut self.entries[perm[i]];
            entry.sh_prev = prev;
            entry.sh_next = next;
        }

        match (self.head, self.shuffle_head) {
            (Some(head), Some(sh_head)) => {
                // Splice the batch in front of the playlist head, i.e. at
                // the tail of the playlist order.
                let tail = self.entries[head].pl_prev;
                let (first, last) = (base, base + n - 1);

                self.entries[tail].pl_next = first;
                self.entries[first].pl_prev = tail;
                self.entries[last].pl_next = head;
                self.entries[head].pl_prev = last;

                // Same splice in shuffle order, in front of the anchor.
                let sh_tail = self.entries[sh_head].sh_prev;
                let (sh_first, sh_last) = (perm[0], perm[n - 1]);

                self.entries[sh_tail].sh_next = sh_first;
                self.entries[sh_first].sh_prev = sh_tail;
                self.entries[sh_last].sh_next = sh_head;
                self.entries[sh_head].sh_prev = sh_last;
            }

            _ => {
                self.head = Some(base);
                self.shuffle_head = Some(perm[0]);
            }
        }
    }

    /// Drops every entry, closing any open decoders.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = None;
        self.shuffle_head = None;
    }

    /// Deals a fresh shuffle permutation over the whole queue.
    ///
    /// The new shuffle head is `anchor` when given (the entry currently
    /// streaming, so the running round continues from it), otherwise the
    /// permutation's first pick.
    pub fn reshuffle(&mut self, anchor: Option<usize>, rng: &mut fastrand::Rng) {
        let Some(head) = self.head else {
            return;
        };

        let mut order = Vec::with_capacity(self.entries.len());
        let mut ix = head;

        loop {
            order.push(ix);
            ix = self.entries[ix].pl_next;

            if ix == head {
                break;
            }
        }

        rng.shuffle(&mut order);

        let n = order.len();
        for i in 0..n {
            let prev = order[(i + n - 1) % n];
            let next = order[(i + 1) % n];

            let entry = &mut self.entries[order[i]];
            entry.sh_prev = prev;
            entry.sh_next = next;
        }

        self.shuffle_head = Some(anchor.unwrap_or(order[0]));
    }

    /// Moves the shuffle-round anchor to `ix`.
    pub fn anchor_shuffle(&mut self, ix: usize) {
        if self.shuffle_head.is_some() {
            self.shuffle_head = Some(ix);
        }
    }

    /// The playlist order as indices, for inspection.
    #[cfg(test)]
    pub fn playlist(&self) -> Vec<usize> {
        self.in_order(false)
    }

    /// The shuffle order as indices, for inspection.
    #[cfg(test)]
    pub fn shuffled(&self) -> Vec<usize> {
        self.in_order(true)
    }

    /// Walks one full cycle in the chosen order.
    #[cfg(test)]
    fn in_order(&self, shuffle: bool) -> Vec<usize> {
        let head = if shuffle { self.shuffle_head } else { self.head };
        let Some(head) = head else {
            return Vec::new();
        };

        let mut order = Vec::with_capacity(self.entries.len());
        let mut ix = head;

        loop {
            order.push(ix);
            ix = self.next_of(ix, shuffle);

            if ix == head {
                break;
            }
        }

        order
    }
}

impl std::ops::Index<usize> for Queue {
    type Output = Entry;

    fn index(&self, ix: usize) -> &Entry {
        &self.entries[ix]
    }
}

impl std::ops::IndexMut<usize> for Queue {
    fn index_mut(&mut self, ix: usize) -> &mut Entry {
        &mut self.entries[ix]
    }
}
