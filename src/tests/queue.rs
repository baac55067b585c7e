//! Queue structure tests: cycle integrity, splicing, shuffling.

use crate::media::TrackId;
use crate::queue::Queue;

/// Tracks 1..=n, as an id batch.
fn ids(n: u32) -> Vec<TrackId> {
    (1..=n).map(TrackId).collect()
}

/// Asserts both cycles are intact and cover the same entry set.
fn assert_cycles(queue: &Queue) {
    let playlist = queue.playlist();
    let shuffled = queue.shuffled();

    assert_eq!(playlist.len(), queue.len());
    assert_eq!(shuffled.len(), queue.len());

    let mut sorted = shuffled.clone();
    sorted.sort_unstable();
    let mut expected = playlist.clone();
    expected.sort_unstable();
    assert_eq!(sorted, expected, "shuffle order must cover the playlist set");

    // Walking backwards reverses the forward walk, in both orders.
    for (shuffle, order) in [(false, &playlist), (true, &shuffled)] {
        for window in order.windows(2) {
            assert_eq!(queue.next_of(window[0], shuffle), window[1]);
            assert_eq!(queue.prev_of(window[1], shuffle), window[0]);
        }

        let first = order[0];
        let last = order[order.len() - 1];
        assert_eq!(queue.next_of(last, shuffle), first);
        assert_eq!(queue.prev_of(first, shuffle), last);
    }
}

#[test]
fn append_builds_both_cycles() {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut queue = Queue::new();

    queue.append(&ids(5), &mut rng);

    assert_eq!(queue.len(), 5);
    assert_eq!(queue.playlist(), vec![0, 1, 2, 3, 4]);
    assert_cycles(&queue);
}

#[test]
fn append_twice_splices_at_the_tail() {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut queue = Queue::new();

    queue.append(&[TrackId(1), TrackId(2)], &mut rng);
    queue.append(&[TrackId(3), TrackId(4), TrackId(5)], &mut rng);

    assert_eq!(queue.playlist(), vec![0, 1, 2, 3, 4]);
    assert_cycles(&queue);
}

#[test]
fn single_entry_is_a_cycle_of_one() {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut queue = Queue::new();

    queue.append(&ids(1), &mut rng);

    assert!(queue.is_single());
    assert_eq!(queue.next_of(0, false), 0);
    assert_eq!(queue.prev_of(0, true), 0);
}

#[test]
fn reshuffle_produces_a_fresh_permutation() {
    let mut rng = fastrand::Rng::with_seed(99);
    let mut queue = Queue::new();

    queue.append(&ids(8), &mut rng);

    // Any sane RNG will move something within a few deals.
    let before = queue.shuffled();
    let mut changed = false;

    for _ in 0..20 {
        queue.reshuffle(None, &mut rng);
        assert_cycles(&queue);

        if queue.shuffled() != before {
            changed = true;
            break;
        }
    }

    assert!(changed, "20 reshuffles never changed the order");
}

#[test]
fn reshuffle_anchors_on_the_given_entry() {
    let mut rng = fastrand::Rng::with_seed(3);
    let mut queue = Queue::new();

    queue.append(&ids(6), &mut rng);
    queue.reshuffle(Some(4), &mut rng);

    assert_eq!(queue.shuffle_head(), Some(4));
    assert_eq!(queue.shuffled()[0], 4);
    assert_cycles(&queue);
}

#[test]
fn position_counts_in_playlist_order() {
    let mut rng = fastrand::Rng::with_seed(1);
    let mut queue = Queue::new();

    queue.append(&ids(4), &mut rng);

    for (pos, &ix) in queue.playlist().iter().enumerate() {
        assert_eq!(queue.position(ix), pos);
    }
}

#[test]
fn clear_drops_everything() {
    let mut rng = fastrand::Rng::with_seed(1);
    let mut queue = Queue::new();

    queue.append(&ids(3), &mut rng);
    queue.clear();

    assert!(queue.is_empty());
    assert_eq!(queue.head(), None);
    assert_eq!(queue.shuffle_head(), None);

    // And it is usable again afterwards.
    queue.append(&ids(2), &mut rng);
    assert_eq!(queue.len(), 2);
    assert_cycles(&queue);
}
