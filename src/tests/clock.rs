//! Clock math tests: conversions, wrap-safe ordering, extrapolation.

use tokio::time::{advance, Duration, Instant};

use crate::clock::{ms_to_samples, reached, samples_to_ms, to_samples, Clock};

#[test]
fn conversions_truncate() {
    assert_eq!(to_samples(1_000_000), 44_100);
    assert_eq!(ms_to_samples(1000), 44_100);
    assert_eq!(samples_to_ms(44_100), 1000);

    // 1 sample is 22.67 us; everything below truncates to zero.
    assert_eq!(to_samples(22), 0);
    assert_eq!(samples_to_ms(44), 0);
}

#[test]
fn reached_is_plain_ordering_without_wrap() {
    assert!(reached(100, 100));
    assert!(reached(101, 100));
    assert!(!reached(99, 100));
}

#[test]
fn reached_survives_wraparound() {
    let mark = u64::MAX - 5;

    assert!(!reached(mark - 1, mark));
    assert!(reached(mark, mark));

    // Positions just past the wrap still count as "after" the mark.
    assert!(reached(mark.wrapping_add(3), mark));
    assert!(reached(2, mark));
}

#[tokio::test(start_paused = true)]
async fn extrapolation_tracks_virtual_time() {
    let mut clock = Clock::new();
    clock.commit(1000, Instant::now());

    advance(Duration::from_secs(1)).await;

    let (pos, _) = clock.extrapolate();
    assert_eq!(pos, 1000 + 44_100);
}

#[tokio::test(start_paused = true)]
async fn commit_moves_the_reference() {
    let mut clock = Clock::new();
    clock.commit(0, Instant::now());

    advance(Duration::from_millis(500)).await;

    let (pos, stamp) = clock.extrapolate();
    assert_eq!(pos, 22_050);

    clock.commit(pos, stamp);
    advance(Duration::from_millis(500)).await;

    let (pos, _) = clock.extrapolate();
    assert_eq!(pos, 44_100);
}
