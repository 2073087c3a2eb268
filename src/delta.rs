use std::ops::Range;

use crate::error::{ensure_finite, DeltaError, Result};
use crate::store::SampleStore;
use crate::types::{CompetitorId, DistanceBucket, SampleMap, Series};

/// One averaged group of common points.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Window {
    delta: f64,
    mean_bucket: f64,
    len: usize,
}

fn pair(
    map: &SampleMap,
    a: CompetitorId,
    b: CompetitorId,
) -> Result<(&Series, &Series)> {
    let sa = map.get(&a).ok_or(DeltaError::UnknownCompetitor(a))?;
    let sb = map.get(&b).ok_or(DeltaError::UnknownCompetitor(b))?;
    Ok((sa, sb))
}

fn common_in(sa: &Series, sb: &Series) -> Vec<DistanceBucket> {
    let (small, large) = if sa.len() <= sb.len() { (sa, sb) } else { (sb, sa) };
    let mut common: Vec<DistanceBucket> = small
        .keys()
        .filter(|bucket| large.contains_key(*bucket))
        .copied()
        .collect();
    // Group boundaries are positional, so order must be by distance.
    common.sort_unstable();
    common
}

/// Index range of `group_index` within `len` ascending common points.
///
/// Groups are `points` wide and aligned so that the group nearest the
/// requested end holds the remainder (`len % points`, or a full group when
/// that is zero). `±1` is that nearest group, `±k` the `k`-th from the same
/// end, and `0` selects everything.
fn group_range(len: usize, points: usize, group_index: i64) -> Range<usize> {
    if group_index == 0 {
        return 0..len;
    }
    let nearest = match len % points {
        0 => points,
        rem => rem,
    }
    .min(len);

    let k = group_index.unsigned_abs() as usize;
    let (near, far) = if k == 1 {
        (0, nearest)
    } else {
        let near = nearest.saturating_add((k - 2).saturating_mul(points));
        (near, near.saturating_add(points))
    };
    let (near, far) = (near.min(len), far.min(len));

    if group_index < 0 {
        len - far..len - near
    } else {
        near..far
    }
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

fn window(
    sa: &Series,
    sb: &Series,
    common: &[DistanceBucket],
    points: usize,
    group_index: i64,
) -> Window {
    let slice = &common[group_range(common.len(), points, group_index)];
    if slice.is_empty() {
        return Window { delta: 0.0, mean_bucket: 0.0, len: 0 };
    }

    let mut delta_sum = 0.0;
    let mut bucket_sum = 0.0;
    let mut lead = None;
    for bucket in slice {
        let delta = sa[bucket] - sb[bucket];
        match lead {
            None => lead = Some(sign(delta)),
            Some(s) if s != sign(delta) => {
                return Window { delta: 0.0, mean_bucket: 0.0, len: slice.len() };
            }
            Some(_) => {}
        }
        delta_sum += delta;
        bucket_sum += *bucket as f64;
    }

    let n = slice.len() as f64;
    Window {
        delta: delta_sum / n,
        mean_bucket: bucket_sum / n,
        len: slice.len(),
    }
}

fn mean_successive_difference(values: &[f64]) -> f64 {
    let sum: f64 = values.windows(2).map(|w| w[1] - w[0]).sum();
    sum / (values.len() - 1) as f64
}

/// Buckets both competitors have a sample at, ascending.
pub fn common_distances(
    store: &SampleStore,
    a: CompetitorId,
    b: CompetitorId,
) -> Result<Vec<DistanceBucket>> {
    store.read(|map| -> Result<Vec<DistanceBucket>> {
        let (sa, sb) = pair(map, a, b)?;
        Ok(common_in(sa, sb))
    })
}

/// Average of `time(a) - time(b)` over one group of common points, or `0`
/// when the sign flips inside the group or the group is empty.
///
/// Negative means `a` is ahead, positive means `b` is.
pub fn windowed_delta_average(
    store: &SampleStore,
    a: CompetitorId,
    b: CompetitorId,
    group_index: i64,
) -> Result<f64> {
    let points = store.config().points_per_average;
    store.read(|map| -> Result<f64> {
        let (sa, sb) = pair(map, a, b)?;
        let common = common_in(sa, sb);
        Ok(window(sa, sb, &common, points, group_index).delta)
    })
}

/// Most recent stable gap in milliseconds between `a` and `b`.
pub fn delta_between(store: &SampleStore, a: CompetitorId, b: CompetitorId) -> Result<f64> {
    windowed_delta_average(store, a, b, -1)
}

/// Laps for `behind` to catch `ahead` at the difference of their last laps.
///
/// Returns `-1` when `behind` is in front or lapping slower, and `0` when the
/// two are level or swapping the lead. Linear extrapolation only.
pub fn to_catch_lap_based(
    store: &SampleStore,
    ahead: CompetitorId,
    behind: CompetitorId,
    last_lap_ahead: f64,
    last_lap_behind: f64,
) -> Result<f64> {
    let gap = delta_between(store, behind, ahead)?;
    let last_lap_ahead = ensure_finite("last_lap_ahead", last_lap_ahead)?;
    let last_lap_behind = ensure_finite("last_lap_behind", last_lap_behind)?;

    if gap == 0.0 {
        return Ok(0.0);
    }
    if gap < 0.0 || last_lap_behind > last_lap_ahead {
        return Ok(-1.0);
    }
    Ok(gap / (last_lap_ahead - last_lap_behind))
}

/// Laps for `behind` to catch `ahead`, extrapolated from how the gap has been
/// closing over the last `averages_per_to_catch` groups.
///
/// Walks groups from the most recent backwards and stops at the first one
/// where `ahead` is not ahead. Returns `-1` if that is the most recent group,
/// `0` when fewer than two groups are usable, and `-1` when the gap is not
/// changing at all.
pub fn to_catch_real_time(
    store: &SampleStore,
    ahead: CompetitorId,
    behind: CompetitorId,
    average_lap_distance: f64,
) -> Result<f64> {
    let cfg = store.config();
    let (points, max_groups, interval) = (
        cfg.points_per_average,
        cfg.averages_per_to_catch,
        cfg.distance_interval,
    );

    store.read(|map| -> Result<f64> {
        let (sa, sb) = pair(map, ahead, behind)?;
        let lap_distance = ensure_finite("average_lap_distance", average_lap_distance)?;
        let common = common_in(sa, sb);
        if common.is_empty() {
            return Ok(0.0);
        }

        let mut groups = Vec::with_capacity(max_groups);
        for k in 1..=max_groups {
            let w = window(sa, sb, &common, points, -(k as i64));
            if w.len == 0 || w.delta >= 0.0 {
                if k == 1 {
                    return Ok(-1.0);
                }
                break;
            }
            groups.push(w);
        }
        if groups.len() < 2 {
            return Ok(0.0);
        }

        // Oldest first so differences read as "later minus earlier".
        groups.reverse();
        let deltas: Vec<f64> = groups.iter().map(|w| w.delta).collect();
        let positions: Vec<f64> = groups.iter().map(|w| w.mean_bucket).collect();

        let closing_rate = mean_successive_difference(&deltas);
        if closing_rate == 0.0 {
            return Ok(-1.0);
        }
        let progress_rate = mean_successive_difference(&positions) * interval;
        let most_recent = deltas[deltas.len() - 1];

        Ok((most_recent / closing_rate).abs() * (lap_distance / progress_rate))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeltaConfig;

    const INTERVAL: f64 = 100.0;
    const UPPER: f64 = 10.0;
    const POINTS: usize = 5;
    const AVERAGES: usize = 5;

    fn store() -> SampleStore {
        SampleStore::new(DeltaConfig {
            distance_interval: INTERVAL,
            distance_upper_bound: UPPER,
            points_per_average: POINTS,
            averages_per_to_catch: AVERAGES,
        })
        .unwrap()
    }

    fn put(s: &SampleStore, id: CompetitorId, bucket: usize, time: f64) {
        s.ingest(id, bucket as f64 * INTERVAL, time).unwrap();
    }

    fn assert_close(actual: f64, expected: f64) {
        let tol = 1e-9 * expected.abs().max(1.0);
        assert!(
            (actual - expected).abs() < tol,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn group_ranges_align_from_the_requested_end() {
        // 12 points, groups of 5: nearest group holds the 2 leftover points
        assert_eq!(group_range(12, 5, -1), 10..12);
        assert_eq!(group_range(12, 5, -2), 5..10);
        assert_eq!(group_range(12, 5, -3), 0..5);
        assert_eq!(group_range(12, 5, -4), 0..0);
        assert_eq!(group_range(12, 5, 1), 0..2);
        assert_eq!(group_range(12, 5, 2), 2..7);
        assert_eq!(group_range(12, 5, 0), 0..12);

        assert_eq!(group_range(10, 5, -1), 5..10);
        assert_eq!(group_range(10, 5, 1), 0..5);
        assert_eq!(group_range(3, 5, -1), 0..3);
        assert_eq!(group_range(3, 5, -2), 0..0);
        assert_eq!(group_range(0, 5, -1), 0..0);
        assert_eq!(group_range(10, 5, i64::MIN), 0..0);
    }

    #[test]
    fn unknown_competitor() {
        let s = store();
        put(&s, 1, 1, 1.0);
        put(&s, 2, 1, 1.0);
        assert!(matches!(delta_between(&s, 1, 5), Err(DeltaError::UnknownCompetitor(5))));
        assert!(matches!(delta_between(&s, 10, 2), Err(DeltaError::UnknownCompetitor(10))));
        assert!(delta_between(&s, 10, 15).is_err());
        assert!(common_distances(&s, 3, 1).is_err());
    }

    #[test]
    fn simple_delta() {
        let s = store();
        put(&s, 1, 1, 5000.0);
        put(&s, 2, 1, 7000.0);
        assert_eq!(delta_between(&s, 1, 2).unwrap(), -2000.0);
        assert_eq!(delta_between(&s, 2, 1).unwrap(), 2000.0);
    }

    #[test]
    fn only_shared_buckets_count() {
        let s = store();
        put(&s, 44, 0, 70000.0);
        put(&s, 44, 1, 80000.0);
        put(&s, 77, 0, 124000.0);
        assert_eq!(common_distances(&s, 44, 77).unwrap(), vec![0]);
        assert_eq!(delta_between(&s, 44, 77).unwrap(), 70000.0 - 124000.0);
        assert_eq!(delta_between(&s, 77, 44).unwrap(), 124000.0 - 70000.0);
    }

    #[test]
    fn intermediate_distances_are_ignored() {
        let s = store();
        s.ingest(77, 500.0, 500.0).unwrap();
        s.ingest(99, 500.0, 700.0).unwrap();
        s.ingest(77, 600.0, 501.0).unwrap();
        s.ingest(77, 1000.0, 800.0).unwrap();
        s.ingest(99, 1000.0, 1000.0).unwrap();
        assert_eq!(delta_between(&s, 77, 99).unwrap(), (500.0 - 700.0 + 800.0 - 1000.0) / 2.0);
    }

    #[test]
    fn distances_within_tolerance_match() {
        let s = store();
        s.ingest(123, INTERVAL, 1.0).unwrap();
        s.ingest(124, INTERVAL + UPPER / 2.0, 5.0).unwrap();
        s.ingest(123, INTERVAL * 2.0, 10.0).unwrap();
        s.ingest(124, INTERVAL * 2.0 + UPPER / 4.0, 20.0).unwrap();
        assert_eq!(delta_between(&s, 123, 124).unwrap(), (1.0 - 5.0 + 10.0 - 20.0) / 2.0);
        assert_eq!(delta_between(&s, 124, 123).unwrap(), (5.0 - 1.0 + 20.0 - 10.0) / 2.0);
    }

    #[test]
    fn only_the_latest_window_is_averaged() {
        let s = store();
        put(&s, 1, 0, 0.0);
        put(&s, 2, 0, 50.0);
        for i in 1..=POINTS {
            put(&s, 1, i, i as f64);
            put(&s, 2, i, i as f64);
        }
        assert_eq!(delta_between(&s, 1, 2).unwrap(), 0.0);
    }

    #[test]
    fn lead_change_inside_window_is_zero() {
        let s = store();
        put(&s, 1, 0, 50.0);
        put(&s, 2, 0, 100.0);
        put(&s, 1, 1, 200.0);
        put(&s, 2, 1, 150.0);
        put(&s, 1, 2, 300.0);
        put(&s, 2, 2, 350.0);
        assert_eq!(delta_between(&s, 1, 2).unwrap(), 0.0);
        assert_eq!(delta_between(&s, 2, 1).unwrap(), 0.0);
    }

    #[test]
    fn antisymmetric() {
        let s = store();
        for i in 0..13 {
            put(&s, 3, i, i as f64 * 1000.0);
            put(&s, 4, i, i as f64 * 1010.0 + 7.0);
        }
        for g in [-3, -2, -1, 0, 1, 2, 3] {
            let ab = windowed_delta_average(&s, 3, 4, g).unwrap();
            let ba = windowed_delta_average(&s, 4, 3, g).unwrap();
            assert_eq!(ab, -ba, "group {}", g);
        }
    }

    #[test]
    fn lap_based_errors() {
        let s = store();
        s.ingest(5, 6.0, 8.0).unwrap();
        s.ingest(8, 6.0, 5.0).unwrap();
        assert!(to_catch_lap_based(&s, 15, 8, 25.0, 32.0).is_err());
        assert!(to_catch_lap_based(&s, 5, 25, 67.0, 89.0).is_err());
        assert!(matches!(
            to_catch_lap_based(&s, 5, 8, f64::NAN, 25.0),
            Err(DeltaError::InvalidArgument(_))
        ));
        assert!(to_catch_lap_based(&s, 8, 5, 74.0, f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn lap_based_forecast() {
        let s = store();
        put(&s, 1, 1, 50.0);
        put(&s, 2, 1, 100.0);
        assert_eq!(to_catch_lap_based(&s, 1, 2, 20.0, 10.0).unwrap(), 5.0);

        let s = store();
        put(&s, 13, 17, 10.0);
        put(&s, 14, 17, 15.0);
        assert_eq!(to_catch_lap_based(&s, 13, 14, 6.0, 4.0).unwrap(), 2.5);
    }

    #[test]
    fn lap_based_not_catching_or_ahead() {
        let s = store();
        put(&s, 44, 3, 5.0);
        put(&s, 77, 3, 10.0);
        assert_eq!(to_catch_lap_based(&s, 44, 77, 1.0, 2.0).unwrap(), -1.0);

        let s = store();
        s.ingest(99, INTERVAL + UPPER - 1.0, 4.0).unwrap();
        s.ingest(101, INTERVAL + UPPER - 1.0, 3.0).unwrap();
        assert_eq!(to_catch_lap_based(&s, 99, 101, 1.0, 2.0).unwrap(), -1.0);
        assert_eq!(to_catch_lap_based(&s, 99, 101, 2.0, 1.0).unwrap(), -1.0);
    }

    #[test]
    fn lap_based_level_or_lead_changing_is_zero() {
        let s = store();
        put(&s, 123, 10, 5.0);
        put(&s, 15, 10, 5.0);
        assert_eq!(to_catch_lap_based(&s, 123, 15, 5.0, 4.0).unwrap(), 0.0);
        assert_eq!(to_catch_lap_based(&s, 15, 123, 4.0, 5.0).unwrap(), 0.0);

        let s = store();
        put(&s, 1, 0, 50.0);
        put(&s, 2, 0, 100.0);
        put(&s, 1, 1, 200.0);
        put(&s, 2, 1, 150.0);
        put(&s, 1, 2, 250.0);
        put(&s, 2, 2, 300.0);
        assert_eq!(to_catch_lap_based(&s, 1, 2, 50000.0, 40000.0).unwrap(), 0.0);
        assert_eq!(to_catch_lap_based(&s, 2, 1, 40000.0, 50000.0).unwrap(), 0.0);
    }

    #[test]
    fn real_time_errors() {
        let s = store();
        put(&s, 101, 1, 15.0);
        put(&s, 1, 1, 20.0);
        assert!(matches!(
            to_catch_real_time(&s, 101, 15, 2345.0),
            Err(DeltaError::UnknownCompetitor(15))
        ));
        assert!(to_catch_real_time(&s, 48, 101, 5789.0).is_err());
        assert!(matches!(
            to_catch_real_time(&s, 101, 1, f64::NAN),
            Err(DeltaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn real_time_behind_car_ahead_in_latest_group() {
        let s = store();
        let last = AVERAGES * POINTS - 1;
        for i in 0..last {
            put(&s, 1, i, i as f64 * 100.0);
            put(&s, 2, i, i as f64 * 200.0);
        }
        put(&s, 1, last, last as f64 * 200.0);
        put(&s, 2, last, last as f64 * 100.0);
        assert_eq!(to_catch_real_time(&s, 1, 2, 7890.0).unwrap(), -1.0);
    }

    #[test]
    fn real_time_single_group_is_zero() {
        let s = store();
        for i in 1..=POINTS {
            put(&s, 1, i, i as f64 * 50.0);
            put(&s, 2, i, i as f64 * 100.0);
        }
        assert_eq!(to_catch_real_time(&s, 1, 2, 123.0).unwrap(), 0.0);
    }

    #[test]
    fn real_time_lead_change_in_previous_group_is_zero() {
        let s = store();
        for i in 0..POINTS {
            put(&s, 1, i, i as f64 * 100.0);
            put(&s, 2, i, i as f64 * 50.0);
        }
        for i in POINTS..2 * POINTS {
            put(&s, 1, i, i as f64 * 50.0);
            put(&s, 2, i, i as f64 * 100.0);
        }
        assert_eq!(to_catch_real_time(&s, 1, 2, 3465.0).unwrap(), 0.0);
    }

    #[test]
    fn real_time_two_full_groups() {
        let s = store();
        let mut sum_one = 0.0;
        for i in 1..=POINTS {
            sum_one += i as f64 * INTERVAL;
            put(&s, 1, i, 100.0);
            put(&s, 2, i, 200.0);
        }
        let mut sum_two = 0.0;
        for i in POINTS + 1..=2 * POINTS {
            sum_two += i as f64 * INTERVAL;
            put(&s, 1, i, 150.0);
            put(&s, 2, i, 200.0);
        }

        let most_recent = 200.0 - 150.0;
        let rate = (200.0 - 100.0) - (200.0 - 150.0);
        let lap = POINTS as f64 * INTERVAL;
        let progress = sum_two / POINTS as f64 - sum_one / POINTS as f64;
        assert_close(
            to_catch_real_time(&s, 1, 2, lap).unwrap(),
            (most_recent / rate) * (lap / progress),
        );
    }

    #[test]
    fn real_time_stops_at_older_lead_change() {
        let s = store();
        for i in 0..(AVERAGES - 2) * POINTS {
            put(&s, 1, i, 750.0);
            put(&s, 2, i, 500.0);
        }
        let mut sum_one = 0.0;
        for i in (AVERAGES - 2) * POINTS..(AVERAGES - 1) * POINTS {
            sum_one += i as f64 * INTERVAL;
            put(&s, 1, i, 400.0);
            put(&s, 2, i, 500.0);
        }
        let mut sum_two = 0.0;
        for i in (AVERAGES - 1) * POINTS..AVERAGES * POINTS {
            sum_two += i as f64 * INTERVAL;
            put(&s, 1, i, 450.0);
            put(&s, 2, i, 500.0);
        }

        let most_recent = 500.0 - 450.0;
        let rate = (500.0 - 400.0) - (500.0 - 450.0);
        let lap = POINTS as f64 * INTERVAL * 2.0;
        let progress = sum_two / POINTS as f64 - sum_one / POINTS as f64;
        assert_close(
            to_catch_real_time(&s, 1, 2, lap).unwrap(),
            (most_recent / rate) * (lap / progress),
        );
    }

    #[test]
    fn real_time_partial_latest_group() {
        let s = store();
        let mut sum_one = 0.0;
        for i in 0..POINTS {
            sum_one += i as f64 * INTERVAL;
            put(&s, 1, i, 1000.0);
            put(&s, 2, i, 2000.0);
        }
        let mut sum_two = 0.0;
        for i in POINTS..2 * POINTS - 2 {
            sum_two += i as f64 * INTERVAL;
            put(&s, 1, i, 1500.0);
            put(&s, 2, i, 2000.0);
        }

        let most_recent = 2000.0 - 1500.0;
        let rate = (2000.0 - 1000.0) - (2000.0 - 1500.0);
        let lap = POINTS as f64 * INTERVAL * 5.0;
        let progress = sum_two / (POINTS - 2) as f64 - sum_one / POINTS as f64;
        assert_close(
            to_catch_real_time(&s, 1, 2, lap).unwrap(),
            (most_recent / rate) * (lap / progress),
        );
    }

    #[test]
    fn real_time_level_history_excluded() {
        let s = store();
        for i in 0..POINTS {
            put(&s, 1, i, 1500.0);
            put(&s, 2, i, 1500.0);
        }
        let mut sum_one = 0.0;
        for i in POINTS..2 * POINTS {
            sum_one += i as f64 * INTERVAL;
            put(&s, 1, i, 1500.0);
            put(&s, 2, i, 2500.0);
        }
        let mut sum_two = 0.0;
        for i in 2 * POINTS..3 * POINTS {
            sum_two += i as f64 * INTERVAL;
            put(&s, 1, i, 1500.0);
            put(&s, 2, i, 2000.0);
        }

        let most_recent = 2000.0 - 1500.0;
        let rate = (2500.0 - 1500.0) - (2000.0 - 1500.0);
        let lap = POINTS as f64 * INTERVAL;
        let progress = sum_two / POINTS as f64 - sum_one / POINTS as f64;
        assert_close(
            to_catch_real_time(&s, 1, 2, lap).unwrap(),
            (most_recent / rate) * (lap / progress),
        );
    }

    #[test]
    fn real_time_full_history() {
        let s = store();
        let n = AVERAGES as f64;
        let mut delta_averages = Vec::new();
        let mut distance_averages = Vec::new();
        for i in 1..=AVERAGES {
            let mut delta_sum = 0.0;
            let mut distance_sum = 0.0;
            for j in 1..=POINTS {
                let k = (i * POINTS + j) as f64;
                let t1 = k * (20.0 * n);
                let t2 = k * (2.0 * 20.0 * n) - i as f64 * 10.0;
                delta_sum += t1 - t2;
                distance_sum += k * INTERVAL;
                put(&s, 10, i * POINTS + j, t1);
                put(&s, 20, i * POINTS + j, t2);
            }
            delta_averages.push(delta_sum / POINTS as f64);
            distance_averages.push(distance_sum / POINTS as f64);
        }

        let delta_rate = mean_successive_difference(&delta_averages);
        let distance_rate = mean_successive_difference(&distance_averages);
        let lap = n / 3.0;
        let expected =
            (delta_averages[AVERAGES - 1] / delta_rate).abs() * (lap / distance_rate);
        assert_close(to_catch_real_time(&s, 10, 20, lap).unwrap(), expected);
    }

    #[test]
    fn real_time_frozen_gap_never_closes() {
        let s = store();
        for i in 0..2 * POINTS {
            put(&s, 1, i, 100.0);
            put(&s, 2, i, 300.0);
        }
        assert_eq!(to_catch_real_time(&s, 1, 2, 5000.0).unwrap(), -1.0);
    }
}
