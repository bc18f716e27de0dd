//! Value-change deduplication for dense telemetry series
//!
//! Position feeds sample every car several times a second whether or not
//! anything changed; on a full race that is an order of magnitude more
//! data than the state it encodes. A sample is kept only if at least one
//! tracked field differs from the last kept sample for the same driver.
//!
//! Single pass, O(n), state is one retained sample per driver.

use crate::types::TelemetrySample;
use std::collections::HashMap;

/// Collapse redundant samples per driver.
///
/// The first sample for each driver is always retained; after that a
/// sample survives iff its values differ (exact comparison) from the last
/// retained sample for that driver. Input is expected in per-driver
/// timestamp order; relative order of retained samples is preserved.
///
/// Idempotent: running the output through again changes nothing.
pub fn dedupe(series: Vec<TelemetrySample>) -> Vec<TelemetrySample> {
    let mut last_kept: HashMap<u32, TelemetrySample> = HashMap::new();
    let mut out = Vec::with_capacity(series.len());

    for sample in series {
        let keep = match last_kept.get(&sample.driver_number) {
            Some(prev) => prev.values != sample.values,
            None => true,
        };

        if keep {
            last_kept.insert(sample.driver_number, sample.clone());
            out.push(sample);
        }
    }

    out
}

/// Reduction ratio achieved by a dedup pass, for logging.
pub fn reduction_pct(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    100.0 * (before - after) as f64 / before as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleValues;

    fn pos(driver: u32, ts: i64, x: f64, y: f64, z: f64) -> TelemetrySample {
        TelemetrySample {
            driver_number: driver,
            timestamp_ms: ts,
            values: SampleValues::Position { x, y, z },
        }
    }

    #[test]
    fn test_first_sample_per_driver_retained() {
        let series = vec![pos(44, 0, 1.0, 1.0, 0.0), pos(1, 10, 5.0, 5.0, 0.0)];
        let deduped = dedupe(series.clone());
        assert_eq!(deduped, series);
    }

    #[test]
    fn test_identical_consecutive_samples_dropped() {
        let series = vec![
            pos(44, 0, 1.0, 1.0, 0.0),
            pos(44, 100, 1.0, 1.0, 0.0), // identical, dropped
            pos(44, 200, 1.0, 1.0, 0.0), // still identical, dropped
            pos(44, 300, 2.0, 1.0, 0.0), // x changed, kept
        ];

        let deduped = dedupe(series);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].timestamp_ms, 0);
        assert_eq!(deduped[1].timestamp_ms, 300);
    }

    #[test]
    fn test_single_field_change_is_enough() {
        let series = vec![pos(44, 0, 1.0, 1.0, 3.0), pos(44, 100, 1.0, 1.0, 3.1)];
        assert_eq!(dedupe(series).len(), 2);
    }

    #[test]
    fn test_per_driver_state_is_independent() {
        // Interleaved drivers with identical coordinates must not
        // suppress each other
        let series = vec![
            pos(44, 0, 1.0, 1.0, 0.0),
            pos(1, 0, 1.0, 1.0, 0.0),
            pos(44, 100, 1.0, 1.0, 0.0), // dup of 44's last
            pos(1, 100, 2.0, 1.0, 0.0),  // changed
        ];

        let deduped = dedupe(series);
        assert_eq!(deduped.len(), 3);
        assert!(deduped.iter().filter(|s| s.driver_number == 44).count() == 1);
        assert!(deduped.iter().filter(|s| s.driver_number == 1).count() == 2);
    }

    #[test]
    fn test_adjacency_invariant() {
        // For all adjacent retained samples of the same driver, at least
        // one field differs
        let mut series = Vec::new();
        for i in 0..1000 {
            // Long identical runs with occasional movement
            let x = (i / 97) as f64;
            series.push(pos(44, i * 50, x, 0.0, 0.0));
        }

        let deduped = dedupe(series);
        for pair in deduped.windows(2) {
            if pair[0].driver_number == pair[1].driver_number {
                assert_ne!(pair[0].values, pair[1].values);
            }
        }
    }

    #[test]
    fn test_idempotence() {
        let mut series = Vec::new();
        for i in 0..500 {
            let x = (i / 13) as f64;
            series.push(pos(44, i * 20, x, x * 2.0, 0.0));
            series.push(pos(16, i * 20, -x, 0.0, 0.0));
        }

        let once = dedupe(series);
        let twice = dedupe(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_reduction_on_dense_feed() {
        // A stationary car sampled at 10Hz for 100s reduces ~99%
        let series: Vec<_> = (0..1000).map(|i| pos(44, i * 100, 4.0, 2.0, 0.0)).collect();
        let deduped = dedupe(series);
        assert_eq!(deduped.len(), 1);
        assert!(reduction_pct(1000, deduped.len()) > 90.0);
    }

    #[test]
    fn test_empty_series() {
        assert!(dedupe(Vec::new()).is_empty());
        assert_eq!(reduction_pct(0, 0), 0.0);
    }
}
