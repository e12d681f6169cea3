//! Latency statistics over a window snapshot.

use std::cmp::Ordering;

use flowwatch_types::LatencyStats;

/// A latency sample tagged with its arrival sequence number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub latency_ms: f64,
    pub seq: u64,
}

/// Sort ascending by latency, ties by arrival order.
pub fn sort_samples(samples: &mut [Sample]) {
    samples.sort_by(|a, b| {
        a.latency_ms
            .total_cmp(&b.latency_ms)
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

/// Nearest-rank percentile over ascending-sorted samples.
///
/// `permille` is the percentile times ten (950 for p95) so the rank is
/// computed in integers: `ceil(p * n)`, clamped to `1..=n`.
pub fn nearest_rank(sorted: &[Sample], permille: u64) -> Option<f64> {
    let n = sorted.len() as u64;
    if n == 0 {
        return None;
    }
    let rank = ((permille * n + 999) / 1000).clamp(1, n);
    sorted.get((rank - 1) as usize).map(|s| s.latency_ms)
}

/// Compute summary statistics; `None` when there are no samples.
pub fn summarize(samples: &mut [Sample]) -> Option<LatencyStats> {
    if samples.is_empty() {
        return None;
    }
    sort_samples(samples);

    let count = samples.len();
    let sum: f64 = samples.iter().map(|s| s.latency_ms).sum();
    let first = samples.first()?.latency_ms;
    let last = samples.last()?.latency_ms;

    Some(LatencyStats {
        count: count as u64,
        mean_ms: sum / count as f64,
        min_ms: first,
        p50_ms: nearest_rank(samples, 500)?,
        p95_ms: nearest_rank(samples, 950)?,
        p99_ms: nearest_rank(samples, 990)?,
        max_ms: last,
    })
}

/// Descending comparison on a float key with a stable tiebreak.
pub(crate) fn desc_then<T: Ord>(a: (f64, T), b: (f64, T)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1))
}
