//! Statistics derived from a snapshot
//!
//! Mean, variance and standard deviation come exactly from the all-time
//! moments. Percentiles and the histogram are approximations computed over
//! the reservoir only, so report cost stays bounded however long the run.

use super::state::MomentAccumulator;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Scalar statistics; `None` means unavailable (no data yet)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub count: u64,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub std_dev: Option<f64>,
    pub p5: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
}

impl Statistics {
    pub fn compute(moments: &MomentAccumulator, reservoir: &[f64]) -> Self {
        let sorted = sorted_finite(reservoir);
        Self {
            count: moments.count,
            mean: moments.mean(),
            variance: moments.variance(),
            std_dev: moments.std_dev(),
            p5: percentile(&sorted, 0.05),
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
        }
    }
}

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted
}

/// Linear-interpolated percentile of sorted data, `q` in [0, 1].
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let w = idx - lo as f64;
    Some(sorted[lo] * (1.0 - w) + sorted[hi] * w)
}

// ============================================================================
// Histogram
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
}

/// Equal-width bins spanning min..max of the sample
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Histogram {
    pub bins: Vec<HistogramBin>,
}

impl Histogram {
    pub fn build(values: &[f64], bins: usize) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let (Some(min), Some(max)) = (
            finite.iter().copied().reduce(f64::min),
            finite.iter().copied().reduce(f64::max),
        ) else {
            return Self::default();
        };

        if bins == 0 {
            return Self::default();
        }
        if min == max {
            return Self {
                bins: vec![HistogramBin {
                    lower: min,
                    upper: max,
                    count: finite.len() as u64,
                }],
            };
        }

        // Halved so that spans near f64::MAX stay finite
        let half_span = max / 2.0 - min / 2.0;
        let edge = |i: usize| {
            let t = i as f64 / bins as f64;
            min * (1.0 - t) + max * t
        };
        let mut out: Vec<HistogramBin> = (0..bins)
            .map(|i| HistogramBin {
                lower: edge(i),
                upper: if i + 1 == bins { max } else { edge(i + 1) },
                count: 0,
            })
            .collect();

        for value in finite {
            let position = (value / 2.0 - min / 2.0) / half_span;
            // max lands in the last bin
            let idx = ((position * bins as f64) as usize).min(bins - 1);
            out[idx].count += 1;
        }

        Self { bins: out }
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().map(|b| b.count).sum()
    }
}

// ============================================================================
// Worker ranking
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerCount {
    pub worker: String,
    pub count: u64,
}

/// Per-worker counts, busiest first (ties by id).
pub fn rank_workers(counts: &HashMap<String, u64>) -> Vec<WorkerCount> {
    let mut ranking: Vec<WorkerCount> = counts
        .iter()
        .map(|(worker, count)| WorkerCount {
            worker: worker.clone(),
            count: *count,
        })
        .collect();
    ranking.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.worker.cmp(&b.worker)));
    ranking
}
