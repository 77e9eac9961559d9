//! Robust statistics on partially-flagged power series.
//!
//! Every primitive takes a parallel boolean mask; flagged entries are
//! excluded. Fully-flagged (or empty) inputs yield zero sentinels rather
//! than NaN, and the median additionally reports the "all flagged" case
//! through an `Option` so callers can skip downstream work.
//!
//! Medians use average-case linear partial selection
//! (`select_nth_unstable_by`), never a full sort.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Shape errors for callers that hand in separately-owned power and flag
/// buffers. The primitives themselves are total and only debug-assert.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("power/flag shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Mean, median and standard deviation of one detector input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SampleStats {
    pub mean: f32,
    pub median: f32,
    pub std_dev: f32,
}

/// Mean of all entries. 0 for an empty slice.
pub fn mean(powers: &[f32]) -> f32 {
    if powers.is_empty() {
        return 0.0;
    }
    powers.iter().sum::<f32>() / powers.len() as f32
}

/// Mean and population standard deviation of all entries.
pub fn mean_std_dev(powers: &[f32]) -> (f32, f32) {
    let mean = mean(powers);
    if powers.is_empty() {
        return (0.0, 0.0);
    }
    let mut sum = 0.0f32;
    for &p in powers {
        let diff = p - mean;
        sum += diff * diff;
    }
    (mean, (sum / powers.len() as f32).sqrt())
}

/// Mean of the unflagged entries. 0 when everything is flagged.
pub fn flagged_mean(powers: &[f32], flags: &[bool]) -> f32 {
    debug_assert_eq!(powers.len(), flags.len());
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for (&p, &f) in powers.iter().zip(flags) {
        if !f {
            sum += p;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    sum / count as f32
}

/// Mean and population standard deviation of the unflagged entries.
pub fn flagged_mean_std_dev(powers: &[f32], flags: &[bool]) -> (f32, f32) {
    debug_assert_eq!(powers.len(), flags.len());
    let mean = flagged_mean(powers, flags);
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for (&p, &f) in powers.iter().zip(flags) {
        if !f {
            let diff = p - mean;
            sum += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    (mean, (sum / count as f32).sqrt())
}

/// Median of all entries, with the position of (the first occurrence of)
/// the median element in `powers`. `None` for an empty slice.
pub fn median_with_index(powers: &[f32]) -> Option<(f32, usize)> {
    if powers.is_empty() {
        return None;
    }
    let mut data = powers.to_vec();
    let mid = data.len() / 2;
    data.select_nth_unstable_by(mid, f32::total_cmp);
    let median = data[mid];
    Some((median, position_of(powers, median)))
}

/// Median of the unflagged entries, with the position of (the first
/// occurrence of) the median value in the full `powers` slice.
/// `None` when everything is flagged.
pub fn flagged_median(powers: &[f32], flags: &[bool]) -> Option<(f32, usize)> {
    debug_assert_eq!(powers.len(), flags.len());
    let mut data = compact_unflagged(powers, flags);
    if data.is_empty() {
        return None;
    }
    let mid = data.len() / 2;
    data.select_nth_unstable_by(mid, f32::total_cmp);
    let median = data[mid];
    Some((median, position_of(powers, median)))
}

/// Winsorized mean of the unflagged entries: values are clamped to the
/// 10th/90th percentiles before averaging. 0 when everything is flagged.
pub fn winsorized_mean(powers: &[f32], flags: &[bool]) -> f32 {
    debug_assert_eq!(powers.len(), flags.len());
    let mut data = compact_unflagged(powers, flags);
    if data.is_empty() {
        return 0.0;
    }
    let (low, high) = winsorize_bounds(&mut data);
    let mut sum = 0.0f32;
    for &value in &data {
        sum += value.clamp(low, high);
    }
    sum / data.len() as f32
}

/// Plain mean / median / standard deviation of the unflagged entries.
pub fn normal_statistics(powers: &[f32], flags: &[bool]) -> SampleStats {
    let (mean, std_dev) = flagged_mean_std_dev(powers, flags);
    let median = flagged_median(powers, flags).map_or(0.0, |(m, _)| m);
    SampleStats { mean, median, std_dev }
}

/// Winsorized mean / median / standard deviation of the unflagged entries.
///
/// The 1.54 factor corrects the winsorized variance estimator back toward
/// the Gaussian-equivalent σ; it is an empirical constant and must not be
/// "fixed".
pub fn winsorized_statistics(powers: &[f32], flags: &[bool]) -> SampleStats {
    debug_assert_eq!(powers.len(), flags.len());
    let mut data = compact_unflagged(powers, flags);
    if data.is_empty() {
        return SampleStats::default();
    }

    let mid = data.len() / 2;
    data.select_nth_unstable_by(mid, f32::total_cmp);
    let median = data[mid];

    let (low, high) = winsorize_bounds(&mut data);

    let mut mean = 0.0f32;
    for &value in &data {
        mean += value.clamp(low, high);
    }
    mean /= data.len() as f32;

    let mut std_dev = 0.0f32;
    for &value in &data {
        let diff = value.clamp(low, high) - mean;
        std_dev += diff * diff;
    }
    std_dev = (1.54f32 * std_dev / data.len() as f32).sqrt();

    SampleStats { mean, median, std_dev }
}

/// Clamp bounds at ⌊0.1·n⌋ and ⌈0.9·n⌉−1 of the sorted data.
/// Reorders `data` in place via partial selection.
fn winsorize_bounds(data: &mut [f32]) -> (f32, f32) {
    let low_index = (0.1 * data.len() as f64).floor() as usize;
    let mut high_index = (0.9 * data.len() as f64).ceil() as usize;
    if high_index > 0 {
        high_index -= 1;
    }
    data.select_nth_unstable_by(low_index, f32::total_cmp);
    let low = data[low_index];
    data.select_nth_unstable_by(high_index, f32::total_cmp);
    let high = data[high_index];
    (low, high)
}

fn compact_unflagged(powers: &[f32], flags: &[bool]) -> Vec<f32> {
    powers
        .iter()
        .zip(flags)
        .filter(|(_, &f)| !f)
        .map(|(&p, _)| p)
        .collect()
}

/// Linear scan for the first entry equal to `value`. The selection above
/// reorders its scratch copy, so the index has to come from the original.
fn position_of(powers: &[f32], value: f32) -> usize {
    for (i, &p) in powers.iter().enumerate() {
        if p == value {
            return i;
        }
    }
    // Unreachable for values taken from `powers` itself.
    debug!("median value not found in source slice, returning index 0");
    0
}
