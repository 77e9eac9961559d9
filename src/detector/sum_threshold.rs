//! SumThreshold window passes.
//!
//! A run of length `w` is declared polluted when its sum exceeds
//! `w · T(w)`, with the per-window threshold shrinking as the window
//! grows. Samples flagged by an earlier iteration contribute the current
//! threshold instead of their own power, so one strong outlier cannot
//! dominate later, wider windows. That substitution is the definition of
//! the method, not an optimisation.

use crate::grid::Grid2D;

/// Per-window threshold `T(w) = T1 · ρ^(log2 w) / w`.
///
/// A non-positive ρ selects the 1.5 default.
pub fn threshold_for_window(threshold1: f32, window: usize, rho: f32) -> f32 {
    let p = if rho <= 0.0 { 1.5f32 } else { rho };
    threshold1 * p.powf((window as f32).log2()) / window as f32
}

/// One 1-D pass with a sliding window of `window` samples.
///
/// Returns the number of newly flagged samples. The scan starts at index 1
/// and the last window stops short of the final sample; this asymmetry is
/// kept for compatibility with archived data products.
pub fn sum_threshold_1d(
    powers: &[f32],
    flags: &mut [bool],
    window: usize,
    threshold: f32,
) -> usize {
    debug_assert_eq!(powers.len(), flags.len());
    let mut extra_flagged = 0;

    let mut base = 1;
    while base + window < powers.len() {
        let mut sum = 0.0f32;
        for pos in base..base + window {
            if flags[pos] {
                sum += threshold;
            } else {
                sum += powers[pos];
            }
        }

        if sum >= window as f32 * threshold {
            for pos in base..base + window {
                if !flags[pos] {
                    extra_flagged += 1;
                    flags[pos] = true;
                }
            }
        }
        base += 1;
    }

    extra_flagged
}

/// One horizontal (time-direction) pass over every channel row but the
/// first. Returns the number of newly flagged cells.
pub fn sum_threshold_2d_horizontal(
    powers: &Grid2D<f32>,
    flags: &mut Grid2D<bool>,
    window: usize,
    threshold: f32,
) -> usize {
    debug_assert_eq!(powers.rows(), flags.rows());
    debug_assert_eq!(powers.cols(), flags.cols());
    let mut extra_flagged = 0;

    for channel in 1..powers.rows() {
        let mut base = 0;
        while base + window < powers.cols() {
            let mut sum = 0.0f32;
            for time in base..base + window {
                if flags.get(channel, time) {
                    sum += threshold;
                } else {
                    sum += powers.get(channel, time);
                }
            }

            if sum >= window as f32 * threshold {
                for time in base..base + window {
                    if !flags.get(channel, time) {
                        extra_flagged += 1;
                        flags.set(channel, time, true);
                    }
                }
            }
            base += 1;
        }
    }

    extra_flagged
}

/// One vertical (frequency-direction) pass over every time column, with
/// channel windows starting at channel 1. Returns the number of newly
/// flagged cells.
pub fn sum_threshold_2d_vertical(
    powers: &Grid2D<f32>,
    flags: &mut Grid2D<bool>,
    window: usize,
    threshold: f32,
) -> usize {
    debug_assert_eq!(powers.rows(), flags.rows());
    debug_assert_eq!(powers.cols(), flags.cols());
    let mut extra_flagged = 0;

    for time in 0..powers.cols() {
        let mut base = 1;
        while base + window < powers.rows() {
            let mut sum = 0.0f32;
            for channel in base..base + window {
                if flags.get(channel, time) {
                    sum += threshold;
                } else {
                    sum += powers.get(channel, time);
                }
            }

            if sum >= window as f32 * threshold {
                for channel in base..base + window {
                    if !flags.get(channel, time) {
                        extra_flagged += 1;
                        flags.set(channel, time, true);
                    }
                }
            }
            base += 1;
        }
    }

    extra_flagged
}
