//! Simple single-pass thresholding against a precomputed cutoff.

use crate::grid::Grid2D;

/// Flag every sample above `threshold`. Returns the number of newly
/// flagged samples.
pub fn threshold_1d(powers: &[f32], flags: &mut [bool], threshold: f32) -> usize {
    debug_assert_eq!(powers.len(), flags.len());
    let mut extra_flagged = 0;

    for (i, &power) in powers.iter().enumerate() {
        if power > threshold && !flags[i] {
            extra_flagged += 1;
            flags[i] = true;
        }
    }

    extra_flagged
}

/// 2-D variant; channel 0 is skipped, matching the windowed detector.
pub fn threshold_2d(powers: &Grid2D<f32>, flags: &mut Grid2D<bool>, threshold: f32) -> usize {
    debug_assert_eq!(powers.rows(), flags.rows());
    debug_assert_eq!(powers.cols(), flags.cols());
    let mut extra_flagged = 0;

    for channel in 1..powers.rows() {
        for time in 0..powers.cols() {
            if powers.get(channel, time) > threshold && !flags.get(channel, time) {
                extra_flagged += 1;
                flags.set(channel, time, true);
            }
        }
    }

    extra_flagged
}
