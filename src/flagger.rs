//! Flagger façade: dispatches the configured statistics and detector
//! kinds, and provides the higher-level combinators the pipelines stitch
//! together (smoothed flagging, history-gated flagging, 1-D → 2-D flag
//! broadcasting).
//!
//! Every flagging method returns the number of *additional* samples it
//! flagged; the SIR operator is the one exception (total count).

use crate::config::{DetectorKind, FlaggerConfig, StatsKind};
use crate::convolution::gaussian_convolve_1d;
use crate::detector::{
    sum_threshold_1d, sum_threshold_2d_horizontal, sum_threshold_2d_vertical, threshold_1d,
    threshold_2d, threshold_for_window,
};
use crate::grid::Grid2D;
use crate::history::FlaggerHistory;
use crate::statistics::{self, SampleStats, StatsError};

/// Smoothing σ of the Gaussian pass inside the smoothed combinator.
const SMOOTHING_SIGMA: f32 = 0.5;

/// Stateless numeric engine around an immutable [`FlaggerConfig`].
#[derive(Debug, Clone)]
pub struct Flagger {
    config: FlaggerConfig,
}

impl Flagger {
    pub fn new(config: FlaggerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FlaggerConfig {
        &self.config
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Statistics of the unflagged samples, using the configured kind.
    pub fn calculate_statistics(&self, powers: &[f32], flags: &[bool]) -> SampleStats {
        match self.config.stats_kind {
            StatsKind::Normal => statistics::normal_statistics(powers, flags),
            StatsKind::Winsorized => statistics::winsorized_statistics(powers, flags),
        }
    }

    /// Shape-checked entry point for callers handing in separately-owned
    /// buffers.
    pub fn checked_statistics(
        &self,
        powers: &[f32],
        flags: &[bool],
    ) -> Result<SampleStats, StatsError> {
        if powers.len() != flags.len() {
            return Err(StatsError::ShapeMismatch {
                expected: powers.len(),
                got: flags.len(),
            });
        }
        Ok(self.calculate_statistics(powers, flags))
    }

    /// 2-D statistics run directly on the contiguous grid storage.
    pub fn calculate_statistics_2d(
        &self,
        powers: &Grid2D<f32>,
        flags: &Grid2D<bool>,
    ) -> SampleStats {
        self.calculate_statistics(powers.as_slice(), flags.as_slice())
    }

    // ========================================================================
    // Detectors
    // ========================================================================

    /// Single-pass median + k·σ thresholding.
    pub fn threshold_flagger_1d(&self, powers: &[f32], flags: &mut [bool]) -> usize {
        let stats = self.calculate_statistics(powers, flags);
        let threshold = stats.median + self.config.cutoff_threshold * stats.std_dev;
        threshold_1d(powers, flags, threshold)
    }

    /// 2-D single-pass thresholding.
    pub fn threshold_flagger_2d(&self, powers: &Grid2D<f32>, flags: &mut Grid2D<bool>) -> usize {
        let stats = self.calculate_statistics_2d(powers, flags);
        let threshold = stats.median + self.config.cutoff_threshold * stats.std_dev;
        threshold_2d(powers, flags, threshold)
    }

    /// Iterative SumThreshold with doubling windows.
    ///
    /// Statistics are computed once up front; with σ = 0 the sensitivity
    /// alone scales the per-window threshold.
    pub fn sum_threshold_flagger_1d(
        &self,
        powers: &[f32],
        flags: &mut [bool],
        sensitivity: f32,
    ) -> usize {
        let stats = self.calculate_statistics(powers, flags);
        let factor = if stats.std_dev == 0.0 {
            sensitivity
        } else {
            stats.std_dev * sensitivity
        };

        let mut extra_flagged = 0;
        let mut window = 1;
        for _ in 0..self.config.max_iters {
            let threshold = stats.median
                + threshold_for_window(self.config.cutoff_threshold, window, 1.5) * factor;
            extra_flagged += sum_threshold_1d(powers, flags, window, threshold);
            window *= 2;
        }

        extra_flagged
    }

    /// 2-D SumThreshold: both axes are scanned per iteration before the
    /// window doubles.
    pub fn sum_threshold_flagger_2d(
        &self,
        powers: &Grid2D<f32>,
        flags: &mut Grid2D<bool>,
        sensitivity: f32,
    ) -> usize {
        let stats = self.calculate_statistics_2d(powers, flags);
        let factor = if stats.std_dev == 0.0 {
            sensitivity
        } else {
            stats.std_dev * sensitivity
        };

        let mut extra_flagged = 0;
        let mut window = 1;
        for _ in 0..self.config.max_iters {
            let threshold = stats.median
                + threshold_for_window(self.config.cutoff_threshold, window, 1.5) * factor;
            extra_flagged += sum_threshold_2d_horizontal(powers, flags, window, threshold);
            extra_flagged += sum_threshold_2d_vertical(powers, flags, window, threshold);
            window *= 2;
        }

        extra_flagged
    }

    /// Dispatch on the configured detector kind, 1-D.
    pub fn detect_1d(&self, powers: &[f32], flags: &mut [bool], sensitivity: f32) -> usize {
        match self.config.detector_kind {
            DetectorKind::Threshold => self.threshold_flagger_1d(powers, flags),
            DetectorKind::SumThreshold => self.sum_threshold_flagger_1d(powers, flags, sensitivity),
        }
    }

    /// Dispatch on the configured detector kind, 2-D.
    pub fn detect_2d(
        &self,
        powers: &Grid2D<f32>,
        flags: &mut Grid2D<bool>,
        sensitivity: f32,
    ) -> usize {
        match self.config.detector_kind {
            DetectorKind::Threshold => self.threshold_flagger_2d(powers, flags),
            DetectorKind::SumThreshold => self.sum_threshold_flagger_2d(powers, flags, sensitivity),
        }
    }

    // ========================================================================
    // Combinators
    // ========================================================================

    /// SumThreshold on the raw powers, then on the difference with a
    /// Gaussian-smoothed copy, then a more sensitive final pass.
    ///
    /// `smoothed` and `diffs` are caller-owned scratch of the same length
    /// as `powers`.
    pub fn sum_threshold_flagger_1d_smoothed(
        &self,
        powers: &[f32],
        smoothed: &mut [f32],
        diffs: &mut [f32],
        flags: &mut [bool],
        sensitivity: f32,
    ) -> usize {
        let mut extra_flagged = 0;

        // Insensitive first pass.
        extra_flagged += self.sum_threshold_flagger_1d(powers, flags, 1.0 * sensitivity);

        gaussian_convolve_1d(powers, smoothed, SMOOTHING_SIGMA);
        for i in 0..powers.len() {
            diffs[i] = powers[i] - smoothed[i];
        }

        // Flag on the deviation from the smooth background.
        extra_flagged += self.sum_threshold_flagger_1d(diffs, flags, 1.0 * sensitivity);

        // One final, more sensitive pass on the raw powers.
        extra_flagged += self.sum_threshold_flagger_1d(powers, flags, 0.8 * sensitivity);

        extra_flagged
    }

    /// Two SumThreshold passes (the second with statistics corrected by the
    /// first), then a history gate on the resulting median. A fired gate
    /// flags the whole series.
    pub fn sum_threshold_flagger_1d_with_history(
        &self,
        powers: &[f32],
        flags: &mut [bool],
        sensitivity: f32,
        history: &mut FlaggerHistory,
    ) -> usize {
        let mut extra_flagged = 0;

        extra_flagged += self.sum_threshold_flagger_1d(powers, flags, sensitivity);
        extra_flagged += self.sum_threshold_flagger_1d(powers, flags, sensitivity);

        let stats = self.calculate_statistics(powers, flags);
        if history.add_gated(stats.median, self.config.history_sensitivity) {
            for flag in flags.iter_mut() {
                if !*flag {
                    extra_flagged += 1;
                    *flag = true;
                }
            }
        }

        extra_flagged
    }

    /// Smoothed flagging followed by the same history gate.
    pub fn sum_threshold_flagger_1d_smoothed_with_history(
        &self,
        powers: &[f32],
        smoothed: &mut [f32],
        diffs: &mut [f32],
        flags: &mut [bool],
        history: &mut FlaggerHistory,
        sensitivity: f32,
    ) -> usize {
        let mut extra_flagged =
            self.sum_threshold_flagger_1d_smoothed(powers, smoothed, diffs, flags, sensitivity);

        let stats = self.calculate_statistics(powers, flags);
        if history.add_gated(stats.median, self.config.history_sensitivity) {
            for flag in flags.iter_mut() {
                if !*flag {
                    extra_flagged += 1;
                    *flag = true;
                }
            }
        }

        extra_flagged
    }

    /// 2-D SumThreshold, then a 1-D pass on the fully time-integrated
    /// powers for maximal signal to noise, broadcast of the integrated
    /// flags back to 2-D, and a history gate on the integrated median.
    ///
    /// `integrated_powers` holds one fully integrated power per channel.
    pub fn sum_threshold_flagger_2d_with_history(
        &self,
        powers: &Grid2D<f32>,
        flags: &mut Grid2D<bool>,
        integrated_powers: &[f32],
        sensitivity: f32,
        history: &mut FlaggerHistory,
    ) -> usize {
        debug_assert_eq!(integrated_powers.len(), flags.rows());
        let flags_count_start = flags.count_set();

        self.sum_threshold_flagger_2d(powers, flags, sensitivity);

        // A channel is integrated-flagged when any of its blocks is.
        let mut integrated_flags = vec![false; flags.rows()];
        for channel in 0..flags.rows() {
            integrated_flags[channel] = flags.row(channel).iter().any(|&f| f);
        }

        self.sum_threshold_flagger_1d(integrated_powers, &mut integrated_flags, sensitivity);

        Self::apply_integrated_flags(flags, &integrated_flags);

        let stats = self.calculate_statistics(integrated_powers, &integrated_flags);
        if history.add_gated(stats.median, self.config.history_sensitivity) {
            flags.fill(true);
        }

        flags.count_set() - flags_count_start
    }

    /// Broadcast integrated (per-channel) flags over every time block.
    pub fn apply_integrated_flags(flags: &mut Grid2D<bool>, integrated_flags: &[bool]) {
        debug_assert_eq!(integrated_flags.len(), flags.rows());
        for (channel, &set) in integrated_flags.iter().enumerate() {
            if set {
                flags.row_mut(channel).fill(true);
            }
        }
    }

    /// Gated history append using the configured sensitivity.
    pub fn add_to_history(&self, value: f32, history: &mut FlaggerHistory) -> bool {
        history.add_gated(value, self.config.history_sensitivity)
    }

    /// Number of set flags.
    pub fn count_flagged(flags: &[bool]) -> usize {
        flags.iter().filter(|&&f| f).count()
    }
}
