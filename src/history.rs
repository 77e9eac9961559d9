//! Sliding history of per-interval statistics.
//!
//! One ring per observable key, e.g. (station, subband) or (baseline,
//! subband), gathers a long-running baseline so whole seconds whose power
//! drifts upward can be gated even when nothing inside the second looks
//! anomalous.

/// Ring capacity in values (seconds, at one value per `flag` call).
pub const HISTORY_SIZE: usize = 256;

/// Warm-up length: the gate never fires before this many values are
/// collected. At least 1, at most [`HISTORY_SIZE`].
pub const MIN_HISTORY_SIZE: usize = 32;

/// Fixed-capacity ring with a running sum.
#[derive(Debug, Clone)]
pub struct FlaggerHistory {
    values: Vec<f32>,
    current: usize,
    size: usize,
    sum: f32,
}

impl Default for FlaggerHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl FlaggerHistory {
    pub fn new() -> Self {
        Self {
            values: vec![0.0; HISTORY_SIZE],
            current: 0,
            size: 0,
            sum: 0.0,
        }
    }

    /// Append a value, evicting the oldest once the ring is full.
    pub fn add(&mut self, value: f32) {
        if self.size >= HISTORY_SIZE {
            self.sum -= self.values[self.current];
        } else {
            self.size += 1;
        }
        self.sum += value;
        self.values[self.current] = value;
        self.current += 1;
        if self.current >= HISTORY_SIZE {
            self.current = 0;
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Mean of the stored values; 0 when empty.
    pub fn mean(&self) -> f32 {
        if self.size == 0 {
            return 0.0;
        }
        self.sum / self.size as f32
    }

    /// Population standard deviation of the stored values; 0 when empty.
    pub fn std_dev(&self) -> f32 {
        if self.size == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let mut sum = 0.0f32;
        for &value in &self.values[..self.size] {
            let diff = value - mean;
            sum += diff * diff;
        }
        (sum / self.size as f32).sqrt()
    }

    /// Append with anomaly gating. Returns `true` when `value` exceeds
    /// `mean + sensitivity · σ` of the history collected so far.
    ///
    /// During warm-up (fewer than [`MIN_HISTORY_SIZE`] values) the value is
    /// stored and the gate never fires. When the gate fires, the
    /// *threshold* is stored instead of the outlier so one bad second does
    /// not poison the baseline. With σ = 0 the threshold degenerates to
    /// the mean: any `value > mean` gates, and the mean is fed back.
    pub fn add_gated(&mut self, value: f32, sensitivity: f32) -> bool {
        if self.size < MIN_HISTORY_SIZE {
            self.add(value);
            return false;
        }

        let mean = self.mean();
        let std_dev = self.std_dev();
        let threshold = mean + sensitivity * std_dev;

        let gated = value > threshold;
        if gated {
            tracing::debug!(
                value,
                mean,
                std_dev,
                ratio = value / threshold,
                "history gate flagged this interval"
            );
            self.add(threshold);
        } else {
            self.add(value);
        }

        gated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_yields_zero_statistics() {
        let history = FlaggerHistory::new();
        assert_eq!(history.len(), 0);
        assert_eq!(history.mean(), 0.0);
        assert_eq!(history.std_dev(), 0.0);
    }

    #[test]
    fn running_sum_tracks_additions() {
        let mut history = FlaggerHistory::new();
        history.add(1.0);
        history.add(2.0);
        history.add(3.0);
        assert_eq!(history.len(), 3);
        assert!((history.mean() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn eviction_keeps_sum_consistent() {
        let mut history = FlaggerHistory::new();
        for _ in 0..HISTORY_SIZE {
            history.add(1.0);
        }
        assert_eq!(history.len(), HISTORY_SIZE);
        // Overwrite the whole ring with 3.0.
        for _ in 0..HISTORY_SIZE {
            history.add(3.0);
        }
        assert_eq!(history.len(), HISTORY_SIZE);
        assert!((history.mean() - 3.0).abs() < 1e-5);
    }

    #[test]
    fn gate_never_fires_during_warm_up() {
        let mut history = FlaggerHistory::new();
        for _ in 0..MIN_HISTORY_SIZE - 1 {
            assert!(!history.add_gated(1.0, 10.0));
        }
        // Even a wild outlier is accepted while warming up.
        assert!(!history.add_gated(1.0e9, 10.0));
        assert_eq!(history.len(), MIN_HISTORY_SIZE);
    }

    #[test]
    fn zero_sigma_gate_fires_on_any_increase() {
        // 32 identical values: σ = 0, threshold = mean. The 33rd value of
        // 2.0 exceeds the mean of 1.0 and gates; the mean is stored back.
        let mut history = FlaggerHistory::new();
        for _ in 0..MIN_HISTORY_SIZE {
            history.add(1.0);
        }
        assert!(history.add_gated(2.0, 10.0));
        assert!((history.mean() - 1.0).abs() < 1e-6, "threshold, not outlier, is stored");
    }

    #[test]
    fn gate_stores_threshold_not_outlier() {
        let mut history = FlaggerHistory::new();
        for i in 0..MIN_HISTORY_SIZE {
            history.add(if i % 2 == 0 { 0.9 } else { 1.1 });
        }
        let mean_before = history.mean();
        let threshold = mean_before + 10.0 * history.std_dev();

        assert!(history.add_gated(1.0e6, 10.0));
        assert!(
            history.mean() <= threshold,
            "baseline must not be poisoned by the outlier"
        );
    }

    #[test]
    fn in_band_values_pass_the_gate() {
        let mut history = FlaggerHistory::new();
        for i in 0..MIN_HISTORY_SIZE {
            history.add(if i % 2 == 0 { 0.9 } else { 1.1 });
        }
        assert!(!history.add_gated(1.05, 10.0));
    }
}
