//! Correlated visibilities and the triangular baseline index mapping.

use num_complex::Complex32;

use crate::config::NR_POLARIZATIONS;

/// Baseline index of the station pair (station1, station2), station1 ≤
/// station2. The correlator orders baselines as the lower triangle of the
/// station matrix: b = s2·(s2+1)/2 + s1.
#[inline]
pub fn baseline_index(station1: usize, station2: usize) -> usize {
    debug_assert!(station1 <= station2);
    station2 * (station2 + 1) / 2 + station1
}

/// Inverse of [`baseline_index`].
pub fn baseline_stations(baseline: usize) -> (usize, usize) {
    // Row from the triangular number just below `baseline`, then fix up
    // any float rounding.
    let mut station2 = ((((8 * baseline + 1) as f64).sqrt() - 1.0) / 2.0) as usize;
    while baseline_index(0, station2 + 1) <= baseline {
        station2 += 1;
    }
    while baseline_index(0, station2) > baseline {
        station2 -= 1;
    }
    let station1 = baseline - baseline_index(0, station2);
    (station1, station2)
}

/// Whether both station indices of this baseline coincide.
pub fn baseline_is_autocorrelation(baseline: usize) -> bool {
    let (station1, station2) = baseline_stations(baseline);
    station1 == station2
}

/// Number of baselines for `nr_stations`, autocorrelations included.
#[inline]
pub fn baseline_count(nr_stations: usize) -> usize {
    nr_stations * (nr_stations + 1) / 2
}

/// One second of correlated data: complex visibilities indexed
/// [baseline][channel][pol1][pol2], plus a valid-sample count per
/// (baseline, channel) that the flagger zeroes to invalidate a channel.
#[derive(Debug, Clone)]
pub struct CorrelatedVisibilities {
    nr_baselines: usize,
    nr_channels: usize,
    visibilities: Vec<Complex32>,
    valid_samples: Vec<u32>,
}

impl CorrelatedVisibilities {
    pub fn new(nr_stations: usize, nr_channels: usize) -> Self {
        let nr_baselines = baseline_count(nr_stations);
        Self {
            nr_baselines,
            nr_channels,
            visibilities: vec![
                Complex32::new(0.0, 0.0);
                nr_baselines * nr_channels * NR_POLARIZATIONS * NR_POLARIZATIONS
            ],
            valid_samples: vec![0; nr_baselines * nr_channels],
        }
    }

    pub fn nr_baselines(&self) -> usize {
        self.nr_baselines
    }

    pub fn nr_channels(&self) -> usize {
        self.nr_channels
    }

    #[inline]
    fn visibility_index(&self, baseline: usize, channel: usize, pol1: usize, pol2: usize) -> usize {
        debug_assert!(baseline < self.nr_baselines);
        debug_assert!(channel < self.nr_channels);
        debug_assert!(pol1 < NR_POLARIZATIONS && pol2 < NR_POLARIZATIONS);
        ((baseline * self.nr_channels + channel) * NR_POLARIZATIONS + pol1) * NR_POLARIZATIONS
            + pol2
    }

    #[inline]
    pub fn visibility(&self, baseline: usize, channel: usize, pol1: usize, pol2: usize) -> Complex32 {
        self.visibilities[self.visibility_index(baseline, channel, pol1, pol2)]
    }

    pub fn set_visibility(
        &mut self,
        baseline: usize,
        channel: usize,
        pol1: usize,
        pol2: usize,
        value: Complex32,
    ) {
        let index = self.visibility_index(baseline, channel, pol1, pol2);
        self.visibilities[index] = value;
    }

    pub fn valid_samples(&self, baseline: usize, channel: usize) -> u32 {
        self.valid_samples[baseline * self.nr_channels + channel]
    }

    /// Passing 0 marks the channel of this baseline invalid downstream.
    pub fn set_valid_samples(&mut self, baseline: usize, channel: usize, n: u32) {
        self.valid_samples[baseline * self.nr_channels + channel] = n;
    }

    /// Reset every valid-sample count, typically to the integration length
    /// before a new second is correlated.
    pub fn fill_valid_samples(&mut self, n: u32) {
        self.valid_samples.fill(n);
    }
}
