//! Filtered voltage frames and the sparse per-(channel, station) time
//! flag sets that travel with them.

use num_complex::Complex32;

use crate::config::NR_POLARIZATIONS;

/// Sparse set of flagged time indices, stored as sorted disjoint
/// half-open ranges. Insertions merge adjacent and overlapping ranges, so
/// membership tests stay logarithmic even when most of a second is
/// flagged.
#[derive(Debug, Clone, Default)]
pub struct SparseTimeSet {
    ranges: Vec<(usize, usize)>,
}

impl SparseTimeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether time index `t` is flagged.
    pub fn test(&self, t: usize) -> bool {
        match self.ranges.binary_search_by(|&(lo, _)| lo.cmp(&t)) {
            Ok(_) => true,
            Err(0) => false,
            Err(i) => t < self.ranges[i - 1].1,
        }
    }

    /// Flag a single time index.
    pub fn include(&mut self, t: usize) {
        self.include_range(t, t + 1);
    }

    /// Flag the half-open range `[lo, hi)`.
    pub fn include_range(&mut self, lo: usize, hi: usize) {
        if lo >= hi {
            return;
        }

        let mut new_lo = lo;
        let mut new_hi = hi;

        // Find the span of existing ranges that touch [lo, hi) and merge.
        let start = self
            .ranges
            .partition_point(|&(_, existing_hi)| existing_hi < new_lo);
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].0 <= new_hi {
            new_lo = new_lo.min(self.ranges[end].0);
            new_hi = new_hi.max(self.ranges[end].1);
            end += 1;
        }

        self.ranges.splice(start..end, [(new_lo, new_hi)]);
    }

    /// The merged ranges, in ascending order.
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// Total number of flagged indices.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(|&(lo, hi)| hi - lo).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// One second of filtered voltages: complex samples indexed
/// [channel][station][time][pol], plus one [`SparseTimeSet`] per
/// (channel, station).
#[derive(Debug, Clone)]
pub struct FilteredVoltages {
    nr_channels: usize,
    nr_stations: usize,
    nr_samples: usize,
    samples: Vec<Complex32>,
    flags: Vec<SparseTimeSet>,
}

impl FilteredVoltages {
    pub fn new(nr_channels: usize, nr_stations: usize, nr_samples: usize) -> Self {
        Self {
            nr_channels,
            nr_stations,
            nr_samples,
            samples: vec![Complex32::new(0.0, 0.0); nr_channels * nr_stations * nr_samples * NR_POLARIZATIONS],
            flags: vec![SparseTimeSet::new(); nr_channels * nr_stations],
        }
    }

    pub fn nr_channels(&self) -> usize {
        self.nr_channels
    }

    pub fn nr_stations(&self) -> usize {
        self.nr_stations
    }

    pub fn nr_samples(&self) -> usize {
        self.nr_samples
    }

    #[inline]
    fn sample_index(&self, channel: usize, station: usize, time: usize, pol: usize) -> usize {
        debug_assert!(channel < self.nr_channels);
        debug_assert!(station < self.nr_stations);
        debug_assert!(time < self.nr_samples);
        debug_assert!(pol < NR_POLARIZATIONS);
        ((channel * self.nr_stations + station) * self.nr_samples + time) * NR_POLARIZATIONS + pol
    }

    #[inline]
    pub fn sample(&self, channel: usize, station: usize, time: usize, pol: usize) -> Complex32 {
        self.samples[self.sample_index(channel, station, time, pol)]
    }

    #[inline]
    pub fn set_sample(
        &mut self,
        channel: usize,
        station: usize,
        time: usize,
        pol: usize,
        value: Complex32,
    ) {
        let index = self.sample_index(channel, station, time, pol);
        self.samples[index] = value;
    }

    /// Flag set of one (channel, station) pair.
    pub fn flags(&self, channel: usize, station: usize) -> &SparseTimeSet {
        &self.flags[channel * self.nr_stations + station]
    }

    pub fn flags_mut(&mut self, channel: usize, station: usize) -> &mut SparseTimeSet {
        &mut self.flags[channel * self.nr_stations + station]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_set_single_includes() {
        let mut set = SparseTimeSet::new();
        assert!(!set.test(3));
        set.include(3);
        assert!(set.test(3));
        assert!(!set.test(2));
        assert!(!set.test(4));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn sparse_set_merges_adjacent_ranges() {
        let mut set = SparseTimeSet::new();
        set.include_range(0, 4);
        set.include_range(4, 8);
        assert_eq!(set.ranges(), &[(0, 8)]);
        assert_eq!(set.count(), 8);
    }

    #[test]
    fn sparse_set_merges_overlapping_ranges() {
        let mut set = SparseTimeSet::new();
        set.include_range(10, 20);
        set.include_range(0, 5);
        set.include_range(3, 12);
        assert_eq!(set.ranges(), &[(0, 20)]);
        assert!(set.test(0));
        assert!(set.test(19));
        assert!(!set.test(20));
    }

    #[test]
    fn sparse_set_keeps_disjoint_ranges_separate() {
        let mut set = SparseTimeSet::new();
        set.include_range(0, 2);
        set.include_range(6, 8);
        assert_eq!(set.ranges(), &[(0, 2), (6, 8)]);
        assert!(!set.test(4));
        assert_eq!(set.count(), 4);
    }

    #[test]
    fn empty_range_is_ignored() {
        let mut set = SparseTimeSet::new();
        set.include_range(5, 5);
        assert!(set.is_empty());
    }

    #[test]
    fn voltages_are_indexed_per_channel_station_time_pol() {
        let mut voltages = FilteredVoltages::new(2, 3, 4);
        voltages.set_sample(1, 2, 3, 1, Complex32::new(1.5, -2.5));
        assert_eq!(voltages.sample(1, 2, 3, 1), Complex32::new(1.5, -2.5));
        assert_eq!(voltages.sample(1, 2, 3, 0), Complex32::new(0.0, 0.0));
        assert_eq!(voltages.sample(0, 0, 0, 0), Complex32::new(0.0, 0.0));
    }

    #[test]
    fn flag_sets_are_per_channel_station() {
        let mut voltages = FilteredVoltages::new(2, 2, 16);
        voltages.flags_mut(0, 1).include_range(4, 8);
        assert!(voltages.flags(0, 1).test(5));
        assert!(!voltages.flags(0, 0).test(5));
        assert!(!voltages.flags(1, 1).test(5));
    }
}
