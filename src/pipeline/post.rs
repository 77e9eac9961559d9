//! Post-correlation flagger.
//!
//! One call covers one second of visibilities for all frequencies of a
//! subband, so detection runs in the frequency direction only; drift in
//! time is the history gate's job. Baselines are flagged completely
//! independently, and if one polarization component exceeds the
//! threshold, the channel is invalidated for all of them.
//! Autocorrelations are ignored.

use tracing::{debug, info, warn};

use crate::config::{FlaggerConfig, NR_POLARIZATIONS};
use crate::detector::sir_operator_1d;
use crate::flagger::Flagger;
use crate::frame::{
    baseline_count, baseline_index, baseline_is_autocorrelation, power, CorrelatedVisibilities,
};
use crate::history::FlaggerHistory;
use crate::statistics;

pub struct PostCorrelationFlagger {
    flagger: Flagger,
    nr_baselines: usize,
    // Copied, not borrowed: the subbands this core services over time.
    subband_list: Vec<usize>,
    broken_station_detection: bool,

    // Powers for all four components stay resident: the history gate
    // needs them after the union and the SIR operator have run.
    powers: Vec<Vec<f32>>, // [pol1 · NR_POLARIZATIONS + pol2][nr_channels]
    flags: Vec<Vec<bool>>,

    history: Option<Vec<FlaggerHistory>>, // [baseline][subband-list index]

    summed_baseline_powers: Vec<f32>,
    summed_station_powers: Vec<f32>,
}

impl PostCorrelationFlagger {
    pub fn new(
        config: FlaggerConfig,
        subband_list: Vec<usize>,
        broken_station_detection: bool,
    ) -> Self {
        let nr_baselines = baseline_count(config.nr_stations);
        let nr_channels = config.nr_channels;
        let nr_stations = config.nr_stations;

        let history = config
            .use_history
            .then(|| vec![FlaggerHistory::new(); nr_baselines * subband_list.len()]);

        info!(
            detector = config.detector_kind.as_str(),
            statistics = config.stats_kind.as_str(),
            nr_baselines,
            broken_station_detection,
            "post-correlation flagger configured"
        );

        Self {
            flagger: Flagger::new(config),
            nr_baselines,
            subband_list,
            broken_station_detection,
            powers: (0..NR_POLARIZATIONS * NR_POLARIZATIONS)
                .map(|_| vec![0.0; nr_channels])
                .collect(),
            flags: (0..NR_POLARIZATIONS * NR_POLARIZATIONS)
                .map(|_| vec![false; nr_channels])
                .collect(),
            history,
            summed_baseline_powers: vec![0.0; nr_baselines],
            summed_station_powers: vec![0.0; nr_stations],
        }
    }

    /// Flag one second of correlated visibilities, invalidating polluted
    /// channels through `set_valid_samples`.
    pub fn flag(&mut self, data: &mut CorrelatedVisibilities, global_time: u32, subband: usize) {
        let nr_channels = self.flagger.config().nr_channels;
        if data.nr_baselines() != self.nr_baselines || data.nr_channels() != nr_channels {
            warn!(
                global_time,
                subband, "frame shape does not match configuration, skipping"
            );
            return;
        }

        if self.broken_station_detection {
            self.wipe_summed_powers();
        }

        for baseline in 0..self.nr_baselines {
            if baseline_is_autocorrelation(baseline) {
                continue;
            }

            self.flag_baseline(data, global_time, subband, baseline);

            if self.broken_station_detection {
                self.accumulate_baseline_powers(baseline);
            }
        }
    }

    fn flag_baseline(
        &mut self,
        data: &mut CorrelatedVisibilities,
        global_time: u32,
        subband: usize,
        baseline: usize,
    ) {
        for flags in &mut self.flags {
            flags.fill(false);
        }

        let sensitivity = self.flagger.config().base_sensitivity;
        for pol1 in 0..NR_POLARIZATIONS {
            for pol2 in 0..NR_POLARIZATIONS {
                let component = pol1 * NR_POLARIZATIONS + pol2;
                self.calculate_powers(data, baseline, pol1, pol2);

                // Flag twice, the second time with corrected statistics.
                let flagged = self.flagger.detect_1d(
                    &self.powers[component],
                    &mut self.flags[component],
                    sensitivity,
                );
                if flagged > 0 {
                    self.flagger.detect_1d(
                        &self.powers[component],
                        &mut self.flags[component],
                        sensitivity,
                    );
                }
            }
        }

        // All flags are unified into the first component.
        self.union_flags();

        // Expand the flagged windows a bit and fill in the holes.
        let mut flagged_count =
            sir_operator_1d(&mut self.flags[0], self.flagger.config().sir_eta);

        if self.flagger.config().use_history {
            self.history_flagger(global_time, subband, baseline, &mut flagged_count);
        }

        if flagged_count > 0 {
            debug!(global_time, subband, baseline, flagged_count, "baseline flagged");
            self.apply_flags(baseline, data);
        }
    }

    fn calculate_powers(
        &mut self,
        data: &CorrelatedVisibilities,
        baseline: usize,
        pol1: usize,
        pol2: usize,
    ) {
        // No correction for the number of valid samples here; the
        // correlator already corrects for that.
        let component = pol1 * NR_POLARIZATIONS + pol2;
        let nr_channels = self.flagger.config().nr_channels;
        for channel in 0..nr_channels {
            self.powers[component][channel] =
                power(data.visibility(baseline, channel, pol1, pol2));
        }
    }

    fn union_flags(&mut self) {
        let (first, rest) = self.flags.split_at_mut(1);
        for other in rest.iter() {
            for (dst, &src) in first[0].iter_mut().zip(other.iter()) {
                *dst |= src;
            }
        }
    }

    /// History gate on the mean of the winsorized means of all four
    /// polarization components.
    fn history_flagger(
        &mut self,
        global_time: u32,
        subband: usize,
        baseline: usize,
        flagged_count: &mut usize,
    ) {
        let config = self.flagger.config();
        let nr_channels = config.nr_channels;
        let sensitivity = config.history_sensitivity;

        let Some(subband_index) = self.subband_index(subband) else {
            return;
        };
        let Some(history) = self.history.as_mut() else {
            return;
        };

        let mut mean = 0.0f32;
        for component in 0..NR_POLARIZATIONS * NR_POLARIZATIONS {
            mean += statistics::winsorized_mean(&self.powers[component], &self.flags[0]);
        }
        mean /= (NR_POLARIZATIONS * NR_POLARIZATIONS * nr_channels) as f32;

        let ring = &mut history[baseline * self.subband_list.len() + subband_index];
        if ring.add_gated(mean, sensitivity) {
            debug!(global_time, subband, baseline, "history gate fired");
            for flag in self.flags[0].iter_mut() {
                if !*flag {
                    *flagged_count += 1;
                    *flag = true;
                }
            }
        }
    }

    fn subband_index(&self, subband: usize) -> Option<usize> {
        let index = self.subband_list.iter().position(|&s| s == subband);
        if index.is_none() {
            warn!(subband, "subband not in list, skipping history flagger");
        }
        index
    }

    fn apply_flags(&self, baseline: usize, data: &mut CorrelatedVisibilities) {
        let nr_channels = self.flagger.config().nr_channels;
        for channel in 0..nr_channels {
            // The union of all components lives in the first one.
            if self.flags[0][channel] {
                data.set_valid_samples(baseline, channel, 0);
            }
        }
    }

    // ========================================================================
    // Broken-station detection
    // ========================================================================

    fn wipe_summed_powers(&mut self) {
        self.summed_baseline_powers.fill(0.0);
        self.summed_station_powers.fill(0.0);
    }

    fn accumulate_baseline_powers(&mut self, baseline: usize) {
        for component in 0..NR_POLARIZATIONS * NR_POLARIZATIONS {
            for channel in 0..self.flagger.config().nr_channels {
                if !self.flags[component][channel] {
                    self.summed_baseline_powers[baseline] += self.powers[component][channel];
                }
            }
        }
    }

    /// Stations whose total cross-baseline power stands out above
    /// `mean + cutoff · σ` of all station totals. Expects `flag` to have
    /// run for the current second with broken-station detection enabled.
    pub fn detect_broken_stations(&mut self) -> Vec<usize> {
        let nr_stations = self.flagger.config().nr_stations;
        let cutoff = self.flagger.config().cutoff_threshold;

        // Sum every baseline that involves a station, from both triangles;
        // autocorrelations are not counted.
        for station in 0..nr_stations {
            let mut sum = 0.0f32;
            for other in station + 1..nr_stations {
                sum += self.summed_baseline_powers[baseline_index(station, other)];
            }
            for other in 0..station {
                sum += self.summed_baseline_powers[baseline_index(other, station)];
            }
            self.summed_station_powers[station] = sum;
        }

        let (mean, std_dev) = statistics::mean_std_dev(&self.summed_station_powers);
        let median = statistics::median_with_index(&self.summed_station_powers)
            .map_or(0.0, |(value, _)| value);
        let threshold = mean + cutoff * std_dev;
        debug!(mean, median, std_dev, threshold, "broken-station statistics");

        let mut broken = Vec::new();
        for (station, &total) in self.summed_station_powers.iter().enumerate() {
            if total > threshold {
                warn!(
                    station,
                    total_power = total,
                    threshold,
                    "station seems to be corrupted"
                );
                broken.push(station);
            }
        }
        broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MIN_HISTORY_SIZE;
    use num_complex::Complex32;

    fn config(nr_stations: usize, nr_channels: usize) -> FlaggerConfig {
        FlaggerConfig::new(nr_stations, 1, nr_channels)
    }

    /// Uniform visibilities of the given amplitude on every baseline.
    fn uniform_frame(nr_stations: usize, nr_channels: usize, amplitude: f32) -> CorrelatedVisibilities {
        let mut data = CorrelatedVisibilities::new(nr_stations, nr_channels);
        for baseline in 0..data.nr_baselines() {
            for channel in 0..nr_channels {
                for pol1 in 0..NR_POLARIZATIONS {
                    for pol2 in 0..NR_POLARIZATIONS {
                        data.set_visibility(baseline, channel, pol1, pol2, Complex32::new(amplitude, 0.0));
                    }
                }
            }
        }
        data.fill_valid_samples(768);
        data
    }

    #[test]
    fn polluted_channel_is_invalidated() {
        let mut pipeline = PostCorrelationFlagger::new(config(3, 16), vec![0], false);
        let mut data = uniform_frame(3, 16, 1.0);
        // Narrowband RFI in channel 5 of the (0, 1) cross baseline, one
        // polarization component only.
        let baseline = baseline_index(0, 1);
        data.set_visibility(baseline, 5, 1, 0, Complex32::new(100.0, 0.0));

        pipeline.flag(&mut data, 0, 0);

        assert_eq!(data.valid_samples(baseline, 5), 0, "channel 5 should be invalid");
        assert_eq!(data.valid_samples(baseline, 4), 768);
        assert_eq!(data.valid_samples(baseline, 6), 768);
        // Other baselines stay valid throughout.
        let other = baseline_index(1, 2);
        for channel in 0..16 {
            assert_eq!(data.valid_samples(other, channel), 768);
        }
    }

    #[test]
    fn autocorrelations_are_never_flagged() {
        let mut pipeline = PostCorrelationFlagger::new(config(3, 16), vec![0], false);
        let mut data = uniform_frame(3, 16, 1.0);
        // Absurd power on the (0, 0) autocorrelation.
        let auto = baseline_index(0, 0);
        for channel in 0..16 {
            for pol1 in 0..NR_POLARIZATIONS {
                for pol2 in 0..NR_POLARIZATIONS {
                    data.set_visibility(auto, channel, pol1, pol2, Complex32::new(3.0e4, 0.0));
                }
            }
        }

        pipeline.flag(&mut data, 0, 0);

        for channel in 0..16 {
            assert_eq!(
                data.valid_samples(auto, channel),
                768,
                "autocorrelation must pass through unchanged"
            );
        }
    }

    #[test]
    fn quiet_frame_keeps_all_channels_valid() {
        let mut pipeline = PostCorrelationFlagger::new(config(3, 16), vec![0], false);
        let mut data = uniform_frame(3, 16, 1.0);

        pipeline.flag(&mut data, 0, 0);

        for baseline in 0..data.nr_baselines() {
            for channel in 0..16 {
                assert_eq!(data.valid_samples(baseline, channel), 768);
            }
        }
    }

    #[test]
    fn broken_station_is_reported() {
        // 40 stations: every cross baseline involving station 0 carries
        // 100x the power, pushing its summed total past mean + 6σ.
        let nr_stations = 40;
        let mut pipeline = PostCorrelationFlagger::new(config(nr_stations, 16), vec![0], true);
        let mut data = uniform_frame(nr_stations, 16, 1.0);
        for other in 1..nr_stations {
            let baseline = baseline_index(0, other);
            for channel in 0..16 {
                for pol1 in 0..NR_POLARIZATIONS {
                    for pol2 in 0..NR_POLARIZATIONS {
                        data.set_visibility(baseline, channel, pol1, pol2, Complex32::new(10.0, 0.0));
                    }
                }
            }
        }

        pipeline.flag(&mut data, 0, 0);
        let broken = pipeline.detect_broken_stations();

        assert_eq!(broken, vec![0], "station 0 should stand out");
    }

    #[test]
    fn healthy_array_reports_no_broken_stations() {
        let mut pipeline = PostCorrelationFlagger::new(config(8, 16), vec![0], true);
        let mut data = uniform_frame(8, 16, 1.0);

        pipeline.flag(&mut data, 0, 0);
        let broken = pipeline.detect_broken_stations();

        assert!(broken.is_empty(), "uniform array should be clean, got {broken:?}");
    }

    #[test]
    fn history_gate_invalidates_a_drifted_second() {
        let mut cfg = config(2, 16);
        cfg.use_history = true;
        let mut pipeline = PostCorrelationFlagger::new(cfg, vec![7], false);

        // Warm-up seconds are quiet and stay valid.
        for second in 0..MIN_HISTORY_SIZE as u32 {
            let mut data = uniform_frame(2, 16, 1.0);
            pipeline.flag(&mut data, second, 7);
            let cross = baseline_index(0, 1);
            for channel in 0..16 {
                assert_eq!(
                    data.valid_samples(cross, channel),
                    768,
                    "gate fired during warm-up at second {second}"
                );
            }
        }

        // Ten-fold power jump across the whole band: locally flat, only
        // the history can catch it.
        let mut data = uniform_frame(2, 16, 10.0);
        pipeline.flag(&mut data, MIN_HISTORY_SIZE as u32, 7);

        let cross = baseline_index(0, 1);
        for channel in 0..16 {
            assert_eq!(data.valid_samples(cross, channel), 0, "whole band should be invalid");
        }
    }

    #[test]
    fn unknown_subband_skips_history_but_still_flags() {
        let mut cfg = config(2, 16);
        cfg.use_history = true;
        let mut pipeline = PostCorrelationFlagger::new(cfg, vec![3], false);
        let mut data = uniform_frame(2, 16, 1.0);
        let cross = baseline_index(0, 1);
        data.set_visibility(cross, 9, 0, 0, Complex32::new(100.0, 0.0));

        // Subband 5 is not in the list; the detector must still work.
        pipeline.flag(&mut data, 0, 5);

        assert_eq!(data.valid_samples(cross, 9), 0);
    }
}
