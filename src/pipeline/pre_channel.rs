//! Pre-correlation flagger for multi-channel filtered voltages.
//!
//! Frequency flagging runs first and zeroes the samples it rejects, so
//! the time-direction integration that follows is not corrupted by
//! already-known RFI. Flags are only copied back into the frame's sparse
//! sets at the end of each station, for the same reason: a channel marked
//! early would wipe the whole time integration for that channel.
//!
//! The externally flagged samples (dropped network packets and the like)
//! are never copied into the local flag grids: those flags are exact, and
//! widening them with the detector's dilation would only lose data. They
//! are skipped during integration instead.

use tracing::{debug, info, warn};

use crate::config::{FlaggerConfig, MINIMUM_CHANNELS_FOR_FULL_INTEGRATION, NR_POLARIZATIONS};
use crate::flagger::Flagger;
use crate::frame::{power, FilteredVoltages};
use crate::grid::Grid2D;
use crate::history::FlaggerHistory;
use crate::pipeline::PipelineError;
use crate::statistics;

use num_complex::Complex32;

pub struct PreCorrelationFlagger {
    flagger: Flagger,
    nr_samples_per_integration: usize,
    integration_factor: usize,
    nr_blocks: usize,

    // Scratch, reinitialised per station.
    integrated_powers_frequency: Vec<Grid2D<f32>>, // [pol], each [channel][block]
    integrated_flags_frequency: Vec<Grid2D<bool>>,
    integrated_powers_time: Vec<Vec<f32>>, // [pol][nr_samples_per_integration]
    integrated_flags_time: Vec<Vec<bool>>,

    // One ring per (station, subband) and per (station, subband, channel).
    history_time: Option<Vec<FlaggerHistory>>,
    history_frequency: Option<Vec<FlaggerHistory>>,
}

impl PreCorrelationFlagger {
    /// `integration_factor` of `None` (or an explicit factor that does not
    /// divide the integration length) selects the built-in default: full
    /// integration at ≥ 256 channels, 16 samples per block below that.
    pub fn new(
        config: FlaggerConfig,
        nr_samples_per_integration: usize,
        integration_factor: Option<usize>,
    ) -> Result<Self, PipelineError> {
        let default_factor = if config.nr_channels >= MINIMUM_CHANNELS_FOR_FULL_INTEGRATION {
            nr_samples_per_integration
        } else {
            nr_samples_per_integration / 16
        };
        if default_factor == 0 || nr_samples_per_integration % default_factor != 0 {
            return Err(PipelineError::IntegrationMismatch {
                nr_samples: nr_samples_per_integration,
                divisor: 16,
            });
        }

        let factor = match integration_factor {
            None | Some(0) => {
                info!(default_factor, "integration factor not set, using default");
                default_factor
            }
            Some(factor) if nr_samples_per_integration % factor != 0 => {
                warn!(factor, default_factor, "illegal integration factor, using default");
                default_factor
            }
            Some(factor) => factor,
        };

        let nr_blocks = nr_samples_per_integration / factor;
        let nr_channels = config.nr_channels;

        let history_time = config
            .use_history
            .then(|| vec![FlaggerHistory::new(); config.nr_stations * config.nr_subbands]);
        let history_frequency = config.use_history.then(|| {
            vec![FlaggerHistory::new(); config.nr_stations * config.nr_subbands * nr_channels]
        });

        info!(
            detector = config.detector_kind.as_str(),
            statistics = config.stats_kind.as_str(),
            integration_factor = factor,
            nr_blocks,
            "pre-correlation flagger configured"
        );

        Ok(Self {
            flagger: Flagger::new(config),
            nr_samples_per_integration,
            integration_factor: factor,
            nr_blocks,
            integrated_powers_frequency: (0..NR_POLARIZATIONS)
                .map(|_| Grid2D::new(nr_channels, nr_blocks))
                .collect(),
            integrated_flags_frequency: (0..NR_POLARIZATIONS)
                .map(|_| Grid2D::new(nr_channels, nr_blocks))
                .collect(),
            integrated_powers_time: (0..NR_POLARIZATIONS)
                .map(|_| vec![0.0; nr_samples_per_integration])
                .collect(),
            integrated_flags_time: (0..NR_POLARIZATIONS)
                .map(|_| vec![false; nr_samples_per_integration])
                .collect(),
            history_time,
            history_frequency,
        })
    }

    pub fn integration_factor(&self) -> usize {
        self.integration_factor
    }

    pub fn nr_blocks(&self) -> usize {
        self.nr_blocks
    }

    /// Flag one second of filtered voltages in place.
    ///
    /// A frame whose shape disagrees with the configuration is left
    /// untouched.
    pub fn flag(&mut self, voltages: &mut FilteredVoltages, global_time: u32, subband: usize) {
        let (nr_channels, nr_stations) = {
            let config = self.flagger.config();
            (config.nr_channels, config.nr_stations)
        };
        if voltages.nr_channels() != nr_channels
            || voltages.nr_stations() != nr_stations
            || voltages.nr_samples() != self.nr_samples_per_integration
        {
            warn!(
                global_time,
                subband, "frame shape does not match configuration, skipping"
            );
            return;
        }

        for station in 0..nr_stations {
            self.flag_station(voltages, station, global_time, subband);
        }
    }

    fn flag_station(
        &mut self,
        voltages: &mut FilteredVoltages,
        station: usize,
        global_time: u32,
        subband: usize,
    ) {
        let mut flagged_count_frequency = 0;
        let mut flagged_count_time = 0;

        if self.flagger.config().flag_in_frequency_direction {
            flagged_count_frequency =
                self.flag_in_frequency_direction(voltages, station, global_time, subband);
        }

        if self.flagger.config().flag_in_time_direction {
            flagged_count_time =
                self.flag_in_time_direction(voltages, station, global_time, subband);
        }

        // Copy all flags back into the frame. The frequency samples were
        // already zeroed before the time flagger ran.
        if flagged_count_frequency > 0 {
            self.store_flags_frequency(station, voltages);
        }
        if flagged_count_time > 0 {
            self.apply_flags_time(station, voltages);
        }

        if flagged_count_frequency > 0 || flagged_count_time > 0 {
            debug!(
                global_time,
                station,
                subband,
                flagged_frequency = flagged_count_frequency,
                flagged_time = flagged_count_time,
                "pre-correlation flagger"
            );
        }
    }

    // ========================================================================
    // Frequency direction
    // ========================================================================

    /// Returns the number of flagged (channel, block) cells. Because
    /// `nr_blocks` may exceed 1, this also flags in the time direction.
    fn flag_in_frequency_direction(
        &mut self,
        voltages: &mut FilteredVoltages,
        station: usize,
        _global_time: u32,
        subband: usize,
    ) -> usize {
        for flags in &mut self.integrated_flags_frequency {
            flags.fill(false);
        }

        let sensitivity = self.flagger.config().base_sensitivity;
        for pol in 0..NR_POLARIZATIONS {
            self.integrate_powers_frequency(voltages, station, pol);
            self.flagger.detect_2d(
                &self.integrated_powers_frequency[pol],
                &mut self.integrated_flags_frequency[pol],
                sensitivity,
            );
        }

        self.union_flags_frequency();

        if self.flagger.config().use_history {
            self.history_flag_frequency(station, subband);
        }

        // Zero the rejected samples so the time-direction integration does
        // not see them.
        self.wipe_flagged_data_frequency(station, voltages);

        self.integrated_flags_frequency[0].count_set()
    }

    /// Integrate powers over time in groups of the integration factor to
    /// increase the signal-to-noise ratio. Externally flagged samples are
    /// skipped and the sum is divided by the number actually integrated,
    /// so dropped packets do not drag the block power down.
    fn integrate_powers_frequency(
        &mut self,
        voltages: &FilteredVoltages,
        station: usize,
        pol: usize,
    ) {
        let nr_channels = self.flagger.config().nr_channels;
        for channel in 0..nr_channels {
            let external_flags = voltages.flags(channel, station);
            for block in 0..self.nr_blocks {
                let mut power_sum = 0.0f32;
                let mut count = 0usize;
                for time in 0..self.integration_factor {
                    let global_index = block * self.integration_factor + time;
                    if !external_flags.test(global_index) {
                        power_sum += power(voltages.sample(channel, station, global_index, pol));
                        count += 1;
                    }
                }
                let value = if count == 0 { 0.0 } else { power_sum / count as f32 };
                self.integrated_powers_frequency[pol].set(channel, block, value);
            }
        }
    }

    fn union_flags_frequency(&mut self) {
        let (first, rest) = self.integrated_flags_frequency.split_at_mut(1);
        for other in rest {
            for (dst, &src) in first[0].as_mut_slice().iter_mut().zip(other.as_slice()) {
                *dst |= src;
            }
        }
    }

    /// History gate per channel on the mean unflagged power per sample.
    fn history_flag_frequency(&mut self, station: usize, subband: usize) {
        let config = self.flagger.config();
        let nr_channels = config.nr_channels;
        let nr_subbands = config.nr_subbands;
        let sensitivity = config.history_sensitivity;
        if subband >= nr_subbands {
            warn!(subband, "subband out of range, skipping frequency history");
            return;
        }
        let Some(history) = self.history_frequency.as_mut() else {
            return;
        };

        for channel in 0..nr_channels {
            let mut mean_power = 0.0f32;
            let mut count = 0usize;
            for pol in 0..NR_POLARIZATIONS {
                for block in 0..self.nr_blocks {
                    if !self.integrated_flags_frequency[0].get(channel, block) {
                        mean_power += self.integrated_powers_frequency[pol].get(channel, block);
                        count += 1;
                    }
                }
            }
            if count == 0 {
                continue;
            }
            mean_power /= (count * self.integration_factor) as f32;

            let ring = &mut history[(station * nr_subbands + subband) * nr_channels + channel];
            if ring.add_gated(mean_power, sensitivity) {
                for block in 0..self.nr_blocks {
                    self.integrated_flags_frequency[0].set(channel, block, true);
                }
            }
        }
    }

    /// Zero every sample of every flagged (channel, block) cell, for all
    /// polarizations.
    fn wipe_flagged_data_frequency(&self, station: usize, voltages: &mut FilteredVoltages) {
        let zero = Complex32::new(0.0, 0.0);
        let nr_channels = self.flagger.config().nr_channels;
        for channel in 0..nr_channels {
            for block in 0..self.nr_blocks {
                if self.integrated_flags_frequency[0].get(channel, block) {
                    let start_index = block * self.integration_factor;
                    for time in 0..self.integration_factor {
                        for pol in 0..NR_POLARIZATIONS {
                            voltages.set_sample(channel, station, start_index + time, pol, zero);
                        }
                    }
                }
            }
        }
    }

    /// Record the flagged blocks in the frame's sparse time sets. The
    /// samples themselves were already zeroed.
    fn store_flags_frequency(&self, station: usize, voltages: &mut FilteredVoltages) {
        let nr_channels = self.flagger.config().nr_channels;
        for channel in 0..nr_channels {
            for block in 0..self.nr_blocks {
                if self.integrated_flags_frequency[0].get(channel, block) {
                    let start_index = block * self.integration_factor;
                    voltages
                        .flags_mut(channel, station)
                        .include_range(start_index, start_index + self.integration_factor);
                }
            }
        }
    }

    // ========================================================================
    // Time direction
    // ========================================================================

    fn flag_in_time_direction(
        &mut self,
        voltages: &mut FilteredVoltages,
        station: usize,
        _global_time: u32,
        subband: usize,
    ) -> usize {
        for flags in &mut self.integrated_flags_time {
            flags.fill(false);
        }
        // Samples flagged in the frequency direction are already zero and
        // need no special handling here.

        let sensitivity = self.flagger.config().base_sensitivity;
        for pol in 0..NR_POLARIZATIONS {
            self.integrate_powers_time(voltages, station, pol);
            self.flagger.detect_1d(
                &self.integrated_powers_time[pol],
                &mut self.integrated_flags_time[pol],
                sensitivity,
            );
        }

        self.union_flags_time();

        if self.flagger.config().use_history {
            self.history_flag_time(station, subband);
        }

        self.integrated_flags_time[0].iter().filter(|&&f| f).count()
    }

    /// Integrate powers across channels for every time step.
    fn integrate_powers_time(&mut self, voltages: &FilteredVoltages, station: usize, pol: usize) {
        let nr_channels = self.flagger.config().nr_channels;
        for time in 0..self.nr_samples_per_integration {
            let mut power_sum = 0.0f32;
            let mut count = 0usize;
            for channel in 0..nr_channels {
                if !voltages.flags(channel, station).test(time) {
                    power_sum += power(voltages.sample(channel, station, time, pol));
                    count += 1;
                }
            }
            self.integrated_powers_time[pol][time] =
                if count == 0 { 0.0 } else { power_sum / count as f32 };
        }
    }

    fn union_flags_time(&mut self) {
        let (first, rest) = self.integrated_flags_time.split_at_mut(1);
        for other in rest {
            for (dst, &src) in first[0].iter_mut().zip(other.iter()) {
                *dst |= src;
            }
        }
    }

    /// History gate on the winsorized mean power per sample. The mean of
    /// the unflagged samples predicts drift better than the median here.
    fn history_flag_time(&mut self, station: usize, subband: usize) {
        let config = self.flagger.config();
        let nr_subbands = config.nr_subbands;
        let nr_channels = config.nr_channels;
        let sensitivity = config.history_sensitivity;
        if subband >= nr_subbands {
            warn!(subband, "subband out of range, skipping time history");
            return;
        }

        let flagged = self.integrated_flags_time[0].iter().filter(|&&f| f).count();
        if flagged >= self.nr_samples_per_integration {
            // Everything is already flagged, nothing left to gate.
            return;
        }

        let Some(history) = self.history_time.as_mut() else {
            return;
        };

        // The flags at index 0 hold the union of both polarizations.
        let mean0 = statistics::winsorized_mean(
            &self.integrated_powers_time[0],
            &self.integrated_flags_time[0],
        );
        let mean1 = statistics::winsorized_mean(
            &self.integrated_powers_time[1],
            &self.integrated_flags_time[0],
        );
        let mean = (mean0 + mean1) / (2.0 * nr_channels as f32);

        let ring = &mut history[station * nr_subbands + subband];
        if ring.add_gated(mean, sensitivity) {
            self.integrated_flags_time[0].fill(true);
        }
    }

    /// Record flagged times in every channel's sparse set and zero the
    /// corresponding samples.
    fn apply_flags_time(&self, station: usize, voltages: &mut FilteredVoltages) {
        let zero = Complex32::new(0.0, 0.0);
        let nr_channels = self.flagger.config().nr_channels;
        for time in 0..self.nr_samples_per_integration {
            if self.integrated_flags_time[0][time] {
                for channel in 0..nr_channels {
                    voltages.flags_mut(channel, station).include(time);
                    for pol in 0..NR_POLARIZATIONS {
                        voltages.set_sample(channel, station, time, pol, zero);
                    }
                }
            }
        }
    }
}
