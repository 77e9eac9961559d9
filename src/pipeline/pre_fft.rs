//! Pre-correlation flagger for single-channel data.
//!
//! Without a channel axis the flagger makes its own: each second is cut
//! into blocks of the FFT size, transformed, and the per-bin powers are
//! integrated over the blocks. Flagging runs first in frequency (most RFI
//! is narrowband), then in time on integrated powers. Flagged bins are
//! replaced in full resolution through a second FFT round trip; an FFT
//! followed by an inverse FFT scales every sample by the transform size,
//! so the output is divided by it afterwards.
//!
//! Powers cannot be integrated by adding samples and squaring the sum;
//! the power of each sample is computed first and the powers are added.
//!
//! Both the per-bin powers and the frequency flags are stored in
//! FFT-shifted order (DC in the centre, the order of the real
//! frequencies).

use num_complex::Complex32;
use tracing::{debug, info, warn};

use crate::config::{FlaggerConfig, ReplacementPolicy, DEFAULT_FFT_SIZE, NR_POLARIZATIONS};
use crate::detector::sir_operator_1d;
use crate::diagnostics::IntermediateSink;
use crate::frame::{power, BandpassTable, FilteredVoltages};
use crate::pipeline::PipelineError;

#[cfg(feature = "fft")]
use crate::flagger::Flagger;
#[cfg(feature = "fft")]
use crate::history::FlaggerHistory;
#[cfg(feature = "fft")]
use crate::statistics;
#[cfg(feature = "fft")]
use rustfft::{Fft, FftPlanner};
#[cfg(feature = "fft")]
use std::sync::Arc;

/// The three caller-supplied diagnostic sinks: integrated powers, the same
/// with flagged bins marked, and the powers after replacement.
pub struct DebugSinks {
    pub integrated: Box<dyn IntermediateSink>,
    pub flagged: Box<dyn IntermediateSink>,
    pub replaced: Box<dyn IntermediateSink>,
}

#[cfg(feature = "fft")]
pub struct PreCorrelationFftFlagger {
    flagger: Flagger,
    nr_samples_per_integration: usize,
    integration_factor: usize,
    fft_size: usize,
    correct_bandpass: bool,
    bandpass: BandpassTable,

    forward_plan: Arc<dyn Fft<f32>>,
    inverse_plan: Arc<dyn Fft<f32>>,
    fft_scratch: Vec<Complex32>,

    // Scratch, reinitialised per station.
    samples: Vec<Complex32>,    // [fft_size]
    fft_buffer: Vec<Complex32>, // [fft_size]
    powers: Vec<Vec<f32>>,      // [pol][fft_size], FFT-shifted
    flags_frequency: Vec<Vec<bool>>, // [pol][fft_size], FFT-shifted
    flags_time: Vec<Vec<bool>>, // [pol][fft_size]

    history_time: Option<Vec<FlaggerHistory>>, // [station][subband]
    history_frequency: Option<Vec<FlaggerHistory>>, // [station][subband][bin]

    sinks: Option<DebugSinks>,
}

#[cfg(feature = "fft")]
impl std::fmt::Debug for PreCorrelationFftFlagger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreCorrelationFftFlagger").finish_non_exhaustive()
    }
}

#[cfg(feature = "fft")]
impl PreCorrelationFftFlagger {
    /// Plans are created eagerly here; `flag` never allocates FFT state.
    ///
    /// `bandpass` of `None` selects a flat table. The table length must
    /// equal the FFT size.
    pub fn new(
        config: FlaggerConfig,
        nr_samples_per_integration: usize,
        correct_bandpass: bool,
        bandpass: Option<BandpassTable>,
    ) -> Result<Self, PipelineError> {
        let fft_size = DEFAULT_FFT_SIZE;

        if config.nr_channels != 1 {
            return Err(PipelineError::ChannelCountUnsupported {
                got: config.nr_channels,
            });
        }
        if nr_samples_per_integration == 0 || nr_samples_per_integration % fft_size != 0 {
            return Err(PipelineError::IntegrationMismatch {
                nr_samples: nr_samples_per_integration,
                divisor: fft_size,
            });
        }

        let bandpass = match bandpass {
            Some(table) => {
                if table.len() != fft_size {
                    return Err(PipelineError::BandpassMismatch {
                        expected: fft_size,
                        got: table.len(),
                    });
                }
                table
            }
            None => BandpassTable::flat(fft_size),
        };

        let integration_factor = nr_samples_per_integration / fft_size;

        let mut planner = FftPlanner::<f32>::new();
        let forward_plan = planner.plan_fft_forward(fft_size);
        let inverse_plan = planner.plan_fft_inverse(fft_size);
        let scratch_len = forward_plan
            .get_inplace_scratch_len()
            .max(inverse_plan.get_inplace_scratch_len());

        let history_time = config
            .use_history
            .then(|| vec![FlaggerHistory::new(); config.nr_stations * config.nr_subbands]);
        let history_frequency = config.use_history.then(|| {
            vec![FlaggerHistory::new(); config.nr_stations * config.nr_subbands * fft_size]
        });

        info!(
            nr_samples_per_integration,
            fft_size,
            integration_factor,
            bandpass_correction = correct_bandpass,
            "single-channel flagger configured"
        );

        Ok(Self {
            flagger: Flagger::new(config),
            nr_samples_per_integration,
            integration_factor,
            fft_size,
            correct_bandpass,
            bandpass,
            forward_plan,
            inverse_plan,
            fft_scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            samples: vec![Complex32::new(0.0, 0.0); fft_size],
            fft_buffer: vec![Complex32::new(0.0, 0.0); fft_size],
            powers: (0..NR_POLARIZATIONS).map(|_| vec![0.0; fft_size]).collect(),
            flags_frequency: (0..NR_POLARIZATIONS).map(|_| vec![false; fft_size]).collect(),
            flags_time: (0..NR_POLARIZATIONS).map(|_| vec![false; fft_size]).collect(),
            history_time,
            history_frequency,
            sinks: None,
        })
    }

    /// Attach diagnostic sinks and write their headers. While sinks are
    /// attached the replacement step always runs, so the replaced record
    /// reflects the data actually written back.
    pub fn attach_debug_sinks(&mut self, mut sinks: DebugSinks) -> std::io::Result<()> {
        let config = self.flagger.config();
        let nr_stations = config.nr_stations as u32;
        let nr_subbands = config.nr_subbands as u32;
        let fft_size = self.fft_size as u32;
        let nr_pol = NR_POLARIZATIONS as u32;
        sinks
            .integrated
            .write_header(nr_stations, nr_subbands, fft_size, nr_pol)?;
        sinks
            .flagged
            .write_header(nr_stations, nr_subbands, fft_size, nr_pol)?;
        sinks
            .replaced
            .write_header(nr_stations, nr_subbands, fft_size, nr_pol)?;
        self.sinks = Some(sinks);
        Ok(())
    }

    pub fn integration_factor(&self) -> usize {
        self.integration_factor
    }

    /// Flag one second of single-channel voltages in place.
    pub fn flag(&mut self, voltages: &mut FilteredVoltages, global_time: u32, subband: usize) {
        let nr_stations = self.flagger.config().nr_stations;
        if voltages.nr_channels() != 1
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
            self.flag_station(voltages, global_time, station, subband);
        }
    }

    fn flag_station(
        &mut self,
        voltages: &mut FilteredVoltages,
        global_time: u32,
        station: usize,
        subband: usize,
    ) {
        if self.flagger.config().flag_in_frequency_direction {
            self.flag_in_frequency_direction(voltages, global_time, station, subband);
        }
        if self.flagger.config().flag_in_time_direction {
            self.flag_in_time_direction(voltages, global_time, station, subband);
        }
    }

    #[inline]
    fn fft_shifted(&self, index: usize) -> usize {
        (self.fft_size / 2 + index) % self.fft_size
    }

    // ========================================================================
    // Frequency direction
    // ========================================================================

    fn flag_in_frequency_direction(
        &mut self,
        voltages: &mut FilteredVoltages,
        global_time: u32,
        station: usize,
        subband: usize,
    ) {
        for flags in &mut self.flags_frequency {
            flags.fill(false);
        }

        let sensitivity = self.flagger.config().base_sensitivity;
        for pol in 0..NR_POLARIZATIONS {
            self.integrate_powers_frequency(voltages, station, pol);

            // Flag twice: the second pass sees statistics no longer
            // poisoned by what the first one caught. Only when needed.
            let flagged = self.flagger.sum_threshold_flagger_1d(
                &self.powers[pol],
                &mut self.flags_frequency[pol],
                sensitivity,
            );
            if flagged > 0 {
                self.flagger.sum_threshold_flagger_1d(
                    &self.powers[pol],
                    &mut self.flags_frequency[pol],
                    sensitivity,
                );
            }
        }

        union_of_flags(&mut self.flags_frequency);

        // Widen the flagged windows a bit and fill in the holes.
        let mut flagged_count =
            sir_operator_1d(&mut self.flags_frequency[0], self.flagger.config().sir_eta);

        debug!(global_time, station, subband, flagged_count, "flagged in frequency");

        if self.flagger.config().use_history {
            flagged_count += self.history_flag_frequency(global_time, station, subband);
        }

        if self.sinks.is_some() {
            self.write_integrated_records(global_time, station, subband);
            // The replacement also feeds the replaced record, so always
            // run it while sinks are attached.
            self.apply_flags_frequency(voltages, global_time, station, subband, flagged_count);
        } else if flagged_count > 0 {
            self.apply_flags_frequency(voltages, global_time, station, subband, flagged_count);
        }
    }

    /// Per-bin powers integrated over all blocks of this second, in
    /// FFT-shifted order, with optional bandpass correction.
    fn integrate_powers_frequency(
        &mut self,
        voltages: &FilteredVoltages,
        station: usize,
        pol: usize,
    ) {
        self.powers[pol].fill(0.0);

        for block in 0..self.integration_factor {
            let start_index = block * self.fft_size;
            for minor_time in 0..self.fft_size {
                self.samples[minor_time] =
                    voltages.sample(0, station, start_index + minor_time, pol);
            }
            self.forward_fft();

            for i in 0..self.fft_size {
                let shifted = self.fft_shifted(i);
                let mut sample = self.fft_buffer[i];
                if self.correct_bandpass {
                    sample *= self.bandpass.correction_factors()[shifted];
                }
                self.powers[pol][shifted] += power(sample);
            }
        }
    }

    /// History gate per frequency bin on the mean unflagged power of both
    /// polarizations. Returns the number of bins it flagged.
    fn history_flag_frequency(&mut self, global_time: u32, station: usize, subband: usize) -> usize {
        let config = self.flagger.config();
        let nr_subbands = config.nr_subbands;
        let sensitivity = config.history_sensitivity;
        if subband >= nr_subbands {
            warn!(subband, "subband out of range, skipping frequency history");
            return 0;
        }
        let Some(history) = self.history_frequency.as_mut() else {
            return 0;
        };

        let mut extra_flagged = 0;
        for channel in 0..self.fft_size {
            if self.flags_frequency[0][channel] {
                continue;
            }
            let mut mean_power = 0.0f32;
            for pol in 0..NR_POLARIZATIONS {
                mean_power += self.powers[pol][channel];
            }
            mean_power /= NR_POLARIZATIONS as f32;

            let ring = &mut history[(station * nr_subbands + subband) * self.fft_size + channel];
            if ring.add_gated(mean_power, sensitivity) {
                debug!(global_time, station, subband, channel, "frequency history gate fired");
                self.flags_frequency[0][channel] = true;
                extra_flagged += 1;
            }
        }
        extra_flagged
    }

    /// Re-transform every block, overwrite the flagged bins with the
    /// replacement value, and transform back. The flags are stored in
    /// real-frequency order, so the bin index is FFT-shifted on lookup.
    /// Replacements are pre-divided by the bandpass so the later external
    /// correction restores the intended magnitude.
    fn apply_flags_frequency(
        &mut self,
        voltages: &mut FilteredVoltages,
        global_time: u32,
        station: usize,
        subband: usize,
        nr_flagged: usize,
    ) {
        let mut replaced_powers = self
            .sinks
            .is_some()
            .then(|| vec![0.0f32; self.fft_size * NR_POLARIZATIONS]);

        for pol in 0..NR_POLARIZATIONS {
            for major_time in 0..self.integration_factor {
                let start_index = major_time * self.fft_size;
                for minor_time in 0..self.fft_size {
                    self.samples[minor_time] =
                        voltages.sample(0, station, start_index + minor_time, pol);
                }
                self.forward_fft();

                let replacement = self.replacement_value_frequency(nr_flagged);

                for minor_time in 0..self.fft_size {
                    let shifted = self.fft_shifted(minor_time);
                    if self.flags_frequency[0][shifted] {
                        self.fft_buffer[minor_time] = replacement;
                        if self.correct_bandpass {
                            self.fft_buffer[minor_time] /=
                                self.bandpass.correction_factors()[shifted];
                        }
                    }
                }

                if let Some(accumulated) = replaced_powers.as_mut() {
                    for minor_time in 0..self.fft_size {
                        let shifted = self.fft_shifted(minor_time);
                        let mut sample = self.fft_buffer[minor_time];
                        if self.correct_bandpass {
                            sample *= self.bandpass.correction_factors()[shifted];
                        }
                        accumulated[shifted * NR_POLARIZATIONS + pol] += power(sample);
                    }
                }

                self.backward_fft();
                let scale = self.fft_size as f32;
                for minor_time in 0..self.fft_size {
                    let sample = self.samples[minor_time];
                    voltages.set_sample(
                        0,
                        station,
                        start_index + minor_time,
                        pol,
                        Complex32::new(sample.re / scale, sample.im / scale),
                    );
                }
            }
        }

        if let (Some(sinks), Some(accumulated)) = (self.sinks.as_mut(), replaced_powers) {
            if let Err(error) = sinks.replaced.write_record(
                global_time,
                station as u32,
                subband as u32,
                &accumulated,
            ) {
                warn!(%error, "failed to write replaced-data record");
            }
        }
    }

    /// Replacement value for flagged frequency bins, from the current
    /// content of the FFT buffer.
    fn replacement_value_frequency(&self, nr_flagged: usize) -> Complex32 {
        let zero = Complex32::new(0.0, 0.0);
        match self.flagger.config().replacement_policy {
            ReplacementPolicy::Zero => zero,

            ReplacementPolicy::Mean => {
                // Keep the total signal power the same: every flagged bin
                // gets the mean power of the unflagged ones, imaginary 0.
                if nr_flagged >= self.fft_size {
                    return zero;
                }
                let mut mean_power = 0.0f32;
                for minor_time in 0..self.fft_size {
                    let shifted = self.fft_shifted(minor_time);
                    if !self.flags_frequency[0][shifted] {
                        mean_power += power(self.fft_buffer[minor_time]);
                    }
                }
                mean_power /= (self.fft_size - nr_flagged) as f32;
                Complex32::new(mean_power.sqrt(), 0.0)
            }

            ReplacementPolicy::Random => {
                for minor_time in 0..self.fft_size {
                    let shifted = self.fft_shifted(minor_time);
                    if !self.flags_frequency[0][shifted] {
                        let mut value = self.fft_buffer[minor_time];
                        if self.correct_bandpass {
                            value *= self.bandpass.correction_factors()[shifted];
                        }
                        return value;
                    }
                }
                debug!("frequency replacement: no unflagged bins, returning zero");
                zero
            }

            ReplacementPolicy::Median => {
                let mut bin_powers = vec![0.0f32; self.fft_size];
                for minor_time in 0..self.fft_size {
                    let shifted = self.fft_shifted(minor_time);
                    bin_powers[shifted] = power(self.fft_buffer[minor_time]);
                }
                match statistics::flagged_median(&bin_powers, &self.flags_frequency[0]) {
                    Some((_, median_index)) => {
                        // The median index is in real-frequency order; undo
                        // the shift to address the buffer. Even FFT sizes
                        // make the shift self-inverse.
                        let unshifted = self.fft_shifted(median_index);
                        let mut value = self.fft_buffer[unshifted];
                        if self.correct_bandpass {
                            value *= self.bandpass.correction_factors()[median_index];
                        }
                        value
                    }
                    None => zero,
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
        global_time: u32,
        station: usize,
        subband: usize,
    ) {
        for flags in &mut self.flags_time {
            flags.fill(false);
        }

        let sensitivity = self.flagger.config().base_sensitivity;
        for pol in 0..NR_POLARIZATIONS {
            self.integrate_powers_time(voltages, station, pol);

            let flagged = self.flagger.sum_threshold_flagger_1d(
                &self.powers[pol],
                &mut self.flags_time[pol],
                sensitivity,
            );
            if flagged > 0 {
                self.flagger.sum_threshold_flagger_1d(
                    &self.powers[pol],
                    &mut self.flags_time[pol],
                    sensitivity,
                );
            }
        }

        union_of_flags(&mut self.flags_time);

        let mut flagged_count =
            sir_operator_1d(&mut self.flags_time[0], self.flagger.config().sir_eta);

        debug!(global_time, station, subband, flagged_count, "flagged in time");

        if self.flagger.config().use_history && flagged_count < self.fft_size {
            if self.history_flag_time(global_time, station, subband) {
                self.flags_time[0].fill(true);
                flagged_count = self.fft_size;
            }
        }

        if flagged_count > 0 {
            self.apply_flags_time(voltages, station, subband, flagged_count);
        }
    }

    /// Sum the powers of every `integration_factor` consecutive samples
    /// into one time slot per FFT bin width.
    fn integrate_powers_time(&mut self, voltages: &FilteredVoltages, station: usize, pol: usize) {
        self.powers[pol].fill(0.0);
        for t in 0..self.nr_samples_per_integration {
            let sample = voltages.sample(0, station, t, pol);
            self.powers[pol][t / self.integration_factor] += power(sample);
        }
    }

    /// Whole-second gate on the winsorized mean power per sample. The mean
    /// of the unflagged samples predicts drift better than the median.
    fn history_flag_time(&mut self, global_time: u32, station: usize, subband: usize) -> bool {
        let config = self.flagger.config();
        let nr_subbands = config.nr_subbands;
        let sensitivity = config.history_sensitivity;
        if subband >= nr_subbands {
            warn!(subband, "subband out of range, skipping time history");
            return false;
        }
        let Some(history) = self.history_time.as_mut() else {
            return false;
        };

        // The flags at index 0 hold the union of both polarizations.
        let mean0 = statistics::winsorized_mean(&self.powers[0], &self.flags_time[0]);
        let mean1 = statistics::winsorized_mean(&self.powers[1], &self.flags_time[0]);
        let mean = (mean0 + mean1) / (2.0 * self.integration_factor as f32);

        let ring = &mut history[station * nr_subbands + subband];
        let fired = ring.add_gated(mean, sensitivity);
        if fired {
            debug!(global_time, station, subband, "time history gate fired");
        }
        fired
    }

    /// Record the flagged slots in the frame's sparse set and overwrite
    /// every sample in them with the replacement value.
    fn apply_flags_time(
        &mut self,
        voltages: &mut FilteredVoltages,
        station: usize,
        subband: usize,
        nr_flagged: usize,
    ) {
        for i in 0..self.fft_size {
            if self.flags_time[0][i] {
                let start_index = i * self.integration_factor;
                voltages
                    .flags_mut(0, station)
                    .include_range(start_index, start_index + self.integration_factor);
            }
        }

        for pol in 0..NR_POLARIZATIONS {
            let replacement = self.replacement_value_time(voltages, station, subband, pol, nr_flagged);
            for i in 0..self.fft_size {
                if self.flags_time[0][i] {
                    let start_index = i * self.integration_factor;
                    for pos in start_index..start_index + self.integration_factor {
                        voltages.set_sample(0, station, pos, pol, replacement);
                    }
                }
            }
        }
    }

    fn replacement_value_time(
        &self,
        voltages: &FilteredVoltages,
        station: usize,
        subband: usize,
        pol: usize,
        nr_flagged: usize,
    ) -> Complex32 {
        let zero = Complex32::new(0.0, 0.0);
        match self.flagger.config().replacement_policy {
            ReplacementPolicy::Zero => zero,

            ReplacementPolicy::Mean => {
                if nr_flagged >= self.fft_size {
                    return self.replacement_from_history_time(station, subband);
                }
                let mut mean_power = 0.0f32;
                for i in 0..self.fft_size {
                    if !self.flags_time[0][i] {
                        mean_power += self.powers[pol][i];
                    }
                }
                mean_power /=
                    ((self.fft_size - nr_flagged) * self.integration_factor) as f32;
                let replacement = Complex32::new(mean_power.sqrt(), 0.0);
                self.sanity_check_time(station, subband, replacement)
            }

            ReplacementPolicy::Random => {
                if nr_flagged >= self.fft_size {
                    return self.replacement_from_history_time(station, subband);
                }
                // The first sample of the first unflagged slot.
                let mut replacement = zero;
                for i in 0..self.fft_size {
                    if !self.flags_time[0][i] {
                        replacement =
                            voltages.sample(0, station, i * self.integration_factor, pol);
                        break;
                    }
                }
                self.sanity_check_time(station, subband, replacement)
            }

            ReplacementPolicy::Median => {
                if nr_flagged >= self.fft_size {
                    return self.replacement_from_history_time(station, subband);
                }
                // The median sample of the first unflagged slot.
                let mut replacement = zero;
                for i in 0..self.fft_size {
                    if !self.flags_time[0][i] {
                        let start_index = i * self.integration_factor;
                        let mut slot_powers = vec![0.0f32; self.integration_factor];
                        for (s, slot_power) in slot_powers.iter_mut().enumerate() {
                            *slot_power =
                                power(voltages.sample(0, station, start_index + s, pol));
                        }
                        if let Some((_, median_index)) =
                            statistics::median_with_index(&slot_powers)
                        {
                            replacement =
                                voltages.sample(0, station, start_index + median_index, pol);
                        }
                        break;
                    }
                }
                self.sanity_check_time(station, subband, replacement)
            }
        }
    }

    /// Used when every slot is flagged, or when the sanity check rejects
    /// the computed replacement: no good median exists in this second, so
    /// take the level the history remembers.
    fn replacement_from_history_time(&self, station: usize, subband: usize) -> Complex32 {
        let nr_subbands = self.flagger.config().nr_subbands;
        match self.history_time.as_ref() {
            Some(history) if subband < nr_subbands => {
                debug!("time replacement: falling back to historic data");
                let mean_power = history[station * nr_subbands + subband].mean();
                Complex32::new(mean_power.sqrt(), 0.0)
            }
            _ => Complex32::new(0.0, 0.0),
        }
    }

    /// Replacement occasionally comes out too high when some samples were
    /// not flagged correctly; verify it against the history.
    fn sanity_check_time(&self, station: usize, subband: usize, replacement: Complex32) -> Complex32 {
        let nr_subbands = self.flagger.config().nr_subbands;
        if let Some(history) = self.history_time.as_ref() {
            if subband < nr_subbands {
                let ring = &history[station * nr_subbands + subband];
                if !ring.is_empty() && power(replacement) > ring.mean() {
                    debug!(
                        station,
                        subband,
                        replacement_power = power(replacement),
                        history_mean = ring.mean(),
                        "time replacement sanity check triggered"
                    );
                    return self.replacement_from_history_time(station, subband);
                }
            }
        }

        if replacement == Complex32::new(0.0, 0.0) {
            debug!(station, subband, "time flagger replaces with zero");
        }
        replacement
    }

    // ========================================================================
    // FFT plumbing and diagnostics
    // ========================================================================

    fn forward_fft(&mut self) {
        self.fft_buffer.copy_from_slice(&self.samples);
        self.forward_plan
            .process_with_scratch(&mut self.fft_buffer, &mut self.fft_scratch);
    }

    fn backward_fft(&mut self) {
        self.samples.copy_from_slice(&self.fft_buffer);
        self.inverse_plan
            .process_with_scratch(&mut self.samples, &mut self.fft_scratch);
    }

    fn write_integrated_records(&mut self, global_time: u32, station: usize, subband: usize) {
        let Some(sinks) = self.sinks.as_mut() else {
            return;
        };

        let mut record = vec![0.0f32; self.fft_size * NR_POLARIZATIONS];
        for bin in 0..self.fft_size {
            for pol in 0..NR_POLARIZATIONS {
                record[bin * NR_POLARIZATIONS + pol] = self.powers[pol][bin];
            }
        }
        if let Err(error) =
            sinks
                .integrated
                .write_record(global_time, station as u32, subband as u32, &record)
        {
            warn!(%error, "failed to write integrated-data record");
        }

        for bin in 0..self.fft_size {
            for pol in 0..NR_POLARIZATIONS {
                record[bin * NR_POLARIZATIONS + pol] = if self.flags_frequency[pol][bin] {
                    -1.0
                } else {
                    self.powers[pol][bin]
                };
            }
        }
        if let Err(error) =
            sinks
                .flagged
                .write_record(global_time, station as u32, subband as u32, &record)
        {
            warn!(%error, "failed to write flagged-data record");
        }
    }
}

/// OR the flags of every polarization into index 0.
fn union_of_flags(flags: &mut [Vec<bool>]) {
    let (first, rest) = flags.split_at_mut(1);
    for other in rest.iter() {
        for (dst, &src) in first[0].iter_mut().zip(other.iter()) {
            *dst |= src;
        }
    }
}

/// Placeholder when the crate is built without an FFT backend; the
/// constructor fails and nothing else is reachable.
#[cfg(not(feature = "fft"))]
pub struct PreCorrelationFftFlagger {
    _unavailable: (),
}

#[cfg(not(feature = "fft"))]
impl PreCorrelationFftFlagger {
    pub fn new(
        _config: FlaggerConfig,
        _nr_samples_per_integration: usize,
        _correct_bandpass: bool,
        _bandpass: Option<BandpassTable>,
    ) -> Result<Self, PipelineError> {
        Err(PipelineError::FftUnavailable)
    }
}

#[cfg(all(test, feature = "fft"))]
mod tests {
    use super::*;
    use crate::config::{FFT_BASE_SENSITIVITY, PIPELINE_CUTOFF_THRESHOLD};
    use crate::history::MIN_HISTORY_SIZE;
    use std::f32::consts::TAU;
    use std::io;
    use std::sync::{Arc as StdArc, Mutex};

    const NR_SAMPLES: usize = 1024; // 4 blocks of 256

    fn config() -> FlaggerConfig {
        FlaggerConfig {
            cutoff_threshold: PIPELINE_CUTOFF_THRESHOLD,
            base_sensitivity: FFT_BASE_SENSITIVITY,
            ..FlaggerConfig::new(1, 2, 1)
        }
    }

    /// In-memory sink capturing record values for assertions.
    #[derive(Default)]
    struct CaptureSink {
        records: StdArc<Mutex<Vec<Vec<f32>>>>,
    }

    impl IntermediateSink for CaptureSink {
        fn write_header(&mut self, _: u32, _: u32, _: u32, _: u32) -> io::Result<()> {
            Ok(())
        }
        fn write_record(&mut self, _: u32, _: u32, _: u32, values: &[f32]) -> io::Result<()> {
            self.records.lock().unwrap().push(values.to_vec());
            Ok(())
        }
    }

    fn capture_sinks() -> (DebugSinks, StdArc<Mutex<Vec<Vec<f32>>>>) {
        let replaced = CaptureSink::default();
        let handle = replaced.records.clone();
        (
            DebugSinks {
                integrated: Box::new(CaptureSink::default()),
                flagged: Box::new(CaptureSink::default()),
                replaced: Box::new(replaced),
            },
            handle,
        )
    }

    /// An impulse train has a flat spectrum, so nothing gets flagged.
    fn flat_spectrum_frame() -> FilteredVoltages {
        let mut voltages = FilteredVoltages::new(1, 1, NR_SAMPLES);
        for block in 0..NR_SAMPLES / 256 {
            for pol in 0..NR_POLARIZATIONS {
                voltages.set_sample(0, 0, block * 256, pol, Complex32::new(1.0, 0.0));
            }
        }
        voltages
    }

    #[test]
    fn requires_a_single_channel() {
        let bad = FlaggerConfig::new(1, 2, 4);
        let err = PreCorrelationFftFlagger::new(bad, NR_SAMPLES, false, None).unwrap_err();
        assert!(matches!(err, PipelineError::ChannelCountUnsupported { got: 4 }));
    }

    #[test]
    fn requires_a_multiple_of_the_fft_size() {
        let err = PreCorrelationFftFlagger::new(config(), 1000, false, None).unwrap_err();
        assert!(matches!(err, PipelineError::IntegrationMismatch { .. }));
    }

    #[test]
    fn fft_plans_round_trip_within_tolerance() {
        let mut pipeline = PreCorrelationFftFlagger::new(config(), NR_SAMPLES, false, None).unwrap();
        for (i, sample) in pipeline.samples.iter_mut().enumerate() {
            *sample = Complex32::new((i as f32 * 0.1).sin(), (i as f32 * 0.05).cos());
        }
        let original = pipeline.samples.clone();

        pipeline.forward_fft();
        pipeline.backward_fft();

        let scale = pipeline.fft_size as f32;
        for (output, input) in pipeline.samples.iter().zip(&original) {
            assert!(
                (output.re / scale - input.re).abs() <= 1e-5
                    && (output.im / scale - input.im).abs() <= 1e-5,
                "round trip drifted: {input} -> {}",
                output / scale
            );
        }
    }

    #[test]
    fn fft_round_trip_is_identity_when_nothing_is_flagged() {
        let mut cfg = config();
        cfg.flag_in_time_direction = false;
        let mut pipeline = PreCorrelationFftFlagger::new(cfg, NR_SAMPLES, false, None).unwrap();
        // Sinks force the replacement round trip even with zero flags.
        let (sinks, _) = capture_sinks();
        pipeline.attach_debug_sinks(sinks).unwrap();

        let mut voltages = flat_spectrum_frame();
        let original = voltages.clone();
        pipeline.flag(&mut voltages, 0, 0);

        for t in 0..NR_SAMPLES {
            for pol in 0..NR_POLARIZATIONS {
                let output = voltages.sample(0, 0, t, pol);
                let input = original.sample(0, 0, t, pol);
                assert!(
                    (output.re - input.re).abs() <= 1e-5 && (output.im - input.im).abs() <= 1e-5,
                    "round trip drifted at t={t} pol={pol}: {input} -> {output}"
                );
            }
        }
        assert!(voltages.flags(0, 0).is_empty());
    }

    #[test]
    fn narrowband_tone_is_suppressed_in_frequency() {
        let mut pipeline = PreCorrelationFftFlagger::new(config(), NR_SAMPLES, false, None).unwrap();

        // Impulse train baseline plus a strong carrier at bin 32.
        let mut voltages = flat_spectrum_frame();
        for t in 0..NR_SAMPLES {
            let phase = TAU * 32.0 * (t % 256) as f32 / 256.0;
            for pol in 0..NR_POLARIZATIONS {
                let base = voltages.sample(0, 0, t, pol);
                voltages.set_sample(
                    0,
                    0,
                    t,
                    pol,
                    base + Complex32::new(phase.cos(), phase.sin()) * 30.0,
                );
            }
        }

        let tone_power_before: f32 = (0..NR_SAMPLES)
            .map(|t| power(voltages.sample(0, 0, t, 0)))
            .sum();
        pipeline.flag(&mut voltages, 0, 0);
        let tone_power_after: f32 = (0..NR_SAMPLES)
            .map(|t| power(voltages.sample(0, 0, t, 0)))
            .sum();

        assert!(
            tone_power_after < tone_power_before / 100.0,
            "carrier should be removed: before {tone_power_before}, after {tone_power_after}"
        );
    }

    #[test]
    fn time_burst_is_flagged_and_replaced() {
        let mut cfg = config();
        cfg.flag_in_frequency_direction = false;
        let mut pipeline = PreCorrelationFftFlagger::new(cfg, NR_SAMPLES, false, None).unwrap();

        let mut voltages = FilteredVoltages::new(1, 1, NR_SAMPLES);
        for t in 0..NR_SAMPLES {
            for pol in 0..NR_POLARIZATIONS {
                voltages.set_sample(0, 0, t, pol, Complex32::new(1.0, 0.0));
            }
        }
        // 16-sample burst, well inside one group of time slots.
        for t in 512..528 {
            for pol in 0..NR_POLARIZATIONS {
                voltages.set_sample(0, 0, t, pol, Complex32::new(50.0, 0.0));
            }
        }

        pipeline.flag(&mut voltages, 0, 0);

        let flags = voltages.flags(0, 0);
        assert!(flags.test(512), "burst start should be flagged");
        assert!(flags.test(527), "burst end should be flagged");
        // Replaced with the median of a clean slot (unit amplitude).
        for t in 512..528 {
            assert_eq!(voltages.sample(0, 0, t, 0), Complex32::new(1.0, 0.0));
        }
        // Samples far from the burst stay untouched.
        assert_eq!(voltages.sample(0, 0, 0, 0), Complex32::new(1.0, 0.0));
        assert!(!flags.test(0));
    }

    #[test]
    fn mean_replacement_preserves_sample_power() {
        let mut cfg = config();
        cfg.flag_in_frequency_direction = false;
        cfg.replacement_policy = ReplacementPolicy::Mean;
        let mut pipeline = PreCorrelationFftFlagger::new(cfg, NR_SAMPLES, false, None).unwrap();

        let mut voltages = FilteredVoltages::new(1, 1, NR_SAMPLES);
        for t in 0..NR_SAMPLES {
            for pol in 0..NR_POLARIZATIONS {
                voltages.set_sample(0, 0, t, pol, Complex32::new(1.0, 0.0));
            }
        }
        for t in 512..528 {
            for pol in 0..NR_POLARIZATIONS {
                voltages.set_sample(0, 0, t, pol, Complex32::new(50.0, 0.0));
            }
        }

        pipeline.flag(&mut voltages, 0, 0);

        // The replacement carries the mean power of the unflagged samples,
        // which is 1.0 here.
        for t in 512..528 {
            let replaced = power(voltages.sample(0, 0, t, 0));
            assert!(
                (replaced - 1.0).abs() <= 1e-4,
                "replacement power should match the unflagged mean, got {replaced}"
            );
        }
    }

    #[test]
    fn history_gate_flags_a_drifted_second() {
        let mut cfg = config();
        cfg.flag_in_frequency_direction = false;
        cfg.use_history = true;
        let mut pipeline = PreCorrelationFftFlagger::new(cfg, NR_SAMPLES, false, None).unwrap();

        // Warm-up: quiet seconds never trip the gate.
        for second in 0..MIN_HISTORY_SIZE as u32 {
            let mut voltages = FilteredVoltages::new(1, 1, NR_SAMPLES);
            for t in 0..NR_SAMPLES {
                for pol in 0..NR_POLARIZATIONS {
                    voltages.set_sample(0, 0, t, pol, Complex32::new(1.0, 0.0));
                }
            }
            pipeline.flag(&mut voltages, second, 0);
            assert!(
                voltages.flags(0, 0).is_empty(),
                "gate fired during warm-up at second {second}"
            );
        }

        // A second with triple the amplitude everywhere: locally flat, so
        // only the history can catch it.
        let mut voltages = FilteredVoltages::new(1, 1, NR_SAMPLES);
        for t in 0..NR_SAMPLES {
            for pol in 0..NR_POLARIZATIONS {
                voltages.set_sample(0, 0, t, pol, Complex32::new(3.0, 0.0));
            }
        }
        pipeline.flag(&mut voltages, MIN_HISTORY_SIZE as u32, 0);

        assert_eq!(
            voltages.flags(0, 0).count(),
            NR_SAMPLES,
            "the whole second should be flagged"
        );
        // All slots flagged: replacement falls back to the history level.
        let replaced = voltages.sample(0, 0, 100, 0);
        assert!(
            (power(replaced) - 1.0).abs() < 1e-4,
            "replacement should carry the historic power, got {replaced}"
        );
    }

    #[test]
    fn unavailable_without_backend_is_a_construction_error() {
        // The error variant exists regardless of the feature; with the
        // backend compiled in, construction succeeds.
        assert!(PreCorrelationFftFlagger::new(config(), NR_SAMPLES, false, None).is_ok());
    }
}
