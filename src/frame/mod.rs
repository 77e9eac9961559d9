//! Frame buffers exchanged with the surrounding pipeline: filtered
//! voltages before correlation, visibilities after, and the bandpass
//! correction table.
//!
//! All multi-dimensional containers are single contiguous buffers with
//! strided indexing; the shape is part of the type.

mod bandpass;
mod visibilities;
mod voltages;

pub use bandpass::{BandpassError, BandpassTable};
pub use visibilities::{
    baseline_count, baseline_index, baseline_is_autocorrelation, baseline_stations,
    CorrelatedVisibilities,
};
pub use voltages::{FilteredVoltages, SparseTimeSet};

use num_complex::Complex32;

/// Power of one complex sample, |v|² = re² + im².
#[inline]
pub fn power(sample: Complex32) -> f32 {
    sample.re * sample.re + sample.im * sample.im
}
