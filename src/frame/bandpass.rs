//! Station polyphase-filter bandpass correction factors.
//!
//! The ripple of the station PPF causes false positives at specific
//! frequencies; one multiplication per bin removes the effect. The factors
//! themselves are produced outside this crate; the table here is read-only
//! and indexed by real-frequency (FFT-shifted) bin.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BandpassError {
    #[error("bandpass table length {got} does not match the FFT size {expected}")]
    LengthMismatch { expected: usize, got: usize },
}

/// Read-only per-bin correction factors, length = FFT size.
#[derive(Debug, Clone)]
pub struct BandpassTable {
    factors: Vec<f32>,
}

impl BandpassTable {
    /// Wrap caller-provided factors, checking the length against the FFT
    /// size they will be applied to.
    pub fn new(factors: Vec<f32>, fft_size: usize) -> Result<Self, BandpassError> {
        if factors.len() != fft_size {
            return Err(BandpassError::LengthMismatch {
                expected: fft_size,
                got: factors.len(),
            });
        }
        Ok(Self { factors })
    }

    /// Unit table for the correction-disabled case.
    pub fn flat(fft_size: usize) -> Self {
        Self {
            factors: vec![1.0; fft_size],
        }
    }

    pub fn correction_factors(&self) -> &[f32] {
        &self.factors
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}
