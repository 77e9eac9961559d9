//! The three composed flagging pipelines.
//!
//! Each pipeline instance owns its scratch buffers and histories, is
//! constructed once with an immutable [`crate::config::FlaggerConfig`],
//! and services `flag(...)` calls in ascending `global_time` order.
//! Instances share no mutable state; different instances may run on
//! different cores.

mod post;
mod pre_channel;
mod pre_fft;

pub use post::PostCorrelationFlagger;
pub use pre_channel::PreCorrelationFlagger;
pub use pre_fft::{DebugSinks, PreCorrelationFftFlagger};

use thiserror::Error;

/// Construction-time pipeline errors. These are fatal: the pipeline
/// refuses to start. Recoverable per-call conditions are handled by
/// skipping the affected station or baseline instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("single-channel pipeline requires exactly 1 channel, got {got}")]
    ChannelCountUnsupported { got: usize },

    #[error("nr_samples_per_integration {nr_samples} is not a multiple of {divisor}")]
    IntegrationMismatch { nr_samples: usize, divisor: usize },

    #[error("bandpass table length {got} does not match the FFT size {expected}")]
    BandpassMismatch { expected: usize, got: usize },

    /// Returned by the FFT pipeline constructor when the crate was built
    /// without the `fft` feature.
    #[error("no FFT backend compiled in")]
    FftUnavailable,
}
