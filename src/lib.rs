//! rfi-core: online radio-frequency-interference detection for streaming
//! correlation pipelines.
//!
//! For each second of complex voltage samples (or of correlated
//! visibilities downstream), the core classifies channel/time cells as
//! clean or contaminated, optionally replaces contaminated samples with
//! statistically plausible substitutes, and feeds long-running statistics
//! into per-key histories that gate whole seconds whose power drifts
//! upward.
//!
//! ## Architecture
//!
//! - **Statistics primitives**: robust mean / median / winsorized
//!   estimators on partially-flagged data
//! - **Detectors**: SumThreshold (1-D/2-D), simple thresholding, and the
//!   scale-invariant-rank dilation
//! - **Flagger façade**: kind dispatch plus the smoothed and
//!   history-gated combinators
//! - **Pipelines**: pre-correlation (with channels), pre-correlation
//!   single-channel (FFT round trip), and post-correlation per-baseline
//!
//! A pipeline instance is single-threaded: construct it with an immutable
//! [`FlaggerConfig`], then submit `flag(...)` calls in ascending
//! `global_time` order. Instances share no mutable state and may run in
//! parallel with each other.

pub mod config;
pub mod convolution;
pub mod detector;
pub mod diagnostics;
pub mod flagger;
pub mod frame;
pub mod grid;
pub mod history;
pub mod pipeline;
pub mod statistics;

// Re-export the configuration surface
pub use config::{
    DetectorKind, FlaggerConfig, ReplacementPolicy, StatsKind, NR_POLARIZATIONS,
};

// Re-export the numeric core
pub use flagger::Flagger;
pub use grid::Grid2D;
pub use history::{FlaggerHistory, HISTORY_SIZE, MIN_HISTORY_SIZE};
pub use statistics::SampleStats;

// Re-export the frame types
pub use frame::{
    BandpassTable, CorrelatedVisibilities, FilteredVoltages, SparseTimeSet,
};

// Re-export the pipelines
pub use pipeline::{
    PipelineError, PostCorrelationFlagger, PreCorrelationFftFlagger, PreCorrelationFlagger,
};
