//! Flagger configuration and system-wide default constants.
//!
//! Centralises the tuning knobs shared by all three pipelines. Unknown
//! configuration strings fall back to the defaults with a logged warning
//! (the lenient path used by parset-style callers); the strict path
//! returns a structured [`ConfigError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

// ============================================================================
// Constants
// ============================================================================

/// Number of polarizations per station. Visibilities carry the full
/// `NR_POLARIZATIONS × NR_POLARIZATIONS` product.
pub const NR_POLARIZATIONS: usize = 2;

/// Default first threshold for the SumThreshold detector.
pub const DEFAULT_CUTOFF_THRESHOLD: f32 = 6.0;

/// Cutoff used by the FFT and post-correlation pipelines.
pub const PIPELINE_CUTOFF_THRESHOLD: f32 = 7.0;

/// Default detector sensitivity multiplier.
pub const DEFAULT_BASE_SENSITIVITY: f32 = 1.0;

/// Sensitivity for the single-channel FFT pipeline. 0.6 was empirically
/// found to be a good setting for LOFAR-class data.
pub const FFT_BASE_SENSITIVITY: f32 = 0.6;

/// Number of doubling-window SumThreshold iterations (windows 1..=64).
pub const MAX_SUM_THRESHOLD_ITERS: u32 = 7;

/// History flagger sensitivity, in units of standard deviation.
pub const HISTORY_FLAGGER_SENSITIVITY: f32 = 10.0;

/// Default η for the scale-invariant-rank operator.
pub const DEFAULT_SIR_ETA: f32 = 0.4;

/// FFT size of the single-channel pipeline.
pub const DEFAULT_FFT_SIZE: usize = 256;

/// At or above this many channels, the pre-correlation flagger integrates
/// all time samples into a single block per channel.
pub const MINIMUM_CHANNELS_FOR_FULL_INTEGRATION: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from the strict configuration-string parsers.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("illegal detector kind: {0:?}")]
    IllegalDetectorKind(String),

    #[error("illegal statistics kind: {0:?}")]
    IllegalStatsKind(String),

    #[error("illegal replacement policy: {0:?}")]
    IllegalReplacementPolicy(String),
}

// ============================================================================
// Detector / statistics kinds
// ============================================================================

/// Which detector the pipelines dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DetectorKind {
    /// Single-pass median + k·σ thresholding.
    Threshold,
    /// Iterative SumThreshold with doubling windows.
    #[default]
    SumThreshold,
}

impl DetectorKind {
    /// Strict parser for the `"THRESHOLD"` / `"SUM_THRESHOLD"` keys.
    pub fn try_parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "THRESHOLD" => Ok(Self::Threshold),
            "SUM_THRESHOLD" => Ok(Self::SumThreshold),
            _ => Err(ConfigError::IllegalDetectorKind(s.to_string())),
        }
    }

    /// Lenient parser: unknown strings fall back to [`DetectorKind::SumThreshold`]
    /// with a logged warning.
    pub fn parse_or_default(s: &str) -> Self {
        Self::try_parse(s).unwrap_or_else(|_| {
            warn!(given = s, "unknown detector kind, using default SUM_THRESHOLD");
            Self::SumThreshold
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "THRESHOLD",
            Self::SumThreshold => "SUM_THRESHOLD",
        }
    }
}

/// Which statistics the detectors are driven by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StatsKind {
    /// Plain mean / median / standard deviation.
    Normal,
    /// Statistics on data clamped to the 10th/90th percentiles.
    #[default]
    Winsorized,
}

impl StatsKind {
    /// Strict parser for the `"NORMAL"` / `"WINSORIZED"` keys.
    pub fn try_parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "NORMAL" => Ok(Self::Normal),
            "WINSORIZED" => Ok(Self::Winsorized),
            _ => Err(ConfigError::IllegalStatsKind(s.to_string())),
        }
    }

    /// Lenient parser: unknown strings fall back to [`StatsKind::Winsorized`]
    /// with a logged warning.
    pub fn parse_or_default(s: &str) -> Self {
        Self::try_parse(s).unwrap_or_else(|_| {
            warn!(given = s, "unknown statistics kind, using default WINSORIZED");
            Self::Winsorized
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Winsorized => "WINSORIZED",
        }
    }
}

/// How the FFT pipeline overwrites flagged samples.
///
/// Replacing with the mean power keeps the total signal power constant;
/// zeroing causes jumps in the output signal. Median is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplacementPolicy {
    /// Complex (0, 0).
    Zero,
    /// √(mean unflagged power) on the real axis.
    Mean,
    /// The first unflagged value. The name is historical.
    Random,
    /// The unflagged median value.
    #[default]
    Median,
}

impl ReplacementPolicy {
    pub fn try_parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "ZERO" => Ok(Self::Zero),
            "MEAN" => Ok(Self::Mean),
            "RANDOM" => Ok(Self::Random),
            "MEDIAN" => Ok(Self::Median),
            _ => Err(ConfigError::IllegalReplacementPolicy(s.to_string())),
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        Self::try_parse(s).unwrap_or_else(|_| {
            warn!(given = s, "unknown replacement policy, using default MEDIAN");
            Self::Median
        })
    }
}

// ============================================================================
// FlaggerConfig
// ============================================================================

/// Immutable configuration shared by the flagger façade and the pipelines.
///
/// A pipeline instance is constructed once with this struct and services
/// `flag(...)` calls for its lifetime; nothing here changes between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaggerConfig {
    /// Number of stations in the observation.
    pub nr_stations: usize,

    /// Number of subbands this instance can see over time.
    pub nr_subbands: usize,

    /// Channels per subband (1 selects the FFT pipeline).
    pub nr_channels: usize,

    /// First threshold of the SumThreshold iteration.
    pub cutoff_threshold: f32,

    /// Detector sensitivity multiplier applied on top of σ.
    pub base_sensitivity: f32,

    /// Detector dispatched by the pipelines.
    pub detector_kind: DetectorKind,

    /// Statistics driving the detectors.
    pub stats_kind: StatsKind,

    /// Number of doubling-window SumThreshold iterations.
    pub max_iters: u32,

    /// History-gate sensitivity in units of standard deviation.
    pub history_sensitivity: f32,

    /// η of the scale-invariant-rank dilation.
    pub sir_eta: f32,

    /// Enables the per-key history gates. Off in the reference setup.
    pub use_history: bool,

    /// Enables flagging in the frequency direction.
    pub flag_in_frequency_direction: bool,

    /// Enables flagging in the time direction.
    pub flag_in_time_direction: bool,

    /// Sample replacement policy of the FFT pipeline.
    pub replacement_policy: ReplacementPolicy,
}

impl Default for FlaggerConfig {
    fn default() -> Self {
        Self {
            nr_stations: 0,
            nr_subbands: 0,
            nr_channels: 0,
            cutoff_threshold: DEFAULT_CUTOFF_THRESHOLD,
            base_sensitivity: DEFAULT_BASE_SENSITIVITY,
            detector_kind: DetectorKind::default(),
            stats_kind: StatsKind::default(),
            max_iters: MAX_SUM_THRESHOLD_ITERS,
            history_sensitivity: HISTORY_FLAGGER_SENSITIVITY,
            sir_eta: DEFAULT_SIR_ETA,
            use_history: false,
            flag_in_frequency_direction: true,
            flag_in_time_direction: true,
            replacement_policy: ReplacementPolicy::default(),
        }
    }
}

impl FlaggerConfig {
    /// Convenience constructor with the observation shape filled in and
    /// every tunable at its default.
    pub fn new(nr_stations: usize, nr_subbands: usize, nr_channels: usize) -> Self {
        Self {
            nr_stations,
            nr_subbands,
            nr_channels,
            ..Self::default()
        }
    }
}
