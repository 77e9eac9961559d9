//! Flagging detector primitives.
//!
//! These are the stateless window passes; the [`crate::flagger::Flagger`]
//! façade owns the statistics and iteration schedules that drive them.
//! Every pass reports the number of cells it newly flagged, except the SIR
//! operator which reports the total after dilation.

mod sir;
mod sum_threshold;
mod threshold;

pub use sir::{sir_operator_1d, sir_operator_2d};
pub use sum_threshold::{
    sum_threshold_1d, sum_threshold_2d_horizontal, sum_threshold_2d_vertical,
    threshold_for_window,
};
pub use threshold::{threshold_1d, threshold_2d};
