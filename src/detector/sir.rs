//! Scale-invariant-rank (SIR) morphological dilation.
//!
//! A forward-then-backward credit sweep widens flagged runs in proportion
//! to their own length and fills small holes between them, while leaving
//! the scale of the flagged regions intact. η ∈ (0, 1) sets the
//! aggressiveness: 0 is the identity, 1 flags everything.

use crate::grid::Grid2D;

/// Dilate `flags` in place. Returns the **total** number of flagged
/// samples after dilation, not the newly flagged count.
pub fn sir_operator_1d(flags: &mut [bool], eta: f32) -> usize {
    let mut temp = vec![false; flags.len()];

    // credit ← max(0, credit) + w(f[i]), with w = η for flagged samples
    // and η − 1 for clean ones.
    let mut credit = 0.0f32;
    for (i, &flag) in flags.iter().enumerate() {
        let w = if flag { eta } else { eta - 1.0 };
        credit = credit.max(0.0) + w;
        temp[i] = credit >= 0.0;
    }

    // The same recurrence, right to left; a sample stays flagged if either
    // sweep accepts it.
    credit = 0.0;
    for i in (0..flags.len()).rev() {
        let w = if flags[i] { eta } else { eta - 1.0 };
        credit = credit.max(0.0) + w;
        flags[i] = credit >= 0.0 || temp[i];
    }

    flags.iter().filter(|&&f| f).count()
}

/// Apply the 1-D operator along every time row, then along every channel
/// column. Returns the sum of the per-sweep totals.
pub fn sir_operator_2d(flags: &mut Grid2D<bool>, eta: f32) -> usize {
    let nr_channels = flags.rows();
    let nr_blocks = flags.cols();
    let mut count = 0;

    let mut sweep = vec![false; nr_blocks];
    for channel in 0..nr_channels {
        sweep.copy_from_slice(flags.row(channel));
        count += sir_operator_1d(&mut sweep, eta);
        flags.row_mut(channel).copy_from_slice(&sweep);
    }

    let mut sweep = vec![false; nr_channels];
    for block in 0..nr_blocks {
        for channel in 0..nr_channels {
            sweep[channel] = flags.get(channel, block);
        }
        count += sir_operator_1d(&mut sweep, eta);
        for channel in 0..nr_channels {
            flags.set(channel, block, sweep[channel]);
        }
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_zero_is_the_identity() {
        let mut flags = [true, false, false, true, false];
        let before = flags;
        let total = sir_operator_1d(&mut flags, 0.0);
        assert_eq!(flags, before);
        assert_eq!(total, 2);
    }

    #[test]
    fn eta_one_flags_everything() {
        let mut flags = [false, false, true, false, false];
        let total = sir_operator_1d(&mut flags, 1.0);
        assert_eq!(total, flags.len());
        assert!(flags.iter().all(|&f| f));
    }

    #[test]
    fn all_clean_input_stays_clean() {
        let mut flags = [false; 16];
        assert_eq!(sir_operator_1d(&mut flags, 0.4), 0);
        assert!(flags.iter().all(|&f| !f));
    }

    #[test]
    fn fills_a_short_hole_between_runs() {
        // Two runs of two build enough credit at η = 0.4 to bridge the
        // two-sample gap from both sides.
        let mut flags = [true, true, false, false, true, true];
        sir_operator_1d(&mut flags, 0.4);
        assert!(flags.iter().all(|&f| f), "hole should be filled, got {flags:?}");
    }

    #[test]
    fn isolated_flag_at_low_eta_does_not_spread() {
        // A single flagged sample earns credit η = 0.4, which the next
        // clean sample (η − 1 = −0.6) immediately exhausts.
        let mut flags = [true, false, false, false, true];
        sir_operator_1d(&mut flags, 0.4);
        assert_eq!(flags, [true, false, false, false, true]);
    }

    #[test]
    fn eta_half_dilates_one_sample_each_side() {
        let mut flags = [false, false, true, false, false];
        let total = sir_operator_1d(&mut flags, 0.5);
        assert_eq!(flags, [false, true, true, true, false]);
        assert_eq!(total, 3);
    }

    #[test]
    fn two_d_sweeps_rows_then_columns() {
        // A fully flagged row dilates into its neighbours during the
        // column sweep at η = 0.5.
        let mut flags = Grid2D::<bool>::new(5, 4);
        flags.row_mut(2).fill(true);
        sir_operator_2d(&mut flags, 0.5);
        for time in 0..4 {
            assert!(flags.get(1, time), "row above should be dilated");
            assert!(flags.get(3, time), "row below should be dilated");
            assert!(!flags.get(0, time));
            assert!(!flags.get(4, time));
        }
    }
}
