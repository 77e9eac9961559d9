//! Detector Regression Tests
//!
//! Exercises the flagger façade through its public API on literal inputs:
//! isolated spikes, all-zero series, pre-flagged data, SIR dilation and
//! history gating. Asserts the contract every flagging operation shares:
//! flags are monotone within a call and the returned count equals the
//! number of 0 → 1 transitions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rfi_core::detector::sir_operator_1d;
use rfi_core::{
    DetectorKind, Flagger, FlaggerConfig, FlaggerHistory, SampleStats, StatsKind,
    MIN_HISTORY_SIZE,
};

fn flagger(stats_kind: StatsKind, detector_kind: DetectorKind) -> Flagger {
    Flagger::new(FlaggerConfig {
        stats_kind,
        detector_kind,
        ..FlaggerConfig::new(2, 1, 64)
    })
}

/// An isolated spike on a quiet background is flagged, and only it.
#[test]
fn isolated_spike_is_flagged_with_count_one() {
    let flagger = flagger(StatsKind::Normal, DetectorKind::SumThreshold);
    let mut powers = vec![1.0f32; 64];
    powers[17] = 100.0;
    let mut flags = vec![false; 64];

    let newly = flagger.sum_threshold_flagger_1d(&powers, &mut flags, 1.0);

    assert_eq!(newly, 1);
    assert!(flags[17]);
    assert_eq!(flags.iter().filter(|&&f| f).count(), 1);
}

/// An all-zero series produces zero statistics, zero new flags and no
/// panic, for both detectors and both statistics kinds.
#[test]
fn all_zero_series_is_inert() {
    for stats_kind in [StatsKind::Normal, StatsKind::Winsorized] {
        for detector_kind in [DetectorKind::Threshold, DetectorKind::SumThreshold] {
            let flagger = flagger(stats_kind, detector_kind);
            let powers = vec![0.0f32; 8];
            let mut flags = vec![false; 8];

            assert_eq!(flagger.detect_1d(&powers, &mut flags, 1.0), 0);
            assert!(flags.iter().all(|&f| !f));

            let stats = flagger.calculate_statistics(&powers, &flags);
            assert_eq!(stats, SampleStats::default());
        }
    }
}

/// Winsorized mean of 1..10 with the last element pre-flagged: nine
/// unflagged values clamp at ⌊0.1·9⌋ = 0 (the minimum) and
/// ⌈0.9·9⌉ − 1 = 8 (the maximum), so nothing is clipped and the result
/// equals the plain mean, 5.0.
#[test]
fn winsorized_mean_with_preflagged_tail() {
    let powers: Vec<f32> = (1..=10).map(|v| v as f32).collect();
    let mut flags = vec![false; 10];
    flags[9] = true;

    let winsorized = rfi_core::statistics::winsorized_mean(&powers, &flags);
    let normal = rfi_core::statistics::flagged_mean(&powers, &flags);

    assert!((winsorized - 5.0).abs() < 1e-6, "got {winsorized}");
    assert!(
        (winsorized - normal).abs() < 1e-6,
        "below ten unflagged samples the winsorized and normal means agree"
    );
}

/// SIR edge cases: η = 0 is the identity, η = 1 flags everything, and at
/// η = 0.4 two flagged runs bridge a short gap while an isolated flag
/// stays isolated.
#[test]
fn sir_operator_scenarios() {
    let mut identity = [true, false, false, false, true];
    sir_operator_1d(&mut identity, 0.0);
    assert_eq!(identity, [true, false, false, false, true]);

    let mut everything = [false, false, true, false, false];
    let total = sir_operator_1d(&mut everything, 1.0);
    assert_eq!(total, 5);
    assert!(everything.iter().all(|&f| f));

    let mut bridged = [true, true, false, false, true, true];
    sir_operator_1d(&mut bridged, 0.4);
    assert!(bridged.iter().all(|&f| f), "gap should be bridged, got {bridged:?}");

    let mut isolated = [true, false, false, false, true];
    sir_operator_1d(&mut isolated, 0.4);
    assert_eq!(isolated, [true, false, false, false, true]);
}

/// History gate on 32 identical values: σ = 0 degenerates the threshold
/// to the mean, so the next higher value gates and the mean (not the
/// outlier) is stored back.
#[test]
fn history_gate_with_zero_sigma_baseline() {
    let mut history = FlaggerHistory::new();
    for _ in 0..MIN_HISTORY_SIZE {
        assert!(!history.add_gated(1.0, 10.0));
    }

    assert!(history.add_gated(2.0, 10.0), "2.0 > mean must gate at σ = 0");
    assert!((history.mean() - 1.0).abs() < 1e-6, "history must not be poisoned");
}

/// Flags set on entry survive, and the return value counts exactly the
/// 0 → 1 transitions of the call.
#[test]
fn flags_are_monotone_and_counted_exactly() {
    let flagger = flagger(StatsKind::Normal, DetectorKind::SumThreshold);
    let mut powers = vec![1.0f32; 64];
    powers[10] = 100.0;
    powers[40] = 90.0;
    let mut flags = vec![false; 64];
    flags[20] = true;
    flags[21] = true;

    let before = flags.iter().filter(|&&f| f).count();
    let newly = flagger.sum_threshold_flagger_1d(&powers, &mut flags, 1.0);
    let after = flags.iter().filter(|&&f| f).count();

    assert!(flags[20] && flags[21], "pre-set flags must survive");
    assert_eq!(newly, after - before, "count must equal the 0 -> 1 transitions");
    assert!(flags[10] && flags[40]);
}

/// With every cell flagged on entry, every detector reports zero.
#[test]
fn fully_flagged_input_short_circuits() {
    for detector_kind in [DetectorKind::Threshold, DetectorKind::SumThreshold] {
        let flagger = flagger(StatsKind::Winsorized, detector_kind);
        let powers = vec![123.0f32; 32];
        let mut flags = vec![true; 32];
        assert_eq!(flagger.detect_1d(&powers, &mut flags, 1.0), 0);
    }
}

/// On a bounded noise floor, the detector flags the injected spike and
/// nothing else: the robust statistics keep the threshold well above the
/// noise excursions.
#[test]
fn noise_floor_survives_while_spike_is_flagged() {
    let flagger = flagger(StatsKind::Winsorized, DetectorKind::SumThreshold);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut powers: Vec<f32> = (0..1024).map(|_| rng.gen_range(0.9..1.1)).collect();
    powers[300] = 100.0;
    let mut flags = vec![false; 1024];

    let newly = flagger.sum_threshold_flagger_1d(&powers, &mut flags, 1.0);

    assert_eq!(newly, 1, "only the spike should be flagged");
    assert!(flags[300]);
}

/// A second invocation corrects the statistics; a third adds nothing.
#[test]
fn sum_threshold_settles_after_two_passes() {
    let flagger = flagger(StatsKind::Winsorized, DetectorKind::SumThreshold);
    let mut powers = vec![2.0f32; 128];
    for (i, p) in powers.iter_mut().enumerate() {
        // Deterministic mild ripple so the statistics are not degenerate.
        *p += (i % 7) as f32 * 0.01;
    }
    powers[64] = 500.0;
    powers[65] = 480.0;
    let mut flags = vec![false; 128];

    flagger.sum_threshold_flagger_1d(&powers, &mut flags, 1.0);
    flagger.sum_threshold_flagger_1d(&powers, &mut flags, 1.0);
    let third = flagger.sum_threshold_flagger_1d(&powers, &mut flags, 1.0);

    assert_eq!(third, 0, "third pass on settled flags must add nothing");
    assert!(flags[64] && flags[65]);
}
