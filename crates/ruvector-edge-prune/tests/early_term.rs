//! Early termination driven the way the trainer drives it: one check per
//! recorded step over a growing log.

use ruvector_edge_prune::early_term::{COMPLEXITY_COLUMN, KL_COLUMN, TEMP_COLUMN};
use ruvector_edge_prune::{EarlyTermConfig, EarlyTermination, TrainingLog, Verdict};

const RECORD_EVERY: usize = 100;

/// Feed `max_steps` entries, checking every `RECORD_EVERY`. Returns the
/// step at which training would halt.
fn run(max_steps: usize, entry: impl Fn(usize) -> (f64, f64, f64)) -> (Option<usize>, TrainingLog) {
    let et = EarlyTermination::new(EarlyTermConfig::default());
    let mut log = TrainingLog::new(&[KL_COLUMN, COMPLEXITY_COLUMN, TEMP_COLUMN]);
    for i in 0..max_steps {
        let (kl, complexity, temp) = entry(i);
        log.add_entry(&[(KL_COLUMN, kl), (COMPLEXITY_COLUMN, complexity), (TEMP_COLUMN, temp)]);
        if log.t() % RECORD_EVERY == 0 {
            et.check(&mut log);
            if et.should_stop(&log) {
                return (Some(log.t()), log);
            }
        }
    }
    (None, log)
}

#[test]
fn test_flat_run_halts_after_threshold_checks() {
    let (halted, log) = run(5000, |_| (0.2, 30.0, 1e-4));
    // Checks start at 500; the tenth converged check is at 1400.
    assert_eq!(halted, Some(1400));
    assert_eq!(log.early_term_count, 10);
}

#[test]
fn test_oscillating_kl_never_halts() {
    let (halted, log) = run(5000, |i| {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / 400.0;
        (1.0 + 0.5 * phase.sin(), 30.0, 1e-4)
    });
    assert_eq!(halted, None);
    assert_eq!(log.early_term_count, 0);
}

#[test]
fn test_hot_temperature_never_halts() {
    let (halted, _) = run(3000, |_| (0.2, 30.0, 0.5));
    assert_eq!(halted, None);
}

#[test]
fn test_shrinking_circuit_delays_halt() {
    // Complexity keeps falling until step 1000, then settles.
    let (halted, _) = run(5000, |i| {
        let complexity = if i < 1000 { 100.0 - 0.05 * i as f64 } else { 50.0 };
        (0.2, complexity, 1e-4)
    });
    let step = halted.expect("settled run should halt");
    assert!(step >= 1000 + 900, "halted at {step}");
}

#[test]
fn test_warmup_verdict() {
    let et = EarlyTermination::default();
    let mut log = TrainingLog::new(&[KL_COLUMN, COMPLEXITY_COLUMN, TEMP_COLUMN]);
    log.add_entry(&[(KL_COLUMN, 0.1)]);
    assert_eq!(et.check(&mut log), Verdict::Warmup);
}
