//! Adaptive cadence computation: strategy precedence, floors, clamps.

use vigil::core::scheduler::{
    compute_interval, CadenceInputs, MAX_INTERVAL_SEC, MIN_INTERVAL_SEC, STABLE_CEILING_SEC,
};
use vigil::core::types::{ChannelHealth, ChannelState, IntervalReason, Priority, Sample};

fn state(health: ChannelHealth, failures: u32) -> ChannelState {
    ChannelState {
        state: health,
        consecutive_failures: failures,
        last_sample: Some(if failures > 0 {
            Sample::failed("api", 1, "timeout")
        } else {
            Sample::ok("api", 1, 5)
        }),
        ..Default::default()
    }
}

fn inputs<'a>(
    baseline: u32,
    jitter: u8,
    priority: Priority,
    threshold: u32,
    state: &'a ChannelState,
) -> CadenceInputs<'a> {
    CadenceInputs {
        baseline_sec: baseline,
        jitter_pct: jitter,
        priority,
        threshold,
        state,
        watch_override_sec: None,
    }
}

fn secs(inputs: &CadenceInputs<'_>) -> f64 {
    compute_interval(inputs, &mut rand::rng()).interval.as_secs_f64()
}

#[test]
fn crisis_accelerates_below_baseline_but_never_below_floor() {
    let offline = state(ChannelHealth::Offline, 3);
    let inp = inputs(300, 0, Priority::Medium, 3, &offline);
    let decision = compute_interval(&inp, &mut rand::rng());
    assert_eq!(decision.reason, IntervalReason::Crisis);
    let secs = decision.interval.as_secs_f64();
    assert!(secs < 300.0, "crisis must run faster than baseline: {secs}");
    assert!(secs >= f64::from(MIN_INTERVAL_SEC));
}

#[test]
fn deep_failure_streak_still_respects_hard_floor() {
    let offline = state(ChannelHealth::Offline, 10);
    let inp = inputs(300, 0, Priority::Medium, 3, &offline);
    assert!(secs(&inp) >= f64::from(MIN_INTERVAL_SEC));

    let critical = inputs(300, 0, Priority::Critical, 3, &offline);
    assert!(secs(&critical) >= f64::from(MIN_INTERVAL_SEC));
}

#[test]
fn crisis_interval_decreases_as_the_streak_grows() {
    let mut previous = f64::MAX;
    for failures in 3..9u32 {
        let offline = state(ChannelHealth::Offline, failures);
        let inp = inputs(600, 0, Priority::Medium, 3, &offline);
        let current = secs(&inp);
        assert!(
            current <= previous,
            "interval grew from {previous} to {current} at {failures} failures"
        );
        previous = current;
    }
}

#[test]
fn crisis_never_exceeds_baseline_even_with_jitter() {
    let offline = state(ChannelHealth::Offline, 3);
    for _ in 0..200 {
        let inp = inputs(30, 50, Priority::Low, 3, &offline);
        let secs = secs(&inp);
        assert!(secs <= 30.0 + f64::EPSILON, "crisis slower than baseline: {secs}");
        assert!(secs >= f64::from(MIN_INTERVAL_SEC));
    }
}

#[test]
fn critical_priority_accelerates_harder_than_medium() {
    let offline = state(ChannelHealth::Offline, 5);
    let medium = inputs(600, 0, Priority::Medium, 3, &offline);
    let critical = inputs(600, 0, Priority::Critical, 3, &offline);
    assert!(secs(&critical) < secs(&medium));
}

#[test]
fn recovery_probes_gently_faster() {
    let recovering = state(ChannelHealth::Unknown, 1);
    let inp = inputs(60, 0, Priority::Medium, 3, &recovering);
    let decision = compute_interval(&inp, &mut rand::rng());
    assert_eq!(decision.reason, IntervalReason::Recovery);
    assert_eq!(decision.interval.as_secs(), 30);

    // Floor applies for fast baselines.
    let fast = inputs(20, 0, Priority::Medium, 3, &recovering);
    assert_eq!(compute_interval(&fast, &mut rand::rng()).interval.as_secs(), 15);
}

#[test]
fn stable_uses_baseline_capped_by_ceiling() {
    let online = state(ChannelHealth::Online, 0);
    let inp = inputs(60, 0, Priority::Medium, 3, &online);
    let decision = compute_interval(&inp, &mut rand::rng());
    assert_eq!(decision.reason, IntervalReason::Stable);
    assert_eq!(decision.interval.as_secs(), 60);

    let slow = inputs(3600, 0, Priority::Medium, 3, &online);
    assert_eq!(
        compute_interval(&slow, &mut rand::rng()).interval.as_secs(),
        u64::from(STABLE_CEILING_SEC)
    );
}

#[test]
fn watch_override_takes_precedence_over_everything() {
    let offline = state(ChannelHealth::Offline, 7);
    let mut inp = inputs(600, 0, Priority::Medium, 3, &offline);
    inp.watch_override_sec = Some(15);
    let decision = compute_interval(&inp, &mut rand::rng());
    assert_eq!(decision.reason, IntervalReason::Watch);
    assert_eq!(decision.interval.as_secs(), 15);
}

#[test]
fn watch_interval_with_jitter_stays_in_band() {
    let online = state(ChannelHealth::Online, 0);
    for _ in 0..200 {
        let mut inp = inputs(600, 10, Priority::Medium, 3, &online);
        inp.watch_override_sec = Some(15);
        let secs = secs(&inp);
        assert!((13.5..=16.5).contains(&secs), "outside jitter band: {secs}");
    }
}

#[test]
fn every_computation_lands_in_the_global_bounds() {
    let states = [
        state(ChannelHealth::Online, 0),
        state(ChannelHealth::Unknown, 0),
        state(ChannelHealth::Unknown, 2),
        state(ChannelHealth::Offline, 3),
        state(ChannelHealth::Offline, 50),
    ];
    let priorities = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];
    for st in &states {
        for &priority in &priorities {
            for baseline in [10u32, 60, 300, 3600] {
                for jitter in [0u8, 10, 50] {
                    let inp = CadenceInputs {
                        baseline_sec: baseline,
                        jitter_pct: jitter,
                        priority,
                        threshold: 3,
                        state: st,
                        watch_override_sec: None,
                    };
                    let secs = secs(&inp);
                    assert!(
                        (f64::from(MIN_INTERVAL_SEC)..=f64::from(MAX_INTERVAL_SEC))
                            .contains(&secs),
                        "out of bounds: {secs}"
                    );
                }
            }
        }
    }
}

#[test]
fn priority_watch_defaults_scale_with_urgency() {
    assert_eq!(Priority::Critical.watch_interval_sec(), 10);
    assert_eq!(Priority::High.watch_interval_sec(), 15);
    assert_eq!(Priority::Medium.watch_interval_sec(), 30);
    assert_eq!(Priority::Low.watch_interval_sec(), 60);
}
