//! GuardEvaluator: caching, aggregation, failure shaping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use vigil::core::guard::{GuardEvaluator, GuardFault, GuardProbe};

/// Guard with a fixed verdict and an evaluation counter.
struct CountingGuard {
    pass: bool,
    evaluations: AtomicU32,
}

impl CountingGuard {
    fn new(pass: bool) -> Arc<Self> {
        Arc::new(Self {
            pass,
            evaluations: AtomicU32::new(0),
        })
    }

    fn count(&self) -> u32 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuardProbe for CountingGuard {
    async fn check(&self) -> Result<(), GuardFault> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if self.pass {
            Ok(())
        } else {
            Err(GuardFault::new("interface-down", "eth0 has no carrier"))
        }
    }
}

/// Guard that never answers; used to trip the per-guard timeout.
struct StuckGuard;

#[async_trait]
impl GuardProbe for StuckGuard {
    async fn check(&self) -> Result<(), GuardFault> {
        std::future::pending().await
    }
}

fn evaluator(guards: Vec<(&str, Arc<dyn GuardProbe>)>) -> GuardEvaluator {
    let map: HashMap<String, Arc<dyn GuardProbe>> = guards
        .into_iter()
        .map(|(name, guard)| (name.to_string(), guard))
        .collect();
    GuardEvaluator::new(map)
}

#[tokio::test]
async fn empty_reference_list_passes() {
    let eval = evaluator(vec![]);
    assert!(eval.evaluate(&[]).await.all_passed);
}

#[tokio::test]
async fn aggregate_is_the_and_of_all_guards() {
    let good = CountingGuard::new(true);
    let bad = CountingGuard::new(false);
    let eval = evaluator(vec![("net", good), ("vpn", bad)]);

    let verdict = eval
        .evaluate(&["net".to_string(), "vpn".to_string()])
        .await;
    assert!(!verdict.all_passed);
    assert_eq!(verdict.failures.len(), 1);
    assert_eq!(verdict.failures[0].name, "vpn");
    assert_eq!(verdict.failures[0].fault.code, "interface-down");
}

#[tokio::test]
async fn unknown_reference_fails_with_machine_readable_code() {
    let eval = evaluator(vec![]);
    let verdict = eval.evaluate(&["missing".to_string()]).await;
    assert!(!verdict.all_passed);
    assert_eq!(verdict.failures[0].fault.code, "unknown-guard");
}

#[tokio::test]
async fn results_are_cached_within_the_ttl() {
    let guard = CountingGuard::new(false);
    let eval = evaluator(vec![("net", guard.clone() as Arc<dyn GuardProbe>)]);

    let refs = vec!["net".to_string()];
    assert!(!eval.evaluate(&refs).await.all_passed);
    assert!(!eval.evaluate(&refs).await.all_passed);
    assert_eq!(guard.count(), 1, "second evaluation must hit the cache");
}

#[tokio::test]
async fn expired_cache_entries_are_re_evaluated() {
    let guard = CountingGuard::new(true);
    let eval = evaluator(vec![("net", guard.clone() as Arc<dyn GuardProbe>)])
        .with_limits(Duration::ZERO, Duration::from_secs(2));

    let refs = vec!["net".to_string()];
    eval.evaluate(&refs).await;
    eval.evaluate(&refs).await;
    assert_eq!(guard.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stuck_guard_times_out_as_a_failure() {
    let eval = evaluator(vec![("stuck", Arc::new(StuckGuard) as Arc<dyn GuardProbe>)]);
    let verdict = eval.evaluate(&["stuck".to_string()]).await;
    assert!(!verdict.all_passed);
    assert_eq!(verdict.failures[0].fault.code, "timeout");
}

#[tokio::test]
async fn replacing_guards_clears_the_cache() {
    let old = CountingGuard::new(false);
    let eval = evaluator(vec![("net", old as Arc<dyn GuardProbe>)]);
    let refs = vec!["net".to_string()];
    assert!(!eval.evaluate(&refs).await.all_passed);

    let fresh = CountingGuard::new(true);
    let mut map: HashMap<String, Arc<dyn GuardProbe>> = HashMap::new();
    map.insert("net".to_string(), fresh as Arc<dyn GuardProbe>);
    eval.replace_guards(map);

    assert!(
        eval.evaluate(&refs).await.all_passed,
        "stale cached failure served after replacement"
    );
}
