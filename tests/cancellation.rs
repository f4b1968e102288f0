mod common;

use std::sync::Arc;
use std::time::Duration;

use balanced_retry::testing::ScriptedLoadBalancer;
use balanced_retry::{
    BackoffConfig, ConnectivityError, LoadBalancerError, LoadBalancerEvent, MemorySink,
    RequestFactory, RetryPolicyConfig, TokioSleeper,
};
use tokio_util::sync::CancellationToken;

use common::test_helpers::{get, instance, retrying, SERVICE};

fn slow_backoff() -> RetryPolicyConfig {
    RetryPolicyConfig::default().with_attempts(3, 1).with_backoff(BackoffConfig {
        enabled: true,
        min_backoff_ms: 1_000,
        max_backoff_ms: None,
        jitter: 0.0,
    })
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff_sleep() {
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a")]));
    lb.fail_instance("a", ConnectivityError::timeout("slow"));
    let token = CancellationToken::new();
    let trigger = token.clone();
    lb.on_attempt(move |_| {
        let trigger = trigger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
    });
    let sink = MemorySink::new();
    let client = retrying(lb.clone(), RequestFactory::default(), slow_backoff())
        .with_sleeper(TokioSleeper)
        .with_sink(sink.clone());

    let started = tokio::time::Instant::now();
    let err = client.execute_with_cancellation(SERVICE, get("/slow"), &token).await.unwrap_err();

    assert!(matches!(err, LoadBalancerError::Cancelled { attempts: 1, .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(lb.attempts().len(), 1);
    assert_eq!(sink.count(|e| matches!(e, LoadBalancerEvent::RetryScheduled { .. })), 1);
    assert_eq!(sink.count(|e| matches!(e, LoadBalancerEvent::Exhausted { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn uncancelled_call_waits_out_backoff() {
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a")]));
    lb.push_failure(ConnectivityError::timeout("slow"));
    let client = retrying(lb.clone(), RequestFactory::default(), slow_backoff()).with_sleeper(TokioSleeper);

    let started = tokio::time::Instant::now();
    let response = client
        .execute_with_cancellation(SERVICE, get("/slow"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(lb.attempts().len(), 2);
}

#[tokio::test]
async fn cancelled_before_failover_skips_selection() {
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a"), instance("b")]));
    lb.fail_instance("a", ConnectivityError::connect("refused"));
    let token = CancellationToken::new();
    let trigger = token.clone();
    lb.on_attempt(move |_| trigger.cancel());
    let client = retrying(lb.clone(), RequestFactory::default(), RetryPolicyConfig::default().with_attempts(1, 1));

    let err = client.execute_with_cancellation(SERVICE, get("/x"), &token).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(lb.selections(), 1);
    assert_eq!(lb.attempts_on("b"), 0);
}
