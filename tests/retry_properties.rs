mod common;

use std::sync::Arc;

use balanced_retry::testing::ScriptedLoadBalancer;
use balanced_retry::{
    ClientInterceptor, ConnectivityError, ConnectivityErrorKind, LoadBalancerError,
    LoadBalancerInterceptor, OutboundRequest, RequestFactory, RetryPolicyConfig,
};
use http::{Method, StatusCode};

use common::test_helpers::{get, instance, retrying, SERVICE};

fn pool(size: usize) -> Arc<ScriptedLoadBalancer> {
    let ids: Vec<String> = (0..size).map(|n| format!("i{}", n)).collect();
    let lb = ScriptedLoadBalancer::new().with_instances(ids.iter().map(|id| instance(id)));
    for id in &ids {
        lb.fail_instance(id.clone(), ConnectivityError::connect("refused"));
    }
    Arc::new(lb)
}

#[tokio::test]
async fn single_attempt_budget_matches_plain_interceptor() {
    let config = RetryPolicyConfig::default()
        .with_attempts(1, 0)
        .with_retryable_status_codes([503]);

    // retryable failure
    let retry_lb = pool(2);
    let plain_lb = pool(2);
    let retried = retrying(retry_lb.clone(), RequestFactory::default(), config.clone())
        .execute(SERVICE, get("/a"))
        .await
        .unwrap_err();
    let plain = LoadBalancerInterceptor::new(plain_lb.clone(), RequestFactory::default())
        .execute(SERVICE, get("/a"))
        .await
        .unwrap_err();
    assert_eq!(retry_lb.attempts().len(), 1);
    assert_eq!(plain_lb.attempts().len(), 1);
    assert_eq!(retried.connectivity(), plain.connectivity());
    assert!(matches!(retried, LoadBalancerError::Connectivity { .. }));

    // retryable status
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a")]));
    lb.push_status(StatusCode::SERVICE_UNAVAILABLE);
    let response = retrying(lb.clone(), RequestFactory::default(), config)
        .execute(SERVICE, get("/a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(lb.attempts().len(), 1);
}

#[tokio::test]
async fn attempts_never_exceed_budget_product() {
    for same in 1..=3 {
        for next in 0..=2 {
            let config = RetryPolicyConfig::default().with_attempts(same, next);
            let bound = config.max_total_attempts();
            let lb = pool(4);
            let _ = retrying(lb.clone(), RequestFactory::default(), config)
                .execute(SERVICE, get("/bounded"))
                .await;
            assert_eq!(lb.attempts().len(), bound, "same={same} next={next}");
        }
    }
}

#[tokio::test]
async fn reselecting_the_same_instance_still_terminates() {
    // A balancer that always returns the same member: failover budget is still consumed.
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("only")]));
    lb.fail_instance("only", ConnectivityError::connect("refused"));
    let err = retrying(lb.clone(), RequestFactory::default(), RetryPolicyConfig::default().with_attempts(2, 2))
        .execute(SERVICE, get("/loop"))
        .await
        .unwrap_err();
    assert_eq!(lb.attempts().len(), 6);
    assert_eq!(err.retry_exhausted_info(), Some((6, 1)));
}

#[tokio::test]
async fn non_retryable_failure_on_first_attempt_is_final() {
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a"), instance("b")]));
    lb.push_failure(ConnectivityError::new(ConnectivityErrorKind::Protocol, "malformed status line"));
    let err = retrying(lb.clone(), RequestFactory::default(), RetryPolicyConfig::default().with_attempts(5, 5))
        .execute(SERVICE, get("/x"))
        .await
        .unwrap_err();
    assert_eq!(lb.attempts().len(), 1);
    assert_eq!(err.connectivity().map(|e| e.kind()), Some(ConnectivityErrorKind::Protocol));
}

#[tokio::test]
async fn writes_execute_once_without_retry_on_all_operations() {
    let lb = pool(3);
    let write = OutboundRequest::post(format!("http://{}/orders", SERVICE).parse().unwrap(), "{}");
    let err = retrying(lb.clone(), RequestFactory::default(), RetryPolicyConfig::default().with_attempts(4, 4))
        .execute(SERVICE, write)
        .await
        .unwrap_err();
    assert_eq!(lb.attempts().len(), 1);
    assert!(matches!(err, LoadBalancerError::Connectivity { .. }));
}

#[tokio::test]
async fn writes_retry_when_all_operations_allowed() {
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a"), instance("b")]));
    lb.fail_instance("a", ConnectivityError::connect("refused"));
    let config = RetryPolicyConfig::default().with_attempts(1, 1).with_retry_on_all_operations(true);
    let put = OutboundRequest::new(Method::PUT, format!("http://{}/orders/1", SERVICE).parse().unwrap());
    let response = retrying(lb.clone(), RequestFactory::default(), config).execute(SERVICE, put).await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(lb.attempts().len(), 2);
}

#[tokio::test]
async fn empty_pool_during_failover_is_no_instance() {
    let lb = Arc::new(ScriptedLoadBalancer::new().with_choices([Some(instance("a")), None]));
    lb.fail_instance("a", ConnectivityError::connect("refused"));
    let err = retrying(lb.clone(), RequestFactory::default(), RetryPolicyConfig::default().with_attempts(1, 3))
        .execute(SERVICE, get("/x"))
        .await
        .unwrap_err();
    assert!(err.is_no_instance());
    assert_eq!(lb.attempts().len(), 1);
    assert_eq!(lb.selections(), 2);
}
