//! Convenient re-exports for building load-balanced clients.
pub use crate::{
    balancer::LoadBalancer,
    config::{BackoffConfig, RetryPolicyConfig, RetryProperties},
    error::{ConnectivityError, ConnectivityErrorKind, LoadBalancerError},
    instance::ServiceInstance,
    interceptor::{ClientInterceptor, Interceptor, LoadBalancedService},
    policy::{LoadBalancedRetryPolicy, RetryPolicyFactory, RetryPolicyRegistry},
    request::{OutboundRequest, Response},
    retry::RetryLoadBalancerInterceptor,
    telemetry::{EventSink, LoadBalancerEvent},
    transform::{RequestFactory, RequestTransformer},
};
