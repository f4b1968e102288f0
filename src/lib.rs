#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # balanced-retry
//!
//! Load-balanced request execution with bounded, instance-aware retries.
//!
//! A caller addresses a logical service (`http://users/profile`). At call time the request is
//! bound to a concrete instance chosen by a [`LoadBalancer`], rewritten by an ordered list of
//! [`RequestTransformer`]s, and executed. The retrying interceptor retries on the same instance
//! up to one budget, then fails over to other instances up to a second budget.
//!
//! ## Features
//!
//! - **Plain and retrying interceptors**, picked once from [`RetryProperties`]
//! - **Per-service retry policies** with a lock-free registry
//! - **Exponential backoff** with jitter, disabled by default
//! - **Cancellation** between attempts via `tokio_util::sync::CancellationToken`
//! - **Structured events** through tower-service sinks, plus `tracing` logs
//! - **Configuration rebinding** for configuration-bound objects
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use balanced_retry::testing::ScriptedLoadBalancer;
//! use balanced_retry::{
//!     ClientInterceptor, ConnectivityError, Interceptor, OutboundRequest, RequestFactory,
//!     RetryPolicyConfig, RetryProperties, ServiceInstance,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let balancer = Arc::new(ScriptedLoadBalancer::new().with_instances([
//!         ServiceInstance::new("users", "10.0.0.1", 8080),
//!         ServiceInstance::new("users", "10.0.0.2", 8080),
//!     ]));
//!     balancer.push_failure(ConnectivityError::connect("connection refused"));
//!
//!     let props = RetryProperties::default()
//!         .with_service("users", RetryPolicyConfig::default().with_attempts(1, 1));
//!     let client = Interceptor::from_properties(balancer.clone(), RequestFactory::default(), &props)
//!         .unwrap();
//!
//!     let response = client
//!         .intercept(OutboundRequest::get("http://users/profile".parse().unwrap()))
//!         .await
//!         .unwrap();
//!     assert!(response.status().is_success());
//!     assert_eq!(balancer.attempts().len(), 2);
//! }
//! ```

pub mod backoff;
pub mod balancer;
pub mod config;
pub mod error;
pub mod instance;
pub mod interceptor;
pub mod policy;
pub mod prelude;
pub mod rebind;
pub mod request;
pub mod retry;
pub mod telemetry;
pub mod testing;
pub mod transform;

// Re-exports
pub use backoff::{Backoff, RecordingSleeper, Sleeper, TokioSleeper, MAX_BACKOFF};
pub use balancer::LoadBalancer;
pub use config::{BackoffConfig, RetryPolicyConfig, RetryProperties};
pub use error::{
    ConfigError, ConnectivityError, ConnectivityErrorKind, LastOutcome, LoadBalancerError,
};
pub use instance::ServiceInstance;
pub use interceptor::{ClientInterceptor, Interceptor, LoadBalancedService, LoadBalancerInterceptor};
pub use policy::{
    ConfiguredRetryPolicy, LoadBalancedRetryPolicy, NeverRetryPolicy, RetryContext,
    RetryPolicyFactory, RetryPolicyRegistry,
};
pub use rebind::{BoundConfig, ConfigurationRebinder, EnvironmentChangeEvent, RebindError, Rebindable};
pub use request::{is_safe_method, reconstruct_uri, service_name_of, OutboundRequest, Response};
pub use retry::RetryLoadBalancerInterceptor;
pub use telemetry::{BypassReason, EventSink, LoadBalancerEvent, LogSink, MemorySink, NullSink};
pub use transform::{InstanceAwareRequest, RequestFactory, RequestFactoryBuilder, RequestTransformer};
