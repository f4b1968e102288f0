//! Interceptors: the plain single-attempt path, construction-time composition, and a tower
//! `Service` front end.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tower::Service;
use tracing::debug;

use crate::balancer::LoadBalancer;
use crate::config::RetryProperties;
use crate::error::{ConfigError, LoadBalancerError};
use crate::policy::RetryPolicyRegistry;
use crate::request::{service_name_of, OutboundRequest, Response};
use crate::retry::RetryLoadBalancerInterceptor;
use crate::telemetry::{emit_best_effort, EventSink, LoadBalancerEvent, NullSink};
use crate::transform::RequestFactory;

/// Executes service-addressed requests against a concrete instance.
#[async_trait]
pub trait ClientInterceptor: Send + Sync {
    /// Execute `request` against an instance of `service`.
    async fn execute(&self, service: &str, request: OutboundRequest) -> Result<Response, LoadBalancerError>;

    /// Execute `request`, taking the service name from its URI host.
    async fn intercept(&self, request: OutboundRequest) -> Result<Response, LoadBalancerError> {
        let service = service_name_of(request.uri())?.to_string();
        self.execute(&service, request).await
    }
}

/// One selection, one execution, failures propagated unchanged.
pub(crate) async fn execute_once(
    balancer: &dyn LoadBalancer,
    requests: &RequestFactory,
    service: &str,
    request: OutboundRequest,
) -> Result<Response, LoadBalancerError> {
    let pending = requests.create(request);
    balancer.execute(service, &pending).await
}

/// The no-retry path.
pub struct LoadBalancerInterceptor<S = NullSink> {
    balancer: Arc<dyn LoadBalancer>,
    requests: RequestFactory,
    sink: S,
}

impl LoadBalancerInterceptor<NullSink> {
    /// One attempt per call on whatever `balancer` chooses, with `requests` applied.
    pub fn new(balancer: Arc<dyn LoadBalancer>, requests: RequestFactory) -> Self {
        Self { balancer, requests, sink: NullSink }
    }
}

impl<S> LoadBalancerInterceptor<S> {
    /// Report completed calls to `sink`.
    pub fn with_sink<T>(self, sink: T) -> LoadBalancerInterceptor<T> {
        LoadBalancerInterceptor { balancer: self.balancer, requests: self.requests, sink }
    }
}

#[async_trait]
impl<S: EventSink> ClientInterceptor for LoadBalancerInterceptor<S> {
    async fn execute(&self, service: &str, request: OutboundRequest) -> Result<Response, LoadBalancerError> {
        let started = Instant::now();
        let response = execute_once(self.balancer.as_ref(), &self.requests, service, request).await?;
        debug!(target: "balanced_retry::interceptor", service, status = %response.status(), "plain call completed");
        emit_best_effort(
            self.sink.clone(),
            LoadBalancerEvent::Succeeded {
                service: service.to_string(),
                attempts: 1,
                elapsed: started.elapsed(),
            },
        )
        .await;
        Ok(response)
    }
}

/// Plain or retrying, chosen once when the client is assembled.
pub enum Interceptor<S = NullSink> {
    Plain(LoadBalancerInterceptor<S>),
    Retrying(RetryLoadBalancerInterceptor<S>),
}

impl Interceptor<NullSink> {
    /// Retrying when `props.enabled`, plain otherwise.
    pub fn from_properties(
        balancer: Arc<dyn LoadBalancer>,
        requests: RequestFactory,
        props: &RetryProperties,
    ) -> Result<Self, ConfigError> {
        if props.enabled {
            let registry = RetryPolicyRegistry::from_properties(props)?;
            Ok(Self::Retrying(RetryLoadBalancerInterceptor::new(balancer, requests, Arc::new(registry))))
        } else {
            Ok(Self::Plain(LoadBalancerInterceptor::new(balancer, requests)))
        }
    }
}

impl<S> Interceptor<S> {
    /// True for the `Retrying` variant.
    pub fn is_retrying(&self) -> bool {
        matches!(self, Self::Retrying(_))
    }

    /// Move either variant onto `sink`.
    pub fn with_sink<T>(self, sink: T) -> Interceptor<T> {
        match self {
            Self::Plain(plain) => Interceptor::Plain(plain.with_sink(sink)),
            Self::Retrying(retrying) => Interceptor::Retrying(retrying.with_sink(sink)),
        }
    }
}

#[async_trait]
impl<S: EventSink> ClientInterceptor for Interceptor<S> {
    async fn execute(&self, service: &str, request: OutboundRequest) -> Result<Response, LoadBalancerError> {
        match self {
            Self::Plain(plain) => plain.execute(service, request).await,
            Self::Retrying(retrying) => retrying.execute(service, request).await,
        }
    }
}

/// Tower front end over a shared interceptor. Always ready.
pub struct LoadBalancedService<I> {
    interceptor: Arc<I>,
}

impl<I> LoadBalancedService<I> {
    /// Wrap `interceptor`; clones of the service share it.
    pub fn new(interceptor: I) -> Self {
        Self { interceptor: Arc::new(interceptor) }
    }
}

impl<I> Clone for LoadBalancedService<I> {
    fn clone(&self) -> Self {
        Self { interceptor: self.interceptor.clone() }
    }
}

impl<I> Service<OutboundRequest> for LoadBalancedService<I>
where
    I: ClientInterceptor + 'static,
{
    type Response = Response;
    type Error = LoadBalancerError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: OutboundRequest) -> Self::Future {
        let interceptor = self.interceptor.clone();
        Box::pin(async move { interceptor.intercept(request).await })
    }
}
