//! The load balancer boundary.
//!
//! Instance-selection math and the HTTP transport live behind this trait. Interceptors only
//! orchestrate around it, and work with either the separated `choose`/`execute_on` pair or the
//! combined `execute`.

use async_trait::async_trait;

use crate::error::{ConnectivityError, LoadBalancerError};
use crate::instance::ServiceInstance;
use crate::request::{OutboundRequest, Response};
use crate::transform::InstanceAwareRequest;

/// Selects live instances for a service name and executes requests against them.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Pick an instance for `service`, or `None` when there is nothing to call.
    async fn choose(&self, service: &str) -> Option<ServiceInstance>;

    /// Send an already-bound request to `instance`.
    async fn execute_on(
        &self,
        service: &str,
        instance: &ServiceInstance,
        request: OutboundRequest,
    ) -> Result<Response, ConnectivityError>;

    /// Select and execute in one step, binding `request` as attempt 1. An instance whose
    /// address cannot be bound fails without reaching the transport.
    ///
    /// Balancers that select atomically with execution override this.
    async fn execute(
        &self,
        service: &str,
        request: &InstanceAwareRequest,
    ) -> Result<Response, LoadBalancerError> {
        let instance = self
            .choose(service)
            .await
            .ok_or_else(|| LoadBalancerError::NoInstanceAvailable { service: service.to_string() })?;
        let connectivity =
            |source: ConnectivityError| LoadBalancerError::Connectivity { service: service.to_string(), source };
        let bound = request.bind(&instance, 1).map_err(connectivity)?;
        self.execute_on(service, &instance, bound).await.map_err(connectivity)
    }
}
