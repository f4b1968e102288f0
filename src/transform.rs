//! Request transformer pipeline and deferred, instance-aware requests.
//!
//! A [`RequestFactory`] captures the ordered transformer list once; [`RequestFactory::create`]
//! wraps a raw request into an [`InstanceAwareRequest`], which is bound to an instance on every
//! attempt. Binding never caches: each call rewrites the URI and re-runs every transformer
//! against the instance it is given.
//!
//! ```rust
//! use balanced_retry::{OutboundRequest, RequestFactory, ServiceInstance};
//! use http::{HeaderName, HeaderValue};
//!
//! let factory = RequestFactory::builder()
//!     .transformer(|req: OutboundRequest, inst: &ServiceInstance| {
//!         let zone = inst.metadata().get("zone").cloned().unwrap_or_default();
//!         match HeaderValue::from_str(&zone) {
//!             Ok(v) => req.with_header(HeaderName::from_static("x-zone"), v),
//!             Err(_) => req,
//!         }
//!     })
//!     .build();
//!
//! let pending = factory.create(OutboundRequest::get("http://users/me".parse().unwrap()));
//! let inst = ServiceInstance::new("users", "10.1.0.4", 8080).with_metadata("zone", "eu-1");
//! let bound = pending.bind(&inst, 1).unwrap();
//! assert_eq!(bound.uri().to_string(), "http://10.1.0.4:8080/me");
//! assert_eq!(bound.headers()["x-zone"], "eu-1");
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::ConnectivityError;
use crate::instance::ServiceInstance;
use crate::request::{reconstruct_uri, OutboundRequest};

/// Rewrites a request once its target instance is known.
///
/// Implementations must be pure and total. To skip, return the input unchanged.
pub trait RequestTransformer: Send + Sync {
    fn transform(&self, request: OutboundRequest, instance: &ServiceInstance) -> OutboundRequest;
}

impl<F> RequestTransformer for F
where
    F: Fn(OutboundRequest, &ServiceInstance) -> OutboundRequest + Send + Sync,
{
    fn transform(&self, request: OutboundRequest, instance: &ServiceInstance) -> OutboundRequest {
        self(request, instance)
    }
}

type Pipeline = Arc<[Arc<dyn RequestTransformer>]>;

/// Builds [`InstanceAwareRequest`]s that share one ordered transformer pipeline.
#[derive(Clone)]
pub struct RequestFactory {
    transformers: Pipeline,
}

impl fmt::Debug for RequestFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFactory").field("transformers", &self.transformers.len()).finish()
    }
}

impl Default for RequestFactory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RequestFactory {
    /// Create a factory from transformers in the order they should run.
    pub fn new(transformers: Vec<Arc<dyn RequestTransformer>>) -> Self {
        Self { transformers: transformers.into() }
    }

    /// Start an empty pipeline; transformers run in the order they are added.
    pub fn builder() -> RequestFactoryBuilder {
        RequestFactoryBuilder::default()
    }

    /// True when binding only rewrites the URI.
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Wrap a raw request. Done once per logical call.
    pub fn create(&self, request: OutboundRequest) -> InstanceAwareRequest {
        InstanceAwareRequest { raw: request, transformers: self.transformers.clone() }
    }
}

/// Collects transformers in registration order.
#[derive(Default)]
pub struct RequestFactoryBuilder {
    transformers: Vec<Arc<dyn RequestTransformer>>,
}

impl RequestFactoryBuilder {
    /// Append `transformer` to the end of the pipeline.
    pub fn transformer<T>(mut self, transformer: T) -> Self
    where
        T: RequestTransformer + 'static,
    {
        self.transformers.push(Arc::new(transformer));
        self
    }

    /// Freeze the pipeline into a shareable factory.
    pub fn build(self) -> RequestFactory {
        RequestFactory::new(self.transformers)
    }
}

/// A raw request waiting for an instance.
#[derive(Clone)]
pub struct InstanceAwareRequest {
    raw: OutboundRequest,
    transformers: Pipeline,
}

impl fmt::Debug for InstanceAwareRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceAwareRequest")
            .field("raw", &self.raw)
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

impl InstanceAwareRequest {
    /// The request as the caller issued it, service-addressed.
    pub fn raw(&self) -> &OutboundRequest {
        &self.raw
    }

    /// Resolve against `instance` for the given 1-based attempt.
    ///
    /// Fails with [`ConnectivityErrorKind::InvalidAddress`](crate::ConnectivityErrorKind) when
    /// the instance address cannot be used; no transformer runs in that case.
    pub fn bind(&self, instance: &ServiceInstance, attempt: usize) -> Result<OutboundRequest, ConnectivityError> {
        let uri = match reconstruct_uri(instance, self.raw.uri()) {
            Ok(uri) => uri,
            Err(error) => {
                warn!(target: "balanced_retry::transform", instance = %instance, attempt, error = %error, "cannot bind request to instance");
                return Err(error);
            }
        };
        let resolved = self.raw.clone().with_uri(uri).with_attempt(attempt);
        Ok(self
            .transformers
            .iter()
            .fold(resolved, |request, transformer| transformer.transform(request, instance)))
    }
}
