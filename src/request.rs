//! Outbound requests addressed to a service name, and their resolution to a concrete instance.

use bytes::Bytes;
use http::uri::{Authority, Scheme, Uri};
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::error::{ConnectivityError, ConnectivityErrorKind, LoadBalancerError};
use crate::instance::ServiceInstance;

/// Response type produced by the transport behind a [`LoadBalancer`](crate::LoadBalancer).
pub type Response = http::Response<Bytes>;

/// An outbound call. Immutable in spirit: transformers consume one and return a new one.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    attempt: usize,
}

impl OutboundRequest {
    /// Request with no headers and an empty body. `uri` names the service, not an instance.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, headers: HeaderMap::new(), body: Bytes::new(), attempt: 0 }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// POST carrying `body`.
    pub fn post(uri: Uri, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, uri).with_body(body)
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header value, keeping any values already present under the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the URI. Transformers use this to redirect a bound request.
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = uri;
        self
    }

    pub(crate) fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Service-addressed before binding, instance-addressed after.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// 1-based attempt ordinal within the logical call, stamped when the request is bound to an
    /// instance. Zero for a request that was never bound.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Extract the logical service name (the URI host) from a service-addressed URI.
pub fn service_name_of(uri: &Uri) -> Result<&str, LoadBalancerError> {
    match uri.host() {
        Some(host) if !host.is_empty() => Ok(host),
        _ => Err(LoadBalancerError::MissingServiceName { uri: uri.to_string() }),
    }
}

/// Rewrite a service-addressed URI to point at `instance`, keeping path and query.
///
/// Secure instances upgrade `http` to `https` and `ws` to `wss`; otherwise the original scheme
/// is kept (`http` when absent). An instance whose host and port do not form a valid authority
/// is an [`ConnectivityErrorKind::InvalidAddress`] failure; the logical service address is never
/// used as a fallback.
pub fn reconstruct_uri(instance: &ServiceInstance, original: &Uri) -> Result<Uri, ConnectivityError> {
    let authority =
        instance.authority().parse::<Authority>().map_err(|e| invalid_address(instance, e))?;
    let mut parts = original.clone().into_parts();
    parts.scheme = Some(resolve_scheme(instance, original.scheme()));
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|e| invalid_address(instance, e))
}

fn invalid_address(instance: &ServiceInstance, cause: impl std::fmt::Display) -> ConnectivityError {
    ConnectivityError::new(
        ConnectivityErrorKind::InvalidAddress,
        format!("{} has unusable address '{}': {}", instance, instance.authority(), cause),
    )
}

fn resolve_scheme(instance: &ServiceInstance, original: Option<&Scheme>) -> Scheme {
    let original = original.map(Scheme::as_str).unwrap_or("http");
    let upgraded = match (instance.is_secure(), original) {
        (true, "http") => "https",
        (true, "ws") => "wss",
        (_, other) => other,
    };
    upgraded.parse().unwrap_or(Scheme::HTTP)
}

/// Methods that are read-only and therefore safe to retry without `retry_on_all_operations`.
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}
