//! Concrete members of a logical service.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One addressable endpoint returned by a [`LoadBalancer`](crate::LoadBalancer).
///
/// Instances are immutable snapshots. The instance list behind a service may change
/// between calls, so nothing here is assumed to stay valid across attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    service_id: Arc<str>,
    instance_id: Arc<str>,
    host: String,
    port: u16,
    secure: bool,
    metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    /// Create a plain-text instance. The instance id defaults to `host:port`.
    pub fn new(service_id: impl Into<Arc<str>>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let instance_id: Arc<str> = format!("{}:{}", host, port).into();
        Self {
            service_id: service_id.into(),
            instance_id,
            host,
            port,
            secure: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Override the id used in events and by [`ServiceInstance::same_endpoint`].
    pub fn with_instance_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Mark the instance as TLS-only; bound URIs are upgraded to `https`/`wss`.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether `other` names the same endpoint. Metadata is ignored: a refreshed
    /// instance with new metadata is still the same member.
    pub fn same_endpoint(&self, other: &ServiceInstance) -> bool {
        self.instance_id == other.instance_id && self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.service_id, self.instance_id)
    }
}
