//! Retry policies and the per-service policy registry.
//!
//! Semantics:
//! - `max_attempts_same_instance` counts attempts on the currently bound instance.
//! - `max_attempts_next_instance` counts failovers to further instances after the first.
//! - Same-instance budget is spent before any failover.
//! - A policy that refuses `can_retry` for a method sends the call down the plain path.
//!
//! Invariants:
//! - Attempts per call never exceed `same * (next + 1)`.
//! - Classification is made once per attempt and never revisited.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use http::{Method, StatusCode};
use tracing::warn;

use crate::backoff::Backoff;
use crate::config::{RetryPolicyConfig, RetryProperties};
use crate::error::{ConfigError, ConnectivityError, ConnectivityErrorKind};
use crate::instance::ServiceInstance;
use crate::request::is_safe_method;

/// Per-call retry bookkeeping. Owned by exactly one in-flight call.
#[derive(Debug)]
pub struct RetryContext {
    service: String,
    same_instance_attempts: usize,
    distinct_instances: usize,
    selections: usize,
    total_attempts: usize,
    instance: Option<ServiceInstance>,
    previous: Option<ServiceInstance>,
}

impl RetryContext {
    /// Fresh context for one call to `service`, with nothing selected yet.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            same_instance_attempts: 0,
            distinct_instances: 0,
            selections: 0,
            total_attempts: 0,
            instance: None,
            previous: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attempts made on the currently bound instance.
    pub fn same_instance_attempts(&self) -> usize {
        self.same_instance_attempts
    }

    /// Distinct instances bound so far. Re-selecting the instance just released does not
    /// count as a new one.
    pub fn distinct_instances_tried(&self) -> usize {
        self.distinct_instances
    }

    /// Instance selections so far, including the first. Every selection consumes failover
    /// budget, even when the balancer hands back the instance it just gave.
    pub fn instance_selections(&self) -> usize {
        self.selections
    }

    /// Attempts across all instances, including the one in flight.
    pub fn total_attempts(&self) -> usize {
        self.total_attempts
    }

    /// Currently bound instance, `None` before the first selection or after a failover
    /// decision.
    pub fn instance(&self) -> Option<&ServiceInstance> {
        self.instance.as_ref()
    }

    pub(crate) fn bind_instance(&mut self, instance: ServiceInstance) {
        let is_new = match &self.previous {
            Some(prev) => !prev.same_endpoint(&instance),
            None => true,
        };
        if is_new {
            self.distinct_instances += 1;
        }
        self.selections += 1;
        self.same_instance_attempts = 0;
        self.instance = Some(instance);
    }

    pub(crate) fn record_attempt(&mut self) -> usize {
        self.same_instance_attempts += 1;
        self.total_attempts += 1;
        self.total_attempts
    }

    /// Drop the bound instance so the next attempt selects again.
    pub(crate) fn release_instance(&mut self) {
        self.previous = self.instance.take();
    }
}

/// Decides whether and where a failed call may be retried.
pub trait LoadBalancedRetryPolicy: Send + Sync + fmt::Debug {
    /// Whether calls with `method` are eligible for retry at all.
    fn can_retry(&self, method: &Method) -> bool;

    /// True iff another attempt on the bound instance is allowed.
    fn can_retry_same_instance(&self, ctx: &RetryContext) -> bool;

    /// True iff failing over to another instance is allowed.
    fn can_retry_next_instance(&self, ctx: &RetryContext) -> bool;

    fn is_retryable_status(&self, status: StatusCode) -> bool;

    fn is_retryable_failure(&self, error: &ConnectivityError) -> bool;

    /// Delay before the next attempt. Zero by default.
    fn retry_delay(&self, _ctx: &RetryContext) -> Duration {
        Duration::ZERO
    }

    /// False when retries are switched off for the service regardless of method.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// The fallback policy: nothing is ever retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverRetryPolicy;

impl LoadBalancedRetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, _method: &Method) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn can_retry_same_instance(&self, _ctx: &RetryContext) -> bool {
        false
    }

    fn can_retry_next_instance(&self, _ctx: &RetryContext) -> bool {
        false
    }

    fn is_retryable_status(&self, _status: StatusCode) -> bool {
        false
    }

    fn is_retryable_failure(&self, _error: &ConnectivityError) -> bool {
        false
    }
}

type FailurePredicate = Arc<dyn Fn(&ConnectivityError) -> bool + Send + Sync>;

/// Policy driven by a validated [`RetryPolicyConfig`].
#[derive(Clone)]
pub struct ConfiguredRetryPolicy {
    config: RetryPolicyConfig,
    backoff: Option<Backoff>,
    classifier: Option<FailurePredicate>,
}

impl fmt::Debug for ConfiguredRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredRetryPolicy")
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .field("classifier", &self.classifier.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl ConfiguredRetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backoff = config.backoff.to_backoff()?;
        Ok(Self { config, backoff, classifier: None })
    }

    /// Replace kind-based failure classification with a custom predicate.
    pub fn with_failure_classifier<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ConnectivityError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(predicate));
        self
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }
}

impl LoadBalancedRetryPolicy for ConfiguredRetryPolicy {
    fn can_retry(&self, method: &Method) -> bool {
        self.config.enabled && (self.config.retry_on_all_operations || is_safe_method(method))
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn can_retry_same_instance(&self, ctx: &RetryContext) -> bool {
        ctx.same_instance_attempts() < self.config.max_attempts_same_instance
    }

    fn can_retry_next_instance(&self, ctx: &RetryContext) -> bool {
        ctx.instance_selections() <= self.config.max_attempts_next_instance
    }

    fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.config.retryable_status_codes.contains(&status.as_u16())
    }

    fn is_retryable_failure(&self, error: &ConnectivityError) -> bool {
        if error.kind() == ConnectivityErrorKind::Cancelled {
            return false;
        }
        match &self.classifier {
            Some(predicate) => predicate(error),
            None => self.config.retryable_failures.contains(&error.kind()),
        }
    }

    fn retry_delay(&self, ctx: &RetryContext) -> Duration {
        // Retry ordinal: one less than the attempt about to start.
        match &self.backoff {
            Some(backoff) => backoff.jittered(ctx.total_attempts()),
            None => Duration::ZERO,
        }
    }
}

/// Resolves the retry policy for a service.
pub trait RetryPolicyFactory: Send + Sync + fmt::Debug {
    /// Policy for `service`; a never-retry policy when nothing is configured.
    fn policy_for(&self, service: &str) -> Arc<dyn LoadBalancedRetryPolicy>;
}

type PolicyMap = HashMap<String, Arc<dyn LoadBalancedRetryPolicy>>;

/// Service-name keyed registry with lock-free reads.
///
/// Writes publish a whole new map, so a concurrent lookup sees either the old or the new
/// registration, never a partial update.
#[derive(Clone)]
pub struct RetryPolicyRegistry {
    policies: Arc<ArcSwap<PolicyMap>>,
    fallback: Arc<dyn LoadBalancedRetryPolicy>,
}

impl fmt::Debug for RetryPolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicyRegistry")
            .field("services", &self.services())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl Default for RetryPolicyRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NeverRetryPolicy))
    }
}

impl RetryPolicyRegistry {
    /// Empty registry answering every lookup with `fallback`.
    pub fn new(fallback: Arc<dyn LoadBalancedRetryPolicy>) -> Self {
        Self { policies: Arc::new(ArcSwap::from_pointee(HashMap::new())), fallback }
    }

    /// Build from properties: `defaults` becomes the fallback, each service entry its own policy.
    pub fn from_properties(props: &RetryProperties) -> Result<Self, ConfigError> {
        let registry = Self::new(policy_from_config(&props.defaults)?);
        let mut map = PolicyMap::new();
        for (service, config) in &props.services {
            map.insert(service.clone(), policy_from_config(config)?);
        }
        registry.policies.store(Arc::new(map));
        Ok(registry)
    }

    /// Register a policy for `service`. The last registration wins.
    pub fn register(&self, service: impl Into<String>, policy: Arc<dyn LoadBalancedRetryPolicy>) {
        let service = service.into();
        if self.policies.load().contains_key(&service) {
            warn!(target: "balanced_retry::policy", service = %service, "retry policy replaced; last registration wins");
        }
        self.policies.rcu(|current| {
            let mut next = PolicyMap::clone(current);
            next.insert(service.clone(), policy.clone());
            next
        });
    }

    /// Remove the policy for `service`, returning whether one was registered.
    pub fn remove(&self, service: &str) -> bool {
        let mut removed = false;
        self.policies.rcu(|current| {
            let mut next = PolicyMap::clone(current);
            removed = next.remove(service).is_some();
            next
        });
        removed
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.load().keys().cloned().collect();
        names.sort();
        names
    }
}

impl RetryPolicyFactory for RetryPolicyRegistry {
    fn policy_for(&self, service: &str) -> Arc<dyn LoadBalancedRetryPolicy> {
        self.policies.load().get(service).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

fn policy_from_config(config: &RetryPolicyConfig) -> Result<Arc<dyn LoadBalancedRetryPolicy>, ConfigError> {
    if config.enabled {
        Ok(Arc::new(ConfiguredRetryPolicy::new(config.clone())?))
    } else {
        Ok(Arc::new(NeverRetryPolicy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    fn policy(same: usize, next: usize) -> ConfiguredRetryPolicy {
        ConfiguredRetryPolicy::new(RetryPolicyConfig::default().with_attempts(same, next)).unwrap()
    }

    fn inst(id: &str) -> ServiceInstance {
        ServiceInstance::new("svc", id, 80).with_instance_id(id.to_string())
    }

    #[test]
    fn same_instance_budget_counts_attempts_on_bound_instance() {
        let p = policy(2, 0);
        let mut ctx = RetryContext::new("svc");
        ctx.bind_instance(inst("a"));
        ctx.record_attempt();
        assert!(p.can_retry_same_instance(&ctx));
        ctx.record_attempt();
        assert!(!p.can_retry_same_instance(&ctx));
    }

    #[test]
    fn next_instance_budget_excludes_first_instance() {
        let p = policy(1, 2);
        let mut ctx = RetryContext::new("svc");
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            ctx.bind_instance(inst(id));
            ctx.record_attempt();
            assert_eq!(p.can_retry_next_instance(&ctx), i < 2, "after instance {}", id);
            ctx.release_instance();
        }
        assert_eq!(ctx.distinct_instances_tried(), 3);
    }

    #[test]
    fn reselecting_previous_instance_is_not_distinct_but_consumes_budget() {
        let mut ctx = RetryContext::new("svc");
        ctx.bind_instance(inst("a"));
        ctx.record_attempt();
        ctx.release_instance();
        ctx.bind_instance(inst("a"));
        assert_eq!(ctx.distinct_instances_tried(), 1);
        assert_eq!(ctx.instance_selections(), 2);
        assert_eq!(ctx.same_instance_attempts(), 0);
        assert!(!policy(1, 1).can_retry_next_instance(&ctx));
    }

    #[test]
    fn unsafe_methods_need_retry_on_all_operations() {
        let strict = policy(3, 3);
        assert!(strict.can_retry(&Method::GET));
        assert!(!strict.can_retry(&Method::POST));
        let lax = ConfiguredRetryPolicy::new(RetryPolicyConfig::default().with_retry_on_all_operations(true))
            .unwrap();
        assert!(lax.can_retry(&Method::POST));
        let off = ConfiguredRetryPolicy::new(RetryPolicyConfig::disabled()).unwrap();
        assert!(!off.can_retry(&Method::GET));
    }

    #[test]
    fn failure_classification_by_kind_and_predicate() {
        let p = policy(1, 1);
        assert!(p.is_retryable_failure(&ConnectivityError::connect("refused")));
        assert!(!p.is_retryable_failure(&ConnectivityError::new(ConnectivityErrorKind::Protocol, "x")));
        let custom = policy(1, 1).with_failure_classifier(|e| e.message().contains("transient"));
        assert!(custom.is_retryable_failure(&ConnectivityError::new(ConnectivityErrorKind::Other, "transient")));
        assert!(!custom.is_retryable_failure(&ConnectivityError::connect("permanent")));
        // Cancellation is never retryable, whatever the predicate says.
        let greedy = policy(1, 1).with_failure_classifier(|_| true);
        assert!(!greedy.is_retryable_failure(&ConnectivityError::new(ConnectivityErrorKind::Cancelled, "x")));
    }

    #[test]
    fn status_classification_uses_configured_set() {
        let p = ConfiguredRetryPolicy::new(RetryPolicyConfig::default().with_retryable_status_codes([503]))
            .unwrap();
        assert!(p.is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!p.is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn registry_falls_back_to_never_retry() {
        let registry = RetryPolicyRegistry::default();
        let p = registry.policy_for("unknown");
        assert!(!p.can_retry(&Method::GET));
    }

    #[test]
    fn registry_from_properties_maps_disabled_to_never() {
        let props = RetryProperties::default()
            .with_service("off", RetryPolicyConfig::disabled())
            .with_service("on", RetryPolicyConfig::default().with_attempts(2, 0));
        let registry = RetryPolicyRegistry::from_properties(&props).unwrap();
        assert_eq!(registry.services(), vec!["off".to_string(), "on".to_string()]);
        assert!(!registry.policy_for("off").can_retry(&Method::GET));
        assert!(registry.policy_for("on").can_retry(&Method::GET));
        // no defaults configured
        let elsewhere = registry.policy_for("elsewhere");
        assert!(!elsewhere.can_retry(&Method::GET));
        assert!(!elsewhere.is_enabled());
    }

    #[test]
    fn registry_remove_reports_presence() {
        let registry = RetryPolicyRegistry::default();
        registry.register("a", Arc::new(policy(1, 0)));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.services().is_empty());
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_warns_and_replaces_duplicates() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = RetryPolicyRegistry::default();
        registry.register("svc", Arc::new(policy(1, 0)));
        registry.register("svc", Arc::new(policy(4, 0)));

        let mut ctx = RetryContext::new("svc");
        ctx.bind_instance(inst("a"));
        ctx.record_attempt();
        assert!(registry.policy_for("svc").can_retry_same_instance(&ctx), "last registration should win");

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("retry policy replaced"));
    }
}
