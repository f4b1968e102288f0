use std::sync::Arc;

use balanced_retry::testing::ScriptedLoadBalancer;
use balanced_retry::{
    ConfiguredRetryPolicy, OutboundRequest, RecordingSleeper, RequestFactory,
    RetryLoadBalancerInterceptor, RetryPolicyConfig, RetryPolicyRegistry, ServiceInstance,
};

pub const SERVICE: &str = "users";

pub fn instance(id: &str) -> ServiceInstance {
    ServiceInstance::new(SERVICE, format!("{}.users.internal", id), 8080).with_instance_id(id.to_string())
}

pub fn get(path: &str) -> OutboundRequest {
    OutboundRequest::get(format!("http://{}{}", SERVICE, path).parse().expect("valid uri"))
}

/// Retrying interceptor with `config` registered for [`SERVICE`] and sleeps recorded, not waited.
pub fn retrying(
    balancer: Arc<ScriptedLoadBalancer>,
    requests: RequestFactory,
    config: RetryPolicyConfig,
) -> RetryLoadBalancerInterceptor {
    let registry = RetryPolicyRegistry::default();
    registry.register(SERVICE, Arc::new(ConfiguredRetryPolicy::new(config).expect("valid config")));
    RetryLoadBalancerInterceptor::new(balancer, requests, Arc::new(registry))
        .with_sleeper(RecordingSleeper::new())
}
