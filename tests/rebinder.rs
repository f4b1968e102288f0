mod common;

use std::sync::{Arc, Mutex};

use balanced_retry::testing::ScriptedLoadBalancer;
use balanced_retry::{
    BoundConfig, ClientInterceptor, ConfigurationRebinder, ConfiguredRetryPolicy,
    ConnectivityError, EnvironmentChangeEvent, RebindError, RequestFactory,
    RetryLoadBalancerInterceptor, RetryPolicyRegistry, RetryProperties,
};
use tower::BoxError;

use common::test_helpers::{get, instance, SERVICE};

const ONE_ATTEMPT: &str = r#"{"services":{"users":{"max_attempts_same_instance":1,"max_attempts_next_instance":0}}}"#;
const THREE_ATTEMPTS: &str = r#"{"services":{"users":{"max_attempts_same_instance":3,"max_attempts_next_instance":0}}}"#;

struct Harness {
    source: Arc<Mutex<String>>,
    props: BoundConfig<RetryProperties>,
    registry: RetryPolicyRegistry,
    rebinder: ConfigurationRebinder,
}

fn harness() -> Harness {
    let source = Arc::new(Mutex::new(ONE_ATTEMPT.to_string()));
    let props = BoundConfig::new(RetryProperties::from_json_str(ONE_ATTEMPT).unwrap());
    let registry = RetryPolicyRegistry::default();
    let rebinder = ConfigurationRebinder::new("app");

    let raw = source.clone();
    rebinder.register_bound("retry-properties", props.clone(), move || {
        let json = raw.lock().unwrap().clone();
        Ok(RetryProperties::from_json_str(&json)?)
    });
    let bound = props.clone();
    let target = registry.clone();
    rebinder.register("retry-registry", move || -> Result<(), BoxError> {
        for (service, config) in &bound.get().services {
            target.register(service.clone(), Arc::new(ConfiguredRetryPolicy::new(config.clone())?));
        }
        Ok(())
    });
    rebinder.rebind_all();

    Harness { source, props, registry, rebinder }
}

#[tokio::test]
async fn environment_change_reconfigures_live_interceptor() {
    let h = harness();
    let lb = Arc::new(ScriptedLoadBalancer::new().with_instances([instance("a")]));
    lb.fail_instance("a", ConnectivityError::connect("refused"));
    let client = RetryLoadBalancerInterceptor::new(lb.clone(), RequestFactory::default(), Arc::new(h.registry.clone()));

    let _ = client.execute(SERVICE, get("/x")).await;
    assert_eq!(lb.attempts().len(), 1);

    *h.source.lock().unwrap() = THREE_ATTEMPTS.to_string();
    assert!(!h.rebinder.on_environment_change(&EnvironmentChangeEvent::new("other-app", ["users"])));
    assert!(h.rebinder.on_environment_change(&EnvironmentChangeEvent::new("app", ["services.users"])));
    assert_eq!(h.props.get().config_for("users").max_attempts_same_instance, 3);

    let _ = client.execute(SERVICE, get("/x")).await;
    assert_eq!(lb.attempts().len(), 1 + 3);
}

#[tokio::test]
async fn invalid_reload_keeps_previous_config_and_records_error() {
    let h = harness();
    *h.source.lock().unwrap() = r#"{"defaults":{"max_attempts_same_instance":0}}"#.to_string();

    assert!(!h.rebinder.rebind("retry-properties"));
    assert_eq!(h.props.get().config_for("users").max_attempts_same_instance, 1);
    let errors = h.rebinder.errors();
    assert!(matches!(errors.get("retry-properties"), Some(RebindError::Failed { .. })));

    *h.source.lock().unwrap() = THREE_ATTEMPTS.to_string();
    h.rebinder.rebind_all();
    assert!(h.rebinder.errors().is_empty());
    assert_eq!(
        h.rebinder.managed_names().into_iter().collect::<Vec<_>>(),
        vec!["retry-properties".to_string(), "retry-registry".to_string()]
    );
}
