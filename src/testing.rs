//! Scripted load balancer for tests and benches.
//!
//! Selection: scripted choices are served first (`None` entries simulate an empty pool),
//! then instances are handed out round-robin. Execution: a per-instance failure, if set,
//! wins; otherwise the next queued outcome is used; otherwise `200 OK`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use crate::balancer::LoadBalancer;
use crate::error::ConnectivityError;
use crate::instance::ServiceInstance;
use crate::request::{OutboundRequest, Response};

/// One executed attempt as the balancer saw it.
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    pub service: String,
    pub instance_id: String,
    pub request: OutboundRequest,
}

#[derive(Debug, Clone)]
enum Outcome {
    Status(StatusCode),
    Failure(ConnectivityError),
}

type AttemptHook = Arc<dyn Fn(&RecordedAttempt) + Send + Sync>;

/// In-memory [`LoadBalancer`] with scripted selections and outcomes. Records every attempt.
#[derive(Default)]
pub struct ScriptedLoadBalancer {
    instances: Vec<ServiceInstance>,
    choices: Mutex<VecDeque<Option<ServiceInstance>>>,
    cursor: AtomicUsize,
    selections: AtomicUsize,
    outcomes: Mutex<VecDeque<Outcome>>,
    failing: Mutex<HashMap<String, ConnectivityError>>,
    attempts: Mutex<Vec<RecordedAttempt>>,
    hook: Mutex<Option<AttemptHook>>,
}

impl std::fmt::Debug for ScriptedLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedLoadBalancer")
            .field("instances", &self.instances)
            .field("selections", &self.selections())
            .field("attempts", &self.attempts().len())
            .finish()
    }
}

impl ScriptedLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool served round-robin once scripted choices run out.
    pub fn with_instances(mut self, instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        self.instances = instances.into_iter().collect();
        self
    }

    /// Exact answers for the next selections.
    pub fn with_choices(self, choices: impl IntoIterator<Item = Option<ServiceInstance>>) -> Self {
        self.choices.lock().expect("scripted choices poisoned").extend(choices);
        self
    }

    /// Queue a response status for the next attempt that has no failing override.
    pub fn push_status(&self, status: StatusCode) {
        self.outcomes.lock().expect("scripted outcomes poisoned").push_back(Outcome::Status(status));
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, error: ConnectivityError) {
        self.outcomes.lock().expect("scripted outcomes poisoned").push_back(Outcome::Failure(error));
    }

    /// Every attempt on `instance_id` fails with `error`.
    pub fn fail_instance(&self, instance_id: impl Into<String>, error: ConnectivityError) {
        self.failing.lock().expect("failing instances poisoned").insert(instance_id.into(), error);
    }

    /// Run `hook` after each attempt is recorded and before its outcome is returned.
    pub fn on_attempt<F>(&self, hook: F)
    where
        F: Fn(&RecordedAttempt) + Send + Sync + 'static,
    {
        *self.hook.lock().expect("attempt hook poisoned") = Some(Arc::new(hook));
    }

    /// Every attempt so far, in execution order.
    pub fn attempts(&self) -> Vec<RecordedAttempt> {
        self.attempts.lock().expect("recorded attempts poisoned").clone()
    }

    pub fn attempts_on(&self, instance_id: &str) -> usize {
        self.attempts
            .lock()
            .expect("recorded attempts poisoned")
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .count()
    }

    /// Number of `choose` calls so far.
    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, instance_id: &str) -> Outcome {
        if let Some(error) = self.failing.lock().expect("failing instances poisoned").get(instance_id) {
            return Outcome::Failure(error.clone());
        }
        self.outcomes
            .lock()
            .expect("scripted outcomes poisoned")
            .pop_front()
            .unwrap_or(Outcome::Status(StatusCode::OK))
    }
}

#[async_trait]
impl LoadBalancer for ScriptedLoadBalancer {
    async fn choose(&self, _service: &str) -> Option<ServiceInstance> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.choices.lock().expect("scripted choices poisoned").pop_front() {
            return scripted;
        }
        if self.instances.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        Some(self.instances[n % self.instances.len()].clone())
    }

    async fn execute_on(
        &self,
        service: &str,
        instance: &ServiceInstance,
        request: OutboundRequest,
    ) -> Result<Response, ConnectivityError> {
        let attempt = RecordedAttempt {
            service: service.to_string(),
            instance_id: instance.instance_id().to_string(),
            request,
        };
        self.attempts.lock().expect("recorded attempts poisoned").push(attempt.clone());
        let hook = self.hook.lock().expect("attempt hook poisoned").clone();
        if let Some(hook) = hook {
            hook(&attempt);
        }
        match self.next_outcome(&attempt.instance_id) {
            Outcome::Status(status) => {
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = status;
                Ok(response)
            }
            Outcome::Failure(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectivityErrorKind;

    fn inst(id: &str) -> ServiceInstance {
        ServiceInstance::new("svc", id, 80).with_instance_id(id.to_string())
    }

    #[tokio::test]
    async fn scripted_choices_precede_round_robin() {
        let lb = ScriptedLoadBalancer::new()
            .with_instances([inst("a"), inst("b")])
            .with_choices([Some(inst("z")), None]);
        let picks: Vec<Option<String>> = [
            lb.choose("svc").await,
            lb.choose("svc").await,
            lb.choose("svc").await,
            lb.choose("svc").await,
        ]
        .into_iter()
        .map(|i| i.map(|i| i.instance_id().to_string()))
        .collect();
        assert_eq!(picks, vec![Some("z".into()), None, Some("a".into()), Some("b".into())]);
        assert_eq!(lb.selections(), 4);
    }

    #[tokio::test]
    async fn failing_instance_overrides_queue() {
        let lb = ScriptedLoadBalancer::new();
        lb.fail_instance("a", ConnectivityError::reset("rst"));
        lb.push_status(StatusCode::ACCEPTED);
        let req = OutboundRequest::get("http://svc/".parse().unwrap());
        let err = lb.execute_on("svc", &inst("a"), req.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ConnectivityErrorKind::Reset);
        let ok = lb.execute_on("svc", &inst("b"), req.clone()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::ACCEPTED);
        let default = lb.execute_on("svc", &inst("b"), req).await.unwrap();
        assert_eq!(default.status(), StatusCode::OK);
        assert_eq!(lb.attempts_on("a"), 1);
        assert_eq!(lb.attempts_on("b"), 2);
    }
}
