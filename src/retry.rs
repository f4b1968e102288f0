//! The retrying interceptor.
//!
//! Per call:
//! 1. Look up the service's policy. If it refuses retries (disabled for the service, or the
//!    method is not safe to repeat), run the plain path once and return.
//! 2. Select an instance (none available is terminal, never retried).
//! 3. Bind the request for this attempt (an unusable instance address is a terminal
//!    `Connectivity` failure), execute, and classify the outcome:
//!    usable response is returned; non-retryable failure is propagated; a retryable status or
//!    failure continues.
//! 4. Retry on the same instance while its budget lasts, then fail over while the
//!    next-instance budget lasts, then give up with `RetryBudgetExhausted`. When the budgets
//!    allow no retry at all, the single outcome is returned as the plain path returns it.
//!
//! Invariants:
//! - Attempts never exceed `same * (next + 1)`.
//! - Each attempt rebinds the request; nothing is reused across attempts.
//! - Cancellation is observed before every selection and retry and is never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{Sleeper, TokioSleeper};
use crate::balancer::LoadBalancer;
use crate::error::{LastOutcome, LoadBalancerError};
use crate::interceptor::{execute_once, ClientInterceptor};
use crate::policy::{LoadBalancedRetryPolicy, RetryContext, RetryPolicyFactory};
use crate::request::{OutboundRequest, Response};
use crate::telemetry::{emit_best_effort, BypassReason, EventSink, LoadBalancerEvent, NullSink};
use crate::transform::RequestFactory;

/// Wraps load-balanced execution in a bounded same-instance / next-instance retry loop.
pub struct RetryLoadBalancerInterceptor<S = NullSink> {
    balancer: Arc<dyn LoadBalancer>,
    requests: RequestFactory,
    policies: Arc<dyn RetryPolicyFactory>,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl RetryLoadBalancerInterceptor<NullSink> {
    /// Interceptor that looks up each service's policy in `policies`, sleeps on the tokio
    /// timer, and discards events.
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        requests: RequestFactory,
        policies: Arc<dyn RetryPolicyFactory>,
    ) -> Self {
        Self { balancer, requests, policies, sleeper: Arc::new(TokioSleeper), sink: NullSink }
    }
}

impl<S> RetryLoadBalancerInterceptor<S> {
    /// Send events to `sink` instead.
    pub fn with_sink<T>(self, sink: T) -> RetryLoadBalancerInterceptor<T> {
        RetryLoadBalancerInterceptor {
            balancer: self.balancer,
            requests: self.requests,
            policies: self.policies,
            sleeper: self.sleeper,
            sink,
        }
    }

    /// Replace how backoff delays are waited out.
    pub fn with_sleeper<T>(mut self, sleeper: T) -> Self
    where
        T: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

impl<S: EventSink> RetryLoadBalancerInterceptor<S> {
    /// Execute with retries; `cancel` is checked before every selection and retry.
    pub async fn execute_with_cancellation(
        &self,
        service: &str,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, LoadBalancerError> {
        if cancel.is_cancelled() {
            return Err(LoadBalancerError::Cancelled { service: service.to_string(), attempts: 0 });
        }

        let policy = self.policies.policy_for(service);
        if !policy.can_retry(request.method()) {
            let reason = if policy.is_enabled() {
                debug!(target: "balanced_retry::retry", service, method = %request.method(), "method not safe to retry; executing once");
                BypassReason::UnsafeMethod
            } else {
                debug!(target: "balanced_retry::retry", service, "retry disabled for service; executing once");
                BypassReason::RetryDisabled
            };
            self.emit(LoadBalancerEvent::Bypassed {
                service: service.to_string(),
                method: request.method().to_string(),
                reason,
            })
            .await;
            return execute_once(self.balancer.as_ref(), &self.requests, service, request).await;
        }

        let pending = self.requests.create(request);
        let mut ctx = RetryContext::new(service);
        let started = Instant::now();

        loop {
            let instance = match ctx.instance().cloned() {
                Some(bound) => bound,
                None => {
                    if cancel.is_cancelled() {
                        return Err(cancelled(&ctx));
                    }
                    let Some(chosen) = self.balancer.choose(service).await else {
                        debug!(target: "balanced_retry::retry", service, attempts = ctx.total_attempts(), "no instance available");
                        return Err(LoadBalancerError::NoInstanceAvailable { service: service.to_string() });
                    };
                    ctx.bind_instance(chosen.clone());
                    debug!(target: "balanced_retry::retry", service, instance = %chosen.instance_id(), distinct = ctx.distinct_instances_tried(), "instance selected");
                    self.emit(LoadBalancerEvent::InstanceSelected {
                        service: service.to_string(),
                        instance_id: chosen.instance_id().to_string(),
                        distinct_instances: ctx.distinct_instances_tried(),
                    })
                    .await;
                    chosen
                }
            };

            let attempt = ctx.record_attempt();
            let bound = match pending.bind(&instance, attempt) {
                Ok(bound) => bound,
                Err(source) => {
                    return Err(LoadBalancerError::Connectivity { service: service.to_string(), source })
                }
            };
            let outcome = self.balancer.execute_on(service, &instance, bound).await;

            let retryable = match outcome {
                Ok(response) if policy.is_retryable_status(response.status()) => {
                    LastOutcome::Response(response)
                }
                Ok(response) => {
                    self.emit(LoadBalancerEvent::Succeeded {
                        service: service.to_string(),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    })
                    .await;
                    return Ok(response);
                }
                Err(error) if error.is_cancelled() => return Err(cancelled(&ctx)),
                Err(error) if policy.is_retryable_failure(&error) => LastOutcome::Failure(error),
                Err(source) => {
                    debug!(target: "balanced_retry::retry", service, attempt, error = %source, "non-retryable failure");
                    return Err(LoadBalancerError::Connectivity { service: service.to_string(), source });
                }
            };

            debug!(target: "balanced_retry::retry", service, instance = %instance.instance_id(), attempt, outcome = %retryable, "attempt failed");
            self.emit(LoadBalancerEvent::AttemptFailed {
                service: service.to_string(),
                instance_id: instance.instance_id().to_string(),
                attempt,
                reason: retryable.to_string(),
            })
            .await;

            let Some(same_instance) = next_step(policy.as_ref(), &mut ctx) else {
                if attempt == 1 {
                    // No retry was ever possible; answer exactly as the plain path would.
                    return match retryable {
                        LastOutcome::Response(response) => Ok(response),
                        LastOutcome::Failure(source) => {
                            Err(LoadBalancerError::Connectivity { service: service.to_string(), source })
                        }
                    };
                }
                return Err(self.exhausted(&ctx, retryable, started).await);
            };

            if cancel.is_cancelled() {
                return Err(cancelled(&ctx));
            }

            let delay = policy.retry_delay(&ctx);
            self.emit(LoadBalancerEvent::RetryScheduled {
                service: service.to_string(),
                same_instance,
                delay,
            })
            .await;
            if delay > Duration::ZERO {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled(&ctx)),
                    _ = self.sleeper.sleep(delay) => {}
                }
            }
        }
    }

    async fn emit(&self, event: LoadBalancerEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn exhausted(&self, ctx: &RetryContext, last: LastOutcome, started: Instant) -> LoadBalancerError {
        let elapsed = started.elapsed();
        warn!(
            target: "balanced_retry::retry",
            service = ctx.service(),
            attempts = ctx.total_attempts(),
            distinct = ctx.distinct_instances_tried(),
            last = %last,
            "retry budget exhausted"
        );
        self.emit(LoadBalancerEvent::Exhausted {
            service: ctx.service().to_string(),
            attempts: ctx.total_attempts(),
            distinct_instances: ctx.distinct_instances_tried(),
            elapsed,
        })
        .await;
        LoadBalancerError::RetryBudgetExhausted {
            service: ctx.service().to_string(),
            attempts: ctx.total_attempts(),
            distinct_instances: ctx.distinct_instances_tried(),
            last,
        }
    }
}

/// `Some(true)` to stay on the bound instance, `Some(false)` to fail over (the instance is
/// released), `None` when both budgets are spent.
fn next_step(policy: &dyn LoadBalancedRetryPolicy, ctx: &mut RetryContext) -> Option<bool> {
    if policy.can_retry_same_instance(ctx) {
        Some(true)
    } else if policy.can_retry_next_instance(ctx) {
        ctx.release_instance();
        Some(false)
    } else {
        None
    }
}

fn cancelled(ctx: &RetryContext) -> LoadBalancerError {
    LoadBalancerError::Cancelled { service: ctx.service().to_string(), attempts: ctx.total_attempts() }
}

#[async_trait]
impl<S: EventSink> ClientInterceptor for RetryLoadBalancerInterceptor<S> {
    async fn execute(&self, service: &str, request: OutboundRequest) -> Result<Response, LoadBalancerError> {
        self.execute_with_cancellation(service, request, &CancellationToken::new()).await
    }
}
