//! Structured events describing what a load-balanced call did.
//!
//! Intermediate failed attempts never show up in a call's return value; they are reported
//! here instead. Sinks are `tower::Service<LoadBalancerEvent>` so they compose with the rest
//! of a tower stack, and interceptors emit to them best-effort.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::Service;

/// Events emitted by the plain and retrying interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadBalancerEvent {
    /// An instance was bound for the next attempts.
    InstanceSelected { service: String, instance_id: String, distinct_instances: usize },
    /// An attempt produced a retryable outcome.
    AttemptFailed { service: String, instance_id: String, attempt: usize, reason: String },
    /// Another attempt will follow after `delay`.
    RetryScheduled { service: String, same_instance: bool, delay: Duration },
    /// The call finished with a usable response.
    Succeeded { service: String, attempts: usize, elapsed: Duration },
    /// Both budgets were spent.
    Exhausted { service: String, attempts: usize, distinct_instances: usize, elapsed: Duration },
    /// The policy refused retries; the call ran once on the plain path.
    Bypassed { service: String, method: String, reason: BypassReason },
}

/// Why a call skipped the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BypassReason {
    /// Retries are switched off for the service, or nothing is configured for it.
    RetryDisabled,
    /// Retries are on, but the method is not safe to repeat.
    UnsafeMethod,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RetryDisabled => "retry disabled",
            Self::UnsafeMethod => "unsafe method",
        })
    }
}

impl fmt::Display for LoadBalancerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceSelected { service, instance_id, distinct_instances } => write!(
                f,
                "InstanceSelected({} -> {}, distinct={})",
                service, instance_id, distinct_instances
            ),
            Self::AttemptFailed { service, instance_id, attempt, reason } => write!(
                f,
                "AttemptFailed({} @ {}, #{}, {})",
                service, instance_id, attempt, reason
            ),
            Self::RetryScheduled { service, same_instance, delay } => write!(
                f,
                "RetryScheduled({}, {}, delay={:?})",
                service,
                if *same_instance { "same" } else { "next" },
                delay
            ),
            Self::Succeeded { service, attempts, elapsed } => {
                write!(f, "Succeeded({}, attempts={}, elapsed={:?})", service, attempts, elapsed)
            }
            Self::Exhausted { service, attempts, distinct_instances, elapsed } => write!(
                f,
                "Exhausted({}, attempts={}, distinct={}, elapsed={:?})",
                service, attempts, distinct_instances, elapsed
            ),
            Self::Bypassed { service, method, reason } => {
                write!(f, "Bypassed({}, {}, {})", service, method, reason)
            }
        }
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A sink that consumes load-balancer events.
pub trait EventSink:
    Service<LoadBalancerEvent, Response = (), Error = Self::SinkError, Future = Self::SinkFuture>
    + Clone
    + Send
    + Sync
    + 'static
{
    type SinkError: std::error::Error + Send + 'static;
    type SinkFuture: Future<Output = Result<(), Self::SinkError>> + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: LoadBalancerEvent)
where
    S: EventSink,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LoadBalancerEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LoadBalancerEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for NullSink {
    type SinkError = Infallible;
    type SinkFuture = SinkFuture;
}

/// Logs events through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LoadBalancerEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LoadBalancerEvent) -> Self::Future {
        tracing::info!(event = %event, "lb_event");
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for LogSink {
    type SinkError = Infallible;
    type SinkFuture = SinkFuture;
}

/// Keeps events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LoadBalancerEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink holding up to 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// `capacity` is clamped to at least one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of retained events, oldest first.
    pub fn events(&self) -> Vec<LoadBalancerEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("memory sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Count events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&LoadBalancerEvent) -> bool) -> usize {
        self.events.lock().expect("memory sink poisoned").iter().filter(|e| predicate(e)).count()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LoadBalancerEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LoadBalancerEvent) -> Self::Future {
        let mut guard = self.events.lock().expect("memory sink poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for MemorySink {
    type SinkError = Infallible;
    type SinkFuture = SinkFuture;
}
