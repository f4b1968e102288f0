//! Error types for load-balanced execution.
//!
//! Taxonomy:
//! - `NoInstanceAvailable`: the balancer had no candidate. Never retried.
//! - `Connectivity`: a transport failure that was not retried (plain path, or classified
//!   non-retryable by the policy).
//! - `RetryBudgetExhausted`: both budgets were spent; carries the last failure or response.
//! - `Cancelled`: the caller's token fired between attempts.
//!
//! A response whose status is outside the retryable set is not an error at all; it is
//! returned to the caller as `Ok`.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::Response;

/// Broad classes of transport failure a [`LoadBalancer`](crate::LoadBalancer) can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityErrorKind {
    /// Could not establish a connection.
    Connect,
    /// The transport gave up waiting.
    Timeout,
    /// The peer reset or closed the connection mid-exchange.
    Reset,
    /// The peer spoke something we could not understand.
    Protocol,
    /// The transport observed cancellation. Never retried.
    Cancelled,
    /// The chosen instance's host and port do not form a usable address. Never retried.
    InvalidAddress,
    /// Anything else.
    Other,
}

impl fmt::Display for ConnectivityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Reset => "reset",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
            Self::InvalidAddress => "invalid address",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Transport-level failure raised while executing against an instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct ConnectivityError {
    kind: ConnectivityErrorKind,
    message: String,
}

impl ConnectivityError {
    pub fn new(kind: ConnectivityErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ConnectivityErrorKind::Connect, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectivityErrorKind::Timeout, message)
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::new(ConnectivityErrorKind::Reset, message)
    }

    pub fn kind(&self) -> ConnectivityErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the transport itself reported cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ConnectivityErrorKind::Cancelled
    }
}

/// The last retryable outcome seen before the retry budget ran out.
#[derive(Debug)]
pub enum LastOutcome {
    /// A retryable transport failure.
    Failure(ConnectivityError),
    /// A response whose status was classified retryable.
    Response(Response),
}

impl fmt::Display for LastOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure(e) => write!(f, "{}", e),
            Self::Response(r) => write!(f, "retryable status {}", r.status()),
        }
    }
}

/// Terminal outcome of a load-balanced call that did not produce a usable response.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadBalancerError {
    /// The request URI has no host to resolve as a service name.
    #[error("request URI '{uri}' does not contain a valid service name")]
    MissingServiceName { uri: String },
    /// The balancer returned no candidate instance.
    #[error("no instance available for service '{service}'")]
    NoInstanceAvailable { service: String },
    /// A transport failure that was propagated without retry.
    #[error("call to service '{service}' failed: {source}")]
    Connectivity {
        service: String,
        #[source]
        source: ConnectivityError,
    },
    /// Both attempt budgets were consumed.
    #[error(
        "retry budget exhausted for service '{service}' after {attempts} attempts across {distinct_instances} instances; last outcome: {last}"
    )]
    RetryBudgetExhausted {
        service: String,
        attempts: usize,
        distinct_instances: usize,
        last: LastOutcome,
    },
    /// The caller cancelled the call before another attempt could start.
    #[error("call to service '{service}' cancelled after {attempts} attempts")]
    Cancelled { service: String, attempts: usize },
}

impl LoadBalancerError {
    pub fn is_no_instance(&self) -> bool {
        matches!(self, Self::NoInstanceAvailable { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryBudgetExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Service the failing call was addressed to, when one was resolved.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::MissingServiceName { .. } => None,
            Self::NoInstanceAvailable { service }
            | Self::Connectivity { service, .. }
            | Self::RetryBudgetExhausted { service, .. }
            | Self::Cancelled { service, .. } => Some(service),
        }
    }

    /// Underlying transport failure, either propagated directly or as the last outcome of an
    /// exhausted budget.
    pub fn connectivity(&self) -> Option<&ConnectivityError> {
        match self {
            Self::Connectivity { source, .. } => Some(source),
            Self::RetryBudgetExhausted { last: LastOutcome::Failure(e), .. } => Some(e),
            _ => None,
        }
    }

    /// Access exhaustion info as (attempts, distinct_instances).
    pub fn retry_exhausted_info(&self) -> Option<(usize, usize)> {
        match self {
            Self::RetryBudgetExhausted { attempts, distinct_instances, .. } => {
                Some((*attempts, *distinct_instances))
            }
            _ => None,
        }
    }

    /// Take the last retryable response out of an exhausted budget, if that is how it ended.
    pub fn into_last_response(self) -> Option<Response> {
        match self {
            Self::RetryBudgetExhausted { last: LastOutcome::Response(r), .. } => Some(r),
            _ => None,
        }
    }
}

/// Invalid retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("max_attempts_same_instance must be >= 1 (got {0})")]
    InvalidSameInstanceAttempts(usize),
    #[error("retryable status code {0} is not a valid HTTP status")]
    InvalidStatusCode(u16),
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),
    #[error("could not parse retry properties: {0}")]
    Parse(String),
}
