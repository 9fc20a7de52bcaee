//! Error types for the replica router

use crate::cluster::ReplicaId;
use std::fmt;
use std::time::Duration;

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport could not reach the chosen replica
    ReplicaUnavailable { replica: ReplicaId, reason: String },
    /// Replica rejected the request because its queue is saturated
    ReplicaOverloaded { replica: ReplicaId },
    /// Active replica set is empty, or every enabled tier is exhausted
    NoCandidateReplicas,
    /// Attempt or age ceiling exceeded
    RequestExpired(ExpiryReason),
    /// Caller abandoned the request
    CallerCancelled,
    /// Non-placement transport failure, passed through without retry
    Transport(String),
    /// Configuration errors
    Config(String),
    /// Internal invariant violation
    Internal(String),
}

/// Why a request expired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryReason {
    /// Attempt ceiling reached; carries the last recoverable cause
    MaxAttempts { attempts: u32, last_error: Option<Box<Error>> },
    /// Request age ceiling reached
    MaxAge { age: Duration, ceiling: Duration },
}

impl Error {
    /// Whether the router handles this error internally by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ReplicaUnavailable { .. } | Error::ReplicaOverloaded { .. }
        )
    }

    /// Stable classification label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            Error::ReplicaUnavailable { .. } => "replica_unavailable",
            Error::ReplicaOverloaded { .. } => "replica_overloaded",
            Error::NoCandidateReplicas => "no_candidate_replicas",
            Error::RequestExpired(_) => "request_expired",
            Error::CallerCancelled => "caller_cancelled",
            Error::Transport(_) => "transport",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::RequestExpired(ExpiryReason::MaxAttempts {
                last_error: Some(e),
                ..
            }) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReplicaUnavailable { replica, reason } => {
                write!(f, "Replica {} unavailable: {}", replica, reason)
            }
            Error::ReplicaOverloaded { replica } => write!(f, "Replica {} overloaded", replica),
            Error::NoCandidateReplicas => write!(f, "No candidate replicas available"),
            Error::RequestExpired(reason) => write!(f, "Request expired: {}", reason),
            Error::CallerCancelled => write!(f, "Request cancelled by caller"),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::MaxAttempts {
                attempts,
                last_error: Some(e),
            } => write!(f, "gave up after {} attempts (last error: {})", attempts, e),
            ExpiryReason::MaxAttempts {
                attempts,
                last_error: None,
            } => write!(f, "gave up after {} attempts", attempts),
            ExpiryReason::MaxAge { age, ceiling } => write!(
                f,
                "age {}ms exceeds ceiling {}ms",
                age.as_millis(),
                ceiling.as_millis()
            ),
        }
    }
}
