//! Transport collaborator interface
//!
//! The router hands each dispatch to a [`ReplicaTransport`] on its own task,
//! so a slow replica never holds up selection for other requests.

use super::{ReplicaId, ReplicaInfo};
use crate::routing::{RequestMetadata, RequestPayload, TierSet};
use crate::Error;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// What the transport receives for one dispatch attempt
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Request metadata (id, streaming flag, multiplexed model)
    pub metadata: RequestMetadata,
    /// Shared request arguments
    pub payload: Arc<RequestPayload>,
    /// 1-based attempt number for this request
    pub attempt: u32,
    /// Tiers already attempted, including the one that chose this replica
    pub tried_tiers: TierSet,
}

/// Body of a successful reply
pub enum ReplyBody {
    /// Complete result
    Unary(serde_json::Value),
    /// Streaming result: first chunk plus the remaining chunks
    Stream {
        first: serde_json::Value,
        rest: BoxStream<'static, Result<serde_json::Value, Error>>,
    },
}

impl fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyBody::Unary(value) => f.debug_tuple("Unary").field(value).finish(),
            ReplyBody::Stream { first, .. } => f
                .debug_struct("Stream")
                .field("first", first)
                .finish_non_exhaustive(),
        }
    }
}

/// Successful reply from a replica
#[derive(Debug)]
pub struct ReplicaReply {
    /// Replica that served the request
    pub replica: ReplicaId,
    pub body: ReplyBody,
    /// Replica's queue length after accepting the request, if reported
    pub queue_len: Option<u32>,
}

impl ReplicaReply {
    pub fn unary(replica: ReplicaId, value: serde_json::Value) -> Self {
        Self {
            replica,
            body: ReplyBody::Unary(value),
            queue_len: None,
        }
    }

    pub fn with_queue_len(mut self, queue_len: u32) -> Self {
        self.queue_len = Some(queue_len);
        self
    }
}

/// Transport-level dispatch failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Replica could not be reached
    Unreachable(String),
    /// Replica rejected the request as overloaded
    Overloaded,
    /// Replica's queue is at capacity
    QueueFull,
    /// Failure unrelated to placement (e.g. malformed payload)
    Fatal(String),
}

impl DispatchError {
    /// Whether retrying on another replica can change the outcome.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DispatchError::Fatal(_))
    }

    /// Map into the router's error taxonomy for the replica that failed.
    pub fn into_error(self, replica: &ReplicaId) -> Error {
        match self {
            DispatchError::Unreachable(reason) => Error::ReplicaUnavailable {
                replica: replica.clone(),
                reason,
            },
            DispatchError::Overloaded | DispatchError::QueueFull => Error::ReplicaOverloaded {
                replica: replica.clone(),
            },
            DispatchError::Fatal(msg) => Error::Transport(msg),
        }
    }
}

/// Invokes a replica.
#[async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    async fn dispatch(
        &self,
        replica: &ReplicaInfo,
        request: DispatchRequest,
    ) -> Result<ReplicaReply, DispatchError>;
}
