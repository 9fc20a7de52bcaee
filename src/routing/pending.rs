//! Pending request envelope and completion handles
//!
//! A [`PendingRequest`] owns exactly one attempt slot at a time. The slot's
//! [`AttemptResolver`] is consumed when it resolves, so a single attempt can
//! never be resolved twice; [`PendingRequest::reset_for_retry`] installs a
//! fresh slot for the next attempt and discards the old one.

use super::RoutingContext;
use crate::cluster::{DispatchError, ReplicaReply};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Outcome of one dispatch attempt
pub type AttemptOutcome = std::result::Result<ReplicaReply, DispatchError>;

/// Positional and keyword arguments of a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl RequestPayload {
    pub fn new(args: Vec<serde_json::Value>) -> Self {
        Self {
            args,
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

/// Request metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Unique request identifier
    pub request_id: String,
    /// Whether the caller expects a streaming reply
    pub is_streaming: bool,
    /// Multiplexed model the request targets, if any
    pub multiplexed_model_id: Option<String>,
    /// Wall-clock receive time, for logs
    pub received_at: DateTime<Utc>,
}

impl RequestMetadata {
    /// Metadata with a fresh random request id
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            is_streaming: false,
            multiplexed_model_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }

    pub fn with_multiplexed_model(mut self, model_id: impl Into<String>) -> Self {
        self.multiplexed_model_id = Some(model_id.into());
        self
    }
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side placement preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPreferences {
    /// Prefer replicas on this physical node
    pub node_id: Option<String>,
    /// Prefer replicas in this availability zone
    pub availability_zone: Option<String>,
}

impl RoutingPreferences {
    pub fn same_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn same_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }
}

/// Resolves one dispatch attempt. Consumed on use.
#[derive(Debug)]
pub struct AttemptResolver {
    tx: oneshot::Sender<AttemptOutcome>,
}

impl AttemptResolver {
    /// Deliver the attempt outcome. Returns false when the attempt was
    /// abandoned (cancelled or superseded), in which case the outcome is
    /// discarded.
    pub fn resolve(self, outcome: AttemptOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Whether the waiting side is gone.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
struct AttemptSlot {
    tx: Option<oneshot::Sender<AttemptOutcome>>,
    rx: Option<oneshot::Receiver<AttemptOutcome>>,
}

impl AttemptSlot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

/// A request waiting to be served by a replica
#[derive(Debug)]
pub struct PendingRequest {
    payload: Arc<RequestPayload>,
    metadata: RequestMetadata,
    preferences: RoutingPreferences,
    /// Clock reading at creation; survives retries
    created_at: Duration,
    routing_context: RoutingContext,
    slot: AttemptSlot,
    attempts: u32,
}

impl PendingRequest {
    pub fn new(
        payload: RequestPayload,
        metadata: RequestMetadata,
        preferences: RoutingPreferences,
        created_at: Duration,
    ) -> Self {
        Self {
            payload: Arc::new(payload),
            metadata,
            preferences,
            created_at,
            routing_context: RoutingContext::new(),
            slot: AttemptSlot::new(),
            attempts: 0,
        }
    }

    pub fn payload(&self) -> &Arc<RequestPayload> {
        &self.payload
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn preferences(&self) -> &RoutingPreferences {
        &self.preferences
    }

    pub fn created_at(&self) -> Duration {
        self.created_at
    }

    /// Age relative to a reading of the same clock
    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.created_at)
    }

    pub fn routing_context(&self) -> &RoutingContext {
        &self.routing_context
    }

    pub fn routing_context_mut(&mut self) -> &mut RoutingContext {
        &mut self.routing_context
    }

    /// Dispatch attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Take both halves of the current attempt slot.
    ///
    /// Fails if the slot was already taken and not reset.
    pub fn take_attempt(
        &mut self,
    ) -> Result<(AttemptResolver, oneshot::Receiver<AttemptOutcome>)> {
        match (self.slot.tx.take(), self.slot.rx.take()) {
            (Some(tx), Some(rx)) => Ok((AttemptResolver { tx }, rx)),
            _ => Err(Error::Internal(format!(
                "attempt slot for request {} reused without reset_for_retry",
                self.metadata.request_id
            ))),
        }
    }

    /// Discard the current attempt slot and install a fresh one. Routing
    /// context, attempt count and creation time are preserved.
    pub fn reset_for_retry(&mut self) {
        self.slot = AttemptSlot::new();
    }
}

/// Caller's handle to a submitted request.
///
/// Resolves exactly once with the reply or a classified failure. Dropping
/// the handle, or calling [`CompletionHandle::cancel`], abandons the request.
#[derive(Debug)]
pub struct CompletionHandle {
    request_id: String,
    rx: oneshot::Receiver<Result<ReplicaReply>>,
    cancel: CancellationToken,
}

impl CompletionHandle {
    pub(crate) fn new(
        request_id: String,
        rx: oneshot::Receiver<Result<ReplicaReply>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            rx,
            cancel,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Abandon the request. Any reply still in flight is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Future for CompletionHandle {
    type Output = Result<ReplicaReply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::CallerCancelled)))
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
