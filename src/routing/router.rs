//! Replica router
//!
//! Drives each request through SELECTING → DISPATCHED → {SUCCEEDED,
//! RETRYING, FAILED}. Selection reads only resident state; the router
//! suspends only while a dispatch is in flight or a backoff timer runs, and
//! both waits race against the request's cancellation token and its age
//! deadline.

use super::backoff::BackoffSchedule;
use super::pending::AttemptOutcome;
use super::selection::{SelectionOutcome, TierSelector};
use super::telemetry;
use super::{
    CompletionHandle, PendingRequest, QueueLenCache, RequestMetadata, RequestPayload,
    RoutingPreferences, Tier,
};
use crate::clock::{Clock, MonotonicClock};
use crate::cluster::{
    DispatchError, DispatchRequest, ReplicaId, ReplicaInfo, ReplicaMembership, ReplicaReply,
    ReplicaTransport,
};
use crate::config::RouterConfig;
use crate::error::ExpiryReason;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes requests to replicas
pub struct Router {
    config: RouterConfig,
    membership: Arc<dyn ReplicaMembership>,
    transport: Arc<dyn ReplicaTransport>,
    cache: Arc<QueueLenCache>,
    clock: Arc<dyn Clock>,
    backoff: BackoffSchedule,
    in_flight: AtomicUsize,
}

impl Router {
    /// Create a router on the monotonic clock
    pub fn new(
        config: RouterConfig,
        membership: Arc<dyn ReplicaMembership>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Result<Self> {
        Self::with_clock(config, membership, transport, Arc::new(MonotonicClock::new()))
    }

    /// Create a router with an explicit time source for the cache and
    /// request ages
    pub fn with_clock(
        config: RouterConfig,
        membership: Arc<dyn ReplicaMembership>,
        transport: Arc<dyn ReplicaTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(QueueLenCache::with_clock(
            config.queue_len_staleness,
            clock.clone(),
        ));
        let backoff = BackoffSchedule::from_config(&config);

        Ok(Self {
            config,
            membership,
            transport,
            cache,
            clock,
            backoff,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Shared queue-length cache
    pub fn queue_len_cache(&self) -> &Arc<QueueLenCache> {
        &self.cache
    }

    /// Build a pending request stamped with the router's clock
    pub fn new_request(
        &self,
        payload: RequestPayload,
        metadata: RequestMetadata,
        preferences: RoutingPreferences,
    ) -> PendingRequest {
        PendingRequest::new(payload, metadata, preferences, self.clock.now())
    }

    /// Submit a request and return its completion handle.
    ///
    /// Routing runs on its own task. Dropping or cancelling the handle
    /// abandons the request.
    pub fn submit(
        self: &Arc<Self>,
        payload: RequestPayload,
        metadata: RequestMetadata,
        preferences: RoutingPreferences,
    ) -> CompletionHandle {
        let request = self.new_request(payload, metadata, preferences);
        let request_id = request.metadata().request_id.clone();
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let router = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            router.drive(request, tx, token).await;
        });

        CompletionHandle::new(request_id, rx, cancel)
    }

    async fn drive(
        self: Arc<Self>,
        mut request: PendingRequest,
        caller: oneshot::Sender<Result<ReplicaReply>>,
        cancel: CancellationToken,
    ) {
        let result = self.route(&mut request, &cancel).await;

        // A cancelled request is never resolved; dropping the sender lets the
        // handle report the cancellation itself.
        if matches!(result, Err(Error::CallerCancelled)) {
            return;
        }
        if caller.send(result).is_err() {
            debug!(
                "Completion handle for request {} dropped before delivery",
                request.metadata().request_id
            );
        }
    }

    /// Route a pending request to completion on the current task.
    ///
    /// Returns `Err(Error::CallerCancelled)` as soon as `cancel` fires, even
    /// while a dispatch is still in flight.
    pub async fn route(
        &self,
        request: &mut PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<ReplicaReply> {
        let _in_flight = InFlightGuard::enter(&self.in_flight);
        let started = self.clock.now();

        let result = self.route_attempts(request, cancel).await;

        let elapsed = self.clock.now().saturating_sub(started);
        let request_id = &request.metadata().request_id;
        match &result {
            Ok(reply) => {
                debug!(
                    request_id = %request_id,
                    replica = %reply.replica,
                    attempts = request.attempts(),
                    "Request routed"
                );
                telemetry::record_outcome("succeeded", None, request.attempts(), elapsed);
            }
            Err(Error::CallerCancelled) => {
                debug!(request_id = %request_id, "Request cancelled by caller");
                telemetry::record_outcome(
                    "cancelled",
                    Some(Error::CallerCancelled.class()),
                    request.attempts(),
                    elapsed,
                );
            }
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    attempts = request.attempts(),
                    error = %e,
                    "Request failed"
                );
                telemetry::record_outcome("failed", Some(e.class()), request.attempts(), elapsed);
            }
        }

        result
    }

    async fn route_attempts(
        &self,
        request: &mut PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<ReplicaReply> {
        let request_id = request.metadata().request_id.clone();
        let mut failures: HashMap<ReplicaId, u32> = HashMap::new();
        let mut last_error: Option<Error> = None;
        let mut fallback_failures = 0u32;
        let mut backoffs = 0u32;

        loop {
            // SELECTING
            if cancel.is_cancelled() {
                return Err(Error::CallerCancelled);
            }
            self.check_ceilings(request, &last_error)?;

            let candidates = self.membership.list_active_replicas();
            if candidates.is_empty() {
                return Err(Error::NoCandidateReplicas);
            }

            let now = self.clock.now();
            let outcome =
                TierSelector::new(&self.config, &self.cache).select(&candidates, request, &failures, now);

            match outcome {
                SelectionOutcome::Exhausted => return Err(Error::NoCandidateReplicas),
                SelectionOutcome::Saturated => {
                    let attempt = request.record_attempt();
                    debug!(
                        "All {} candidate replicas at capacity for request {} (attempt {})",
                        candidates.len(),
                        request_id,
                        attempt
                    );
                    request.routing_context_mut().set_should_backoff();
                }
                SelectionOutcome::Selected(selection) => {
                    let attempt = request.record_attempt();
                    telemetry::record_selection(selection.tier, selection.queue_len);
                    debug!(
                        request_id = %request_id,
                        replica = %selection.replica.id,
                        tier = selection.tier.as_str(),
                        queue_len = ?selection.queue_len,
                        attempt,
                        "Dispatching request"
                    );

                    // DISPATCHED
                    match self.dispatch(request, &selection.replica, attempt, cancel).await? {
                        // SUCCEEDED
                        Ok(reply) => {
                            if let Some(queue_len) = reply.queue_len {
                                self.cache.update(&selection.replica.id, queue_len);
                            }
                            return Ok(reply);
                        }
                        Err(failure) if !failure.is_recoverable() => {
                            return Err(failure.into_error(&selection.replica.id));
                        }
                        // RETRYING
                        Err(failure) => {
                            let replica_id = selection.replica.id.clone();
                            self.cache.invalidate(&replica_id);
                            *failures.entry(replica_id.clone()).or_insert(0) += 1;

                            if selection.tier == Tier::Fallback {
                                fallback_failures += 1;
                            }
                            let overloaded =
                                matches!(failure, DispatchError::Overloaded | DispatchError::QueueFull);
                            if overloaded || fallback_failures > 1 {
                                request.routing_context_mut().set_should_backoff();
                            }

                            let err = failure.into_error(&replica_id);
                            telemetry::record_dispatch_failure(err.class());
                            warn!(
                                "Attempt {} of request {} failed on replica {}: {}",
                                attempt, request_id, replica_id, err
                            );
                            last_error = Some(err);
                        }
                    }
                }
            }

            self.check_ceilings(request, &last_error)?;

            if request.routing_context().should_backoff() {
                let delay = self.backoff.delay(backoffs);
                backoffs += 1;
                telemetry::record_backoff(delay);
                debug!(
                    "Backing off {}ms before retrying request {}",
                    delay.as_millis(),
                    request_id
                );
                let deadline = self.age_deadline(request);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::CallerCancelled),
                    _ = deadline => return Err(self.expired_by_age(request)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            request.reset_for_retry();
        }
    }

    /// Hand the attempt to the transport on its own task and wait for the
    /// outcome or cancellation, whichever comes first.
    async fn dispatch(
        &self,
        request: &mut PendingRequest,
        replica: &ReplicaInfo,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        let (resolver, receiver) = request.take_attempt()?;
        let dispatch_request = DispatchRequest {
            metadata: request.metadata().clone(),
            payload: Arc::clone(request.payload()),
            attempt,
            tried_tiers: request.routing_context().tried(),
        };

        let transport = Arc::clone(&self.transport);
        let replica = replica.clone();
        tokio::spawn(async move {
            if resolver.is_abandoned() {
                debug!("Skipping dispatch to replica {}, attempt abandoned", replica.id);
                return;
            }
            let outcome = transport.dispatch(&replica, dispatch_request).await;
            if !resolver.resolve(outcome) {
                debug!("Discarding late reply from replica {}", replica.id);
                telemetry::record_late_reply_discarded();
            }
        });

        let deadline = self.age_deadline(request);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::CallerCancelled),
            _ = deadline => Err(self.expired_by_age(request)),
            received = receiver => Ok(received.unwrap_or_else(|_| {
                Err(DispatchError::Unreachable(
                    "dispatch task ended without a reply".to_string(),
                ))
            })),
        }
    }

    /// Completes when the request reaches its age ceiling; never completes
    /// when the ceiling is disabled.
    fn age_deadline(&self, request: &PendingRequest) -> impl Future<Output = ()> + Send + 'static {
        let remaining = self
            .config
            .max_request_age
            .map(|ceiling| ceiling.saturating_sub(request.age(self.clock.now())));
        async move {
            match remaining {
                Some(remaining) => tokio::time::sleep(remaining).await,
                None => std::future::pending().await,
            }
        }
    }

    fn expired_by_age(&self, request: &PendingRequest) -> Error {
        let ceiling = self.config.max_request_age.unwrap_or_default();
        Error::RequestExpired(ExpiryReason::MaxAge {
            age: request.age(self.clock.now()),
            ceiling,
        })
    }

    fn check_ceilings(&self, request: &PendingRequest, last_error: &Option<Error>) -> Result<()> {
        if request.attempts() >= self.config.max_attempts {
            return Err(Error::RequestExpired(ExpiryReason::MaxAttempts {
                attempts: request.attempts(),
                last_error: last_error.clone().map(Box::new),
            }));
        }
        if let Some(ceiling) = self.config.max_request_age {
            let age = request.age(self.clock.now());
            if age >= ceiling {
                return Err(Error::RequestExpired(ExpiryReason::MaxAge { age, ceiling }));
            }
        }
        Ok(())
    }

    /// Drop cache entries for replicas outside the current active set.
    pub fn prune_inactive(&self) -> usize {
        let active: HashSet<ReplicaId> = self
            .membership
            .list_active_replicas()
            .into_iter()
            .map(|replica| replica.id)
            .collect();

        let removed = self.cache.prune(&active);
        if removed > 0 {
            info!(
                "Pruned {} queue-length entries for inactive replicas",
                removed
            );
        }
        telemetry::record_pruned(removed);
        removed
    }

    /// Prune the cache on every membership change until `shutdown` fires.
    pub async fn run_membership_sync(&self, shutdown: CancellationToken) {
        let mut changes = self.membership.subscribe();
        self.prune_inactive();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Membership sync stopped");
                    break;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        warn!("Membership change channel closed, stopping sync");
                        break;
                    }
                    self.prune_inactive();
                }
            }
        }
    }

    /// Get router statistics
    pub fn get_stats(&self) -> RouterStats {
        RouterStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            cached_replicas: self.cache.len(),
            active_replicas: self.membership.list_active_replicas().len(),
        }
    }
}

/// Router statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStats {
    pub in_flight: usize,
    pub cached_replicas: usize,
    pub active_replicas: usize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
