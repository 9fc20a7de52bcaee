//! Integration tests for request routing
//!
//! Tests tiered placement, retry and backoff, expiry ceilings, cancellation
//! and membership-driven cache pruning against an in-process registry and a
//! scripted transport.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use replica_router::cluster::{
    DispatchError, DispatchRequest, ReplicaId, ReplicaInfo, ReplicaRegistry, ReplicaReply,
    ReplicaTransport, ReplyBody,
};
use replica_router::config::{RouterConfig, TierToggles};
use replica_router::routing::{
    RequestMetadata, RequestPayload, Router, RoutingPreferences, Tier, TierSet,
};
use replica_router::{Error, ExpiryReason};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type DispatchResult = std::result::Result<ReplicaReply, DispatchError>;
type Behavior = dyn Fn(&ReplicaInfo, &DispatchRequest) -> DispatchResult + Send + Sync;

/// Transport that records every dispatch and answers from a closure
struct ScriptedTransport {
    calls: Mutex<Vec<(ReplicaId, DispatchRequest)>>,
    behavior: Box<Behavior>,
}

impl ScriptedTransport {
    fn new(
        behavior: impl Fn(&ReplicaInfo, &DispatchRequest) -> DispatchResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            behavior: Box::new(behavior),
        })
    }

    fn calls(&self) -> Vec<(ReplicaId, DispatchRequest)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ReplicaTransport for ScriptedTransport {
    async fn dispatch(&self, replica: &ReplicaInfo, request: DispatchRequest) -> DispatchResult {
        self.calls.lock().push((replica.id.clone(), request.clone()));
        (self.behavior)(replica, &request)
    }
}

fn ok_reply(replica: &ReplicaInfo, queue_len: u32) -> DispatchResult {
    Ok(ReplicaReply::unary(replica.id.clone(), json!({ "served_by": replica.id.as_str() }))
        .with_queue_len(queue_len))
}

fn payload() -> RequestPayload {
    RequestPayload::new(vec![json!("input")])
}

fn router_with(
    config: RouterConfig,
    registry: &Arc<ReplicaRegistry>,
    transport: &Arc<ScriptedTransport>,
) -> Arc<Router> {
    Arc::new(Router::new(config, registry.clone(), transport.clone()).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_overloaded_replica_then_new_replica_succeeds() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));

    let a_failures = Arc::new(AtomicUsize::new(0));
    let transport = {
        let registry = registry.clone();
        let a_failures = a_failures.clone();
        ScriptedTransport::new(move |replica, _| {
            if replica.id.as_str() == "A" {
                // B joins the active set after A's second rejection
                if a_failures.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    registry.register_replica(ReplicaInfo::new("B"));
                }
                Err(DispatchError::Overloaded)
            } else {
                ok_reply(replica, 2)
            }
        })
    };
    let router = router_with(RouterConfig::default(), &registry, &transport);
    router.queue_len_cache().update(&ReplicaId::new("A"), 0);

    let reply = router
        .submit(payload(), RequestMetadata::new(), RoutingPreferences::default())
        .await
        .unwrap();

    assert_eq!(reply.replica, ReplicaId::new("B"));
    assert_eq!(router.queue_len_cache().get(&ReplicaId::new("A")), None);
    assert_eq!(router.queue_len_cache().get(&ReplicaId::new("B")), Some(2));

    let calls = transport.calls();
    assert_eq!(calls.len(), 3, "Two rejections by A, then B");
    assert_eq!(calls[2].0, ReplicaId::new("B"));
    assert_eq!(calls[2].1.attempt, 3);
    let fallback_only: TierSet = [Tier::Fallback].into_iter().collect();
    assert_eq!(calls[2].1.tried_tiers, fallback_only);
}

#[tokio::test]
async fn test_no_replicas_fails_immediately() {
    let registry = Arc::new(ReplicaRegistry::new());
    let transport = ScriptedTransport::new(ok_reply_zero);
    let router = router_with(RouterConfig::default(), &registry, &transport);

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        router.submit(payload(), RequestMetadata::new(), RoutingPreferences::default()),
    )
    .await
    .expect("no-replica failure must not wait on backoff");

    assert_eq!(result.unwrap_err(), Error::NoCandidateReplicas);
    assert!(transport.calls().is_empty());
}

fn ok_reply_zero(replica: &ReplicaInfo, _: &DispatchRequest) -> DispatchResult {
    ok_reply(replica, 0)
}

#[tokio::test(start_paused = true)]
async fn test_max_attempts_expiry_carries_last_error() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    registry.register_replica(ReplicaInfo::new("B"));
    let transport = ScriptedTransport::new(|_, _| {
        Err(DispatchError::Unreachable("connection refused".to_string()))
    });
    let config = RouterConfig {
        max_attempts: 3,
        ..Default::default()
    };
    let router = router_with(config, &registry, &transport);

    let err = router
        .submit(payload(), RequestMetadata::new(), RoutingPreferences::default())
        .await
        .unwrap_err();

    match err {
        Error::RequestExpired(ExpiryReason::MaxAttempts {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                last_error.as_deref(),
                Some(Error::ReplicaUnavailable { .. })
            ));
        }
        other => panic!("expected attempt-ceiling expiry, got {other:?}"),
    }

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    // Failure memory spreads retries across replicas
    assert_ne!(calls[0].0, calls[1].0);
}

#[tokio::test(start_paused = true)]
async fn test_max_age_expiry() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let transport = ScriptedTransport::new(|_, _| Err(DispatchError::QueueFull));
    let config = RouterConfig {
        max_request_age: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let router = router_with(config, &registry, &transport);

    let err = router
        .submit(payload(), RequestMetadata::new(), RoutingPreferences::default())
        .await
        .unwrap_err();

    match err {
        Error::RequestExpired(ExpiryReason::MaxAge { age, ceiling }) => {
            assert_eq!(ceiling, Duration::from_millis(100));
            assert!(age >= ceiling);
            // The third backoff (100ms) is cut short at the ceiling
            assert!(age < ceiling + Duration::from_millis(10), "overshot: {age:?}");
        }
        other => panic!("expected age-ceiling expiry, got {other:?}"),
    }
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test]
async fn test_fatal_transport_error_is_not_retried() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    registry.register_replica(ReplicaInfo::new("B"));
    let transport =
        ScriptedTransport::new(|_, _| Err(DispatchError::Fatal("payload rejected".to_string())));
    let router = router_with(RouterConfig::default(), &registry, &transport);

    let err = router
        .submit(payload(), RequestMetadata::new(), RoutingPreferences::default())
        .await
        .unwrap_err();

    assert_eq!(err, Error::Transport("payload rejected".to_string()));
    assert!(!err.is_recoverable());
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_dispatches_to_replica_reported_full() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A").with_max_ongoing_requests(2));
    // Every reply reports the replica at capacity
    let transport = ScriptedTransport::new(|replica, _| ok_reply(replica, 2));
    let router = router_with(RouterConfig::default(), &registry, &transport);

    for _ in 0..2 {
        let reply = router
            .submit(payload(), RequestMetadata::new(), RoutingPreferences::default())
            .await
            .unwrap();
        assert_eq!(reply.replica, ReplicaId::new("A"));
    }

    assert_eq!(router.queue_len_cache().get(&ReplicaId::new("A")), Some(2));
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.attempt, 1, "no saturated passes before dispatch");
}

#[tokio::test(start_paused = true)]
async fn test_saturated_affinity_without_fallback_gives_up() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(
        ReplicaInfo::new("A")
            .with_node("node-1")
            .with_max_ongoing_requests(2),
    );
    let transport = ScriptedTransport::new(ok_reply_zero);
    let config = RouterConfig {
        max_attempts: 3,
        tiers: TierToggles {
            fallback: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let router = router_with(config, &registry, &transport);
    router.queue_len_cache().update(&ReplicaId::new("A"), 2);

    let err = router
        .submit(
            payload(),
            RequestMetadata::new(),
            RoutingPreferences::default().same_node("node-1"),
        )
        .await
        .unwrap_err();

    // The same-node tier saturates once; with no fallback the next pass has
    // nothing left to try
    assert_eq!(err, Error::NoCandidateReplicas);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_affinity_tiers_accumulate_across_retries() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(
        ReplicaInfo::new("A")
            .with_node("node-1")
            .with_availability_zone("zone-a"),
    );
    registry.register_replica(
        ReplicaInfo::new("B")
            .with_node("node-2")
            .with_availability_zone("zone-a"),
    );
    registry.register_replica(
        ReplicaInfo::new("C")
            .with_node("node-3")
            .with_availability_zone("zone-b"),
    );
    let transport = ScriptedTransport::new(|replica, _| {
        if replica.id.as_str() == "B" {
            Err(DispatchError::Unreachable("node-2 draining".to_string()))
        } else {
            ok_reply(replica, 1)
        }
    });
    let router = router_with(RouterConfig::default(), &registry, &transport);

    let preferences = RoutingPreferences::default()
        .same_node("node-2")
        .same_availability_zone("zone-a");
    let reply = router
        .submit(payload(), RequestMetadata::new(), preferences)
        .await
        .unwrap();

    assert_eq!(reply.replica, ReplicaId::new("A"));

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, ReplicaId::new("B"));
    assert!(calls[0].1.tried_tiers.contains(Tier::SameNode));
    assert!(!calls[0].1.tried_tiers.contains(Tier::SameAvailabilityZone));

    assert!(calls[0]
        .1
        .tried_tiers
        .iter()
        .all(|tier| calls[1].1.tried_tiers.contains(tier)));
    assert!(calls[1].1.tried_tiers.contains(Tier::SameAvailabilityZone));
    assert!(!calls[1].1.tried_tiers.contains(Tier::Fallback));
}

#[tokio::test]
async fn test_multiplexed_model_prefers_loaded_replica() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    registry.register_replica(ReplicaInfo::new("B").with_models(["llama-7b"]));
    let transport = ScriptedTransport::new(ok_reply_zero);
    let router = router_with(RouterConfig::default(), &registry, &transport);

    let metadata = RequestMetadata::new().with_multiplexed_model("llama-7b");
    let reply = router
        .submit(payload(), metadata, RoutingPreferences::default())
        .await
        .unwrap();

    assert_eq!(reply.replica, ReplicaId::new("B"));
    let calls = transport.calls();
    assert!(calls[0]
        .1
        .tried_tiers
        .contains(Tier::FirstMultiplexedMatch));
    assert_eq!(
        calls[0].1.metadata.multiplexed_model_id.as_deref(),
        Some("llama-7b")
    );
}

#[tokio::test]
async fn test_streaming_reply_passes_through() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let transport = ScriptedTransport::new(|replica, request| {
        assert!(request.metadata.is_streaming);
        let rest = futures::stream::iter(vec![Ok(json!("two")), Ok(json!("three"))]).boxed();
        Ok(ReplicaReply {
            replica: replica.id.clone(),
            body: ReplyBody::Stream {
                first: json!("one"),
                rest,
            },
            queue_len: Some(1),
        })
    });
    let router = router_with(RouterConfig::default(), &registry, &transport);

    let reply = router
        .submit(
            payload(),
            RequestMetadata::new().streaming(),
            RoutingPreferences::default(),
        )
        .await
        .unwrap();

    let ReplyBody::Stream { first, rest } = reply.body else {
        panic!("expected a streaming reply");
    };
    assert_eq!(first, json!("one"));
    let rest: Vec<_> = rest.map(|chunk| chunk.unwrap()).collect().await;
    assert_eq!(rest, vec![json!("two"), json!("three")]);
}

/// Transport that blocks every dispatch until released
struct GatedTransport {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl ReplicaTransport for GatedTransport {
    async fn dispatch(&self, replica: &ReplicaInfo, _request: DispatchRequest) -> DispatchResult {
        self.started.notify_one();
        self.release.notified().await;
        ok_reply(replica, 9)
    }
}

#[tokio::test]
async fn test_cancellation_discards_late_reply() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let transport = Arc::new(GatedTransport {
        started: Notify::new(),
        release: Notify::new(),
    });
    let router = Arc::new(
        Router::new(RouterConfig::default(), registry.clone(), transport.clone()).unwrap(),
    );

    let handle = router.submit(payload(), RequestMetadata::new(), RoutingPreferences::default());
    transport.started.notified().await;
    assert_eq!(router.get_stats().in_flight, 1);

    handle.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("cancellation must not wait for the replica");
    assert_eq!(result.unwrap_err(), Error::CallerCancelled);

    // Let the replica answer after the caller has gone
    transport.release.notify_one();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(router.queue_len_cache().get(&ReplicaId::new("A")), None);
    assert_eq!(router.get_stats().in_flight, 0);
}

#[tokio::test]
async fn test_dropping_handle_cancels_routing() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let transport = Arc::new(GatedTransport {
        started: Notify::new(),
        release: Notify::new(),
    });
    let router = Arc::new(
        Router::new(RouterConfig::default(), registry.clone(), transport.clone()).unwrap(),
    );

    let handle = router.submit(payload(), RequestMetadata::new(), RoutingPreferences::default());
    transport.started.notified().await;
    drop(handle);

    tokio::time::timeout(Duration::from_secs(1), async {
        while router.get_stats().in_flight > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("routing should stop once the handle is dropped");
}

#[tokio::test]
async fn test_route_on_caller_task() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let transport = ScriptedTransport::new(ok_reply_zero);
    let router = router_with(RouterConfig::default(), &registry, &transport);

    let mut request = router.new_request(
        payload(),
        RequestMetadata::new().with_request_id("req-42"),
        RoutingPreferences::default(),
    );
    let reply = router
        .route(&mut request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.replica, ReplicaId::new("A"));
    assert_eq!(request.attempts(), 1);
    assert!(request.routing_context().has_tried(Tier::Fallback));
    assert_eq!(transport.calls()[0].1.metadata.request_id, "req-42");
}

#[tokio::test]
async fn test_membership_sync_prunes_removed_replicas() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    registry.register_replica(ReplicaInfo::new("B"));
    let transport = ScriptedTransport::new(ok_reply_zero);
    let router = router_with(RouterConfig::default(), &registry, &transport);

    router.queue_len_cache().update(&ReplicaId::new("A"), 1);
    router.queue_len_cache().update(&ReplicaId::new("B"), 3);

    let shutdown = CancellationToken::new();
    let sync = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { router.run_membership_sync(shutdown).await })
    };

    assert!(registry.remove_replica(&ReplicaId::new("B")));

    tokio::time::timeout(Duration::from_secs(1), async {
        while router.queue_len_cache().len() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removed replica should be pruned from the cache");

    assert_eq!(router.queue_len_cache().get(&ReplicaId::new("A")), Some(1));
    assert_eq!(router.queue_len_cache().get(&ReplicaId::new("B")), None);

    shutdown.cancel();
    sync.await.unwrap();
}

/// Transport whose replicas never answer
struct SilentTransport;

#[async_trait]
impl ReplicaTransport for SilentTransport {
    async fn dispatch(&self, _replica: &ReplicaInfo, _request: DispatchRequest) -> DispatchResult {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_age_ceiling_applies_to_in_flight_dispatch() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let config = RouterConfig {
        max_request_age: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let router = Arc::new(Router::new(config, registry.clone(), Arc::new(SilentTransport)).unwrap());

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(3600),
        router.submit(payload(), RequestMetadata::new(), RoutingPreferences::default()),
    )
    .await
    .expect("a silent replica must not hold the request past its age ceiling");

    assert!(matches!(
        result,
        Err(Error::RequestExpired(ExpiryReason::MaxAge { .. }))
    ));
    assert!(started.elapsed() < Duration::from_millis(110));
    assert_eq!(router.get_stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let transport = ScriptedTransport::new(|_, _| Err(DispatchError::Overloaded));
    let config = RouterConfig {
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(5),
        ..Default::default()
    };
    let router = router_with(config, &registry, &transport);

    let started = tokio::time::Instant::now();
    let handle = router.submit(payload(), RequestMetadata::new(), RoutingPreferences::default());

    // Let the first attempt fail and the router settle into its backoff sleep
    while transport.calls().is_empty() {
        tokio::task::yield_now().await;
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(router.get_stats().in_flight, 1);

    handle.cancel();
    assert_eq!(handle.await.unwrap_err(), Error::CallerCancelled);

    assert!(started.elapsed() < Duration::from_secs(1), "waited out the backoff");
    assert_eq!(transport.calls().len(), 1);
    assert_eq!(router.get_stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_grow_to_cap() {
    let registry = Arc::new(ReplicaRegistry::new());
    registry.register_replica(ReplicaInfo::new("A"));
    let dispatched_at = Arc::new(Mutex::new(Vec::new()));
    let transport = {
        let dispatched_at = dispatched_at.clone();
        ScriptedTransport::new(move |replica, request| {
            dispatched_at.lock().push(tokio::time::Instant::now());
            if request.attempt < 7 {
                Err(DispatchError::Overloaded)
            } else {
                ok_reply(replica, 0)
            }
        })
    };
    let router = router_with(RouterConfig::default(), &registry, &transport);

    router
        .submit(payload(), RequestMetadata::new(), RoutingPreferences::default())
        .await
        .unwrap();

    let times = dispatched_at.lock().clone();
    assert_eq!(times.len(), 7);
    let expected_ms = [25u64, 50, 100, 200, 400, 500];
    for (pair, expected) in times.windows(2).zip(expected_ms) {
        let gap = pair[1] - pair[0];
        let expected = Duration::from_millis(expected);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(5),
            "gap {gap:?}, expected {expected:?}"
        );
    }
}
