//! # Replica Router
//!
//! Request-routing core for a pool of model-serving replicas.
//!
//! Each request is placed on one replica, chosen by affinity and by a cached
//! view of per-replica queue lengths, and is retried with exponential backoff
//! when a replica turns out to be unreachable or overloaded.
//!
//! ## Components
//!
//! - **Queue-length cache**: recent queue-length observations per replica,
//!   with staleness-based expiry
//! - **Routing context**: per-request record of tried tiers and backoff state,
//!   preserved across retries
//! - **Pending request**: the request envelope plus a single-use attempt slot
//! - **Router**: tiered selection, dispatch, retry and cancellation
//!
//! Replica membership and the transport that actually invokes a replica are
//! collaborators supplied by the host; see [`cluster`].

pub mod clock;
pub mod cluster;
pub mod config;
pub mod routing;
pub mod telemetry;

mod error;

pub use error::{Error, ExpiryReason, Result};

/// Common imports for hosts embedding the router
pub mod prelude {
    pub use crate::cluster::{
        DispatchError, DispatchRequest, ReplicaId, ReplicaInfo, ReplicaMembership,
        ReplicaRegistry, ReplicaReply, ReplicaTransport, ReplyBody,
    };
    pub use crate::config::RouterConfig;
    pub use crate::routing::{
        CompletionHandle, RequestMetadata, RequestPayload, Router, RoutingPreferences, Tier,
    };
    pub use crate::{Error, Result};
}
