//! Request routing
//!
//! Picks a replica for each request, dispatches it, and retries on
//! recoverable failures until the request succeeds, fails, or is cancelled.
//!
//! Placement walks affinity tiers in order (multiplexed model, same node,
//! same availability zone) before falling back to the whole active set.
//! Within a tier the replica with the shortest fresh queue length wins.

pub mod backoff;
pub mod context;
pub mod pending;
pub mod queue_len_cache;
pub mod router;
pub mod selection;
mod telemetry;

pub use backoff::BackoffSchedule;
pub use context::{RoutingContext, Tier, TierSet};
pub use pending::{
    AttemptOutcome, AttemptResolver, CompletionHandle, PendingRequest, RequestMetadata,
    RequestPayload, RoutingPreferences,
};
pub use queue_len_cache::{QueueLenCache, QueueLenEntry};
pub use router::{Router, RouterStats};
pub use selection::{Selection, SelectionOutcome, TierSelector};
