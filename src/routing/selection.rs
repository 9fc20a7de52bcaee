//! Tiered replica selection
//!
//! A pure decision over the candidate set, the resident cache contents and
//! the request's routing context. Nothing here waits on I/O.
//!
//! Tiers run in priority order: the two multiplexed-model tiers (order set by
//! [`MultiplexPrecedence`]), same node, same availability zone, then the
//! unconstrained fallback. Affinity tiers are tried at most once per request.
//! The fallback is the last resort and stays available on every attempt.
//!
//! Within a tier, candidates rank by:
//! 1. how many times they already failed this request (fewer first),
//! 2. whether the replica is at capacity (full last),
//! 3. known vs. unknown queue length, per [`UnknownQueuePolicy`],
//! 4. cached queue length (lower first),
//! 5. position in the candidate list.
//!
//! Affinity tiers skip replicas whose fresh cached queue length has reached
//! their `max_ongoing_requests`. The fallback never skips anyone: a full
//! reading only lasts until the replica's next reply, and dispatching is the
//! only way to get one.

use super::{PendingRequest, QueueLenCache, RequestMetadata, RoutingPreferences, Tier};
use crate::cluster::{ReplicaId, ReplicaInfo};
use crate::config::{MultiplexPrecedence, RouterConfig, UnknownQueuePolicy};
use std::collections::HashMap;
use std::time::Duration;

/// A chosen replica and the tier that chose it
#[derive(Debug, Clone)]
pub struct Selection {
    pub replica: ReplicaInfo,
    pub tier: Tier,
    /// Cached queue length at selection time
    pub queue_len: Option<u32>,
}

/// Result of one selection pass
#[derive(Debug, Clone)]
pub enum SelectionOutcome {
    Selected(Selection),
    /// Some affinity tier had members but every one of them is at capacity,
    /// and the fallback is disabled
    Saturated,
    /// No enabled tier produced a member
    Exhausted,
}

/// Selection policy bound to a config and a cache
pub struct TierSelector<'a> {
    config: &'a RouterConfig,
    cache: &'a QueueLenCache,
}

impl<'a> TierSelector<'a> {
    pub fn new(config: &'a RouterConfig, cache: &'a QueueLenCache) -> Self {
        Self { config, cache }
    }

    /// Tiers in the order they are tried
    pub fn tier_order(&self) -> [Tier; 5] {
        let (first, second) = match self.config.multiplex_precedence {
            MultiplexPrecedence::FirstMatch => {
                (Tier::FirstMultiplexedMatch, Tier::FewestMultiplexedModels)
            }
            MultiplexPrecedence::FewestModels => {
                (Tier::FewestMultiplexedModels, Tier::FirstMultiplexedMatch)
            }
        };
        [
            first,
            second,
            Tier::SameNode,
            Tier::SameAvailabilityZone,
            Tier::Fallback,
        ]
    }

    /// Pick a replica for `request`, marking every tier it enters as tried.
    ///
    /// `failures` counts earlier failed attempts of this request per replica.
    pub fn select(
        &self,
        candidates: &[ReplicaInfo],
        request: &mut PendingRequest,
        failures: &HashMap<ReplicaId, u32>,
        now: Duration,
    ) -> SelectionOutcome {
        // One snapshot per pass so every tier ranks against the same view
        let queue_lens: Vec<Option<u32>> = candidates
            .iter()
            .map(|replica| self.cache.get(&replica.id))
            .collect();

        let mut saturated = false;

        for tier in self.tier_order() {
            if !self.is_enabled(tier)
                || !is_applicable(tier, request.metadata(), request.preferences())
            {
                continue;
            }
            if tier != Tier::Fallback && request.routing_context().has_tried(tier) {
                continue;
            }

            let members = tier_members(tier, candidates, request.metadata(), request.preferences());

            let ctx = request.routing_context_mut();
            if tier.is_multiplexed() {
                ctx.start_multiplexed_matching(now);
            }
            ctx.mark_tried(tier);

            let is_full =
                |i: usize| matches!(queue_lens[i], Some(len) if candidates[i].is_full(len));
            let eligible: Vec<usize> = if tier == Tier::Fallback {
                members.clone()
            } else {
                members.iter().copied().filter(|&i| !is_full(i)).collect()
            };

            if eligible.is_empty() {
                saturated |= !members.is_empty();
                continue;
            }

            let best = eligible.into_iter().min_by_key(|&i| {
                let failed = failures.get(&candidates[i].id).copied().unwrap_or(0);
                (
                    failed,
                    is_full(i),
                    self.unknown_rank(queue_lens[i]),
                    queue_lens[i].unwrap_or(0),
                    i,
                )
            });

            if let Some(i) = best {
                return SelectionOutcome::Selected(Selection {
                    replica: candidates[i].clone(),
                    tier,
                    queue_len: queue_lens[i],
                });
            }
        }

        if saturated {
            SelectionOutcome::Saturated
        } else {
            SelectionOutcome::Exhausted
        }
    }

    fn is_enabled(&self, tier: Tier) -> bool {
        let tiers = &self.config.tiers;
        match tier {
            Tier::FirstMultiplexedMatch | Tier::FewestMultiplexedModels => tiers.multiplexed,
            Tier::SameNode => tiers.same_node,
            Tier::SameAvailabilityZone => tiers.same_az,
            Tier::Fallback => tiers.fallback,
        }
    }

    fn unknown_rank(&self, queue_len: Option<u32>) -> u8 {
        match (self.config.unknown_queue_policy, queue_len) {
            (UnknownQueuePolicy::Probe, None) => 0,
            (UnknownQueuePolicy::Probe, Some(_)) => 1,
            (UnknownQueuePolicy::Deprioritize, Some(_)) => 0,
            (UnknownQueuePolicy::Deprioritize, None) => 1,
        }
    }
}

fn is_applicable(tier: Tier, metadata: &RequestMetadata, prefs: &RoutingPreferences) -> bool {
    match tier {
        Tier::FirstMultiplexedMatch | Tier::FewestMultiplexedModels => {
            metadata.multiplexed_model_id.is_some()
        }
        Tier::SameNode => prefs.node_id.is_some(),
        Tier::SameAvailabilityZone => prefs.availability_zone.is_some(),
        Tier::Fallback => true,
    }
}

/// Indices of candidates that belong to a tier
fn tier_members(
    tier: Tier,
    candidates: &[ReplicaInfo],
    metadata: &RequestMetadata,
    prefs: &RoutingPreferences,
) -> Vec<usize> {
    let indices = 0..candidates.len();
    match tier {
        Tier::FirstMultiplexedMatch => {
            let Some(model) = metadata.multiplexed_model_id.as_ref() else {
                return Vec::new();
            };
            indices
                .filter(|&i| candidates[i].multiplexed_model_ids.contains(model))
                .collect()
        }
        Tier::FewestMultiplexedModels => {
            let Some(fewest) = candidates
                .iter()
                .map(|r| r.multiplexed_model_ids.len())
                .min()
            else {
                return Vec::new();
            };
            indices
                .filter(|&i| candidates[i].multiplexed_model_ids.len() == fewest)
                .collect()
        }
        Tier::SameNode => indices
            .filter(|&i| {
                prefs.node_id.is_some() && candidates[i].node_id == prefs.node_id
            })
            .collect(),
        Tier::SameAvailabilityZone => indices
            .filter(|&i| {
                prefs.availability_zone.is_some()
                    && candidates[i].availability_zone == prefs.availability_zone
            })
            .collect(),
        Tier::Fallback => indices.collect(),
    }
}
