//! Per-request routing state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Placement strategy tried during selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Replicas that already hold the requested multiplexed model
    FirstMultiplexedMatch,
    /// Replicas with the fewest multiplexed models loaded
    FewestMultiplexedModels,
    /// Replicas on the caller's physical node
    SameNode,
    /// Replicas in the caller's availability zone
    SameAvailabilityZone,
    /// Any active replica
    Fallback,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::FirstMultiplexedMatch,
        Tier::FewestMultiplexedModels,
        Tier::SameNode,
        Tier::SameAvailabilityZone,
        Tier::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::FirstMultiplexedMatch => "first_multiplexed_match",
            Tier::FewestMultiplexedModels => "fewest_multiplexed_models",
            Tier::SameNode => "same_node",
            Tier::SameAvailabilityZone => "same_az",
            Tier::Fallback => "fallback",
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(
            self,
            Tier::FirstMultiplexedMatch | Tier::FewestMultiplexedModels
        )
    }

    fn bit(self) -> u8 {
        match self {
            Tier::FirstMultiplexedMatch => 1 << 0,
            Tier::FewestMultiplexedModels => 1 << 1,
            Tier::SameNode => 1 << 2,
            Tier::SameAvailabilityZone => 1 << 3,
            Tier::Fallback => 1 << 4,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of tiers, stored as a bitset.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TierSet(u8);

impl TierSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a tier. Returns true if it was not already present.
    pub fn insert(&mut self, tier: Tier) -> bool {
        let fresh = !self.contains(tier);
        self.0 |= tier.bit();
        fresh
    }

    pub fn contains(&self, tier: Tier) -> bool {
        self.0 & tier.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Tier> + '_ {
        Tier::ALL.into_iter().filter(|t| self.contains(*t))
    }
}

impl fmt::Debug for TierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Tier> for TierSet {
    fn from_iter<I: IntoIterator<Item = Tier>>(iter: I) -> Self {
        let mut set = TierSet::empty();
        for tier in iter {
            set.insert(tier);
        }
        set
    }
}

/// Routing state carried by one pending request.
///
/// Attempt flags only ever go from unset to set; there is no way to clear
/// them on an existing context.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    multiplexed_start_matching_time: Option<Duration>,
    tried: TierSet,
    should_backoff: bool,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock reading when multiplexed-model matching began
    pub fn multiplexed_start_matching_time(&self) -> Option<Duration> {
        self.multiplexed_start_matching_time
    }

    /// Record the start of multiplexed matching. Later calls keep the first time.
    pub fn start_multiplexed_matching(&mut self, now: Duration) {
        self.multiplexed_start_matching_time.get_or_insert(now);
    }

    pub fn tried(&self) -> TierSet {
        self.tried
    }

    pub fn has_tried(&self, tier: Tier) -> bool {
        self.tried.contains(tier)
    }

    /// Mark a tier attempted. Returns true on the first mark.
    pub fn mark_tried(&mut self, tier: Tier) -> bool {
        self.tried.insert(tier)
    }

    pub fn should_backoff(&self) -> bool {
        self.should_backoff
    }

    pub fn set_should_backoff(&mut self) {
        self.should_backoff = true;
    }
}
