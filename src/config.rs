//! Router configuration
//!
//! Values only; the router core consumes them and never reads the
//! environment on its own. `RouterConfig::from_env` is the convenience path
//! for hosts that configure through environment variables:
//!
//! - REPLICA_ROUTER_QUEUE_LEN_STALENESS_MS (default: 10000)
//! - REPLICA_ROUTER_MAX_ATTEMPTS (default: 10)
//! - REPLICA_ROUTER_BACKOFF_BASE_MS (default: 25)
//! - REPLICA_ROUTER_BACKOFF_MULTIPLIER (default: 2.0)
//! - REPLICA_ROUTER_BACKOFF_MAX_MS (default: 500)
//! - REPLICA_ROUTER_MAX_REQUEST_AGE_MS (default: 120000, 0 disables)
//! - REPLICA_ROUTER_TIER_MULTIPLEXED / _TIER_SAME_NODE / _TIER_SAME_AZ / _TIER_FALLBACK
//! - REPLICA_ROUTER_UNKNOWN_QUEUE_POLICY: "probe" (default) or "deprioritize"
//! - REPLICA_ROUTER_MULTIPLEX_PRECEDENCE: "first_match" (default) or "fewest_models"

use crate::{Error, Result};
use std::time::Duration;
use tracing::info;

/// How a replica with no fresh queue-length observation ranks within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownQueuePolicy {
    /// Unknown ranks ahead of every known length; dispatching doubles as the probe.
    Probe,
    /// Unknown ranks behind every known length.
    Deprioritize,
}

impl UnknownQueuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Deprioritize => "deprioritize",
        }
    }
}

impl std::str::FromStr for UnknownQueuePolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "probe" => Ok(Self::Probe),
            "deprioritize" | "deprioritise" => Ok(Self::Deprioritize),
            other => Err(Error::Config(format!(
                "unknown queue policy '{}'; expected probe or deprioritize",
                other
            ))),
        }
    }
}

/// Order of the two multiplexed-model affinity tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexPrecedence {
    /// Replicas already holding the model, then replicas with the fewest models.
    FirstMatch,
    /// Replicas with the fewest models, then replicas already holding the model.
    FewestModels,
}

impl std::str::FromStr for MultiplexPrecedence {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first_match" | "first-match" => Ok(Self::FirstMatch),
            "fewest_models" | "fewest-models" => Ok(Self::FewestModels),
            other => Err(Error::Config(format!(
                "unknown multiplex precedence '{}'; expected first_match or fewest_models",
                other
            ))),
        }
    }
}

/// Per-tier enable switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierToggles {
    pub multiplexed: bool,
    pub same_node: bool,
    pub same_az: bool,
    pub fallback: bool,
}

impl Default for TierToggles {
    fn default() -> Self {
        Self {
            multiplexed: true,
            same_node: true,
            same_az: true,
            fallback: true,
        }
    }
}

/// Configuration consumed by the router core
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum age at which a cached queue length is trusted
    pub queue_len_staleness: Duration,
    /// Maximum dispatch attempts per request
    pub max_attempts: u32,
    /// First backoff delay
    pub backoff_base: Duration,
    /// Growth factor between consecutive backoff delays
    pub backoff_multiplier: f64,
    /// Backoff ceiling
    pub backoff_max: Duration,
    /// Absolute request age ceiling (None disables)
    pub max_request_age: Option<Duration>,
    /// Tier enable flags
    pub tiers: TierToggles,
    /// Ranking of replicas with unknown queue length
    pub unknown_queue_policy: UnknownQueuePolicy,
    /// Order of the multiplexed tiers
    pub multiplex_precedence: MultiplexPrecedence,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_len_staleness: Duration::from_secs(10),
            max_attempts: 10,
            backoff_base: Duration::from_millis(25),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_millis(500),
            max_request_age: Some(Duration::from_secs(120)),
            tiers: TierToggles::default(),
            unknown_queue_policy: UnknownQueuePolicy::Probe,
            multiplex_precedence: MultiplexPrecedence::FirstMatch,
        }
    }
}

impl RouterConfig {
    /// Build a configuration from `REPLICA_ROUTER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_request_age = match parse_u64("REPLICA_ROUTER_MAX_REQUEST_AGE_MS")? {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.max_request_age,
        };

        let config = Self {
            queue_len_staleness: parse_millis("REPLICA_ROUTER_QUEUE_LEN_STALENESS_MS")?
                .unwrap_or(defaults.queue_len_staleness),
            max_attempts: match parse_u64("REPLICA_ROUTER_MAX_ATTEMPTS")? {
                Some(n) => u32::try_from(n).map_err(|_| {
                    Error::Config(format!("REPLICA_ROUTER_MAX_ATTEMPTS out of range: {n}"))
                })?,
                None => defaults.max_attempts,
            },
            backoff_base: parse_millis("REPLICA_ROUTER_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.backoff_base),
            backoff_multiplier: parse_f64("REPLICA_ROUTER_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.backoff_multiplier),
            backoff_max: parse_millis("REPLICA_ROUTER_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.backoff_max),
            max_request_age,
            tiers: TierToggles {
                multiplexed: parse_optional_bool("REPLICA_ROUTER_TIER_MULTIPLEXED")?
                    .unwrap_or(defaults.tiers.multiplexed),
                same_node: parse_optional_bool("REPLICA_ROUTER_TIER_SAME_NODE")?
                    .unwrap_or(defaults.tiers.same_node),
                same_az: parse_optional_bool("REPLICA_ROUTER_TIER_SAME_AZ")?
                    .unwrap_or(defaults.tiers.same_az),
                fallback: parse_optional_bool("REPLICA_ROUTER_TIER_FALLBACK")?
                    .unwrap_or(defaults.tiers.fallback),
            },
            unknown_queue_policy: match std::env::var("REPLICA_ROUTER_UNKNOWN_QUEUE_POLICY") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.unknown_queue_policy,
            },
            multiplex_precedence: match std::env::var("REPLICA_ROUTER_MULTIPLEX_PRECEDENCE") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.multiplex_precedence,
            },
        };

        config.validate()?;

        info!(
            staleness_ms = config.queue_len_staleness.as_millis() as u64,
            max_attempts = config.max_attempts,
            unknown_queue_policy = config.unknown_queue_policy.as_str(),
            "Loaded router configuration from environment"
        );

        Ok(config)
    }

    /// Reject configurations the router cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.queue_len_staleness.is_zero() {
            return Err(Error::Config(
                "queue_len_staleness must be greater than zero".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::Config(format!(
                "backoff_base ({}ms) exceeds backoff_max ({}ms)",
                self.backoff_base.as_millis(),
                self.backoff_max.as_millis()
            )));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::Config(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

pub(crate) fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    parse_bool_value(name, &raw).map(Some)
}

fn parse_bool_value(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_u64(name: &str) -> Result<Option<u64>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} must be an unsigned integer: {e}")))
}

fn parse_millis(name: &str) -> Result<Option<Duration>> {
    Ok(parse_u64(name)?.map(Duration::from_millis))
}

fn parse_f64(name: &str) -> Result<Option<f64>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    raw.trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} must be a float: {e}")))
}
