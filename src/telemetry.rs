//! Telemetry bootstrap for processes embedding the router.

use crate::config::parse_optional_bool;
use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_ROUTER_INSTANCE: &str = "replica_router.instance";

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Whether routing metrics are recorded through an SDK meter provider
    pub metrics_enabled: bool,
    pub instance: Option<String>,
    pub resource_attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "OTEL_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let metrics_enabled =
            parse_optional_bool("REPLICA_ROUTER_METRICS_ENABLED")?.unwrap_or(true);

        let instance = std::env::var("REPLICA_ROUTER_INSTANCE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut attr_map: BTreeMap<String, String> = BTreeMap::new();
        if let Ok(attr_str) = std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            for (key, value) in parse_resource_attributes(&attr_str)? {
                attr_map.insert(key, value);
            }
        }

        attr_map.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
        attr_map
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| "replica_router".to_string());
        if let Some(instance) = &instance {
            attr_map.insert(ATTR_ROUTER_INSTANCE.to_string(), instance.clone());
        }

        let resource_attributes = attr_map
            .into_iter()
            .map(|(k, v)| KeyValue::new(k, v))
            .collect::<Vec<_>>();

        Ok(Self {
            service_name: service_name.to_string(),
            metrics_enabled,
            instance,
            resource_attributes,
        })
    }
}

/// Keeps the meter provider alive; shuts it down on drop.
pub struct Telemetry {
    config: TelemetryConfig,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Install the JSON log subscriber and the OTel meter provider for a
    /// process.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| {
                Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
            })?;

        // Without a provider the global meter is a no-op and routing
        // instruments record nothing.
        let meter_provider = if config.metrics_enabled {
            let resource =
                Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
            let provider = SdkMeterProvider::builder().with_resource(resource).build();
            global::set_meter_provider(provider.clone());
            Some(provider)
        } else {
            None
        };

        info!(
            service_name = %config.service_name,
            metrics_enabled = config.metrics_enabled,
            instance = %config.instance.as_deref().unwrap_or("none"),
            "Telemetry bootstrap initialized"
        );

        Ok(Self {
            config,
            meter_provider,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn instance(&self) -> Option<&str> {
        self.config.instance.as_deref()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.meter_provider.is_some()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(meter_provider) = &self.meter_provider {
            let _ = meter_provider.shutdown();
        }
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
            ));
        }
        attrs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(attrs)
}
