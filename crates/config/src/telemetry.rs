//! Telemetry configuration for exporting rate limiter metrics.

use std::{collections::BTreeMap, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Telemetry configuration for observability
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Service name for telemetry identification
    service_name: Option<String>,

    /// Custom resource attributes to attach to all telemetry
    resource_attributes: BTreeMap<String, String>,

    /// Exporters configuration
    exporters: ExportersConfig,
}

impl TelemetryConfig {
    /// Get the service name
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Get the resource attributes
    pub fn resource_attributes(&self) -> &BTreeMap<String, String> {
        &self.resource_attributes
    }

    /// The OTLP exporter for metrics, if one is enabled.
    pub fn metrics_otlp_config(&self) -> Option<&OtlpExporterConfig> {
        Some(&self.exporters.otlp).filter(|otlp| otlp.enabled)
    }
}

/// Exporters configuration for telemetry
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExportersConfig {
    /// OTLP exporter configuration
    pub otlp: OtlpExporterConfig,
}

/// OTLP exporter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtlpExporterConfig {
    /// Whether this exporter is enabled
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Url,

    /// Protocol to use (grpc or http)
    pub protocol: OtlpProtocol,

    /// Request timeout
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    /// Delay between two metric exports
    #[serde(deserialize_with = "deserialize_duration")]
    pub export_interval: Duration,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            protocol: OtlpProtocol::default(),
            timeout: Duration::from_secs(60),
            export_interval: Duration::from_secs(5),
        }
    }
}

fn default_endpoint() -> Url {
    Url::parse("http://localhost:4317").expect("default URL should be valid")
}

/// OTLP protocol selection
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    /// gRPC protocol (default)
    #[default]
    Grpc,
    /// HTTP/protobuf protocol
    Http,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_disabled_by_default() {
        let config: TelemetryConfig = toml::from_str("").unwrap();
        assert!(config.metrics_otlp_config().is_none());
    }

    #[test]
    fn enabled_http_exporter() {
        let toml = r#"
            service_name = "gatekeeper"

            [resource_attributes]
            region = "eu-west-1"

            [exporters.otlp]
            enabled = true
            endpoint = "http://collector:4318"
            protocol = "http"
            export_interval = "10s"
        "#;

        let config: TelemetryConfig = toml::from_str(toml).unwrap();
        let otlp = config.metrics_otlp_config().unwrap();

        assert_eq!(config.service_name(), Some("gatekeeper"));
        assert_eq!(config.resource_attributes().get("region").map(String::as_str), Some("eu-west-1"));
        assert_eq!(otlp.protocol, OtlpProtocol::Http);
        assert_eq!(otlp.endpoint.as_str(), "http://collector:4318/");
        assert_eq!(otlp.export_interval, Duration::from_secs(10));
        assert_eq!(otlp.timeout, Duration::from_secs(60));
    }
}
