//! Meter provider setup and the instruments used by the rate limiter.

mod names;
mod recorder;

pub use names::*;
pub use recorder::Recorder;

use anyhow::Context;
use config::{OtlpExporterConfig, OtlpProtocol, TelemetryConfig};
use opentelemetry::{KeyValue, metrics::Meter};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

const METER_NAME: &str = "gatekeeper";

/// The meter every Gatekeeper instrument is created from.
pub fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

pub(crate) async fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<SdkMeterProvider> {
    let meter_provider = create_meter_provider(config)?;
    opentelemetry::global::set_meter_provider(meter_provider.clone());

    Ok(meter_provider)
}

fn create_meter_provider(config: &TelemetryConfig) -> anyhow::Result<SdkMeterProvider> {
    let Some(otlp) = config.metrics_otlp_config() else {
        log::debug!("No metrics exporter enabled, rate limit metrics stay in process");
        return Ok(SdkMeterProvider::builder().build());
    };

    let reader = PeriodicReader::builder(exporter(otlp)?)
        .with_interval(otlp.export_interval)
        .build();

    log::info!(
        "Exporting rate limit metrics to {} over {:?} every {:?}",
        otlp.endpoint,
        otlp.protocol,
        otlp.export_interval
    );

    Ok(SdkMeterProvider::builder()
        .with_resource(resource(config))
        .with_reader(reader)
        .build())
}

fn resource(config: &TelemetryConfig) -> Resource {
    let service_name = config.service_name().unwrap_or(METER_NAME).to_string();

    let attributes = config
        .resource_attributes()
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()));

    Resource::builder()
        .with_service_name(service_name)
        .with_attributes(attributes)
        .build()
}

fn exporter(otlp: &OtlpExporterConfig) -> anyhow::Result<MetricExporter> {
    let endpoint = otlp.endpoint.as_str();

    match otlp.protocol {
        OtlpProtocol::Grpc => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_timeout(otlp.timeout)
            .build()
            .context("Failed to create gRPC OTLP metric exporter"),
        OtlpProtocol::Http => MetricExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .with_timeout(otlp.timeout)
            .build()
            .context("Failed to create HTTP OTLP metric exporter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_exporter_builds_local_provider() {
        let config: TelemetryConfig = toml::from_str("").unwrap();
        let provider = create_meter_provider(&config);

        assert!(provider.is_ok());
    }
}
