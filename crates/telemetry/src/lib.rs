//! Metrics export for Gatekeeper.
//!
//! [`init`] installs the global meter provider. Instruments are created from
//! [`metrics::meter`] and keep working before `init` runs, they just record into nothing.

pub mod metrics;

use config::TelemetryConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, UpDownCounter},
};

/// Keeps the meter provider alive. Pending metrics are exported when it is dropped.
pub struct TelemetryGuard {
    meter_provider: SdkMeterProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            log::error!("Failed to shut down the meter provider: {e}");
        }
    }
}

/// Installs the global meter provider described by the configuration.
pub async fn init(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let meter_provider = metrics::init_metrics(config).await?;

    Ok(TelemetryGuard { meter_provider })
}
