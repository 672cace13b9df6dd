//! Tracing and metrics setup for inkwell binaries.
//!
//! - Compact console logs filtered by `RUST_LOG`
//! - A Prometheus recorder for the engine's `metrics` counters, rendered on
//!   demand with [`render`]
//!
//! # Usage
//!
//! ```ignore
//! use inkwell_common::telemetry::{self, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     telemetry::init(TelemetryConfig::from_env("inkwell"));
//!     tracing::info!("started");
//!     println!("{}", telemetry::render());
//! }
//! ```

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for labeling (e.g., "inkwell")
    pub service_name: String,
    /// Console log level (default: INFO, DEBUG in debug builds)
    pub console_level: Level,
}

impl TelemetryConfig {
    /// Load config from environment variables.
    ///
    /// - `RUST_LOG`: Standard env filter (optional, overrides console_level)
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let console_level = if cfg!(debug_assertions) {
            Level::DEBUG
        } else {
            Level::INFO
        };

        Self {
            service_name: service_name.into(),
            console_level,
        }
    }

    /// Override the console level (e.g. from a `--verbose` flag).
    pub fn with_level(mut self, level: Level) -> Self {
        self.console_level = level;
        self
    }
}

/// Initialize telemetry (metrics + tracing).
///
/// Call once at application startup. A second call is a no-op.
pub fn init(config: TelemetryConfig) {
    init_tracing(&config);
    init_metrics();
}

/// Install the Prometheus recorder, once per process.
///
/// Returns `None` if another recorder was installed first; counters then go
/// to that recorder instead.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle);
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
        }
        Err(e) => tracing::warn!(error = %e, "could not install prometheus recorder"),
    }
    PROMETHEUS_HANDLE.get()
}

/// Render the recorded metrics in Prometheus text format. Empty if the
/// recorder is not installed.
pub fn render() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

fn init_tracing(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=info,reqwest=info",
            config.console_level.as_str().to_lowercase()
        ))
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    match tracing_subscriber::registry().with(console_layer).try_init() {
        Ok(()) => tracing::debug!(
            service = %config.service_name,
            "telemetry initialized (console only)"
        ),
        Err(e) => tracing::debug!(error = %e, "tracing subscriber already installed"),
    }
}

// Re-export the metrics crate for convenience
pub use metrics::{counter, gauge, histogram};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_reach_the_recorder() {
        let handle = init_metrics().expect("recorder installed");
        assert!(std::ptr::eq(handle, init_metrics().unwrap()));

        counter!("inkwell_test_events_total").increment(3);
        let rendered = render();
        assert!(
            rendered.contains("inkwell_test_events_total 3"),
            "{rendered}"
        );
    }
}
