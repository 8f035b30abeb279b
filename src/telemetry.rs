//! Shared logging and metrics bootstrap for seriesvault binaries.
//!
//! The library only emits `tracing` events and `metrics` samples; installing
//! a subscriber or recorder is left to the process embedding it.

use crate::{Error, Result};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_SERVICE: &str = "seriesvault";
const ENV_SERVICE_NAME: &str = "SERIESVAULT_SERVICE_NAME";
const ENV_LOG_FILTER: &str = "SERIESVAULT_LOG";

static SERVICE: OnceLock<String> = OnceLock::new();

/// Service label attached to every metric.
pub fn service() -> String {
    SERVICE
        .get()
        .cloned()
        .unwrap_or_else(|| DEFAULT_SERVICE.to_string())
}

/// Set the service label; only the first call has an effect.
pub fn set_service(name: &str) -> bool {
    SERVICE.set(name.to_string()).is_ok()
}

/// Logging settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Directive string for `EnvFilter`, overriding the plain level
    pub filter: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name =
            std::env::var(ENV_SERVICE_NAME).unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(format!("{ENV_SERVICE_NAME} cannot be empty")));
        }

        let filter = std::env::var(ENV_LOG_FILTER)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            service_name: service_name.to_string(),
            filter,
        })
    }
}

/// Recorder collecting the library's counters in Prometheus text form.
fn metrics_recorder() -> PrometheusRecorder {
    PrometheusBuilder::new().build_recorder()
}

/// Handle returned once logging and metrics are installed.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: PrometheusHandle,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    /// Install a JSON `tracing` subscriber and a global metrics recorder.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        let filter = match &config.filter {
            Some(directives) => EnvFilter::try_new(directives).map_err(|e| {
                Error::Config(format!("invalid {ENV_LOG_FILTER} '{directives}': {e}"))
            })?,
            None => EnvFilter::new(level.to_string()),
        };

        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

        let recorder = metrics_recorder();
        let metrics = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| Error::Config(format!("failed to install metrics recorder: {e}")))?;

        set_service(&config.service_name);

        info!(
            service_name = %config.service_name,
            log_level = %level,
            filter = %config.filter.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self { config, metrics })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Everything recorded so far, in Prometheus exposition format.
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    let raw = raw.trim();
    raw.parse::<Level>().map_err(|_| {
        Error::Config(format!(
            "invalid log level '{raw}', expected trace, debug, info, warn or error"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level_is_case_insensitive() {
        assert_eq!(parse_log_level(" DEBUG ").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
    }

    #[test]
    fn test_parse_log_level_rejects_unknown() {
        let err = parse_log_level("loud").unwrap_err();
        assert!(format!("{err}").contains("invalid log level"));
    }

    #[test]
    fn test_service_label_has_default() {
        assert!(!service().is_empty());
    }

    #[test]
    fn test_recorder_renders_labelled_counters() {
        let recorder = metrics_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(
                "seriesvault_assignments_total",
                "service" => service(),
                "bucket" => "user",
                "result" => "created"
            )
            .increment(2);
        });

        let rendered = handle.render();
        let line = rendered
            .lines()
            .find(|line| line.starts_with("seriesvault_assignments_total{"))
            .unwrap();
        assert!(line.contains("bucket=\"user\""));
        assert!(line.ends_with(" 2"));
    }
}
