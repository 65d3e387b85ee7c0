use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "gateway=info,fismatik_internal=info,tower_http=info,warn";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// `RUST_LOG` when set, else the gateway defaults
fn env_filter() -> Result<EnvFilter, Error> {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(&filter).map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Invalid `RUST_LOG` filter `{filter}`: {e}"),
            })
        });
    }
    EnvFilter::try_new(DEFAULT_LOG_FILTER).map_err(|e| {
        Error::new_without_logging(ErrorDetails::Config {
            message: format!("Invalid log filter: {e}"),
        })
    })
}

/// Installs the global `tracing` subscriber. Must be called once, before anything logs.
pub fn setup_logs(log_format: LogFormat) -> Result<(), Error> {
    let filter = env_filter()?;
    let fmt_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Failed to install log subscriber: {e}"),
            })
        })
}

/// Installs the global Prometheus recorder; the handle renders `/metrics`
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to install metrics recorder: {e}"),
        })
    })?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "fismatik_requests_total",
        "API requests by endpoint and outcome code"
    );
    metrics::describe_counter!(
        "fismatik_abuse_blocks_total",
        "Receipt submissions rejected by the duplicate-submission guard"
    );
    metrics::describe_counter!(
        "fismatik_quota_rejections_total",
        "Receipt submissions rejected because the monthly quota was exhausted"
    );
    metrics::describe_counter!(
        "fismatik_usage_events_written_total",
        "Token usage events written to the quota store"
    );
    metrics::describe_counter!(
        "fismatik_usage_events_failed_total",
        "Token usage events whose write failed"
    );
    metrics::describe_counter!(
        "fismatik_usage_events_dropped_total",
        "Token usage events dropped because the queue was full"
    );
}
