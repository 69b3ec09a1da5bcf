use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::compile::{
        METRIC_ASSET_BYTES_TOTAL, METRIC_COMPILATIONS_IN_FLIGHT, METRIC_COMPILATIONS_TOTAL,
        METRIC_COMPILE_MS,
    },
    config::{LogFormat, LoggingSettings},
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_COMPILATIONS_TOTAL,
            Unit::Count,
            "Total number of compilation requests by output kind and result class."
        );
        describe_histogram!(
            METRIC_COMPILE_MS,
            Unit::Milliseconds,
            "End-to-end compilation latency in milliseconds."
        );
        describe_counter!(
            METRIC_ASSET_BYTES_TOTAL,
            Unit::Bytes,
            "Total number of asset bytes downloaded into workspaces."
        );
        describe_gauge!(
            METRIC_COMPILATIONS_IN_FLIGHT,
            Unit::Count,
            "Current number of admitted compilations."
        );
    });
}
