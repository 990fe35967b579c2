use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

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
            "velo_cache_hit_total",
            Unit::Count,
            "Total number of query cache hits."
        );
        describe_counter!(
            "velo_cache_miss_total",
            Unit::Count,
            "Total number of query cache misses, including backend faults served as misses."
        );
        describe_counter!(
            "velo_cache_evict_total",
            Unit::Count,
            "Total number of collection-level cache evictions."
        );
        describe_counter!(
            "velo_ingest_accepted_total",
            Unit::Count,
            "Total number of change notifications accepted by the webhook endpoint."
        );
        describe_counter!(
            "velo_ingest_rejected_total",
            Unit::Count,
            "Total number of change notifications rejected at the webhook boundary."
        );
        describe_counter!(
            "velo_ingest_dispatched_total",
            Unit::Count,
            "Total number of deduplicated change events delivered to observers."
        );
        describe_histogram!(
            "velo_ingest_flush_ms",
            Unit::Milliseconds,
            "Debounce flush latency in milliseconds."
        );
    });
}
