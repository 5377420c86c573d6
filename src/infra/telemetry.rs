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

    // Logs go to stderr so command output on stdout stays machine-readable.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "fedcache_cache_hit_total",
            Unit::Count,
            "Total number of entity cache hits, labelled by cache."
        );
        describe_counter!(
            "fedcache_cache_miss_total",
            Unit::Count,
            "Total number of entity cache misses, labelled by cache."
        );
        describe_counter!(
            "fedcache_cache_evict_total",
            Unit::Count,
            "Total number of entity cache evictions due to capacity."
        );
        describe_counter!(
            "fedcache_cache_coalesced_total",
            Unit::Count,
            "Total number of lookups that joined an in-flight load."
        );
        describe_counter!(
            "fedcache_deref_total",
            Unit::Count,
            "Total number of account dereferences, labelled by outcome."
        );
        describe_histogram!(
            "fedcache_deref_ms",
            Unit::Milliseconds,
            "Account dereference latency in milliseconds."
        );
        describe_counter!(
            "fedcache_worker_dropped_total",
            Unit::Count,
            "Total number of background jobs dropped by a full or stopped queue."
        );
    });
}
