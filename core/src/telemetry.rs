// Logging and session metrics
use opentelemetry::metrics::{Counter, UpDownCounter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). Calling this more than once
/// is harmless; later calls leave the first subscriber in place.
pub fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(target: "telemetry", "Logging initialized");
    }
}

/// OpenTelemetry instruments for session lifecycle.
///
/// Recorded against the global meter provider; a no-op until one is installed.
#[derive(Clone)]
pub struct SessionMetrics {
    pub in_memory: UpDownCounter<i64>,
    pub created: Counter<u64>,
    pub ended: Counter<u64>,
    pub expired: Counter<u64>,
    pub rehydrated: Counter<u64>,
    pub evicted: Counter<u64>,
    pub compactions: Counter<u64>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("parley.sessions");

        Self {
            in_memory: meter
                .i64_up_down_counter("sessions.in_memory")
                .with_description("Number of sessions resident in memory")
                .init(),
            created: meter
                .u64_counter("sessions.created")
                .with_description("Total number of sessions created")
                .init(),
            ended: meter
                .u64_counter("sessions.ended")
                .with_description("Total number of sessions ended")
                .init(),
            expired: meter
                .u64_counter("sessions.expired")
                .with_description("Sessions removed after exceeding their TTL")
                .init(),
            rehydrated: meter
                .u64_counter("sessions.rehydrated")
                .with_description("Sessions rebuilt from durable metadata")
                .init(),
            evicted: meter
                .u64_counter("sessions.evicted")
                .with_description("Idle sessions dropped from memory")
                .init(),
            compactions: meter
                .u64_counter("sessions.compactions")
                .with_description("History compaction runs")
                .init(),
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
