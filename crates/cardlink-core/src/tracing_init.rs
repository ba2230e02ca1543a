//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output,
//! and (behind the `metrics` feature) an OpenTelemetry export pipeline.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the optional telemetry pipeline alive for the process lifetime.
#[derive(Default)]
pub struct TracingGuard {
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::MetricsGuard>,
}

impl TracingGuard {
    /// Flush and shut down the telemetry pipeline, if one was started.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        if let Some(guard) = self.metrics
            && let Err(e) = guard.shutdown()
        {
            tracing::warn!(error = %e, "Failed to flush telemetry on shutdown");
        }
    }
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"cardlink_agent=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing and, when `metrics_endpoint` is set and the `metrics`
/// feature is compiled in, an OTLP pipeline for spans and metrics.
///
/// A failing OTLP exporter degrades to plain logging.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TracingGuard {
    let metrics = match metrics_endpoint.map(crate::metrics::init_metrics) {
        Some(Ok(guard)) => Some(guard),
        Some(Err(e)) => {
            // Subscriber is not installed yet.
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Failed to initialise OpenTelemetry pipeline: {e}");
            }
            None
        }
        None => None,
    };

    let otel_layer = metrics
        .as_ref()
        .map(|guard| tracing_opentelemetry::layer().with_tracer(guard.tracer("cardlink")));

    if log_json {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer().json())
            .with(otel_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(default_filter))
            .with(tracing_subscriber::fmt::layer())
            .with(otel_layer)
            .init();
    }

    TracingGuard { metrics }
}

/// Initialise tracing; without the `metrics` feature the endpoint is ignored.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TracingGuard {
    init_tracing(default_filter, log_json);
    if let Some(endpoint) = metrics_endpoint {
        tracing::warn!(
            endpoint,
            "Metrics endpoint ignored: built without the `metrics` feature"
        );
    }
    TracingGuard::default()
}
