/*!
Observability infrastructure for Vegh.

Structured logging is always available through `tracing`. With the `metrics`
feature the engine also maintains Prometheus counters for packing and chunk
transfer, readable through [`gather_metrics`].
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapError};

/// Crates whose events are shown by default
const LOG_TARGETS: &[&str] = &["vegh_core", "vegh_cli", "vegh_retry"];

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<VeghMetrics> = OnceLock::new();

/// Prometheus metrics for Vegh operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct VeghMetrics {
    pub packed_files_total: Counter,
    pub packed_bytes_total: Counter,
    pub chunk_requests_total: Counter,
    pub chunk_retries_total: Counter,
    pub chunk_failures_total: Counter,
    pub request_latency_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> SnapError {
    SnapError::configuration(format!("failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl VeghMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };

        let packed_files_total = counter("vegh_packed_files_total", "Files written into snapshots")?;
        let packed_bytes_total = counter("vegh_packed_bytes_total", "Uncompressed bytes written into snapshots")?;
        let chunk_requests_total = counter("vegh_chunk_requests_total", "Upload requests sent")?;
        let chunk_retries_total = counter("vegh_chunk_retries_total", "Upload requests retried")?;
        let chunk_failures_total = counter("vegh_chunk_failures_total", "Chunks that exhausted their retries")?;

        let request_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "vegh_request_latency_seconds",
            "Duration of upload requests in seconds",
        ))
        .map_err(|e| metric_error("vegh_request_latency_seconds", e))?;
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .map_err(|e| metric_error("vegh_request_latency_seconds", e))?;

        Ok(Self {
            packed_files_total,
            packed_bytes_total,
            chunk_requests_total,
            chunk_retries_total,
            chunk_failures_total,
            request_latency_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Result<&'static VeghMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let metrics = Self::new()?;
        Ok(METRICS.get_or_init(|| metrics))
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SnapError::configuration(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| SnapError::configuration(format!("metrics are not UTF-8: {e}")))
    }
}

/// Prometheus text rendering of the global metrics
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    VeghMetrics::global()?.gather()
}

#[cfg(feature = "metrics")]
fn with_metrics(record: impl FnOnce(&VeghMetrics)) {
    match VeghMetrics::global() {
        Ok(metrics) => record(metrics),
        Err(e) => tracing::debug!(error = %e, "metrics unavailable"),
    }
}

pub(crate) fn record_packed(files: usize, bytes: u64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.packed_files_total.inc_by(files as f64);
        m.packed_bytes_total.inc_by(bytes as f64);
    });
    #[cfg(not(feature = "metrics"))]
    let _ = (files, bytes);
}

pub(crate) fn record_request(latency: Duration) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.chunk_requests_total.inc();
        m.request_latency_seconds.observe(latency.as_secs_f64());
    });
    #[cfg(not(feature = "metrics"))]
    let _ = latency;
}

pub(crate) fn record_retry() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.chunk_retries_total.inc());
}

pub(crate) fn record_chunk_failure() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.chunk_failures_total.inc());
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence when set. Otherwise Vegh crates log at `info`,
/// or `debug` when `verbose` is true. `json` switches to one JSON object per
/// event.
///
/// # Errors
/// * `SnapError::Configuration` - invalid filter directive or a subscriber
///   is already installed
pub fn init_observability(verbose: bool, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(verbose)?,
    };

    let registry = TracingRegistry::default().with(filter);
    let installed = if json {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            ),
        )
    } else {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
        )
    };
    installed.map_err(|e| {
        SnapError::configuration(format!("failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(verbose, json, "observability initialized");
    Ok(())
}

fn default_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    LOG_TARGETS.iter().try_fold(EnvFilter::new("warn"), |filter, target| {
        let directive = format!("{target}={level}")
            .parse()
            .map_err(|e| SnapError::configuration(format!("invalid log directive: {e}")))?;
        Ok(filter.add_directive(directive))
    })
}
