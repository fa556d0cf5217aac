//! Prometheus metrics for the issuance engine.
//!
//! Covers:
//! - Acceptance path (accepted, exhausted, contention, lock wait)
//! - Fulfillment workers (persisted, duplicates, compensations, redeliveries)
//! - Coupon state transitions
//! - State cache failures
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use flashcoupon_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr`. Must be
/// started from within a tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter.
    ///
    /// If another recorder is already installed (e.g. in tests), logs a
    /// warning and returns `Ok` without serving.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built (for
    /// example when the address is already in use).
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("issuance_accepted_total", "Issuance requests that reserved a unit");
    describe_counter!(
        "issuance_exhausted_total",
        "Issuance requests rejected because the policy is sold out"
    );
    describe_counter!(
        "issuance_contention_total",
        "Issuance requests rejected because the policy lock was busy"
    );
    describe_counter!(
        "issuance_window_closed_total",
        "Issuance requests outside the policy validity window"
    );
    describe_counter!(
        "issuance_enqueue_failures_total",
        "Reservations compensated because the enqueue failed"
    );
    describe_histogram!("issuance_lock_wait_seconds", "Time spent waiting for the policy lock");
    describe_histogram!(
        "issuance_critical_section_seconds",
        "Time the policy lock was held"
    );

    describe_counter!("fulfillment_persisted_total", "Coupons persisted by workers");
    describe_counter!(
        "fulfillment_duplicates_total",
        "Redelivered messages whose coupon already existed"
    );
    describe_counter!(
        "fulfillment_compensated_total",
        "Reservations returned to the ledger after a definitive failure"
    );
    describe_counter!(
        "fulfillment_redelivered_total",
        "Messages handed back to the queue after a transient failure"
    );
    describe_counter!("fulfillment_malformed_total", "Undecodable queue payloads dropped");

    describe_counter!("coupon_transitions_total", "Coupon state transitions by target status");
    describe_counter!("cache_errors_total", "State cache operations that failed");

    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("retry_exhausted_total", "Operations that ran out of retries");
}

/// Acceptance path metrics recorder.
pub struct IssuanceMetrics;

impl IssuanceMetrics {
    /// Record a reservation that was enqueued (or persisted, on the direct path).
    pub fn record_accepted(path: &'static str) {
        counter!("issuance_accepted_total", "path" => path).increment(1);
    }

    /// Record a sold-out rejection.
    pub fn record_exhausted() {
        counter!("issuance_exhausted_total").increment(1);
    }

    /// Record a lock timeout.
    pub fn record_contention() {
        counter!("issuance_contention_total").increment(1);
    }

    /// Record a request outside the policy window.
    pub fn record_window_closed() {
        counter!("issuance_window_closed_total").increment(1);
    }

    /// Record an enqueue failure that was compensated.
    pub fn record_enqueue_failure() {
        counter!("issuance_enqueue_failures_total").increment(1);
    }

    /// Record how long acquiring the policy lock took.
    pub fn record_lock_wait(waited: Duration) {
        histogram!("issuance_lock_wait_seconds").record(waited.as_secs_f64());
    }

    /// Record how long the policy lock was held.
    pub fn record_critical_section(held: Duration) {
        histogram!("issuance_critical_section_seconds").record(held.as_secs_f64());
    }
}

/// Fulfillment worker metrics recorder.
pub struct FulfillmentMetrics;

impl FulfillmentMetrics {
    /// Record a persisted coupon.
    pub fn record_persisted() {
        counter!("fulfillment_persisted_total").increment(1);
    }

    /// Record a duplicate delivery.
    pub fn record_duplicate() {
        counter!("fulfillment_duplicates_total").increment(1);
    }

    /// Record a compensation.
    pub fn record_compensated() {
        counter!("fulfillment_compensated_total").increment(1);
    }

    /// Record a nack.
    pub fn record_redelivered() {
        counter!("fulfillment_redelivered_total").increment(1);
    }

    /// Record an undecodable payload.
    pub fn record_malformed() {
        counter!("fulfillment_malformed_total").increment(1);
    }
}

/// Coupon state machine metrics recorder.
pub struct CouponMetrics;

impl CouponMetrics {
    /// Record a persisted transition into `status`.
    pub fn record_transition(status: &'static str) {
        counter!("coupon_transitions_total", "status" => status).increment(1);
    }
}

/// State cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a failed cache operation.
    pub fn record_error(operation: &'static str) {
        counter!("cache_errors_total", "operation" => operation).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt(operation: &'static str) {
        counter!("retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record a successful retry.
    pub fn record_success(operation: &'static str) {
        counter!("retry_successes_total", "operation" => operation).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(operation: &'static str) {
        counter!("retry_exhausted_total", "operation" => operation).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn start_and_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        IssuanceMetrics::record_accepted("queued");
        FulfillmentMetrics::record_persisted();

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("issuance_accepted_total"));
            assert!(rendered.contains("fulfillment_persisted_total"));
        }
    }
}
