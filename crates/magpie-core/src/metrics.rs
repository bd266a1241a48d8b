//! Prometheus metrics helpers for the Magpie node.
//!
//! This module provides centralized metrics initialization and common metric
//! definitions used across Magpie components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use magpie_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::{counter, gauge};
//!     counter!("my_counter").increment(1);
//!     gauge!("my_gauge").set(42.0);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! All Magpie metrics follow these conventions:
//! - Prefix: Component name (e.g., `store_`, `queue_`, `crawler_`, `peer_`)
//! - Suffix: Unit or type (e.g., `_total`, `_seconds`)
//! - Labels: Use sparingly to avoid cardinality explosion

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    // Register all metric descriptions upfront
    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port.
/// This spawns a background task and returns immediately.
///
/// # Arguments
///
/// * `port` - TCP port to listen on (e.g., 9091)
/// * `handle` - Prometheus handle from [`init_metrics`]
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    Ok(())
}

/// Register descriptions for common metrics used across Magpie.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Store / Write Path Metrics
    // =========================================================================

    describe_counter!(
        "store_messages_written_total",
        "Messages accepted as new and written to the index"
    );
    describe_counter!(
        "store_messages_duplicate_total",
        "Messages rejected as already known"
    );
    describe_counter!(
        "store_authors_written_total",
        "Author records written or refreshed"
    );
    describe_counter!(
        "store_dump_lines_total",
        "Lines appended to the message dump log"
    );
    describe_counter!(
        "store_dump_buckets_sealed_total",
        "Dump buckets rotated and compressed"
    );

    // =========================================================================
    // Ingestion Queue Metrics
    // =========================================================================

    describe_gauge!("queue_depth", "Messages waiting in the ingestion queue");
    describe_counter!("queue_enqueued_total", "Messages accepted into the queue");
    describe_counter!(
        "queue_rejected_total",
        "Messages rejected because the queue was full"
    );
    describe_counter!(
        "queue_cache_hits_total",
        "Messages dropped at dequeue because they were cache-resident"
    );
    describe_gauge!(
        "queue_messages_per_second",
        "Current drain rate (messages/sec)"
    );

    // =========================================================================
    // Crawler Metrics
    // =========================================================================

    describe_gauge!("crawler_pending", "Terms waiting in the crawl frontier");
    describe_counter!("crawler_terms_stacked_total", "Terms accepted for crawling");
    describe_counter!(
        "crawler_terms_deduplicated_total",
        "Terms rejected by the frontier dedup horizon"
    );
    describe_counter!("crawler_steps_total", "Crawler processing steps executed");
    describe_counter!(
        "crawler_messages_harvested_total",
        "Messages produced by crawl steps"
    );

    // =========================================================================
    // Peer Client Metrics
    // =========================================================================

    describe_counter!("peer_push_total", "Timeline push attempts to peers");
    describe_counter!("peer_push_errors_total", "Failed timeline push attempts");
    describe_counter!(
        "peer_push_dropped_total",
        "Timelines dropped after exhausting push retries"
    );
    describe_counter!("peer_search_total", "Search requests sent to peers");
    describe_histogram!(
        "peer_request_duration_seconds",
        "Time spent on peer HTTP requests"
    );

    // =========================================================================
    // Import / Retrieval Metrics
    // =========================================================================

    describe_counter!("import_files_total", "Dump files fully imported");
    describe_counter!(
        "import_files_failed_total",
        "Dump files set aside because they could not be read"
    );
    describe_counter!("import_lines_total", "Dump lines read during import");
    describe_counter!(
        "import_lines_malformed_total",
        "Dump lines skipped as malformed"
    );
    describe_counter!(
        "retrieval_queries_total",
        "Scheduled queries re-run by the caretaker"
    );
    describe_gauge!(
        "caretaker_state",
        "Caretaker lifecycle state (0=starting, 1=running, 2=stopping, 3=stopped)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        // First call may or may not succeed (depends on test order)
        let handle1 = try_init_metrics();

        // Second call should definitely return None (already installed)
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        // This should be idempotent and not panic
        register_common_metrics();
        register_common_metrics();
    }
}
