//! Metrics surface and in-flight accounting.
//!
//! Two Prometheus series are exported: `http_requests_total{code, method}`
//! and `http_requests_in_flight`. The scrape endpoint runs on its own
//! listener on the metrics port. The in-flight count is additionally kept in
//! a plain atomic so the shutdown coordinator and the admission gate can read
//! it without going through the exporter.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Install the Prometheus recorder with a scrape listener on the given port.
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter: {}", e))?;

    describe_counter!("http_requests_total", "Completed HTTP responses by status code and method");
    describe_gauge!("http_requests_in_flight", "HTTP requests currently being handled");

    info!(port, "metrics listening");
    Ok(())
}

/// Record a completed response on the function route.
pub fn count_request(method: &str, status: u16) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "code" => status.to_string()
    )
    .increment(1);
}

/// Process-wide in-flight request tracker, doubling as the admission gate.
pub struct InFlight {
    current: AtomicI64,
    limit: i64,
}

impl InFlight {
    /// Create a tracker; a limit of zero means unbounded.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(0),
            limit: limit as i64,
        })
    }

    /// Register a request. The check-and-increment is a single atomic
    /// fetch-add, so concurrent entries cannot both observe a free slot.
    /// The count is released when the returned guard drops.
    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        let value = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("http_requests_in_flight").increment(1.0);
        InFlightGuard {
            tracker: Arc::clone(self),
            over_limit: self.limit > 0 && value > self.limit,
        }
    }

    /// Current number of in-flight requests.
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// RAII registration of one in-flight request.
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
    over_limit: bool,
}

impl InFlightGuard {
    /// True when this request pushed the count past the configured limit and
    /// must be rejected.
    pub fn over_limit(&self) -> bool {
        self.over_limit
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.current.fetch_sub(1, Ordering::SeqCst);
        gauge!("http_requests_in_flight").decrement(1.0);
    }
}
