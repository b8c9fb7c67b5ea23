//! Graceful shutdown coordination.
//!
//! A single coordinator owns the whole sequence so there is exactly one exit
//! path: flip to not-ready and drop the lock file, give the external health
//! prober one full interval to observe 503, stop the accept loop, then wait
//! out in-flight requests bounded by the write timeout.

use crate::config::WatchdogConfig;
use crate::health::ReadyState;
use crate::lockfile;
use crate::metrics::InFlight;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Interval for polling the in-flight count while draining (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

pub struct ShutdownCoordinator {
    ready: Arc<ReadyState>,
    in_flight: Arc<InFlight>,
    shutdown_tx: watch::Sender<bool>,
    healthcheck_interval: Duration,
    drain_timeout: Duration,
    suppress_lock: bool,
}

impl ShutdownCoordinator {
    pub fn new(
        config: &WatchdogConfig,
        ready: Arc<ReadyState>,
        in_flight: Arc<InFlight>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            ready,
            in_flight,
            shutdown_tx,
            healthcheck_interval: config.healthcheck_interval,
            drain_timeout: config.write_timeout,
            suppress_lock: config.suppress_lock,
        }
    }

    /// Block until SIGTERM, then run the drain sequence.
    pub async fn run(self) {
        wait_for_sigterm().await;
        self.execute().await;
    }

    /// The drain sequence, separated from signal delivery so it runs exactly
    /// once no matter what triggered it.
    pub async fn execute(self) {
        info!(
            drain_window = %humantime::format_duration(self.healthcheck_interval),
            "SIGTERM received, refusing new work after the drain window"
        );

        self.ready.mark_not_ready();
        if !self.suppress_lock {
            if let Err(e) = lockfile::remove() {
                warn!(path = %lockfile::path().display(), error = %e, "unable to remove lock file");
            }
        }

        // The external prober needs one full interval to observe 503 and pull
        // this endpoint from its pool before we stop serving.
        tokio::time::sleep(self.healthcheck_interval).await;

        info!(
            in_flight = self.in_flight.current(),
            "no new connections allowed, draining"
        );
        let _ = self.shutdown_tx.send(true);

        let started = Instant::now();
        while self.in_flight.current() > 0 && started.elapsed() < self.drain_timeout {
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }

        let remaining = self.in_flight.current();
        if remaining > 0 {
            warn!(in_flight = remaining, "drain timeout exceeded, exiting with requests in flight");
        } else {
            info!("all requests drained, exiting");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
}
