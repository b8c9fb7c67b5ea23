use execgate::auth::JwtAuthenticator;
use execgate::config::WatchdogConfig;
use execgate::health::ReadyState;
use execgate::metrics::{self, InFlight};
use execgate::runner::FunctionRunner;
use execgate::server::{Watchdog, WatchdogServer};
use execgate::shutdown::ShutdownCoordinator;
use execgate::{lockfile, PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // The exec-style health probe runs before any server setup: a sibling
    // invocation of this binary checks for the lock file and exits with the
    // verdict.
    if args.iter().any(|a| a == "--run-healthcheck") {
        if lockfile::present() {
            std::process::exit(0);
        }
        eprintln!("unable to find lock file.");
        std::process::exit(1);
    }

    if args.iter().any(|a| a == "--version") {
        println!("{} {}", PKG_NAME, VERSION);
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("execgate=debug".parse().expect("valid log directive")),
        )
        .init();

    info!(name = PKG_NAME, version = VERSION, "starting watchdog");

    let config = Arc::new(WatchdogConfig::from_env());
    config.validate().map_err(|e| {
        error!(error = %e, "invalid configuration");
        e
    })?;

    info!(
        read_timeout = %humantime::format_duration(config.read_timeout),
        write_timeout = %humantime::format_duration(config.write_timeout),
        exec_timeout = %humantime::format_duration(config.exec_timeout),
        healthcheck_interval = %humantime::format_duration(config.healthcheck_interval),
        "timeouts"
    );
    info!(
        port = config.port,
        metrics_port = config.metrics_port,
        fprocess = %config.function_process,
        max_inflight = config.max_inflight,
        "configuration loaded"
    );

    let runner = FunctionRunner::new(Arc::clone(&config))?;

    let auth = if config.jwt_auth {
        let authenticator = JwtAuthenticator::new(&config).map_err(|e| {
            error!(error = %e, "error creating JWT auth middleware");
            e
        })?;
        Some(authenticator)
    } else {
        None
    };

    metrics::install_exporter(config.metrics_port)?;

    let ready = ReadyState::new();
    let in_flight = InFlight::new(config.max_inflight);
    let watchdog = Watchdog::new(
        Arc::clone(&config),
        runner,
        Arc::clone(&ready),
        Arc::clone(&in_flight),
        auth,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = WatchdogServer::bind(addr, watchdog, shutdown_rx).await?;

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "server error");
        }
    });

    if config.suppress_lock {
        warn!("suppress_lock is enabled, no automated health checks will be in place for this function");
        ready.mark_ready();
    } else {
        match lockfile::create(&ready) {
            Ok(path) => {
                info!(path = %path.display(), "lock file written, accepting connections");
            }
            Err(e) => {
                error!(
                    path = %lockfile::path().display(),
                    error = %e,
                    "cannot write lock file; set suppress_lock=true to disable"
                );
                anyhow::bail!("cannot write lock file: {}", e);
            }
        }
    }

    let coordinator = ShutdownCoordinator::new(
        &config,
        Arc::clone(&ready),
        Arc::clone(&in_flight),
        shutdown_tx,
    );

    // A single exit path: SIGTERM drives the drain sequence, and an
    // unexpected server exit takes the process down through the same spot.
    tokio::select! {
        _ = coordinator.run() => {}
        _ = &mut server_handle => {
            ready.mark_not_ready();
            if !config.suppress_lock {
                let _ = lockfile::remove();
            }
            anyhow::bail!("server exited unexpectedly");
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    info!("shutdown complete");
    Ok(())
}
