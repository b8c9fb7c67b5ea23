//! The function-facing HTTP server.
//!
//! One accept loop in the shape of the admin/proxy servers: a `TcpListener`
//! bound up front (so startup failures are fatal before any traffic), a task
//! per connection served through hyper's auto builder, and a watch channel
//! that stops the loop when shutdown begins. Routing is fixed: `/_/health`
//! answers probes, everything else invokes the function.

use crate::auth::JwtAuthenticator;
use crate::config::WatchdogConfig;
use crate::health::{self, ReadyState};
use crate::metrics::{self, InFlight};
use crate::runner::FunctionRunner;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Max header size accepted from clients (1 MiB)
const MAX_HEADER_BYTES: usize = 1 << 20;

/// Helper to create a plain-text response - infallible with valid StatusCode
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Shared request-handling state: routing, admission, auth and the runner.
pub struct Watchdog {
    config: Arc<WatchdogConfig>,
    runner: FunctionRunner,
    ready: Arc<ReadyState>,
    in_flight: Arc<InFlight>,
    auth: Option<JwtAuthenticator>,
}

impl Watchdog {
    pub fn new(
        config: Arc<WatchdogConfig>,
        runner: FunctionRunner,
        ready: Arc<ReadyState>,
        in_flight: Arc<InFlight>,
        auth: Option<JwtAuthenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            runner,
            ready,
            in_flight,
            auth,
        })
    }

    /// Dispatch one request. The health route is never instrumented; every
    /// function-route response is counted once its status is known.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.uri().path() == "/_/health" {
            return health::handle(&self.ready, &req);
        }

        let method = req.method().as_str().to_owned();
        let guard = self.in_flight.begin();

        let response = if guard.over_limit() {
            debug!(limit = self.config.max_inflight, "over concurrent request limit");
            text_response(
                StatusCode::TOO_MANY_REQUESTS,
                "concurrent request limit exceeded",
            )
        } else {
            match &self.auth {
                Some(auth) => match auth.authorize(&req).await {
                    Ok(()) => self.runner.handle(req).await,
                    Err(response) => response,
                },
                None => self.runner.handle(req).await,
            }
        };

        metrics::count_request(&method, response.status().as_u16());
        response
    }
}

/// The HTTP server owning the function port.
pub struct WatchdogServer {
    listener: TcpListener,
    watchdog: Arc<Watchdog>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WatchdogServer {
    /// Bind the listening socket. Failures here are startup failures.
    pub async fn bind(
        addr: SocketAddr,
        watchdog: Arc<Watchdog>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("cannot listen on {}: {}", addr, e))?;
        Ok(Self {
            listener,
            watchdog,
            shutdown_rx,
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown channel flips. In-flight
    /// connections keep running on their own tasks; the shutdown coordinator
    /// waits on the in-flight gauge, not on this loop.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "watchdog listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let watchdog = Arc::clone(&self.watchdog);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, watchdog).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("server no longer accepting connections");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, watchdog: Arc<Watchdog>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let watchdog = Arc::clone(&watchdog);
        async move { Ok::<_, hyper::Error>(watchdog.handle(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .max_buf_size(MAX_HEADER_BYTES)
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}
