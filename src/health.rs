//! Ready state and the `/_/health` endpoint.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the watchdog is accepting traffic. Flipped to ready once the lock
/// file has been written (or immediately when the lock is suppressed) and
/// back to not-ready when shutdown begins.
pub struct ReadyState {
    accepting: AtomicBool,
}

impl ReadyState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accepting: AtomicBool::new(false),
        })
    }

    pub fn mark_ready(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn mark_not_ready(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Answer a health probe: 200 `OK` while ready, 503 otherwise. Only GET is
/// served on this path.
pub fn handle(ready: &ReadyState, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::new()))
            .expect("valid response with StatusCode enum");
    }

    if ready.is_ready() {
        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"OK")))
            .expect("valid response with StatusCode enum")
    } else {
        Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Full::new(Bytes::new()))
            .expect("valid response with StatusCode enum")
    }
}
