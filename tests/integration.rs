//! Integration tests for the watchdog
//!
//! Each test starts an in-process server on an ephemeral port, speaks raw
//! HTTP over a TCP stream, and runs real function processes (`cat`, `env`,
//! `sleep`, `sh`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use execgate::config::WatchdogConfig;
use execgate::health::ReadyState;
use execgate::metrics::InFlight;
use execgate::runner::FunctionRunner;
use execgate::server::{Watchdog, WatchdogServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

struct TestServer {
    addr: SocketAddr,
    ready: Arc<ReadyState>,
    in_flight: Arc<InFlight>,
    shutdown_tx: watch::Sender<bool>,
}

/// Start a watchdog on 127.0.0.1:0 with the given environment pairs.
async fn start_watchdog(pairs: &[(&str, &str)]) -> TestServer {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = Arc::new(WatchdogConfig::from_lookup(|key| map.get(key).cloned()));

    let runner = FunctionRunner::new(Arc::clone(&config)).expect("valid fprocess");
    let ready = ReadyState::new();
    let in_flight = InFlight::new(config.max_inflight);
    let watchdog = Watchdog::new(
        config,
        runner,
        Arc::clone(&ready),
        Arc::clone(&in_flight),
        None,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = WatchdogServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), watchdog, shutdown_rx)
        .await
        .expect("bind ephemeral port");
    let addr = server.local_addr().expect("bound address");

    tokio::spawn(server.run());

    TestServer {
        addr,
        ready,
        in_flight,
        shutdown_tx,
    }
}

/// Send one HTTP/1.1 request and return (status, headers, body).
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        addr,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.expect("write head");
    stream.write_all(body).await.expect("write body");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> (u16, HashMap<String, String>, Vec<u8>) {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head");
    let head = std::str::from_utf8(&raw[..header_end]).expect("utf8 head");

    let mut lines = head.lines();
    let status: u16 = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    (status, headers, raw[header_end + 4..].to_vec())
}

#[tokio::test]
async fn test_echo_stream_mode() {
    let server = start_watchdog(&[("fprocess", "cat")]).await;

    let (status, headers, body) =
        http_request(server.addr, "POST", "/", &[], b"hello watchdog").await;

    assert_eq!(status, 200);
    assert_eq!(body, b"hello watchdog");
    assert_eq!(
        headers.get("content-type").map(String::as_str),
        Some("application/octet-stream")
    );
}

#[tokio::test]
async fn test_transform_via_pipe() {
    let server = start_watchdog(&[("fprocess", "tr a-z A-Z")]).await;

    let (status, _, body) = http_request(server.addr, "POST", "/", &[], b"abc").await;

    assert_eq!(status, 200);
    assert_eq!(body, b"ABC");
}

#[tokio::test]
async fn test_empty_body_omits_content_type() {
    let server = start_watchdog(&[("fprocess", "cat")]).await;

    let (status, headers, body) = http_request(server.addr, "GET", "/", &[], b"").await;

    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert!(!headers.contains_key("content-type"));
}

#[tokio::test]
async fn test_forced_content_type() {
    let server = start_watchdog(&[("fprocess", "cat"), ("content_type", "application/json")]).await;

    let (status, headers, _) = http_request(server.addr, "POST", "/", &[], b"{}").await;

    assert_eq!(status, 200);
    assert_eq!(
        headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
}

#[tokio::test]
async fn test_request_metadata_reaches_child_env() {
    let server = start_watchdog(&[("fprocess", "env"), ("cgi_headers", "true")]).await;

    let (status, _, body) = http_request(
        server.addr,
        "GET",
        "/foo?bar=baz",
        &[("X-Call-Id", "abc")],
        b"",
    )
    .await;

    assert_eq!(status, 200);
    let output = String::from_utf8_lossy(&body);
    assert!(output.lines().any(|l| l == "Http_Method=GET"), "{output}");
    assert!(output.lines().any(|l| l == "Http_Path=/foo"), "{output}");
    assert!(output.lines().any(|l| l == "Http_Query=bar=baz"), "{output}");
    assert!(output.lines().any(|l| l == "Http_X_Call_Id=abc"), "{output}");
}

#[tokio::test]
async fn test_exec_timeout_kills_function() {
    let server = start_watchdog(&[("fprocess", "sleep 10"), ("exec_timeout", "1")]).await;

    let started = Instant::now();
    let (status, _, body) = http_request(server.addr, "POST", "/", &[], b"").await;
    let elapsed = started.elapsed();

    assert_eq!(status, 502);
    assert!(String::from_utf8_lossy(&body).contains("timeout"));
    assert!(
        elapsed < Duration::from_secs(3),
        "sleep survived for {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_concurrent_request_limit() {
    let server = start_watchdog(&[("fprocess", "cat"), ("max_inflight", "1")]).await;

    // First request: send the head and a partial body, then hold the
    // connection open so the handler stays in flight.
    let mut first = TcpStream::connect(server.addr).await.unwrap();
    let head = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: 5\r\n\r\n",
        server.addr
    );
    first.write_all(head.as_bytes()).await.unwrap();
    first.write_all(b"he").await.unwrap();

    // Give the handler time to register before the second request arrives
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.in_flight.current(), 1);

    let (status, _, body) = http_request(server.addr, "POST", "/", &[], b"second").await;
    assert_eq!(status, 429);
    assert_eq!(body, b"concurrent request limit exceeded");

    // Completing the first body lets the held request finish normally
    first.write_all(b"llo").await.unwrap();
    let mut raw = Vec::new();
    first.read_to_end(&mut raw).await.unwrap();
    let (status, _, body) = parse_response(&raw);
    assert_eq!(status, 200);
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_in_flight_returns_to_zero() {
    let server = start_watchdog(&[("fprocess", "cat")]).await;

    let (status, _, _) = http_request(server.addr, "POST", "/", &[], b"ping").await;
    assert_eq!(status, 200);

    // The guard drops when the handler returns, just before the response is
    // written; poll briefly to absorb that window.
    let deadline = Instant::now() + Duration::from_secs(1);
    while server.in_flight.current() != 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.in_flight.current(), 0);
}

#[tokio::test]
async fn test_health_endpoint_follows_ready_state() {
    let server = start_watchdog(&[("fprocess", "cat")]).await;

    let (status, _, _) = http_request(server.addr, "GET", "/_/health", &[], b"").await;
    assert_eq!(status, 503);

    server.ready.mark_ready();
    let (status, _, body) = http_request(server.addr, "GET", "/_/health", &[], b"").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"OK");

    let (status, _, _) = http_request(server.addr, "POST", "/_/health", &[], b"").await;
    assert_eq!(status, 405);

    server.ready.mark_not_ready();
    let (status, _, _) = http_request(server.addr, "GET", "/_/health", &[], b"").await;
    assert_eq!(status, 503);
}

#[tokio::test]
async fn test_non_zero_exit_with_combined_output_stays_200() {
    let server = start_watchdog(&[("fprocess", "/bin/false"), ("combine_output", "true")]).await;

    let (status, _, _) = http_request(server.addr, "POST", "/", &[], b"").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_non_zero_exit_with_split_output_is_500() {
    let server = start_watchdog(&[("fprocess", "/bin/false"), ("combine_output", "false")]).await;

    let (status, _, _) = http_request(server.addr, "POST", "/", &[], b"").await;
    assert_eq!(status, 500);
}

#[tokio::test]
async fn test_split_output_returns_stderr_in_body() {
    // `sh -c <word>` keeps the command to a single token, which the
    // whitespace-split fprocess can express
    let server = start_watchdog(&[
        ("fprocess", "sh -c no-such-command-zz"),
        ("combine_output", "false"),
    ])
    .await;

    let (status, _, body) = http_request(server.addr, "POST", "/", &[], b"").await;
    assert_eq!(status, 500);
    let stderr = String::from_utf8_lossy(&body);
    assert!(stderr.contains("no-such-command-zz"), "{stderr}");
}

#[tokio::test]
async fn test_function_headers_propagate_when_split() {
    let script = std::env::temp_dir().join("execgate-test-headers.sh");
    std::fs::write(
        &script,
        "printf 'X-Custom: yes\\r\\nContent-Type: text/plain\\r\\n\\r\\nhello'\n",
    )
    .unwrap();

    let fprocess = format!("sh {}", script.display());
    let server = start_watchdog(&[("fprocess", &fprocess), ("combine_output", "false")]).await;

    let (status, headers, body) = http_request(server.addr, "GET", "/", &[], b"").await;

    assert_eq!(status, 200);
    assert_eq!(headers.get("x-custom").map(String::as_str), Some("yes"));
    assert_eq!(
        headers.get("content-type").map(String::as_str),
        Some("text/plain")
    );
    assert_eq!(body, b"hello");

    let _ = std::fs::remove_file(&script);
}

#[tokio::test]
async fn test_marshal_mode_envelope() {
    let server = start_watchdog(&[("fprocess", "cat"), ("marshal_request", "true")]).await;

    let (status, _, body) = http_request(
        server.addr,
        "POST",
        "/echo?x=1",
        &[("X-Call-Id", "abc")],
        b"ping",
    )
    .await;

    assert_eq!(status, 200);
    let envelope: serde_json::Value = serde_json::from_slice(&body).expect("envelope is JSON");
    assert_eq!(envelope["method"], "POST");
    assert_eq!(envelope["contentLength"], 4);
    assert_eq!(envelope["path"], "/echo");
    assert_eq!(envelope["query"], "x=1");
    assert_eq!(envelope["body"], "ping");
    assert_eq!(envelope["headers"]["X-Call-Id"][0], "abc");
}

#[tokio::test]
async fn test_shutdown_signal_stops_accepting() {
    let server = start_watchdog(&[("fprocess", "cat")]).await;

    let (status, _, _) = http_request(server.addr, "POST", "/", &[], b"ok").await;
    assert_eq!(status, 200);

    server.shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(TcpStream::connect(server.addr).await.is_err());
}
