//! The per-request invocation pipeline.
//!
//! Every inbound request spawns a fresh function process. The request body is
//! fed to the child's stdin (streamed, or marshalled as a single JSON
//! envelope), stdout and stderr are captured in full, and the response is
//! shaped from the captured output once the child has exited. A hard exec
//! timeout, or failing that the HTTP write timeout, bounds the whole
//! invocation; on expiry the child's process group is terminated.

use crate::config::WatchdogConfig;
use crate::server::text_response;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Time between SIGTERM and SIGKILL when a timed-out process group is torn down
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Spawns and supervises one function process per request.
pub struct FunctionRunner {
    config: Arc<WatchdogConfig>,
    argv: Vec<String>,
}

/// Request body as handed to the stdin writer task.
enum Payload {
    /// Raw body frames, streamed as they arrive from the client
    Stream(Incoming),
    /// Pre-serialized JSON envelope of the whole request
    Marshalled(Bytes),
}

/// The JSON envelope written to the function's stdin in marshal mode.
#[derive(Serialize)]
struct MarshalledRequest {
    method: String,
    #[serde(rename = "contentLength")]
    content_length: i64,
    path: String,
    query: String,
    headers: HashMap<String, Vec<String>>,
    body: String,
}

impl FunctionRunner {
    /// Split the target command into argv. The command is validated once at
    /// startup, never per request.
    pub fn new(config: Arc<WatchdogConfig>) -> anyhow::Result<Self> {
        let argv: Vec<String> = config
            .function_process
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if argv.is_empty() {
            anyhow::bail!("provide a valid process via the fprocess environment variable");
        }
        Ok(Self { config, argv })
    }

    /// Run the function process for one request and shape its output into the
    /// response.
    pub async fn handle(&self, req: hyper::Request<Incoming>) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let (parts, body) = req.into_parts();

        if self.config.debug_headers {
            info!(method = %parts.method, uri = %parts.uri, headers = ?parts.headers, "request headers");
        }

        // Marshal mode reads the whole body up front; stream mode hands it to
        // the stdin writer untouched.
        let payload = if self.config.marshal_request {
            match self.collect_body(body).await {
                Ok(bytes) => {
                    let envelope = marshal_request(&parts, &bytes);
                    match serde_json::to_vec(&envelope) {
                        Ok(buf) => Payload::Marshalled(Bytes::from(buf)),
                        Err(e) => {
                            error!(error = %e, "could not marshal request");
                            return text_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                format!("could not marshal request: {}", e),
                            );
                        }
                    }
                }
                Err(response) => return response,
            }
        } else {
            Payload::Stream(body)
        };

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .envs(request_env(&parts, self.config.cgi_headers))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The child gets its own process group so the whole tree can be
        // signalled on timeout, not just the root pid.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %self.argv[0], error = %e, "could not start process");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("could not start process: {}", e),
                );
            }
        };
        let pid = child.id();
        debug!(pid, "function process spawned");

        let stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let mut stdin_task = tokio::spawn(write_stdin(payload, stdin, self.config.read_timeout));
        let mut stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let mut stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        // exec_timeout is the hard deadline; with it disabled the HTTP write
        // timeout still bounds the invocation so nothing outlives the handler
        let deadline = if self.config.exec_timeout > Duration::ZERO {
            Some(self.config.exec_timeout)
        } else if self.config.write_timeout > Duration::ZERO {
            Some(self.config.write_timeout)
        } else {
            None
        };

        let outcome = {
            // The stdin writer is joined before the exit status is observed,
            // and both readers before the response is shaped.
            let completion = async {
                let _ = (&mut stdin_task).await;
                let exit = child.wait().await;
                let stdout = (&mut stdout_task).await;
                let stderr = (&mut stderr_task).await;
                (exit, stdout, stderr)
            };
            tokio::pin!(completion);
            match deadline {
                Some(limit) => {
                    let remaining = limit.saturating_sub(started.elapsed());
                    match tokio::time::timeout(remaining, completion).await {
                        Ok(done) => Ok(done),
                        Err(_) => Err(limit),
                    }
                }
                None => Ok(completion.await),
            }
        };

        let (exit, stdout_join, stderr_join) = match outcome {
            Ok(done) => done,
            Err(limit) => {
                warn!(
                    pid,
                    limit = %humantime::format_duration(limit),
                    "function exceeded its timeout, terminating process group"
                );
                terminate(&mut child, pid).await;
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                return text_response(
                    StatusCode::BAD_GATEWAY,
                    format!(
                        "function invocation timeout of {} exceeded, process terminated",
                        humantime::format_duration(limit)
                    ),
                );
            }
        };

        let exit = match exit {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "error waiting for function process");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("error waiting for process: {}", e),
                );
            }
        };

        let stdout_buf = collect_join("stdout", stdout_join);
        let stderr_buf = collect_join("stderr", stderr_join);
        let duration = started.elapsed();

        if self.config.combine_output {
            let mut body = stdout_buf;
            body.extend_from_slice(&stderr_buf);
            if !exit.success() {
                // stderr is already part of the body; the status stays 200
                error!(status = ?exit, "function exited with non-zero status");
            }
            return self.respond(StatusCode::OK, Vec::new(), body, duration);
        }

        // Split output: stderr goes to the watchdog's own log, never to the
        // response body of a successful invocation.
        if !stderr_buf.is_empty() {
            warn!(stderr = %String::from_utf8_lossy(&stderr_buf), "function wrote to stderr");
        }

        if !exit.success() {
            error!(status = ?exit, "function exited with non-zero status");
            return self.respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                Vec::new(),
                stderr_buf,
                duration,
            );
        }

        let (headers, offset) = split_output_headers(&stdout_buf);
        let body = stdout_buf[offset..].to_vec();
        self.respond(StatusCode::OK, headers, body, duration)
    }

    /// Read the whole request body, bounded by the read timeout.
    async fn collect_body(&self, body: Incoming) -> Result<Bytes, Response<Full<Bytes>>> {
        let read_timeout = self.config.read_timeout;
        let collected = if read_timeout > Duration::ZERO {
            match tokio::time::timeout(read_timeout, body.collect()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        limit = %humantime::format_duration(read_timeout),
                        "read timeout exceeded while reading request body"
                    );
                    return Err(text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "read timeout exceeded while reading request body",
                    ));
                }
            }
        } else {
            body.collect().await
        };

        match collected {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) => {
                error!(error = %e, "error reading request body");
                Err(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("error reading request body: {}", e),
                ))
            }
        }
    }

    /// Build the response, apply the Content-Type policy and the debug hooks.
    fn respond(
        &self,
        status: StatusCode,
        headers: Vec<(HeaderName, HeaderValue)>,
        body: Vec<u8>,
        duration: Duration,
    ) -> Response<Full<Bytes>> {
        let body_len = body.len();

        if self.config.write_debug {
            info!(
                status = %status,
                duration_ms = duration.as_millis() as u64,
                body = %String::from_utf8_lossy(&body),
                "function response"
            );
        } else {
            info!(
                status = %status,
                duration_ms = duration.as_millis() as u64,
                bytes = body_len,
                "function response"
            );
        }

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        for (name, value) in headers {
            response.headers_mut().append(name, value);
        }

        if !self.config.content_type.is_empty() {
            // A configured content type overrides whatever the function produced
            if let Ok(value) = HeaderValue::from_str(&self.config.content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
        } else if !response.headers().contains_key(CONTENT_TYPE) && body_len > 0 {
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }

        if self.config.debug_headers {
            info!(status = %status, headers = ?response.headers(), "response headers");
        }

        response
    }
}

/// Write the request payload to the child's stdin and close it. Errors are
/// logged, not surfaced: a function may legitimately exit without consuming
/// its input, and the response is shaped from its output either way.
async fn write_stdin(payload: Payload, mut stdin: ChildStdin, read_timeout: Duration) {
    let result = match payload {
        Payload::Marshalled(buf) => stdin.write_all(&buf).await.map_err(anyhow::Error::from),
        Payload::Stream(body) => {
            if read_timeout > Duration::ZERO {
                match tokio::time::timeout(read_timeout, copy_body(body, &mut stdin)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "read timeout of {} exceeded",
                        humantime::format_duration(read_timeout)
                    )),
                }
            } else {
                copy_body(body, &mut stdin).await
            }
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "error writing request body to function");
    }
    // stdin drops here, closing the pipe and signalling end of input
}

async fn copy_body(mut body: Incoming, stdin: &mut ChildStdin) -> anyhow::Result<()> {
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            stdin.write_all(data).await?;
        }
    }
    stdin.flush().await?;
    Ok(())
}

/// Tear down a timed-out process group: SIGTERM, a short grace period, then
/// SIGKILL. The group id equals the child's pid because the child called
/// setpgid at spawn.
#[cfg(unix)]
async fn terminate(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };

    unsafe {
        libc::killpg(pid as i32, libc::SIGTERM);
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "grace period exceeded, sending SIGKILL to process group");
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.kill().await;
}

fn collect_join(stream: &'static str, joined: Result<io::Result<Vec<u8>>, JoinError>) -> Vec<u8> {
    match joined {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            warn!(stream, error = %e, "error reading function output");
            Vec::new()
        }
        Err(e) => {
            warn!(stream, error = %e, "function output reader failed");
            Vec::new()
        }
    }
}

/// Environment variables describing the request, appended to the inherited
/// environment. Header-derived entries come last so they win on collision.
fn request_env(parts: &Parts, cgi_headers: bool) -> Vec<(String, String)> {
    let mut env = Vec::new();

    env.push(("Http_Method".to_string(), parts.method.as_str().to_string()));
    env.push((
        "Http_ContentLength".to_string(),
        content_length(parts).to_string(),
    ));
    if let Some(te) = parts
        .headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        env.push(("Http_Transfer_Encoding".to_string(), te.to_string()));
    }
    env.push(("Http_Path".to_string(), parts.uri.path().to_string()));
    if let Some(query) = parts.uri.query() {
        if !query.is_empty() {
            env.push(("Http_Query".to_string(), query.to_string()));
        }
    }

    if cgi_headers {
        for name in parts.headers.keys() {
            if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
                env.push((
                    format!("Http_{}", cgi_var_name(name.as_str())),
                    value.to_string(),
                ));
            }
        }
    }

    env
}

/// Content length as the function sees it: the declared header value, -1 for
/// chunked transfers, 0 when there is no body.
fn content_length(parts: &Parts) -> i64 {
    if let Some(value) = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
    {
        return value.parse().unwrap_or(-1);
    }
    if parts.headers.contains_key(TRANSFER_ENCODING) {
        return -1;
    }
    0
}

/// `x-call-id` → `X_Call_Id`
fn cgi_var_name(header: &str) -> String {
    canonical_header_name(header).replace('-', "_")
}

/// `x-call-id` → `X-Call-Id`
fn canonical_header_name(header: &str) -> String {
    header
        .split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn marshal_request(parts: &Parts, body: &Bytes) -> MarshalledRequest {
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for name in parts.headers.keys() {
        let values = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        headers.insert(canonical_header_name(name.as_str()), values);
    }

    MarshalledRequest {
        method: parts.method.as_str().to_string(),
        content_length: content_length(parts),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

/// Split HTTP-style header lines off the front of the function's output.
/// Returns the parsed headers and the offset where the body starts. The parse
/// is deliberately lenient: output with no blank-line terminator, or with any
/// line that does not look like a header, is treated as all body.
fn split_output_headers(output: &[u8]) -> (Vec<(HeaderName, HeaderValue)>, usize) {
    let mut headers = Vec::new();
    let mut pos = 0;

    while let Some(nl) = output[pos..].iter().position(|&b| b == b'\n') {
        let mut line = &output[pos..pos + nl];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return (headers, pos + nl + 1);
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return (Vec::new(), 0);
        };
        let name = std::str::from_utf8(&line[..colon]).ok().map(str::trim);
        let value = std::str::from_utf8(&line[colon + 1..]).ok().map(str::trim);
        let parsed = match (name, value) {
            (Some(name), Some(value)) => HeaderName::from_bytes(name.as_bytes())
                .ok()
                .zip(HeaderValue::from_str(value).ok()),
            _ => None,
        };
        let Some(pair) = parsed else {
            return (Vec::new(), 0);
        };

        headers.push(pair);
        pos += nl + 1;
    }

    (Vec::new(), 0)
}
