use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration for the watchdog, materialized once at startup
/// from the process environment.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// The process to exec for every request, e.g. `cat` or `python index.py`
    pub function_process: String,

    /// Bound on reading the request body from the client
    pub read_timeout: Duration,

    /// Bound on producing the response; the ultimate bound on a request when
    /// no exec timeout is set
    pub write_timeout: Duration,

    /// Interval at which an external prober polls `/_/health`; graceful
    /// shutdown waits this long before draining so the prober can observe 503
    pub healthcheck_interval: Duration,

    /// Hard deadline after which the function process is killed; zero disables
    pub exec_timeout: Duration,

    /// Port for the function server
    pub port: u16,

    /// Port for the Prometheus scrape endpoint
    pub metrics_port: u16,

    /// Log the full response body instead of just the byte count
    pub write_debug: bool,

    /// Expose request headers to the function as `Http_*` environment variables
    pub cgi_headers: bool,

    /// Deliver the request to the function as a single JSON envelope on stdin
    /// instead of streaming the raw body
    pub marshal_request: bool,

    /// Log all inbound and outbound HTTP headers
    pub debug_headers: bool,

    /// Skip writing the lock file; the watchdog reports ready immediately and
    /// no exec health check is possible
    pub suppress_lock: bool,

    /// Forced Content-Type for all responses; empty means derive per response
    pub content_type: String,

    /// Merge function stderr into stdout for response body purposes
    pub combine_output: bool,

    /// Validate a gateway-issued JWT on every function request
    pub jwt_auth: bool,

    /// Log JWT validation failures in detail
    pub jwt_auth_debug: bool,

    /// Use a port-forwarded gateway at 127.0.0.1:8000 as the token authority
    pub jwt_auth_local: bool,

    /// Maximum simultaneous requests; zero means unbounded
    pub max_inflight: usize,
}

impl WatchdogConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through a lookup function. Tests use this to avoid
    /// touching the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let write_timeout = duration_value(get("write_timeout").as_deref(), DEFAULT_TIMEOUT);

        Self {
            function_process: get("fprocess").unwrap_or_default(),
            read_timeout: duration_value(get("read_timeout").as_deref(), DEFAULT_TIMEOUT),
            write_timeout,
            healthcheck_interval: duration_value(
                get("healthcheck_interval").as_deref(),
                write_timeout,
            ),
            exec_timeout: duration_value(get("exec_timeout").as_deref(), Duration::ZERO),
            port: int_value(get("port").as_deref(), 8080),
            metrics_port: 8081,
            write_debug: bool_value(get("write_debug").as_deref(), false),
            cgi_headers: bool_value(get("cgi_headers").as_deref(), true),
            marshal_request: bool_value(get("marshal_request").as_deref(), false),
            debug_headers: bool_value(get("debug_headers").as_deref(), false),
            suppress_lock: bool_value(get("suppress_lock").as_deref(), false),
            content_type: get("content_type").unwrap_or_default(),
            combine_output: bool_value(get("combine_output").as_deref(), true),
            jwt_auth: bool_value(get("jwt_auth").as_deref(), false),
            jwt_auth_debug: bool_value(get("jwt_auth_debug").as_deref(), false),
            jwt_auth_local: bool_value(get("jwt_auth_local").as_deref(), false),
            max_inflight: int_value(get("max_inflight").as_deref(), 0),
        }
    }

    /// Validate the configuration. The only fatal condition is a missing
    /// target command.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.function_process.trim().is_empty() {
            anyhow::bail!("provide a valid process via the fprocess environment variable");
        }
        Ok(())
    }
}

/// Parse a duration given either as a plain non-negative integer (seconds) or
/// as a human-readable string such as `250ms`, `5s` or `2m`. Anything else
/// falls back to the given default.
fn duration_value(val: Option<&str>, fallback: Duration) -> Duration {
    let Some(val) = val else { return fallback };
    if val.is_empty() {
        return fallback;
    }
    if let Ok(secs) = val.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    humantime::parse_duration(val).unwrap_or(fallback)
}

/// A non-empty value is true iff it is the literal `true`; absent or empty
/// values keep the field default.
fn bool_value(val: Option<&str>, fallback: bool) -> bool {
    match val {
        Some(v) if !v.is_empty() => v == "true",
        _ => fallback,
    }
}

fn int_value<T: std::str::FromStr + Copy>(val: Option<&str>, fallback: T) -> T {
    val.and_then(|v| v.parse().ok()).unwrap_or(fallback)
}
