//! JWT authentication for the function route.
//!
//! When enabled, every function request must carry a bearer token issued by
//! the gateway. The watchdog resolves its own identity (function name and
//! namespace) at startup and validates tokens against the authority's
//! published key set, which is fetched once and cached.

use crate::config::WatchdogConfig;
use crate::server::text_response;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::http::HeaderMap;
use hyper::{Request, Response, StatusCode};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Fallback namespace source when OPENFAAS_NAMESPACE is not set
pub const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const IN_CLUSTER_AUTHORITY: &str = "http://gateway.openfaas:8080";
const LOCAL_AUTHORITY: &str = "http://127.0.0.1:8000";
const KEY_SET_PATH: &str = "/.well-known/jwks.json";
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The function's own identity, used as the expected token audience.
#[derive(Debug, Clone)]
pub struct FunctionIdentity {
    pub name: String,
    pub namespace: String,
}

impl FunctionIdentity {
    /// Resolve the identity from the environment. The name is required; the
    /// namespace falls back to the service-account file.
    pub fn resolve() -> anyhow::Result<Self> {
        let name = std::env::var("OPENFAAS_NAME")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("env variable 'OPENFAAS_NAME' not set"))?;

        let namespace = match std::env::var("OPENFAAS_NAMESPACE") {
            Ok(namespace) => namespace,
            Err(_) => std::fs::read_to_string(NAMESPACE_FILE)
                .map(|s| s.trim().to_string())
                .map_err(|e| anyhow::anyhow!("failed to get function namespace: {}", e))?,
        };

        Ok(Self { name, namespace })
    }

    /// The audience value tokens must carry: `name.namespace`.
    pub fn audience(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// Validates gateway-issued bearer tokens in front of the function handler.
pub struct JwtAuthenticator {
    audience: String,
    authority: String,
    debug: bool,
    keys: tokio::sync::OnceCell<JwkSet>,
}

impl JwtAuthenticator {
    /// Resolve the function identity and pick the token authority. Fails at
    /// startup when the identity cannot be resolved.
    pub fn new(config: &WatchdogConfig) -> anyhow::Result<Self> {
        let identity = FunctionIdentity::resolve()?;
        let authority = if config.jwt_auth_local {
            LOCAL_AUTHORITY
        } else {
            IN_CLUSTER_AUTHORITY
        };

        info!(
            name = %identity.name,
            namespace = %identity.namespace,
            authority,
            "JWT authentication enabled"
        );

        Ok(Self {
            audience: identity.audience(),
            authority: authority.to_string(),
            debug: config.jwt_auth_debug,
            keys: tokio::sync::OnceCell::new(),
        })
    }

    /// Authorize one request, producing the 401 response on failure.
    pub async fn authorize(&self, req: &Request<Incoming>) -> Result<(), Response<Full<Bytes>>> {
        let Some(token) = bearer_token(req.headers()) else {
            return Err(unauthorized("missing bearer token"));
        };

        match self.validate(token).await {
            Ok(claims) => {
                if self.debug {
                    debug!(sub = ?claims.sub, "request authorized");
                }
                Ok(())
            }
            Err(e) => {
                if self.debug {
                    warn!(error = %e, "JWT validation failed");
                } else {
                    debug!("JWT validation failed");
                }
                Err(unauthorized("invalid bearer token"))
            }
        }
    }

    async fn validate(&self, token: &str) -> anyhow::Result<Claims> {
        let keys = self.keys.get_or_try_init(|| self.fetch_keys()).await?;

        let header = decode_header(token)?;
        let jwk = match header.kid.as_deref() {
            Some(kid) => keys.find(kid),
            None => keys.keys.first(),
        }
        .ok_or_else(|| anyhow::anyhow!("no matching key in the authority's key set"))?;

        let key = DecodingKey::from_jwk(jwk)?;
        let mut validation = Validation::new(Algorithm::ES256);
        validation.algorithms = vec![Algorithm::ES256, Algorithm::RS256];
        validation.set_issuer(&[&self.authority]);
        validation.set_audience(&[&self.audience]);

        let data = decode::<Claims>(token, &key, &validation)?;
        Ok(data.claims)
    }

    async fn fetch_keys(&self) -> anyhow::Result<JwkSet> {
        let host = self
            .authority
            .strip_prefix("http://")
            .unwrap_or(&self.authority);
        let body = fetch_http(host, KEY_SET_PATH).await?;
        let keys: JwkSet = serde_json::from_slice(&body)?;
        info!(count = keys.keys.len(), authority = %self.authority, "fetched JWT key set");
        Ok(keys)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

fn unauthorized(message: &str) -> Response<Full<Bytes>> {
    text_response(
        StatusCode::UNAUTHORIZED,
        format!("unauthorized: {}", message),
    )
}

/// Minimal one-shot HTTP GET. HTTP/1.0 keeps the response unframed so the
/// body is simply everything after the header block.
async fn fetch_http(host: &str, path: &str) -> anyhow::Result<Vec<u8>> {
    let mut stream = tokio::time::timeout(FETCH_TIMEOUT, TcpStream::connect(host))
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to {}", host))??;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    tokio::time::timeout(FETCH_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .map_err(|_| anyhow::anyhow!("timed out reading from {}", host))??;

    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("malformed HTTP response from {}", host))?;

    let status = std::str::from_utf8(&raw[..header_end])
        .ok()
        .and_then(|head| head.lines().next())
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    if !(200..300).contains(&status) {
        anyhow::bail!("{} returned status {}", host, status);
    }

    Ok(raw[header_end + 4..].to_vec())
}
