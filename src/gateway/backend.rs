//! Gateway backends.
//!
//! A backend turns an HTTP request into an HTTP response. `HttpBackend`
//! forwards to a service's HTTP/JSON transcoding surface; other transports
//! plug in through the `Backend` trait.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::Response;
use backon::Retryable;
use tracing::{debug, info, warn};

use super::GatewayError;
use crate::bus::RetryPolicy;
use crate::config::BackendEndpoint;

/// Largest request or response body relayed.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Headers that describe a single hop and must not be relayed.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn forward(&self, request: Request) -> Result<Response, GatewayError>;
}

/// Forwards requests to `address` with the original path and query.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    name: String,
    base: reqwest::Url,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Check the backend accepts connections, retrying per `policy`, and
    /// build the forwarding client. Fails once the policy is exhausted.
    pub async fn dial(endpoint: &BackendEndpoint, policy: &RetryPolicy) -> Result<Self, GatewayError> {
        let base = reqwest::Url::parse(&endpoint.address).map_err(|e| GatewayError::InvalidEndpoint {
            name: endpoint.name.clone(),
            reason: e.to_string(),
        })?;
        let host = base
            .host_str()
            .ok_or_else(|| GatewayError::InvalidEndpoint {
                name: endpoint.name.clone(),
                reason: "address has no host".to_string(),
            })?
            .to_string();
        let port = base
            .port_or_known_default()
            .ok_or_else(|| GatewayError::InvalidEndpoint {
                name: endpoint.name.clone(),
                reason: "address has no port".to_string(),
            })?;

        let target = format!("{}:{}", host, port);
        (|| {
            let target = target.clone();
            async move {
                tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(&target))
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
                    .map(|_| ())
            }
        })
        .retry(policy.backoff())
        .notify(|e: &std::io::Error, delay: Duration| {
            warn!(backend = %endpoint.name, address = %target, error = %e, delay = ?delay, "Backend dial failed, retrying");
        })
        .await
        .map_err(|e| GatewayError::Dial {
            name: endpoint.name.clone(),
            message: format!("{} unreachable after {} attempts: {}", target, policy.max_attempts, e),
        })?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::InvalidEndpoint {
                name: endpoint.name.clone(),
                reason: e.to_string(),
            })?;

        info!(backend = %endpoint.name, address = %endpoint.address, "Backend reachable");
        Ok(Self {
            name: endpoint.name.clone(),
            base,
            client,
        })
    }

    fn upstream_url(&self, request: &Request) -> String {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        )
    }

    fn upstream_error(&self, message: impl ToString) -> GatewayError {
        GatewayError::Upstream {
            name: self.name.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, request: Request) -> Result<Response, GatewayError> {
        let url = self.upstream_url(&request);
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| GatewayError::Body(e.to_string()))?;

        debug!(backend = %self.name, method = %parts.method, %url, "Forwarding request");
        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(strip_hop_by_hop(&parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|e| self.upstream_error(e))?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| self.upstream_error(e))?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Copy of `headers` without hop-by-hop headers, including any named by
/// `Connection`, and without `Content-Length` (recomputed per hop).
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let hop = HOP_BY_HOP.contains(name)
            || name == header::CONTENT_LENGTH
            || name.as_str() == "keep-alive"
            || named.iter().any(|n| n == name.as_str());
        if !hop {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
