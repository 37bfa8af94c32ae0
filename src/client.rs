//! Outbound HTTP for the whole router.
//!
//! Every byte that leaves the process goes through one [`HttpClient`]: the
//! forwarder sends full proxied requests, and the scraper, health checker,
//! and model discoverer issue deadline-bounded GET probes via
//! [`HttpClient::get_with_timeout`]. Probes and proxied traffic share the
//! same connection pool, so a probe usually rides an already-open connection
//! to the upstream it is checking. Tests swap the whole trait for a scripted
//! mock, which picks up the probe helper for free.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;
use url::Url;

/// Idle pooled connections are dropped after this long; an upstream that
/// went quiet does not pin sockets forever.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Enough warm connections per upstream to cover its probe traffic plus a
/// busy forwarding burst.
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// How a probe-style call failed. Background loops fold these into
/// per-upstream failure samples rather than surfacing them.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("timed out")]
    TimedOut,

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("body was not parseable")]
    Malformed,
}

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    /// Sends one fully-formed request and returns the (possibly streaming)
    /// response. The forwarder's path.
    async fn request(
        &self,
        req: Request<Body>,
    ) -> Result<Response, Box<dyn std::error::Error + Send + Sync>>;

    /// `GET base/path` under a deadline. The shape shared by every
    /// background loop: metrics scrapes, health probes, and model discovery
    /// differ only in path and in how they read the body.
    async fn get_with_timeout(
        &self,
        base: &Url,
        path: &str,
        timeout: Duration,
    ) -> Result<Response, ProbeError> {
        let target = base
            .join(path)
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let uri: Uri = target
            .as_str()
            .parse()
            .map_err(|_| ProbeError::Transport(format!("invalid probe uri {target}")))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        match tokio::time::timeout(timeout, self.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(ProbeError::Transport(err.to_string())),
            Err(_) => Err(ProbeError::TimedOut),
        }
    }
}

pub type PooledClient = Client<hyper_tls::HttpsConnector<HttpConnector>, Body>;

#[async_trait]
impl HttpClient for PooledClient {
    async fn request(
        &self,
        req: Request<Body>,
    ) -> Result<Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

/// Builds the one pooled client the process shares across the forwarder and
/// all background loops.
pub fn create_pooled_client() -> PooledClient {
    let https = hyper_tls::HttpsConnector::new();
    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}
