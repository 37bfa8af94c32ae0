//! The forwarder: the per-request pipeline behind every OpenAI-compatible
//! path.
//!
//! Each request buffers its JSON body once (retries need it), peeks the
//! `model` field to drive selection, then walks the retry loop: select an
//! upstream, forward, relay on success, record a failure and move to the
//! next candidate otherwise. Streamed responses (SSE or chunked JSON) relay
//! chunk-for-chunk because the upstream body is handed to the client as a
//! stream, never buffered.
//!
//! Retries can only happen before a response is relayed, so a client never
//! sees bytes from two different upstreams. A dropped client cancels the
//! in-flight upstream call without recording a failure against it.

use crate::AppState;
use crate::client::HttpClient;
use crate::errors::RouterError;
use crate::selector::{self, SelectError};
use crate::upstream::Upstream;
use axum::body::Body;
use axum::extract::State;
use bytes::Bytes;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Method, Request, Uri};
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// RFC 7230 hop-by-hop headers, stripped before forwarding.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Deserialize)]
struct ModelPeek {
    model: Option<String>,
}

/// Extracts a non-empty `model` field from a JSON request body, if any.
/// Anything unparseable routes as a generic request; validating payloads is
/// the upstream's job.
fn peek_model(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ModelPeek>(body)
        .ok()
        .and_then(|peek| peek.model)
        .filter(|model| !model.is_empty())
}

#[instrument(skip(state, req), fields(path = req.uri().path()))]
pub async fn forward_handler<T: HttpClient>(
    State(state): State<AppState<T>>,
    req: Request<Body>,
) -> Result<Response, RouterError> {
    let fleet = state.fleet.load();
    let tuning = fleet.tuning.clone();

    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| RouterError::BadRequestBody)?;
    let model = peek_model(&body_bytes);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path())
        .to_string();

    let mut excluded: HashSet<String> = HashSet::new();
    let mut last_error: Option<String> = None;
    let max_attempts = tuning.max_retries + 1;
    let mut attempts_made = 0u32;

    while attempts_made < max_attempts {
        let choice = match selector::select(&fleet, model.as_deref(), &excluded) {
            Ok(choice) => choice,
            Err(err) if attempts_made == 0 => {
                return Err(match err {
                    SelectError::NoHealthyUpstream => RouterError::NoHealthyUpstream,
                    SelectError::NoUpstreamServesModel(model) => {
                        RouterError::ModelNotAvailable(model)
                    }
                });
            }
            Err(_) => break, // every remaining candidate was already tried
        };

        let at_capacity = choice.is_all_at_capacity();
        let upstream = Arc::clone(choice.upstream());
        attempts_made += 1;

        if at_capacity {
            warn!(url = %upstream.url(), "all upstreams at declared capacity, attempting anyway");
        }
        info!(
            url = %upstream.url(),
            method = %parts.method,
            path = %path_and_query,
            model = model.as_deref().unwrap_or("-"),
            attempt = attempts_made,
            max_attempts,
            "forwarding request"
        );

        let attempt_req = build_upstream_request(
            &parts.method,
            &parts.headers,
            upstream.url(),
            &path_and_query,
            body_bytes.clone(),
        )?;

        match tokio::time::timeout(tuning.forward_timeout(), state.http_client.request(attempt_req))
            .await
        {
            Ok(Ok(response)) if !response.status().is_server_error() => {
                // 2xx and 4xx both relay verbatim; a client error is not the
                // upstream's fault.
                upstream.record_request_success();
                debug!(url = %upstream.url(), status = %response.status(), "relaying response");
                return Ok(response);
            }
            Ok(Ok(response)) => {
                let status = response.status();
                record_attempt_failure(&upstream, &tuning);
                last_error = Some(format!("upstream {} returned {}", upstream.url(), status));
            }
            Ok(Err(err)) => {
                record_attempt_failure(&upstream, &tuning);
                last_error = Some(format!("error forwarding to {}: {}", upstream.url(), err));
            }
            Err(_) => {
                record_attempt_failure(&upstream, &tuning);
                last_error = Some(format!(
                    "upstream {} timed out after {}s",
                    upstream.url(),
                    tuning.request_timeout
                ));
            }
        }

        excluded.insert(upstream.url().as_str().to_string());
        if at_capacity {
            // The one permitted attempt against a saturated fleet.
            break;
        }
        if attempts_made < max_attempts {
            tokio::time::sleep(tuning.retry_pause()).await;
        }
    }

    Err(RouterError::UpstreamUnavailable(last_error.unwrap_or_else(
        || "no upstream could be attempted".to_string(),
    )))
}

fn record_attempt_failure(upstream: &Upstream, tuning: &crate::config::Tuning) {
    warn!(url = %upstream.url(), "upstream attempt failed");
    upstream.record_request_failure(tuning.failure_threshold);
}

/// Rebuilds the client request against the chosen upstream: joined URL,
/// hop-by-hop headers stripped, `host` rewritten, `content-length` pinned to
/// the buffered body.
fn build_upstream_request(
    method: &Method,
    headers: &HeaderMap,
    base: &Url,
    path_and_query: &str,
    body: Bytes,
) -> Result<Request<Body>, RouterError> {
    let target = base
        .join(path_and_query.trim_start_matches('/'))
        .map_err(|_| RouterError::Internal)?;
    let uri: Uri = target.as_str().parse().map_err(|_| RouterError::Internal)?;

    let mut attempt_headers = headers.clone();
    for header in HOP_BY_HOP_HEADERS {
        attempt_headers.remove(*header);
    }
    if let Some(host) = uri.host() {
        let host_value = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        attempt_headers.insert("host", host_value.parse().unwrap());
    }
    attempt_headers.insert(CONTENT_LENGTH, body.len().into());
    attempt_headers.remove(TRANSFER_ENCODING);

    let request = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(Body::from(body))
        .map_err(|_| RouterError::Internal)?;
    let (mut req_parts, req_body) = request.into_parts();
    req_parts.headers = attempt_headers;
    Ok(Request::from_parts(req_parts, req_body))
}
