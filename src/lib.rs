//! vllm-router - a load-aware reverse proxy for LLM inference fleets.
//!
//! The router fronts a fleet of OpenAI-compatible inference servers (vLLM or
//! anything that looks like it). Each request is routed to the healthiest,
//! least-loaded upstream using live numbers scraped from the fleet's
//! `/metrics` endpoints, with retry on failure and streaming relay for SSE
//! responses. The fleet itself is hot-reloadable from a TOML file without
//! dropping in-flight traffic.

use axum::Router;
use axum::routing::{any, get, post};
use tracing::{info, instrument};

pub mod client;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod forward;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod reload;
pub mod scraper;
pub mod selector;
pub mod upstream;

use client::{HttpClient, PooledClient, create_pooled_client};
use upstream::Fleet;

/// Application state shared by every handler: the outbound HTTP client and
/// the handle to the current fleet snapshot.
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub fleet: Fleet,
}

impl AppState<PooledClient> {
    /// Creates state backed by the real pooled client.
    pub fn new(fleet: Fleet) -> Self {
        Self {
            http_client: create_pooled_client(),
            fleet,
        }
    }
}

impl<T: HttpClient> AppState<T> {
    /// Creates state with a custom client (used by tests, and by `main` so
    /// the forwarder and background loops share one pool).
    pub fn with_client(fleet: Fleet, http_client: T) -> Self {
        Self { http_client, fleet }
    }
}

/// Builds the public router:
/// - forward-mode OpenAI paths (chat/completions, completions, embeddings)
/// - any other `/v1/{*path}` request falls through to the same forwarding
///   pipeline, so the rest of the OpenAI surface (files, audio,
///   fine-tuning, ...) proxies too
/// - `/v1/models` served from the discovery cache
/// - `/health` and `/load-stats` introspection
/// - `/` service identification
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + 'static>(state: AppState<T>) -> Router {
    info!("building router");
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::fleet_health))
        .route("/load-stats", get(handlers::load_stats))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(forward::forward_handler))
        .route("/v1/completions", post(forward::forward_handler))
        .route("/v1/embeddings", post(forward::forward_handler))
        .route("/v1/{*path}", any(forward::forward_handler))
        .with_state(state)
}

#[doc(hidden)]
pub mod test_utils {
    //! A scriptable [`HttpClient`] for tests: respond per URI prefix, fail
    //! per URI prefix, or stream chunks, while recording every request.

    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::sync::{Arc, Mutex};

    type MockResult = Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
    type Responder = Arc<dyn Fn() -> MockResult + Send + Sync>;

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    struct Rule {
        prefix: String,
        responder: Responder,
    }

    #[derive(Clone)]
    pub struct MockHttpClient {
        requests: Arc<Mutex<Vec<MockRequest>>>,
        rules: Arc<Mutex<Vec<Rule>>>,
        fallback: Responder,
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .finish()
        }
    }

    fn fixed_response(status: StatusCode, body: String) -> Responder {
        Arc::new(move || {
            Ok(axum::response::Response::builder()
                .status(status)
                .body(Body::from(body.clone()))
                .unwrap())
        })
    }

    fn streaming_response(status: StatusCode, chunks: Vec<String>) -> Responder {
        Arc::new(move || {
            let stream = futures_util::stream::iter(
                chunks
                    .clone()
                    .into_iter()
                    .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
            );
            Ok(axum::response::Response::builder()
                .status(status)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(Body::from_stream(stream))
                .unwrap())
        })
    }

    fn erroring_response(message: String) -> Responder {
        Arc::new(move || Err(message.clone().into()))
    }

    impl MockHttpClient {
        /// Every request gets this status and body.
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                rules: Arc::new(Mutex::new(Vec::new())),
                fallback: fixed_response(status, body.to_string()),
            }
        }

        /// Every request gets an SSE stream of `chunks`.
        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                rules: Arc::new(Mutex::new(Vec::new())),
                fallback: streaming_response(status, chunks),
            }
        }

        /// Every request fails at the transport level (connection refused and
        /// friends).
        pub fn new_erroring(message: &str) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                rules: Arc::new(Mutex::new(Vec::new())),
                fallback: erroring_response(message.to_string()),
            }
        }

        fn push_rule(&self, prefix: &str, responder: Responder) {
            self.rules.lock().unwrap().push(Rule {
                prefix: prefix.to_string(),
                responder,
            });
        }

        /// Requests whose URI starts with `prefix` get this response instead
        /// of the fallback. First matching rule wins.
        pub fn on(&self, prefix: &str, status: StatusCode, body: &str) {
            self.push_rule(prefix, fixed_response(status, body.to_string()));
        }

        pub fn on_streaming(&self, prefix: &str, status: StatusCode, chunks: Vec<String>) {
            self.push_rule(prefix, streaming_response(status, chunks));
        }

        pub fn on_error(&self, prefix: &str, message: &str) {
            self.push_rule(prefix, erroring_response(message.to_string()));
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(&self, req: axum::extract::Request) -> MockResult {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri: uri.clone(),
                headers,
                body,
            });

            let responder = self
                .rules
                .lock()
                .unwrap()
                .iter()
                .find(|rule| uri.starts_with(&rule.prefix))
                .map(|rule| Arc::clone(&rule.responder));
            match responder {
                Some(responder) => responder(),
                None => (self.fallback)(),
            }
        }
    }
}
