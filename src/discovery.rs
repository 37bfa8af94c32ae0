//! Model discovery: caches which model IDs each upstream advertises.
//!
//! The selector filters on these sets when a request names a model, and
//! `/v1/models` serves their union. A failed fetch keeps the previous set;
//! an unreachable upstream keeps its last-known models but is excluded from
//! selection anyway once the health checker trips it.

use crate::client::HttpClient;
use crate::upstream::{Fleet, Upstream};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// The OpenAI-shaped `/v1/models` envelope. Unknown fields on each entry are
/// ignored; only the IDs matter for routing.
#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub async fn run_discovery<T: HttpClient>(
    client: T,
    fleet: Fleet,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let snapshot = fleet.load();
        let timeout = snapshot.tuning.probe_timeout();
        let fetches = snapshot
            .upstreams
            .iter()
            .map(|upstream| discover_one(&client, upstream, timeout));
        futures_util::future::join_all(fetches).await;

        tokio::select! {
            _ = tokio::time::sleep(snapshot.tuning.discovery_interval()) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("model discovery stopped");
}

async fn discover_one<T: HttpClient>(client: &T, upstream: &Arc<Upstream>, timeout: Duration) {
    match fetch_models(client, upstream, timeout).await {
        Ok(models) => {
            debug!(url = %upstream.url(), count = models.len(), "discovered models");
            upstream.set_models(models);
        }
        Err(err) => {
            debug!(url = %upstream.url(), %err, "model discovery failed, keeping previous set");
        }
    }
}

async fn fetch_models<T: HttpClient>(
    client: &T,
    upstream: &Arc<Upstream>,
    timeout: Duration,
) -> Result<BTreeSet<String>, String> {
    let response = client
        .get_with_timeout(upstream.url(), "v1/models", timeout)
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("unexpected status {}", response.status()));
    }
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map_err(|e| e.to_string())?;
    let list: ModelList = serde_json::from_slice(&body).map_err(|e| e.to_string())?;
    Ok(list.data.into_iter().map(|entry| entry.id).collect())
}
