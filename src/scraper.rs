//! The load scraper: keeps every upstream's live load numbers fresh.
//!
//! One loop for the whole process. Each tick loads the fleet snapshot once,
//! then fetches every upstream's `/metrics` in parallel under the probe
//! timeout. Updates touch only the target upstream's own mutex; there is no
//! fleet-wide lock to contend with on the request path.

use crate::client::{HttpClient, ProbeError};
use crate::metrics::{self, EngineGauges};
use crate::upstream::{Fleet, Upstream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

/// Runs until the shutdown signal fires. Never returns early: any error in a
/// tick is recorded against the upstream it belongs to and the loop carries
/// on at the next tick.
pub async fn run_scraper<T: HttpClient>(client: T, fleet: Fleet, mut shutdown: watch::Receiver<bool>) {
    loop {
        let snapshot = fleet.load();
        let timeout = snapshot.tuning.probe_timeout();
        let probes = snapshot
            .upstreams
            .iter()
            .map(|upstream| scrape_one(&client, upstream, timeout));
        futures_util::future::join_all(probes).await;

        tokio::select! {
            _ = tokio::time::sleep(snapshot.tuning.scrape_interval()) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("load scraper stopped");
}

async fn scrape_one<T: HttpClient>(client: &T, upstream: &Arc<Upstream>, timeout: Duration) {
    let started = Instant::now();
    match fetch_metrics(client, upstream.url(), timeout).await {
        Ok(gauges) => {
            debug!(
                url = %upstream.url(),
                running = gauges.running,
                waiting = gauges.waiting,
                "scraped load metrics"
            );
            upstream.record_scrape(&gauges);
        }
        Err(err) => {
            debug!(url = %upstream.url(), %err, "metrics scrape failed");
            upstream.record_scrape_failure(started.elapsed());
        }
    }
}

async fn fetch_metrics<T: HttpClient>(
    client: &T,
    base: &Url,
    timeout: Duration,
) -> Result<EngineGauges, ProbeError> {
    let response = client.get_with_timeout(base, "metrics", timeout).await?;
    if !response.status().is_success() {
        return Err(ProbeError::Status(response.status()));
    }
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;
    let text = std::str::from_utf8(&body).map_err(|_| ProbeError::Malformed)?;
    metrics::parse_engine_gauges(text).map_err(|_| ProbeError::Malformed)
}
