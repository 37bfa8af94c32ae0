//! Introspection endpoints: `/v1/models`, `/health`, `/load-stats`, `/`.
//!
//! These are served from fleet snapshots only; they never touch the network
//! and never block a forwarding request.

use crate::AppState;
use crate::client::HttpClient;
use crate::upstream::UpstreamSnapshot;
use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

/// One entry of the OpenAI-shaped model list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListModelResponse {
    pub object: String,
    pub data: Vec<Model>,
}

impl ListModelResponse {
    fn from_ids(ids: BTreeSet<String>) -> Self {
        // BTreeSet iteration gives the de-duplicated IDs already sorted.
        let data = ids
            .into_iter()
            .map(|id| Model {
                id,
                object: "model".into(),
                created: 0,
                owned_by: "vllm-router".into(),
            })
            .collect();
        ListModelResponse {
            object: "list".into(),
            data,
        }
    }
}

/// `GET /v1/models` — union of every healthy upstream's advertised models.
pub async fn list_models<T: HttpClient>(State(state): State<AppState<T>>) -> Json<ListModelResponse> {
    let fleet = state.fleet.load();
    let mut ids = BTreeSet::new();
    for upstream in &fleet.upstreams {
        let snap = upstream.snapshot();
        if snap.healthy {
            ids.extend(snap.models);
        }
    }
    Json(ListModelResponse::from_ids(ids))
}

#[derive(Debug, Serialize)]
pub struct ServerHealth {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub mean_response_time_ms: f64,
    pub last_scrape_at: Option<DateTime<Utc>>,
    pub models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FleetHealth {
    pub status: &'static str,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub servers: Vec<ServerHealth>,
}

fn overall_status(total: usize, healthy: usize) -> &'static str {
    if total == 0 {
        return "no_servers";
    }
    let ratio = healthy as f64 / total as f64;
    if ratio >= 0.8 {
        "healthy"
    } else if ratio >= 0.5 {
        "degraded"
    } else {
        "unhealthy"
    }
}

/// `GET /health` — fleet liveness summary.
pub async fn fleet_health<T: HttpClient>(State(state): State<AppState<T>>) -> Json<FleetHealth> {
    let fleet = state.fleet.load();
    let snapshots: Vec<UpstreamSnapshot> =
        fleet.upstreams.iter().map(|u| u.snapshot()).collect();

    let total = snapshots.len();
    let healthy = snapshots.iter().filter(|s| s.healthy).count();
    let servers = snapshots
        .into_iter()
        .map(|snap| ServerHealth {
            url: snap.url.to_string(),
            healthy: snap.healthy,
            consecutive_failures: snap.consecutive_failures,
            success_rate: snap.success_rate,
            mean_response_time_ms: snap.mean_response_time.as_secs_f64() * 1000.0,
            last_scrape_at: snap.last_scrape_at,
            models: snap.models.into_iter().collect(),
        })
        .collect();

    Json(FleetHealth {
        status: overall_status(total, healthy),
        total_servers: total,
        healthy_servers: healthy,
        unhealthy_servers: total - healthy,
        servers,
    })
}

#[derive(Debug, Serialize)]
pub struct ServerLoad {
    pub url: String,
    pub current_load: u32,
    pub waiting: u32,
    pub max_capacity: u32,
    pub available_capacity: u32,
    pub utilization_percent: f64,
}

#[derive(Debug, Serialize)]
pub struct LoadSummary {
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub total_active_load: u64,
    pub total_capacity: u64,
    pub overall_utilization_percent: f64,
}

#[derive(Debug, Serialize)]
pub struct LoadStats {
    pub servers: Vec<ServerLoad>,
    pub summary: LoadSummary,
}

/// `GET /load-stats` — per-upstream load plus a fleet-wide rollup.
pub async fn load_stats<T: HttpClient>(State(state): State<AppState<T>>) -> Json<LoadStats> {
    let fleet = state.fleet.load();
    let snapshots: Vec<UpstreamSnapshot> =
        fleet.upstreams.iter().map(|u| u.snapshot()).collect();

    let healthy = snapshots.iter().filter(|s| s.healthy).count();
    let total_active_load: u64 = snapshots.iter().map(|s| s.running as u64).sum();
    let total_capacity: u64 = snapshots
        .iter()
        .map(|s| s.max_concurrent_requests as u64)
        .sum();
    let overall = if total_capacity > 0 {
        total_active_load as f64 / total_capacity as f64 * 100.0
    } else {
        0.0
    };

    let servers = snapshots
        .iter()
        .map(|snap| ServerLoad {
            url: snap.url.to_string(),
            current_load: snap.running,
            waiting: snap.waiting,
            max_capacity: snap.max_concurrent_requests,
            available_capacity: snap.available_capacity(),
            utilization_percent: snap.utilization_percent(),
        })
        .collect();

    Json(LoadStats {
        servers,
        summary: LoadSummary {
            total_servers: snapshots.len(),
            healthy_servers: healthy,
            total_active_load,
            total_capacity,
            overall_utilization_percent: overall,
        },
    })
}

/// `GET /` — service identification.
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "vllm-router",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}
