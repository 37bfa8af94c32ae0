//! The config manager: builds fleet snapshots and hot-reloads them.
//!
//! The watcher polls the config file's mtime on the reload tick. A changed
//! file is re-parsed and diffed against the current snapshot: upstreams
//! whose URL survives keep their record (and with it their liveness history
//! and load numbers), new URLs get fresh records that stay unhealthy until
//! their first successful probe, removed URLs are dropped. The resulting
//! snapshot is published in one atomic store; a parse error keeps the
//! previous snapshot.

use crate::config::{ConfigFile, Tuning};
use crate::upstream::{Fleet, FleetSnapshot, Upstream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, error, info};

fn new_record(url: url::Url, max_concurrent_requests: u32, tuning: &Tuning) -> Arc<Upstream> {
    // With active checks disabled no probe would ever admit the upstream,
    // so it starts healthy instead of unreachable.
    let initially_healthy = !tuning.enable_active_health_check;
    Arc::new(Upstream::new(
        url,
        max_concurrent_requests,
        tuning.health_check_window_size,
        initially_healthy,
    ))
}

/// Builds the initial snapshot at startup.
pub fn build_fleet(config: ConfigFile) -> FleetSnapshot {
    let tuning = config.tuning;
    let upstreams = config
        .servers
        .servers
        .into_iter()
        .map(|spec| new_record(spec.url, spec.max_concurrent_requests, &tuning))
        .collect();
    FleetSnapshot { upstreams, tuning }
}

/// Builds the snapshot that follows `current` under the reloaded config.
pub fn next_snapshot(current: &FleetSnapshot, config: ConfigFile) -> FleetSnapshot {
    let tuning = config.tuning;
    let mut upstreams = Vec::with_capacity(config.servers.servers.len());

    for spec in config.servers.servers {
        match current.get(spec.url.as_str()) {
            Some(existing) => {
                existing.set_capacity(spec.max_concurrent_requests);
                upstreams.push(Arc::clone(existing));
            }
            None => {
                info!(url = %spec.url, "upstream added by reload");
                upstreams.push(new_record(spec.url, spec.max_concurrent_requests, &tuning));
            }
        }
    }

    for old in &current.upstreams {
        if !upstreams.iter().any(|u| u.url() == old.url()) {
            info!(url = %old.url(), "upstream removed by reload");
        }
    }

    FleetSnapshot { upstreams, tuning }
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

pub async fn run_config_watcher(path: PathBuf, fleet: Fleet, mut shutdown: watch::Receiver<bool>) {
    let mut last_modified = modified_time(&path).await;

    loop {
        let interval = fleet.load().tuning.reload_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        let Some(modified) = modified_time(&path).await else {
            debug!(path = %path.display(), "config file not readable, keeping current fleet");
            continue;
        };
        if last_modified.is_some_and(|seen| modified <= seen) {
            continue;
        }
        last_modified = Some(modified);

        match ConfigFile::load(&path) {
            Ok(config) => {
                let current = fleet.load();
                let next = next_snapshot(&current, config);
                info!(
                    upstreams = next.upstreams.len(),
                    path = %path.display(),
                    "configuration reloaded"
                );
                fleet.store(next);
            }
            Err(err) => {
                error!(%err, "config reload failed, keeping previous configuration");
            }
        }
    }
    debug!("config watcher stopped");
}
