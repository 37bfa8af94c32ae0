//! The live fleet model: per-upstream state and the published snapshot.
//!
//! Every configured backend gets one [`Upstream`] record. Records are shared
//! by `Arc` between fleet snapshots, so a hot reload that keeps a URL keeps
//! its liveness history. All mutable fields live behind one per-upstream
//! mutex; readers take a by-value [`UpstreamSnapshot`] and never hold the
//! lock across await points. The current [`FleetSnapshot`] is published
//! through an atomic pointer swap, so there is no global lock anywhere.

use crate::config::Tuning;
use crate::metrics::EngineGauges;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use url::Url;

/// Rolling window over the last N probe outcomes.
#[derive(Debug)]
pub(crate) struct ProbeWindow {
    outcomes: VecDeque<(bool, Duration)>,
    capacity: usize,
}

impl ProbeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn record(&mut self, success: bool, response_time: Duration) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((success, response_time));
    }

    pub(crate) fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Success rate over the window; 1.0 when no samples exist yet.
    pub(crate) fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|(ok, _)| *ok).count();
        successes as f64 / self.outcomes.len() as f64
    }

    pub(crate) fn mean_response_time(&self) -> Duration {
        if self.outcomes.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.outcomes.iter().map(|(_, rt)| *rt).sum();
        total / self.outcomes.len() as u32
    }

    pub(crate) fn clear(&mut self) {
        self.outcomes.clear();
    }
}

#[derive(Debug)]
pub(crate) struct UpstreamState {
    pub(crate) max_concurrent_requests: u32,
    pub(crate) healthy: bool,
    pub(crate) healthy_since: Option<DateTime<Utc>>,
    pub(crate) unhealthy_since: Option<DateTime<Utc>>,
    /// Shared by probe failures and request failures; reset by any success.
    pub(crate) consecutive_failures: u32,
    /// Start of the current run of successful probes while unhealthy.
    /// Recovery requires this run to span the auto-recovery window.
    pub(crate) recovering_since: Option<Instant>,
    pub(crate) last_failure_at: Option<Instant>,
    pub(crate) probes: ProbeWindow,
    pub(crate) running: u32,
    pub(crate) waiting: u32,
    pub(crate) gpu_cache_usage_perc: f64,
    pub(crate) last_scrape_at: Option<DateTime<Utc>>,
    pub(crate) scrape_ok: bool,
    pub(crate) models: BTreeSet<String>,
    pub(crate) last_discovery_at: Option<DateTime<Utc>>,
}

impl UpstreamState {
    /// Applies a liveness transition, stamping the matching `*_since` field.
    /// No-op when the state already matches.
    pub(crate) fn set_healthy(&mut self, url: &Url, healthy: bool, reason: &str) {
        if self.healthy == healthy {
            return;
        }
        self.healthy = healthy;
        if healthy {
            self.healthy_since = Some(Utc::now());
            self.recovering_since = None;
            // Stale failure samples would immediately re-trip the policy.
            self.probes.clear();
            info!(%url, old = "unhealthy", new = "healthy", reason, "upstream recovered");
        } else {
            self.unhealthy_since = Some(Utc::now());
            self.recovering_since = None;
            warn!(%url, old = "healthy", new = "unhealthy", reason, "upstream marked unhealthy");
        }
    }
}

/// One configured backend inference server.
#[derive(Debug)]
pub struct Upstream {
    url: Url,
    state: Mutex<UpstreamState>,
}

impl Upstream {
    pub fn new(url: Url, max_concurrent_requests: u32, window_size: usize, healthy: bool) -> Self {
        Self {
            url,
            state: Mutex::new(UpstreamState {
                max_concurrent_requests,
                healthy,
                healthy_since: healthy.then(Utc::now),
                unhealthy_since: (!healthy).then(Utc::now),
                consecutive_failures: 0,
                recovering_since: None,
                last_failure_at: None,
                probes: ProbeWindow::new(window_size),
                running: 0,
                waiting: 0,
                gpu_cache_usage_perc: 0.0,
                last_scrape_at: None,
                scrape_ok: false,
                models: BTreeSet::new(),
                last_discovery_at: None,
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, UpstreamState> {
        self.state.lock().unwrap()
    }

    /// By-value copy of the public fields, taken under the mutex. Everything
    /// that reads upstream state (selector, introspection handlers) consumes
    /// these copies.
    pub fn snapshot(&self) -> UpstreamSnapshot {
        let state = self.state();
        UpstreamSnapshot {
            url: self.url.clone(),
            max_concurrent_requests: state.max_concurrent_requests,
            healthy: state.healthy,
            healthy_since: state.healthy_since,
            unhealthy_since: state.unhealthy_since,
            consecutive_failures: state.consecutive_failures,
            success_rate: state.probes.success_rate(),
            mean_response_time: state.probes.mean_response_time(),
            running: state.running,
            waiting: state.waiting,
            gpu_cache_usage_perc: state.gpu_cache_usage_perc,
            last_scrape_at: state.last_scrape_at,
            scrape_ok: state.scrape_ok,
            models: state.models.clone(),
            last_discovery_at: state.last_discovery_at,
        }
    }

    /// Declared capacity is the one tuning field a reload updates in place.
    pub fn set_capacity(&self, max_concurrent_requests: u32) {
        let mut state = self.state();
        if state.max_concurrent_requests != max_concurrent_requests {
            info!(
                url = %self.url,
                old = state.max_concurrent_requests,
                new = max_concurrent_requests,
                "upstream capacity changed"
            );
            state.max_concurrent_requests = max_concurrent_requests;
        }
    }

    /// Successful `/metrics` scrape: fresh load numbers.
    pub fn record_scrape(&self, gauges: &EngineGauges) {
        let mut state = self.state();
        state.running = gauges.running;
        state.waiting = gauges.waiting;
        state.gpu_cache_usage_perc = gauges.gpu_cache_usage_perc;
        state.scrape_ok = true;
        state.last_scrape_at = Some(Utc::now());
    }

    /// Failed scrape: the previous load numbers stay (stale but usable), and
    /// one failure sample feeds the rolling statistics. Liveness is never
    /// decided here; that is the health checker's call.
    pub fn record_scrape_failure(&self, elapsed: Duration) {
        let mut state = self.state();
        state.scrape_ok = false;
        state.probes.record(false, elapsed);
    }

    /// Request attempt completed against this upstream.
    pub fn record_request_success(&self) {
        let mut state = self.state();
        state.consecutive_failures = 0;
    }

    /// Request attempt failed. `failure_threshold` consecutive failures trip
    /// the upstream unhealthy immediately (passive health); the usual
    /// recovery window then applies.
    pub fn record_request_failure(&self, failure_threshold: u32) {
        let mut state = self.state();
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Instant::now());
        state.recovering_since = None;
        if state.healthy && state.consecutive_failures >= failure_threshold {
            let reason = format!(
                "{} consecutive request failures",
                state.consecutive_failures
            );
            state.set_healthy(&self.url, false, &reason);
        }
    }

    /// Replaces the cached model set after a successful discovery fetch.
    pub fn set_models(&self, models: BTreeSet<String>) {
        let mut state = self.state();
        if state.models != models {
            info!(url = %self.url, count = models.len(), "advertised model set changed");
        }
        state.models = models;
        state.last_discovery_at = Some(Utc::now());
    }
}

/// Copy of an upstream's public fields at one point in time.
#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub url: Url,
    pub max_concurrent_requests: u32,
    pub healthy: bool,
    pub healthy_since: Option<DateTime<Utc>>,
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub mean_response_time: Duration,
    pub running: u32,
    pub waiting: u32,
    pub gpu_cache_usage_perc: f64,
    pub last_scrape_at: Option<DateTime<Utc>>,
    pub scrape_ok: bool,
    pub models: BTreeSet<String>,
    pub last_discovery_at: Option<DateTime<Utc>>,
}

impl UpstreamSnapshot {
    pub fn available_capacity(&self) -> u32 {
        self.max_concurrent_requests.saturating_sub(self.running)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.max_concurrent_requests == 0 {
            return 0.0;
        }
        (self.running as f64 / self.max_concurrent_requests as f64 * 100.0).min(100.0)
    }
}

/// Immutable view of the fleet: the ordered upstream list (config order) plus
/// the tuning knobs, published as one unit.
#[derive(Debug)]
pub struct FleetSnapshot {
    pub upstreams: Vec<Arc<Upstream>>,
    pub tuning: Tuning,
}

impl FleetSnapshot {
    pub fn get(&self, url: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.iter().find(|u| u.url().as_str() == url)
    }
}

/// Handle for publishing and loading fleet snapshots. Readers load the
/// current `Arc` once per operation and keep it for the operation's
/// duration; the config manager stores a new one atomically.
#[derive(Debug, Clone)]
pub struct Fleet {
    inner: Arc<ArcSwap<FleetSnapshot>>,
}

impl Fleet {
    pub fn new(snapshot: FleetSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<FleetSnapshot> {
        self.inner.load_full()
    }

    pub fn store(&self, snapshot: FleetSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_upstream(healthy: bool) -> Upstream {
        Upstream::new("http://gpu-1:8000".parse().unwrap(), 4, 10, healthy)
    }

    #[test]
    fn probe_window_is_bounded() {
        let mut window = ProbeWindow::new(3);
        for _ in 0..5 {
            window.record(true, Duration::from_millis(10));
        }
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn probe_window_success_rate_and_mean() {
        let mut window = ProbeWindow::new(10);
        assert_eq!(window.success_rate(), 1.0);
        assert_eq!(window.mean_response_time(), Duration::ZERO);

        window.record(true, Duration::from_millis(100));
        window.record(false, Duration::from_millis(300));
        assert_eq!(window.success_rate(), 0.5);
        assert_eq!(window.mean_response_time(), Duration::from_millis(200));
    }

    #[test]
    fn scrape_updates_load_numbers() {
        let upstream = test_upstream(true);
        upstream.record_scrape(&EngineGauges {
            running: 3,
            waiting: 1,
            gpu_cache_usage_perc: 0.5,
            process_max_fds: 65535,
        });

        let snap = upstream.snapshot();
        assert_eq!(snap.running, 3);
        assert_eq!(snap.waiting, 1);
        assert!(snap.scrape_ok);
        assert!(snap.last_scrape_at.is_some());
        assert_eq!(snap.available_capacity(), 1);
    }

    #[test]
    fn scrape_failure_keeps_previous_load_and_health() {
        let upstream = test_upstream(true);
        upstream.record_scrape(&EngineGauges {
            running: 2,
            waiting: 0,
            gpu_cache_usage_perc: 0.1,
            process_max_fds: 65535,
        });

        upstream.record_scrape_failure(Duration::from_secs(5));

        let snap = upstream.snapshot();
        assert_eq!(snap.running, 2, "stale load numbers are retained");
        assert!(!snap.scrape_ok);
        assert!(snap.healthy, "a scrape failure never flips liveness");
        assert!(snap.success_rate < 1.0, "the failure fed the rolling stats");
    }

    #[test]
    fn consecutive_request_failures_trip_passive_health() {
        let upstream = test_upstream(true);

        upstream.record_request_failure(3);
        upstream.record_request_failure(3);
        assert!(upstream.snapshot().healthy, "below the threshold");

        upstream.record_request_failure(3);
        let snap = upstream.snapshot();
        assert!(!snap.healthy);
        assert_eq!(snap.consecutive_failures, 3);
        assert!(snap.unhealthy_since.is_some());
    }

    #[test]
    fn request_success_resets_the_failure_counter() {
        let upstream = test_upstream(true);
        upstream.record_request_failure(3);
        upstream.record_request_failure(3);
        upstream.record_request_success();
        upstream.record_request_failure(3);
        assert!(upstream.snapshot().healthy);
        assert_eq!(upstream.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn capacity_updates_in_place() {
        let upstream = test_upstream(true);
        upstream.record_request_failure(1); // now unhealthy, with history
        upstream.set_capacity(16);

        let snap = upstream.snapshot();
        assert_eq!(snap.max_concurrent_requests, 16);
        assert!(!snap.healthy, "capacity change does not touch liveness");
    }

    #[test]
    fn available_capacity_saturates_at_zero() {
        let upstream = test_upstream(true);
        upstream.record_scrape(&EngineGauges {
            running: 9,
            waiting: 0,
            gpu_cache_usage_perc: 0.0,
            process_max_fds: 65535,
        });
        assert_eq!(upstream.snapshot().available_capacity(), 0);
    }

    #[test]
    fn set_models_stamps_discovery_time() {
        let upstream = test_upstream(true);
        upstream.set_models(["m1".to_string(), "m2".to_string()].into());

        let snap = upstream.snapshot();
        assert!(snap.models.contains("m1"));
        assert!(snap.models.contains("m2"));
        assert!(snap.last_discovery_at.is_some());
    }

    #[test]
    fn fleet_swap_publishes_new_snapshot() {
        let fleet = Fleet::new(FleetSnapshot {
            upstreams: vec![Arc::new(test_upstream(true))],
            tuning: Tuning::default(),
        });
        assert_eq!(fleet.load().upstreams.len(), 1);

        let held = fleet.load();
        fleet.store(FleetSnapshot {
            upstreams: vec![],
            tuning: Tuning::default(),
        });
        assert_eq!(fleet.load().upstreams.len(), 0);
        // A reader that captured the old snapshot keeps seeing it.
        assert_eq!(held.upstreams.len(), 1);
    }
}
