//! Active health checking and the liveness policy.
//!
//! The checker probes each upstream on its own tick, independently of the
//! load scraper, and is the only place liveness transitions are decided
//! (the forwarder's passive trip excepted). Probes hit `/health` first and
//! fall back to `/v1/models`, since not every OpenAI-compatible server
//! exposes a bare health route.
//!
//! Policy: an upstream goes unhealthy when its windowed success rate drops
//! below the configured minimum (once enough samples exist) or its mean
//! response time exceeds the configured ceiling. It becomes healthy again
//! only after successful probes have been sustained for the auto-recovery
//! window, so one lucky probe cannot flap a bad server back into rotation.

use crate::client::HttpClient;
use crate::config::Tuning;
use crate::upstream::{Fleet, Upstream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

const PROBE_PATHS: &[&str] = &["health", "v1/models"];

pub async fn run_health_checker<T: HttpClient>(
    client: T,
    fleet: Fleet,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let snapshot = fleet.load();
        if snapshot.tuning.enable_active_health_check {
            let checks = snapshot
                .upstreams
                .iter()
                .map(|upstream| check_one(&client, upstream, &snapshot.tuning));
            futures_util::future::join_all(checks).await;

            let healthy = snapshot
                .upstreams
                .iter()
                .filter(|u| u.snapshot().healthy)
                .count();
            debug!(
                healthy,
                total = snapshot.upstreams.len(),
                "health check cycle completed"
            );
        } else {
            for upstream in &snapshot.upstreams {
                recover_without_probe(upstream, &snapshot.tuning);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(snapshot.tuning.scrape_interval()) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("health checker stopped");
}

async fn check_one<T: HttpClient>(client: &T, upstream: &Arc<Upstream>, tuning: &Tuning) {
    let started = Instant::now();
    let success = probe(client, upstream, tuning.probe_timeout()).await;
    apply_probe(upstream, success, started.elapsed(), tuning);
}

async fn probe<T: HttpClient>(client: &T, upstream: &Arc<Upstream>, timeout: Duration) -> bool {
    for path in PROBE_PATHS {
        match client.get_with_timeout(upstream.url(), path, timeout).await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                debug!(url = %upstream.url(), path, status = %response.status(), "probe rejected");
            }
            Err(err) => {
                debug!(url = %upstream.url(), path, %err, "probe failed");
            }
        }
    }
    false
}

/// Feeds one probe outcome into the upstream's rolling statistics and applies
/// the liveness policy, all under a single acquisition of its mutex.
pub fn apply_probe(upstream: &Upstream, success: bool, elapsed: Duration, tuning: &Tuning) {
    let url = upstream.url().clone();
    let mut state = upstream.state();
    state.probes.record(success, elapsed);
    if success {
        state.consecutive_failures = 0;
    } else {
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Instant::now());
        state.recovering_since = None;
    }

    if state.healthy {
        let enough_samples = state.probes.len() >= tuning.health_check_consecutive_failures as usize;
        let success_rate = state.probes.success_rate();
        let mean_response = state.probes.mean_response_time();

        if enough_samples && success_rate < tuning.health_check_min_success_rate {
            let reason = format!(
                "success rate {:.2} below minimum {:.2}",
                success_rate, tuning.health_check_min_success_rate
            );
            state.set_healthy(&url, false, &reason);
        } else if mean_response > Duration::from_secs_f64(tuning.health_check_max_response_time) {
            let reason = format!(
                "mean response time {:.2}s above ceiling {:.2}s",
                mean_response.as_secs_f64(),
                tuning.health_check_max_response_time
            );
            state.set_healthy(&url, false, &reason);
        }
    } else if success {
        match state.recovering_since {
            None => {
                state.recovering_since = Some(Instant::now());
                info!(%url, "first successful probe after failure, starting recovery window");
            }
            Some(since) if since.elapsed() >= tuning.recovery_window() => {
                let reason = format!(
                    "successful probes sustained for {}s",
                    tuning.auto_recovery_threshold
                );
                state.set_healthy(&url, true, &reason);
            }
            Some(_) => {}
        }
    }
}

/// With active checks disabled nothing would ever probe a tripped upstream
/// back to life, so passive trips expire on their own once the upstream has
/// gone a full recovery window without a request failure.
fn recover_without_probe(upstream: &Arc<Upstream>, tuning: &Tuning) {
    let url = upstream.url().clone();
    let mut state = upstream.state();
    if state.healthy {
        return;
    }
    let quiet = state
        .last_failure_at
        .is_none_or(|at| at.elapsed() >= tuning.recovery_window());
    if quiet {
        state.consecutive_failures = 0;
        state.set_healthy(&url, true, "auto-recovery (active health checks disabled)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Upstream;

    fn upstream(healthy: bool) -> Upstream {
        Upstream::new("http://gpu-1:8000".parse().unwrap(), 4, 10, healthy)
    }

    fn fast() -> Duration {
        Duration::from_millis(50)
    }

    #[test]
    fn low_success_rate_trips_unhealthy() {
        let tuning = Tuning::default(); // min rate 0.8, 3 consecutive samples
        let u = upstream(true);

        apply_probe(&u, true, fast(), &tuning);
        apply_probe(&u, false, fast(), &tuning);
        assert!(u.snapshot().healthy, "only two samples so far");

        apply_probe(&u, false, fast(), &tuning);
        assert!(!u.snapshot().healthy, "1/3 successes is below 0.8");
    }

    #[test]
    fn slow_responses_trip_unhealthy() {
        let tuning = Tuning {
            health_check_max_response_time: 1.0,
            ..Tuning::default()
        };
        let u = upstream(true);

        apply_probe(&u, true, Duration::from_secs(5), &tuning);
        assert!(
            !u.snapshot().healthy,
            "successful but far too slow probes drain traffic"
        );
    }

    #[test]
    fn one_failed_probe_does_not_trip() {
        let tuning = Tuning::default();
        let u = upstream(true);
        for _ in 0..8 {
            apply_probe(&u, true, fast(), &tuning);
        }
        apply_probe(&u, false, fast(), &tuning);
        // 8/9 ≈ 0.89 success rate, above the 0.8 minimum.
        assert!(u.snapshot().healthy);
    }

    #[test]
    fn recovery_requires_a_sustained_window() {
        let tuning = Tuning {
            auto_recovery_threshold: 3600, // never elapses within the test
            ..Tuning::default()
        };
        let u = upstream(false);

        apply_probe(&u, true, fast(), &tuning);
        apply_probe(&u, true, fast(), &tuning);
        assert!(
            !u.snapshot().healthy,
            "successes within the window do not recover yet"
        );
    }

    #[test]
    fn recovery_completes_after_the_window() {
        let tuning = Tuning {
            auto_recovery_threshold: 0,
            ..Tuning::default()
        };
        let u = upstream(false);

        // First success opens the window; with a zero threshold the second
        // success completes it.
        apply_probe(&u, true, fast(), &tuning);
        apply_probe(&u, true, fast(), &tuning);
        let snap = u.snapshot();
        assert!(snap.healthy);
        assert!(snap.healthy_since.is_some());
    }

    #[test]
    fn failed_probe_resets_the_recovery_run() {
        let tuning = Tuning {
            auto_recovery_threshold: 0,
            ..Tuning::default()
        };
        let u = upstream(false);

        apply_probe(&u, true, fast(), &tuning); // opens the window
        apply_probe(&u, false, fast(), &tuning); // clears it
        apply_probe(&u, true, fast(), &tuning); // reopens it
        assert!(
            !u.snapshot().healthy,
            "the run restarted; one success only reopens the window"
        );

        apply_probe(&u, true, fast(), &tuning);
        assert!(u.snapshot().healthy);
    }

    #[test]
    fn recovery_clears_stale_failure_history() {
        let tuning = Tuning {
            auto_recovery_threshold: 0,
            ..Tuning::default()
        };
        let u = upstream(true);

        // Trip it with failures, then recover.
        for _ in 0..5 {
            apply_probe(&u, false, fast(), &tuning);
        }
        assert!(!u.snapshot().healthy);
        apply_probe(&u, true, fast(), &tuning);
        apply_probe(&u, true, fast(), &tuning);
        assert!(u.snapshot().healthy);

        // The old failures must not immediately re-trip the policy.
        apply_probe(&u, true, fast(), &tuning);
        assert!(u.snapshot().healthy);
        assert_eq!(u.snapshot().success_rate, 1.0);
    }

    #[test]
    fn passive_trip_uses_the_same_recovery_path() {
        let tuning = Tuning {
            auto_recovery_threshold: 0,
            ..Tuning::default()
        };
        let u = upstream(true);
        u.record_request_failure(1);
        assert!(!u.snapshot().healthy);

        apply_probe(&u, true, fast(), &tuning);
        apply_probe(&u, true, fast(), &tuning);
        assert!(u.snapshot().healthy);
    }

    #[test]
    fn disabled_checks_recover_quiet_upstreams() {
        let tuning = Tuning {
            enable_active_health_check: false,
            auto_recovery_threshold: 0,
            ..Tuning::default()
        };
        let u = Arc::new(upstream(true));
        u.record_request_failure(1);
        assert!(!u.snapshot().healthy);

        recover_without_probe(&u, &tuning);
        assert!(u.snapshot().healthy);
        assert_eq!(u.snapshot().consecutive_failures, 0);
    }
}
