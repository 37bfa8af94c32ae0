//! Server selection.
//!
//! [`select`] is pure over upstream snapshots: it mutates nothing, performs
//! no I/O, and never blocks. Candidates are scored by relative load,
//! `(running + 0.5 * waiting) / max_concurrent_requests`, and lightly-loaded
//! upstreams (score below 0.5) form a preferred group that is always picked
//! from first. Ties on the minimum score break uniformly at random so equal
//! upstreams share traffic.

use crate::upstream::{FleetSnapshot, Upstream, UpstreamSnapshot};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

/// Scores at or above this are outside the preferred group.
const PREFERRED_SCORE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no healthy upstream available")]
    NoHealthyUpstream,

    #[error("no healthy upstream serves model {0}")]
    NoUpstreamServesModel(String),
}

/// A successful selection. `AllAtCapacity` means every candidate had zero
/// available capacity; the forwarder still attempts the returned upstream
/// once (load metrics may be briefly stale) but does not retry past it.
#[derive(Debug, Clone)]
pub enum Choice {
    Open(Arc<Upstream>),
    AllAtCapacity(Arc<Upstream>),
}

impl Choice {
    pub fn upstream(&self) -> &Arc<Upstream> {
        match self {
            Choice::Open(u) | Choice::AllAtCapacity(u) => u,
        }
    }

    pub fn is_all_at_capacity(&self) -> bool {
        matches!(self, Choice::AllAtCapacity(_))
    }
}

fn load_score(snapshot: &UpstreamSnapshot) -> f64 {
    let raw = (snapshot.running as f64 + 0.5 * snapshot.waiting as f64)
        / snapshot.max_concurrent_requests as f64;
    if snapshot.available_capacity() == 0 {
        raw.max(1.0)
    } else {
        raw
    }
}

/// Picks the best upstream for one request attempt.
///
/// `excluded` carries the URLs already tried within the current request so a
/// retry never lands on the same upstream twice.
pub fn select(
    fleet: &FleetSnapshot,
    model: Option<&str>,
    excluded: &HashSet<String>,
) -> Result<Choice, SelectError> {
    let mut candidates: Vec<(Arc<Upstream>, UpstreamSnapshot)> = fleet
        .upstreams
        .iter()
        .filter(|u| !excluded.contains(u.url().as_str()))
        .map(|u| (Arc::clone(u), u.snapshot()))
        .filter(|(_, snap)| snap.healthy)
        .collect();

    if candidates.is_empty() {
        return Err(SelectError::NoHealthyUpstream);
    }

    if let Some(model) = model.filter(|m| !m.is_empty()) {
        candidates.retain(|(_, snap)| snap.models.contains(model));
        if candidates.is_empty() {
            return Err(SelectError::NoUpstreamServesModel(model.to_string()));
        }
    }

    let all_at_capacity = candidates
        .iter()
        .all(|(_, snap)| snap.available_capacity() == 0);

    let scored: Vec<(f64, &Arc<Upstream>)> = candidates
        .iter()
        .map(|(upstream, snap)| (load_score(snap), upstream))
        .collect();

    let preferred: Vec<&(f64, &Arc<Upstream>)> = scored
        .iter()
        .filter(|(score, _)| *score < PREFERRED_SCORE)
        .collect();
    let group: Vec<&(f64, &Arc<Upstream>)> = if preferred.is_empty() {
        scored.iter().collect()
    } else {
        preferred
    };

    let best = group
        .iter()
        .map(|(score, _)| *score)
        .fold(f64::INFINITY, f64::min);
    let minima: Vec<&Arc<Upstream>> = group
        .iter()
        .filter(|(score, _)| *score == best)
        .map(|(_, upstream)| *upstream)
        .collect();

    let pick = Arc::clone(minima[rand::rng().random_range(0..minima.len())]);
    Ok(if all_at_capacity {
        Choice::AllAtCapacity(pick)
    } else {
        Choice::Open(pick)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::metrics::EngineGauges;

    fn upstream(url: &str, max: u32, running: u32, waiting: u32, healthy: bool) -> Arc<Upstream> {
        let u = Arc::new(Upstream::new(url.parse().unwrap(), max, 10, healthy));
        u.record_scrape(&EngineGauges {
            running,
            waiting,
            gpu_cache_usage_perc: 0.0,
            process_max_fds: 65535,
        });
        u
    }

    fn fleet(upstreams: Vec<Arc<Upstream>>) -> FleetSnapshot {
        FleetSnapshot {
            upstreams,
            tuning: Tuning::default(),
        }
    }

    fn select_url(fleet: &FleetSnapshot, model: Option<&str>) -> String {
        select(fleet, model, &HashSet::new())
            .unwrap()
            .upstream()
            .url()
            .to_string()
    }

    #[test]
    fn picks_the_lower_scored_upstream() {
        // A: 1/2 -> 0.5, B: 0/4 -> 0.0. B is the only preferred candidate.
        let fleet = fleet(vec![
            upstream("http://a:8000", 2, 1, 0, true),
            upstream("http://b:8000", 4, 0, 0, true),
        ]);
        for _ in 0..20 {
            assert_eq!(select_url(&fleet, None), "http://b:8000/");
        }
    }

    #[test]
    fn preferred_group_beats_global_minimum() {
        // A: 0/2 -> 0.0 (preferred), B: 3/4 -> 0.75. A wins even though both
        // are healthy and B has spare capacity.
        let fleet = fleet(vec![
            upstream("http://a:8000", 2, 0, 0, true),
            upstream("http://b:8000", 4, 3, 0, true),
        ]);
        for _ in 0..20 {
            assert_eq!(select_url(&fleet, None), "http://a:8000/");
        }
    }

    #[test]
    fn waiting_requests_count_half() {
        // A: (0 + 0.5*4)/4 = 0.5, B: (1 + 0)/4 = 0.25. B preferred.
        let fleet = fleet(vec![
            upstream("http://a:8000", 4, 0, 4, true),
            upstream("http://b:8000", 4, 1, 0, true),
        ]);
        assert_eq!(select_url(&fleet, None), "http://b:8000/");
    }

    #[test]
    fn never_selects_an_unhealthy_upstream() {
        let fleet = fleet(vec![
            upstream("http://a:8000", 2, 0, 0, false),
            upstream("http://b:8000", 4, 3, 3, true),
        ]);
        for _ in 0..20 {
            assert_eq!(select_url(&fleet, None), "http://b:8000/");
        }
    }

    #[test]
    fn no_healthy_upstream_is_typed() {
        let fleet = fleet(vec![upstream("http://a:8000", 2, 0, 0, false)]);
        assert_eq!(
            select(&fleet, None, &HashSet::new()).unwrap_err(),
            SelectError::NoHealthyUpstream
        );
    }

    #[test]
    fn model_filter_overrides_load() {
        let a = upstream("http://a:8000", 4, 0, 0, true);
        a.set_models(["m1".to_string()].into());
        let b = upstream("http://b:8000", 4, 3, 2, true);
        b.set_models(["m2".to_string()].into());
        let fleet = fleet(vec![a, b]);

        // B is heavily loaded but the only one advertising m2.
        assert_eq!(select_url(&fleet, Some("m2")), "http://b:8000/");
        assert_eq!(select_url(&fleet, Some("m1")), "http://a:8000/");
    }

    #[test]
    fn unknown_model_is_typed() {
        let a = upstream("http://a:8000", 4, 0, 0, true);
        a.set_models(["m1".to_string()].into());
        let fleet = fleet(vec![a]);

        assert_eq!(
            select(&fleet, Some("m3"), &HashSet::new()).unwrap_err(),
            SelectError::NoUpstreamServesModel("m3".to_string())
        );
    }

    #[test]
    fn empty_model_filter_is_a_generic_request() {
        let a = upstream("http://a:8000", 4, 0, 0, true);
        // No models advertised at all; an empty filter must not 404.
        let fleet = fleet(vec![a]);
        assert!(select(&fleet, Some(""), &HashSet::new()).is_ok());
    }

    #[test]
    fn excluded_upstreams_are_skipped() {
        let fleet = fleet(vec![
            upstream("http://a:8000", 4, 0, 0, true),
            upstream("http://b:8000", 4, 3, 0, true),
        ]);
        let excluded: HashSet<String> = ["http://a:8000/".to_string()].into();
        assert_eq!(
            select(&fleet, None, &excluded)
                .unwrap()
                .upstream()
                .url()
                .as_str(),
            "http://b:8000/"
        );
    }

    #[test]
    fn excluding_everything_reports_no_healthy_upstream() {
        let fleet = fleet(vec![upstream("http://a:8000", 4, 0, 0, true)]);
        let excluded: HashSet<String> = ["http://a:8000/".to_string()].into();
        assert_eq!(
            select(&fleet, None, &excluded).unwrap_err(),
            SelectError::NoHealthyUpstream
        );
    }

    #[test]
    fn full_upstreams_are_scored_as_full() {
        // A: 4/4 running -> no capacity, scored at least 1.0.
        // B: 2/4 -> 0.5, not preferred but clearly better.
        let fleet = fleet(vec![
            upstream("http://a:8000", 4, 4, 0, true),
            upstream("http://b:8000", 4, 2, 0, true),
        ]);
        for _ in 0..20 {
            let choice = select(&fleet, None, &HashSet::new()).unwrap();
            assert!(!choice.is_all_at_capacity());
            assert_eq!(choice.upstream().url().as_str(), "http://b:8000/");
        }
    }

    #[test]
    fn all_at_capacity_still_returns_a_candidate() {
        let fleet = fleet(vec![
            upstream("http://a:8000", 2, 2, 5, true),
            upstream("http://b:8000", 4, 4, 1, true),
        ]);
        let choice = select(&fleet, None, &HashSet::new()).unwrap();
        assert!(choice.is_all_at_capacity());
        // The less overloaded one: A = (2 + 2.5)/2 = 2.25, B = (4 + 0.5)/4 ≈ 1.1.
        assert_eq!(choice.upstream().url().as_str(), "http://b:8000/");
    }

    #[test]
    fn ties_are_broken_among_the_minima() {
        let fleet = fleet(vec![
            upstream("http://a:8000", 4, 0, 0, true),
            upstream("http://b:8000", 4, 0, 0, true),
            upstream("http://c:8000", 4, 2, 0, true),
        ]);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(select_url(&fleet, None));
        }
        // Both zero-load upstreams share traffic; the loaded one never wins.
        assert!(seen.contains("http://a:8000/"));
        assert!(seen.contains("http://b:8000/"));
        assert!(!seen.contains("http://c:8000/"));
    }
}
