//! Prometheus text-format parsing for the load scraper.
//!
//! vLLM exposes its engine state as gauges on `/metrics`. The scraper only
//! needs a handful of them; everything else is tolerated and ignored. When a
//! metric appears several times under different label sets (one per engine or
//! served model), the samples are summed so each engine contributes to the
//! fleet-level load number.

/// Fallback when an upstream does not report `process_max_fds`.
const DEFAULT_MAX_FDS: u64 = 65535;

const NUM_REQUESTS_RUNNING: &str = "vllm:num_requests_running";
const NUM_REQUESTS_WAITING: &str = "vllm:num_requests_waiting";
const GPU_CACHE_USAGE_PERC: &str = "vllm:gpu_cache_usage_perc";
const PROCESS_MAX_FDS: &str = "process_max_fds";

/// The gauges the router extracts from one `/metrics` body.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineGauges {
    pub running: u32,
    pub waiting: u32,
    pub gpu_cache_usage_perc: f64,
    pub process_max_fds: u64,
}

impl Default for EngineGauges {
    fn default() -> Self {
        Self {
            running: 0,
            waiting: 0,
            gpu_cache_usage_perc: 0.0,
            process_max_fds: DEFAULT_MAX_FDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("metrics body contained no parseable samples")]
pub struct MalformedMetrics;

/// Parses a Prometheus text exposition body into [`EngineGauges`].
///
/// Comment lines and individually malformed lines are skipped; a body that
/// yields zero parseable samples is reported as malformed.
pub fn parse_engine_gauges(body: &str) -> Result<EngineGauges, MalformedMetrics> {
    let mut samples = 0usize;
    let mut running = 0.0f64;
    let mut waiting = 0.0f64;
    let mut gpu_cache = 0.0f64;
    let mut max_fds: Option<f64> = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = parse_sample(line) else {
            continue;
        };
        samples += 1;
        match name {
            NUM_REQUESTS_RUNNING => running += value,
            NUM_REQUESTS_WAITING => waiting += value,
            GPU_CACHE_USAGE_PERC => gpu_cache += value,
            PROCESS_MAX_FDS => *max_fds.get_or_insert(0.0) += value,
            _ => {}
        }
    }

    if samples == 0 {
        return Err(MalformedMetrics);
    }

    Ok(EngineGauges {
        running: running.max(0.0).round() as u32,
        waiting: waiting.max(0.0).round() as u32,
        gpu_cache_usage_perc: gpu_cache,
        process_max_fds: max_fds
            .map(|v| v.max(0.0).round() as u64)
            .unwrap_or(DEFAULT_MAX_FDS),
    })
}

/// Splits one exposition line into `(metric name, value)`.
///
/// Accepts `name value` and `name{labels} value`; label values may contain
/// spaces, so the value is taken after the closing brace rather than by
/// whitespace-splitting the whole line.
fn parse_sample(line: &str) -> Option<(&str, f64)> {
    let (name, rest) = match line.find('{') {
        Some(brace) => {
            let close = line.rfind('}')?;
            if close < brace {
                return None;
            }
            (&line[..brace], &line[close + 1..])
        }
        None => {
            let space = line.find(char::is_whitespace)?;
            (&line[..space], &line[space..])
        }
    };
    if name.is_empty() {
        return None;
    }
    // A trailing timestamp after the value is permitted by the format.
    let value = rest.split_whitespace().next()?;
    value.parse::<f64>().ok().map(|v| (name, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_labeled_samples() {
        let body = "\
# HELP vllm:num_requests_running Number of requests currently running.
# TYPE vllm:num_requests_running gauge
vllm:num_requests_running{engine=\"0\",model_name=\"llama3.1:8b\"} 3.0
vllm:num_requests_waiting{engine=\"0\",model_name=\"llama3.1:8b\"} 2.0
vllm:gpu_cache_usage_perc{engine=\"0\"} 0.41
process_max_fds 1048576
";
        let gauges = parse_engine_gauges(body).unwrap();
        assert_eq!(gauges.running, 3);
        assert_eq!(gauges.waiting, 2);
        assert!((gauges.gpu_cache_usage_perc - 0.41).abs() < 1e-9);
        assert_eq!(gauges.process_max_fds, 1048576);
    }

    #[test]
    fn sums_samples_across_label_sets() {
        let body = "\
vllm:num_requests_running{engine=\"0\"} 2
vllm:num_requests_running{engine=\"1\"} 5
vllm:num_requests_waiting{engine=\"0\"} 1
vllm:num_requests_waiting{engine=\"1\"} 1
";
        let gauges = parse_engine_gauges(body).unwrap();
        assert_eq!(gauges.running, 7);
        assert_eq!(gauges.waiting, 2);
    }

    #[test]
    fn tolerates_unknown_metrics_and_missing_names() {
        let body = "\
python_gc_objects_collected_total{generation=\"0\"} 17091.0
vllm:num_requests_running 1
some_other_gauge 42
";
        let gauges = parse_engine_gauges(body).unwrap();
        assert_eq!(gauges.running, 1);
        assert_eq!(gauges.waiting, 0);
        assert_eq!(gauges.process_max_fds, 65535);
    }

    #[test]
    fn labels_containing_spaces_do_not_break_parsing() {
        let body = r#"vllm:num_requests_running{model_name="llama 3 instruct"} 4"#;
        let gauges = parse_engine_gauges(body).unwrap();
        assert_eq!(gauges.running, 4);
    }

    #[test]
    fn skips_malformed_lines_silently() {
        let body = "\
vllm:num_requests_running notanumber
vllm:num_requests_waiting{unclosed 3
vllm:num_requests_running 2
";
        let gauges = parse_engine_gauges(body).unwrap();
        assert_eq!(gauges.running, 2);
        assert_eq!(gauges.waiting, 0);
    }

    #[test]
    fn empty_or_html_bodies_are_malformed() {
        assert_eq!(parse_engine_gauges(""), Err(MalformedMetrics));
        assert_eq!(
            parse_engine_gauges("<html><body>404</body></html>"),
            Err(MalformedMetrics)
        );
        assert_eq!(
            parse_engine_gauges("# only comments here\n# nothing else\n"),
            Err(MalformedMetrics)
        );
    }

    #[test]
    fn round_trips_emitted_gauge_lines() {
        // parse(emit(x)) = x over the recognised names.
        let expected = EngineGauges {
            running: 15,
            waiting: 4,
            gpu_cache_usage_perc: 0.87,
            process_max_fds: 524288,
        };
        let emitted = format!(
            "vllm:num_requests_running {}\nvllm:num_requests_waiting {}\nvllm:gpu_cache_usage_perc {}\nprocess_max_fds {}\n",
            expected.running, expected.waiting, expected.gpu_cache_usage_perc, expected.process_max_fds,
        );
        assert_eq!(parse_engine_gauges(&emitted).unwrap(), expected);
    }
}
