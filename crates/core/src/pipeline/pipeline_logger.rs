use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::pipeline::detection_loop::TickOutcome;

fn outcome_key(outcome: TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::NotRunning => "not_running",
        TickOutcome::SkippedBusy => "skipped_busy",
        TickOutcome::SkippedNoFrame => "skipped_no_frame",
        TickOutcome::Dispatched { .. } => "dispatched",
    }
}

/// Cross-cutting logger for detection-loop events.
///
/// Decouples the loop from specific output mechanisms so each embedder can
/// observe pipeline behavior without changing the orchestration code.
pub trait PipelineLogger: Send {
    fn tick(&mut self, outcome: TickOutcome);

    /// Record how long a named stage took for one frame.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// Record a point-in-time metric (e.g. faces per frame).
    fn metric(&mut self, name: &str, value: f64);

    fn info(&mut self, message: &str);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

pub type SharedLogger = Arc<Mutex<dyn PipelineLogger>>;

/// Silent logger that discards all events.
pub struct NullPipelineLogger;

impl NullPipelineLogger {
    pub fn shared() -> SharedLogger {
        Arc::new(Mutex::new(NullPipelineLogger))
    }
}

impl PipelineLogger for NullPipelineLogger {
    fn tick(&mut self, _outcome: TickOutcome) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn info(&mut self, _message: &str) {}
}

/// Aggregates tick outcomes, per-stage timings and metrics, and reports a
/// summary through `log` when the run ends.
pub struct StdoutPipelineLogger {
    ticks: HashMap<&'static str, usize>,
    timings: HashMap<String, Vec<f64>>,
    metrics: HashMap<String, Vec<f64>>,
    start_time: Instant,
    messages: Vec<String>,
}

impl StdoutPipelineLogger {
    pub fn new() -> Self {
        Self {
            ticks: HashMap::new(),
            timings: HashMap::new(),
            metrics: HashMap::new(),
            start_time: Instant::now(),
            messages: Vec::new(),
        }
    }

    pub fn tick_count(&self, outcome: TickOutcome) -> usize {
        self.ticks.get(outcome_key(outcome)).copied().unwrap_or(0)
    }

    /// Returns the formatted summary string, or `None` if nothing was recorded.
    pub fn summary_string(&self) -> Option<String> {
        if self.ticks.is_empty() && self.timings.is_empty() && self.metrics.is_empty() {
            return None;
        }

        let elapsed_s = self.start_time.elapsed().as_secs_f64();
        let total_ticks: usize = self.ticks.values().sum();
        let mut lines = vec![format!(
            "Detection loop summary ({total_ticks} ticks, {elapsed_s:.1}s):"
        )];

        for outcome in [
            TickOutcome::Dispatched { frame_index: 0 },
            TickOutcome::SkippedBusy,
            TickOutcome::SkippedNoFrame,
        ] {
            let count = self.tick_count(outcome);
            if count > 0 {
                lines.push(format!("  {:16}: {count}", outcome_key(outcome)));
            }
        }

        let mut stages: Vec<_> = self.timings.keys().collect();
        stages.sort();
        for stage in stages {
            let durations = &self.timings[stage];
            let total_ms: f64 = durations.iter().sum();
            let avg_ms = total_ms / durations.len().max(1) as f64;
            let max_ms = durations.iter().copied().fold(0.0, f64::max);
            lines.push(format!(
                "  {stage:16}: avg {avg_ms:6.1}ms  max {max_ms:6.1}ms  ({} calls)",
                durations.len()
            ));
        }

        let mut metric_names: Vec<_> = self.metrics.keys().collect();
        metric_names.sort();
        for name in metric_names {
            let values = &self.metrics[name];
            let total: f64 = values.iter().sum();
            let avg = total / values.len().max(1) as f64;
            lines.push(format!("  {name}: avg {avg:.1}  total {total:.0}"));
        }

        let published = self.timings.get("inference").map_or(0, Vec::len);
        if published > 0 && elapsed_s > 0.0 {
            lines.push(format!(
                "  Throughput: {:.1} inferences/s",
                published as f64 / elapsed_s
            ));
        }

        Some(lines.join("\n"))
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn timings_for(&self, stage: &str) -> Option<&[f64]> {
        self.timings.get(stage).map(|v| v.as_slice())
    }

    pub fn metrics_for(&self, name: &str) -> Option<&[f64]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }
}

impl Default for StdoutPipelineLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineLogger for StdoutPipelineLogger {
    fn tick(&mut self, outcome: TickOutcome) {
        *self.ticks.entry(outcome_key(outcome)).or_default() += 1;
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .push(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn info(&mut self, message: &str) {
        self.messages.push(message.to_string());
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}
