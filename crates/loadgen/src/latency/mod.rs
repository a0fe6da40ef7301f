//! Per-call latency recording.
//!
//! Every protocol call made during a run is recorded here under an endpoint
//! label such as `"POST /acme/new-order"`. Two views are kept:
//! - per-endpoint HDR histograms and counters for the end-of-run summary
//! - the raw call points, written out by [`LatencyRecorder::dump`] for
//!   external charting
//!
//! Recording is done from many concurrent action tasks, so the per-endpoint
//! state lives in a `DashMap` and the raw points behind a short-lived
//! `parking_lot::Mutex`.

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Result of a single call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Good,
    Error,
}

/// One recorded call, as written to the results file.
#[derive(Clone, Debug, Serialize)]
pub struct CallPoint {
    pub endpoint: String,
    /// Unix time the request was sent, in microseconds.
    pub sent_us: u64,
    /// Unix time the response finished, in microseconds.
    pub finished_us: u64,
    pub outcome: CallOutcome,
}

impl CallPoint {
    /// Time the call took.
    pub fn took(&self) -> Duration {
        Duration::from_micros(self.finished_us.saturating_sub(self.sent_us))
    }
}

struct EndpointStats {
    /// Latency histogram (microseconds), good calls only.
    histogram: Histogram<u64>,
    good: u64,
    errors: u64,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            histogram: Histogram::new(3).expect("histogram creation should succeed"),
            good: 0,
            errors: 0,
        }
    }
}

/// Collects timing and outcome of every protocol call in a run.
pub struct LatencyRecorder {
    title: String,
    started: Mutex<Option<SystemTime>>,
    stopped: Mutex<Option<SystemTime>>,
    endpoints: DashMap<String, EndpointStats>,
    points: Mutex<Vec<CallPoint>>,
}

impl LatencyRecorder {
    /// Create an empty recorder.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            started: Mutex::new(None),
            stopped: Mutex::new(None),
            endpoints: DashMap::new(),
            points: Mutex::new(Vec::new()),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Mark the start of measurement.
    pub fn mark_started(&self) {
        *self.started.lock() = Some(SystemTime::now());
    }

    /// Mark the end of measurement.
    pub fn mark_stopped(&self) {
        *self.stopped.lock() = Some(SystemTime::now());
    }

    pub fn started(&self) -> Option<SystemTime> {
        *self.started.lock()
    }

    pub fn stopped(&self) -> Option<SystemTime> {
        *self.stopped.lock()
    }

    /// Record one call.
    pub fn add(&self, endpoint: &str, sent: SystemTime, finished: SystemTime, outcome: CallOutcome) {
        let took = finished.duration_since(sent).unwrap_or_default();
        {
            let mut stats = self
                .endpoints
                .entry(endpoint.to_string())
                .or_insert_with(EndpointStats::new);
            match outcome {
                CallOutcome::Good => {
                    stats.good += 1;
                    let _ = stats.histogram.record(took.as_micros() as u64);
                }
                CallOutcome::Error => stats.errors += 1,
            }
        }

        self.points.lock().push(CallPoint {
            endpoint: endpoint.to_string(),
            sent_us: unix_micros(sent),
            finished_us: unix_micros(finished),
            outcome,
        });
    }

    /// Total number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.points.lock().len()
    }

    /// Copy of the raw call points.
    pub fn points(&self) -> Vec<CallPoint> {
        self.points.lock().clone()
    }

    /// Per-endpoint summary, sorted by endpoint label.
    pub fn report(&self) -> Vec<EndpointSummary> {
        let mut summaries: Vec<EndpointSummary> = self
            .endpoints
            .iter()
            .map(|entry| {
                let stats = entry.value();
                let quantile = |q: f64| {
                    if stats.histogram.is_empty() {
                        Duration::ZERO
                    } else {
                        Duration::from_micros(stats.histogram.value_at_quantile(q))
                    }
                };
                EndpointSummary {
                    endpoint: entry.key().clone(),
                    good: stats.good,
                    errors: stats.errors,
                    p50: quantile(0.50),
                    p90: quantile(0.90),
                    p99: quantile(0.99),
                    max: Duration::from_micros(stats.histogram.max()),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        summaries
    }

    /// Write the recorded data as JSON.
    pub fn dump(&self, path: &Path) -> Result<(), LatencyError> {
        let document = ResultsDocument {
            title: &self.title,
            started_us: self.started().map(unix_micros),
            stopped_us: self.stopped().map(unix_micros),
            calls: self.points(),
        };
        let contents = serde_json::to_vec(&document)?;
        std::fs::write(path, contents)?;
        info!(path = %path.display(), calls = document.calls.len(), "Wrote latency results");
        Ok(())
    }

    /// Print a summary of the recorded calls.
    pub fn print_summary(&self) {
        println!("\n--- Latency Report: {} ---", self.title);
        let report = self.report();
        if report.is_empty() {
            println!("No calls recorded.");
            return;
        }
        println!(
            "{:<40} {:>8} {:>8} {:>12} {:>12} {:>12}",
            "Endpoint", "Good", "Errors", "P50", "P90", "P99"
        );
        for s in report {
            println!(
                "{:<40} {:>8} {:>8} {:>12?} {:>12?} {:>12?}",
                s.endpoint, s.good, s.errors, s.p50, s.p90, s.p99
            );
        }
    }
}

/// Summary statistics for one endpoint.
#[derive(Clone, Debug)]
pub struct EndpointSummary {
    pub endpoint: String,
    pub good: u64,
    pub errors: u64,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub max: Duration,
}

#[derive(Serialize)]
struct ResultsDocument<'a> {
    title: &'a str,
    started_us: Option<u64>,
    stopped_us: Option<u64>,
    calls: Vec<CallPoint>,
}

fn unix_micros(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Errors writing latency results.
#[derive(Debug, thiserror::Error)]
pub enum LatencyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
