//! Reports and rendering sinks
//!
//! A [`Report`] is what the rendering layer receives on every tick: five
//! scalar KPIs, the scalar statistics, a histogram over the reservoir and
//! the per-worker ranking. Sinks only receive; nothing flows back.

use super::stats::{Histogram, Statistics, WorkerCount};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use tracing::info;

/// Result of a best-effort queue depth query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDepth {
    Available(usize),
    Unavailable,
}

impl QueueDepth {
    pub fn value(&self) -> Option<usize> {
        match self {
            QueueDepth::Available(depth) => Some(*depth),
            QueueDepth::Unavailable => None,
        }
    }
}

impl fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDepth::Available(depth) => write!(f, "{}", depth),
            QueueDepth::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// The five headline indicators
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Kpis {
    pub pending_scenarios: QueueDepth,
    pub queued_results: QueueDepth,
    pub total_processed: u64,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
}

/// One report tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub kpis: Kpis,
    pub statistics: Statistics,
    pub histogram: Histogram,
    pub workers: Vec<WorkerCount>,
}

/// Receives a report on every tick
pub trait ReportSink: Send + Sync {
    fn deliver(&self, report: &Report);
}

/// One structured log line per report
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn deliver(&self, report: &Report) {
        let kpis = &report.kpis;
        info!(
            pending = %kpis.pending_scenarios,
            queued_results = %kpis.queued_results,
            processed = kpis.total_processed,
            mean = kpis.mean,
            std_dev = kpis.std_dev,
            p5 = report.statistics.p5,
            p95 = report.statistics.p95,
            workers = report.workers.len(),
            "Aggregate report"
        );
    }
}

/// Plain-text dashboard written to stdout
#[derive(Debug, Clone, Copy)]
pub struct ConsoleDashboard {
    top_workers: usize,
    clear_screen: bool,
}

impl ConsoleDashboard {
    pub fn new(top_workers: usize) -> Self {
        Self {
            top_workers,
            clear_screen: true,
        }
    }

    /// Keep previous frames on screen instead of redrawing in place.
    pub fn scrolling(mut self) -> Self {
        self.clear_screen = false;
        self
    }

    pub fn render(&self, report: &Report) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = self.render_into(&mut out, report);
        out
    }

    fn render_into(&self, out: &mut String, report: &Report) -> fmt::Result {
        let kpis = &report.kpis;
        let stats = &report.statistics;

        writeln!(out, "--- Monte Carlo Simulation (live) ---")?;
        writeln!(out)?;
        writeln!(out, "--- Queues ---")?;
        writeln!(out, "Pending scenarios : {}", kpis.pending_scenarios)?;
        writeln!(
            out,
            "Queued results    : {} (total processed: {})",
            kpis.queued_results, kpis.total_processed
        )?;

        writeln!(out)?;
        writeln!(out, "--- Results ---")?;
        match (stats.mean, stats.std_dev) {
            (Some(mean), Some(std_dev)) => {
                writeln!(out, "  Mean          : {:.4}", mean)?;
                writeln!(out, "  Std. Dev      : {:.4}", std_dev)?;
                if let (Some(p5), Some(p95)) = (stats.p5, stats.p95) {
                    writeln!(out, "  Percentile 5  : {:.4}", p5)?;
                    writeln!(out, "  Percentile 95 : {:.4}", p95)?;
                }
            }
            _ => writeln!(out, "  (waiting for first results...)")?,
        }

        writeln!(out)?;
        writeln!(out, "--- Workers ---")?;
        if report.workers.is_empty() {
            writeln!(out, "  (waiting for activity...)")?;
        }
        for worker in report.workers.iter().take(self.top_workers) {
            writeln!(out, "  {}: {} tasks", worker.worker, worker.count)?;
        }
        Ok(())
    }
}

impl ReportSink for ConsoleDashboard {
    fn deliver(&self, report: &Report) {
        let frame = self.render(report);
        let mut stdout = std::io::stdout().lock();
        if self.clear_screen {
            let _ = write!(stdout, "\x1B[2J\x1B[H");
        }
        let _ = stdout.write_all(frame.as_bytes());
        let _ = stdout.flush();
    }
}
