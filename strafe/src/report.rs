use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

use crate::{
    error::Result,
    macros::summary,
    metric::{Metric, Tags},
    stat::Stat,
};

/// Serializable snapshot produced for a reporter or a caller.
pub trait Summary
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
}

/// Sink for everything a job measures.
///
/// One reporter is shared by every VM of a job, so implementations are called
/// concurrently from VM threads and from async worker tasks.
pub trait Reporter: Send + Sync {
    /// Registers long-lived metrics. Called once per metric, when it is first
    /// created.
    fn collect(&self, metrics: &[Arc<Metric>]);
    /// Accepts discrete measurements.
    fn report(&self, stats: Vec<Stat>);
    /// Flushes whatever the reporter buffered. Called once, at job end.
    fn finish(&self) -> Result<()>;
}

#[summary]
pub struct CounterSummary {
    pub name: String,
    pub tags: Tags,
    pub count: i64,
}

#[summary]
pub struct GaugeSummary {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub p9999: f64,
}

#[summary]
pub struct RateSummary {
    pub name: String,
    pub tags: Tags,
    pub rate: f64,
    pub total: u64,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter(CounterSummary),
    Gauge {
        name: String,
        tags: Tags,
        summary: Option<GaugeSummary>,
    },
    Rate(RateSummary),
}

impl Summary for MetricSummary {}

impl MetricSummary {
    pub fn name(&self) -> &str {
        match self {
            MetricSummary::Counter(c) => &c.name,
            MetricSummary::Gauge { name, .. } => name,
            MetricSummary::Rate(r) => &r.name,
        }
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{
        io::{self, Write},
        sync::atomic::{AtomicBool, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;

    /// Discards everything.
    pub struct NoopReporter;

    impl Reporter for NoopReporter {
        fn collect(&self, _metrics: &[Arc<Metric>]) {}
        fn report(&self, _stats: Vec<Stat>) {}
        fn finish(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Keeps every stat and metric in memory.
    #[derive(Default)]
    pub struct MemoryReporter {
        stats: Mutex<Vec<Stat>>,
        metrics: Mutex<Vec<Arc<Metric>>>,
        finished: AtomicBool,
    }

    impl MemoryReporter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn stats(&self) -> Vec<Stat> {
            self.stats.lock().clone()
        }

        pub fn stats_named(&self, name: &str) -> Vec<Stat> {
            self.stats
                .lock()
                .iter()
                .filter(|s| s.name == name)
                .cloned()
                .collect()
        }

        pub fn metric(&self, name: &str) -> Option<Arc<Metric>> {
            self.metrics.lock().iter().find(|m| m.name() == name).cloned()
        }

        pub fn summaries(&self) -> Vec<MetricSummary> {
            self.metrics.lock().iter().map(|m| m.summary()).collect()
        }

        pub fn is_finished(&self) -> bool {
            self.finished.load(Ordering::Acquire)
        }
    }

    impl Reporter for MemoryReporter {
        fn collect(&self, metrics: &[Arc<Metric>]) {
            self.metrics.lock().extend(metrics.iter().cloned());
        }

        fn report(&self, stats: Vec<Stat>) {
            self.stats.lock().extend(stats);
        }

        fn finish(&self) -> Result<()> {
            self.finished.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Writes stats as line protocol as they arrive and a metrics table at the
    /// end of the run.
    pub struct ConsoleReporter {
        out: Mutex<Box<dyn Write + Send>>,
        metrics: Mutex<Vec<Arc<Metric>>>,
        quiet: bool,
    }

    impl Default for ConsoleReporter {
        fn default() -> Self {
            Self::new(io::stdout())
        }
    }

    impl ConsoleReporter {
        pub fn new(out: impl Write + Send + 'static) -> Self {
            Self {
                out: Mutex::new(Box::new(out)),
                metrics: Mutex::new(Vec::new()),
                quiet: false,
            }
        }

        /// Only the final table is printed.
        pub fn quiet(mut self) -> Self {
            self.quiet = true;
            self
        }

        fn table(&self) -> String {
            let mut rows: Vec<[String; 4]> = self
                .metrics
                .lock()
                .iter()
                .map(|m| {
                    let tags = m
                        .tags()
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(",");
                    [m.name().to_string(), m.kind().to_string(), tags, value(m)]
                })
                .collect();
            rows.sort();

            let header = [
                "NAME".to_string(),
                "KIND".to_string(),
                "TAGS".to_string(),
                "VALUE".to_string(),
            ];
            let mut widths = header.each_ref().map(|h| h.len());
            for row in &rows {
                for (w, cell) in widths.iter_mut().zip(row) {
                    *w = (*w).max(cell.len());
                }
            }

            let mut out = String::new();
            for row in std::iter::once(&header).chain(rows.iter()) {
                let cells: Vec<String> = row
                    .iter()
                    .zip(widths)
                    .map(|(cell, w)| format!("{cell:<w$}"))
                    .collect();
                out.push_str(cells.join("  ").trim_end());
                out.push('\n');
            }
            out
        }
    }

    fn value(metric: &Metric) -> String {
        match metric.summary() {
            MetricSummary::Counter(c) => c.count.to_string(),
            MetricSummary::Rate(r) => format!("{:.2}% of {}", r.rate * 100.0, r.total),
            MetricSummary::Gauge { summary: None, .. } => "-".to_string(),
            MetricSummary::Gauge {
                summary: Some(s), ..
            } => format!(
                "count={} mean={:.2} min={:.2} med={:.2} max={:.2} p90={:.2} p95={:.2} p99={:.2}",
                s.count, s.mean, s.min, s.median, s.max, s.p90, s.p95, s.p99
            ),
        }
    }

    impl Reporter for ConsoleReporter {
        fn collect(&self, metrics: &[Arc<Metric>]) {
            self.metrics.lock().extend(metrics.iter().cloned());
        }

        fn report(&self, stats: Vec<Stat>) {
            if self.quiet {
                return;
            }
            let mut out = self.out.lock();
            for stat in stats {
                if let Err(e) = writeln!(out, "{}", stat.to_line()) {
                    tracing::warn!("Dropping stat {}: {e}", stat.name);
                }
            }
        }

        fn finish(&self) -> Result<()> {
            let table = self.table();
            let mut out = self.out.lock();
            out.write_all(table.as_bytes())
                .and_then(|_| out.flush())
                .map_err(|e| Error::Reporter(e.to_string()))
        }
    }
}
