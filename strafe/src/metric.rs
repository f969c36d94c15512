//! Long-lived aggregates fed by many concurrent `add` calls.
//!
//! A [`Metric`] is created once per name (through [`Global::unique`]) and then
//! shared by every VM of a job. Writers come from VM threads as well as from
//! async worker tasks, so each kind guards its state internally.
//!
//! Derived statistics are never maintained incrementally. A [`Gauge`] keeps its
//! raw samples and [`Gauge::summary`] computes mean, median and percentiles when
//! a reporter asks for them.
//!
//! [`Global::unique`]: crate::context::Global::unique
use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::report::{CounterSummary, GaugeSummary, MetricSummary, RateSummary};

pub type Tags = BTreeMap<String, String>;

/// Percentiles reported for every gauge.
pub const PERCENTILES: [f64; 7] = [50.0, 75.0, 90.0, 95.0, 99.0, 99.9, 99.99];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => f.write_str("COUNTER"),
            MetricKind::Gauge => f.write_str("GAUGE"),
            MetricKind::Rate => f.write_str("RATE"),
        }
    }
}

/// Monotonic sum.
#[derive(Debug, Default)]
pub struct Counter {
    sum: AtomicI64,
}

impl Counter {
    pub fn add(&self, v: i64) {
        self.sum.fetch_add(v, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/// Distribution of raw samples.
#[derive(Debug, Default)]
pub struct Gauge {
    samples: Mutex<Vec<f64>>,
}

impl Gauge {
    pub fn add(&self, v: f64) {
        self.samples.lock().push(v);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computes the derived statistics over every sample seen so far.
    ///
    /// Returns `None` for a gauge that never received a sample.
    pub fn summary(&self) -> Option<GaugeSummary> {
        let mut sorted = self.samples.lock().clone();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let percentiles = PERCENTILES.map(|p| percentile(&sorted, p));

        Some(GaugeSummary {
            count,
            sum,
            mean: sum / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            median: median(&sorted),
            p50: percentiles[0],
            p75: percentiles[1],
            p90: percentiles[2],
            p95: percentiles[3],
            p99: percentiles[4],
            p999: percentiles[5],
            p9999: percentiles[6],
        })
    }
}

/// Fraction of true samples.
#[derive(Debug, Default)]
pub struct Rate {
    truthy: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    pub fn add(&self, v: bool) {
        if v {
            self.truthy.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// `true` samples over all samples; `0.0` before the first sample.
    pub fn value(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.truthy.load(Ordering::Relaxed) as f64 / total as f64
    }
}

#[derive(Debug)]
enum Aggregate {
    Counter(Counter),
    Gauge(Gauge),
    Rate(Rate),
}

/// A named, tagged aggregate.
#[derive(Debug)]
pub struct Metric {
    name: String,
    tags: Tags,
    aggregate: Aggregate,
}

impl Metric {
    pub fn counter(name: impl Into<String>, tags: Tags) -> Self {
        Self::new(name, tags, Aggregate::Counter(Counter::default()))
    }

    pub fn gauge(name: impl Into<String>, tags: Tags) -> Self {
        Self::new(name, tags, Aggregate::Gauge(Gauge::default()))
    }

    pub fn rate(name: impl Into<String>, tags: Tags) -> Self {
        Self::new(name, tags, Aggregate::Rate(Rate::default()))
    }

    pub fn of_kind(kind: MetricKind, name: impl Into<String>, tags: Tags) -> Self {
        match kind {
            MetricKind::Counter => Self::counter(name, tags),
            MetricKind::Gauge => Self::gauge(name, tags),
            MetricKind::Rate => Self::rate(name, tags),
        }
    }

    fn new(name: impl Into<String>, tags: Tags, aggregate: Aggregate) -> Self {
        Self {
            name: name.into(),
            tags,
            aggregate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn kind(&self) -> MetricKind {
        match self.aggregate {
            Aggregate::Counter(_) => MetricKind::Counter,
            Aggregate::Gauge(_) => MetricKind::Gauge,
            Aggregate::Rate(_) => MetricKind::Rate,
        }
    }

    /// Feeds one sample. Counters truncate to an integer, rates treat exactly
    /// `1.0` as true.
    pub fn add(&self, v: f64) {
        match &self.aggregate {
            Aggregate::Counter(c) => c.add(v as i64),
            Aggregate::Gauge(g) => g.add(v),
            Aggregate::Rate(r) => r.add(v == 1.0),
        }
    }

    pub fn as_counter(&self) -> Option<&Counter> {
        match &self.aggregate {
            Aggregate::Counter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_gauge(&self) -> Option<&Gauge> {
        match &self.aggregate {
            Aggregate::Gauge(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_rate(&self) -> Option<&Rate> {
        match &self.aggregate {
            Aggregate::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn summary(&self) -> MetricSummary {
        match &self.aggregate {
            Aggregate::Counter(c) => MetricSummary::Counter(CounterSummary {
                name: self.name.clone(),
                tags: self.tags.clone(),
                count: c.value(),
            }),
            Aggregate::Gauge(g) => MetricSummary::Gauge {
                name: self.name.clone(),
                tags: self.tags.clone(),
                summary: g.summary(),
            },
            Aggregate::Rate(r) => MetricSummary::Rate(RateSummary {
                name: self.name.clone(),
                tags: self.tags.clone(),
                rate: r.value(),
                total: r.total(),
            }),
        }
    }
}

/// Nearest-rank percentile over sorted, non-empty samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn gauge_summary_over_five_samples() {
        let gauge = Gauge::default();
        for v in [1., 2., 3., 4., 5.] {
            gauge.add(v);
        }
        let s = gauge.summary().unwrap();
        assert_eq!(s.count, 5);
        assert_eq!(s.mean, 3.);
        assert_eq!(s.min, 1.);
        assert_eq!(s.max, 5.);
        assert_eq!(s.median, 3.);
        assert_eq!(s.sum, 15.);
        assert_eq!(s.p50, 3.);
        assert_eq!(s.p99, 5.);
    }

    #[test]
    fn gauge_summary_ignores_insertion_order() {
        let gauge = Gauge::default();
        for v in [4., 1., 3., 2.] {
            gauge.add(v);
        }
        let s = gauge.summary().unwrap();
        assert_eq!(s.median, 2.5);
        assert_eq!(s.min, 1.);
        assert_eq!(s.p75, 3.);
    }

    #[test]
    fn empty_gauge_has_no_summary() {
        assert!(Gauge::default().summary().is_none());
    }

    #[test]
    fn rate_value() {
        let rate = Rate::default();
        for v in [true, true, false, true] {
            rate.add(v);
        }
        assert_eq!(rate.value(), 0.75);
        assert_eq!(Rate::default().value(), 0.);
    }

    #[test]
    fn metric_add_dispatches_by_kind() {
        let rate = Metric::rate("ok", Tags::new());
        rate.add(1.);
        rate.add(0.);
        assert_eq!(rate.as_rate().unwrap().value(), 0.5);

        let counter = Metric::counter("hits", Tags::new());
        counter.add(2.9);
        counter.add(1.);
        assert_eq!(counter.as_counter().unwrap().value(), 3);
        assert_eq!(counter.kind(), MetricKind::Counter);
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let counter = Arc::new(Metric::counter("c", Tags::new()));
        let gauge = Arc::new(Metric::gauge("g", Tags::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                let gauge = gauge.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        counter.add(1.);
                        gauge.add(i as f64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.as_counter().unwrap().value(), 8000);
        assert_eq!(gauge.as_gauge().unwrap().len(), 8000);
    }
}
