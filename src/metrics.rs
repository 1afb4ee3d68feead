//! Process-wide metrics with Prometheus text exposition.
//!
//! Counters, gauges, and histograms are plain atomics; labeled families live
//! in concurrent maps keyed by their label values. `/metrics` renders the
//! whole registry with `Metrics::render`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram over fixed upper bounds. Observations and bounds share one unit
/// (milliseconds for durations, kilobytes for memory).
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if (value as f64) <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    fn render_into(&self, out: &mut String, name: &str, labels: &str) {
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            out.push_str(&format!(
                "{name}_bucket{{{labels}le=\"{bound}\"}} {}\n",
                bucket.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "{name}_bucket{{{labels}le=\"+Inf\"}} {}\n",
            self.count()
        ));
        let plain = labels.trim_end_matches(',');
        if plain.is_empty() {
            out.push_str(&format!("{name}_sum {}\n", self.sum()));
            out.push_str(&format!("{name}_count {}\n", self.count()));
        } else {
            out.push_str(&format!("{name}_sum{{{plain}}} {}\n", self.sum()));
            out.push_str(&format!("{name}_count{{{plain}}} {}\n", self.count()));
        }
    }
}

/// Counter family keyed by label values.
#[derive(Debug)]
pub struct CounterVec {
    label_names: &'static [&'static str],
    children: DashMap<Vec<String>, Counter>,
}

impl CounterVec {
    pub fn new(label_names: &'static [&'static str]) -> Self {
        Self {
            label_names,
            children: DashMap::new(),
        }
    }

    pub fn inc(&self, values: &[&str]) {
        debug_assert_eq!(values.len(), self.label_names.len());
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.children.entry(key).or_default().inc();
    }

    pub fn get(&self, values: &[&str]) -> u64 {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.children.get(&key).map(|c| c.get()).unwrap_or(0)
    }
}

/// Histogram family keyed by label values.
#[derive(Debug)]
pub struct HistogramVec {
    label_names: &'static [&'static str],
    bounds: &'static [f64],
    children: DashMap<Vec<String>, Histogram>,
}

impl HistogramVec {
    pub fn new(label_names: &'static [&'static str], bounds: &'static [f64]) -> Self {
        Self {
            label_names,
            bounds,
            children: DashMap::new(),
        }
    }

    pub fn observe(&self, values: &[&str], value: u64) {
        debug_assert_eq!(values.len(), self.label_names.len());
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.children
            .entry(key)
            .or_insert_with(|| Histogram::new(self.bounds))
            .observe(value);
    }

    pub fn count(&self, values: &[&str]) -> u64 {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.children.get(&key).map(|h| h.count()).unwrap_or(0)
    }
}

const DURATION_BOUNDS_MS: &[f64] = &[50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];
const MEMORY_BOUNDS_KB: &[f64] = &[1024.0, 4096.0, 16384.0, 65536.0, 131072.0, 262144.0];
const CREATION_BOUNDS_MS: &[f64] = &[50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0];

/// All metrics the service exposes.
#[derive(Debug)]
pub struct Metrics {
    /// Executions by language and status
    pub executions_total: CounterVec,
    /// Execution duration in ms by language and phase
    pub execution_duration_ms: HistogramVec,
    /// Jobs currently queued
    pub queue_depth: Gauge,
    /// Workers currently processing a job
    pub active_workers: Gauge,
    /// Peak memory per execution in KB by language
    pub memory_usage_kb: HistogramVec,
    /// Time to create and start a container in ms
    pub container_creation_ms: Histogram,
    /// Requests rejected by the rate limiter
    pub rate_limit_hits: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            executions_total: CounterVec::new(&["language", "status"]),
            execution_duration_ms: HistogramVec::new(&["language", "phase"], DURATION_BOUNDS_MS),
            queue_depth: Gauge::new(),
            active_workers: Gauge::new(),
            memory_usage_kb: HistogramVec::new(&["language"], MEMORY_BOUNDS_KB),
            container_creation_ms: Histogram::new(CREATION_BOUNDS_MS),
            rate_limit_hits: Counter::new(),
        }
    }

    /// Prometheus text exposition of the whole registry.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP crucible_executions_total Total number of code executions\n");
        out.push_str("# TYPE crucible_executions_total counter\n");
        for entry in self.executions_total.children.iter() {
            out.push_str(&format!(
                "crucible_executions_total{{{}}} {}\n",
                label_pairs(self.executions_total.label_names, entry.key()),
                entry.value().get()
            ));
        }

        out.push_str("# HELP crucible_execution_duration_ms Execution duration in milliseconds\n");
        out.push_str("# TYPE crucible_execution_duration_ms histogram\n");
        for entry in self.execution_duration_ms.children.iter() {
            let labels = format!(
                "{},",
                label_pairs(self.execution_duration_ms.label_names, entry.key())
            );
            entry
                .value()
                .render_into(&mut out, "crucible_execution_duration_ms", &labels);
        }

        out.push_str("# HELP crucible_queue_depth Current number of jobs in the queue\n");
        out.push_str("# TYPE crucible_queue_depth gauge\n");
        out.push_str(&format!("crucible_queue_depth {}\n", self.queue_depth.get()));

        out.push_str("# HELP crucible_active_workers Number of workers currently processing jobs\n");
        out.push_str("# TYPE crucible_active_workers gauge\n");
        out.push_str(&format!(
            "crucible_active_workers {}\n",
            self.active_workers.get()
        ));

        out.push_str("# HELP crucible_memory_usage_kb Peak memory usage per execution in KB\n");
        out.push_str("# TYPE crucible_memory_usage_kb histogram\n");
        for entry in self.memory_usage_kb.children.iter() {
            let labels = format!(
                "{},",
                label_pairs(self.memory_usage_kb.label_names, entry.key())
            );
            entry
                .value()
                .render_into(&mut out, "crucible_memory_usage_kb", &labels);
        }

        out.push_str("# HELP crucible_container_creation_ms Time to create and start a container\n");
        out.push_str("# TYPE crucible_container_creation_ms histogram\n");
        self.container_creation_ms
            .render_into(&mut out, "crucible_container_creation_ms", "");

        out.push_str("# HELP crucible_rate_limit_hits_total Requests rejected by the rate limiter\n");
        out.push_str("# TYPE crucible_rate_limit_hits_total counter\n");
        out.push_str(&format!(
            "crucible_rate_limit_hits_total {}\n",
            self.rate_limit_hits.get()
        ));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn label_pairs(names: &[&str], values: &[String]) -> String {
    names
        .iter()
        .zip(values)
        .map(|(n, v)| format!("{n}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Global metrics registry.
pub fn global() -> &'static Metrics {
    &METRICS
}
