//! Exam statistics aggregation.
//!
//! The aggregator keeps one running fold per exam — an incremental sum for
//! the average plus a maintained sorted percentage vector for median and
//! top — and is at all times equal to a full recompute over the store. Each
//! change notification or hydration pass pushes a fresh snapshot to the
//! registered sinks; a failed store read republishes the last known-good
//! snapshot flagged stale instead of failing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::scoring::ScoredResult;
use crate::store::{ResultListener, ResultStore};

/// Derived statistics over one exam's scored sheets.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExamStatistics {
    pub exam_id: String,
    pub sheet_count: usize,
    pub average_percent: f64,
    pub median_percent: f64,
    pub top_percent: f64,
}

impl ExamStatistics {
    /// The explicit empty-exam statistics: all zeros.
    pub fn zero(exam_id: &str) -> Self {
        Self {
            exam_id: exam_id.to_string(),
            sheet_count: 0,
            average_percent: 0.0,
            median_percent: 0.0,
            top_percent: 0.0,
        }
    }
}

/// Full recompute from a result collection. The aggregator's incremental
/// state must always agree with this.
pub fn compute(exam_id: &str, results: &[ScoredResult]) -> ExamStatistics {
    let mut agg = ExamAgg::default();
    for result in results {
        agg.insert(result.percentage);
    }
    agg.statistics(exam_id)
}

/// One published statistics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsUpdate {
    pub stats: ExamStatistics,
    /// True only before the first emission for this exam.
    pub loading: bool,
    /// True when the store could not be read and `stats` is the last
    /// known-good snapshot.
    pub stale: bool,
}

/// Presentation-side consumer of statistics snapshots.
pub trait StatisticsSink: Send + Sync {
    fn publish(&self, update: &StatisticsUpdate);
}

#[derive(Debug, Default)]
struct ExamAgg {
    sum: f64,
    /// Percentages in ascending order.
    sorted: Vec<f64>,
    published: bool,
    stale: bool,
}

impl ExamAgg {
    fn insert(&mut self, percentage: f64) {
        self.sum += percentage;
        let idx = self.sorted.partition_point(|&v| v <= percentage);
        self.sorted.insert(idx, percentage);
    }

    fn statistics(&self, exam_id: &str) -> ExamStatistics {
        let n = self.sorted.len();
        if n == 0 {
            return ExamStatistics::zero(exam_id);
        }
        let median_percent = if n % 2 == 1 {
            self.sorted[n / 2]
        } else {
            0.5 * (self.sorted[n / 2 - 1] + self.sorted[n / 2])
        };
        ExamStatistics {
            exam_id: exam_id.to_string(),
            sheet_count: n,
            average_percent: self.sum / n as f64,
            median_percent,
            top_percent: self.sorted[n - 1],
        }
    }
}

/// Live exam statistics over a result store.
///
/// Attach it to a store to receive change notifications; call [`watch`] to
/// bulk-hydrate an exam from what is already persisted. Concurrent writers
/// are fine: the fold is mutex-serialized, so every published snapshot
/// reflects a consistent prefix of the append stream.
///
/// [`watch`]: StatisticsAggregator::watch
pub struct StatisticsAggregator {
    store: Arc<dyn ResultStore>,
    exams: Mutex<HashMap<String, ExamAgg>>,
    sinks: Mutex<Vec<Arc<dyn StatisticsSink>>>,
}

impl StatisticsAggregator {
    /// Create an aggregator subscribed to the store's change feed.
    pub fn attach(store: Arc<dyn ResultStore>) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            store: store.clone(),
            exams: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
        });
        store.subscribe(aggregator.clone());
        aggregator
    }

    /// Register a snapshot consumer.
    pub fn add_sink(&self, sink: Arc<dyn StatisticsSink>) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.push(sink);
    }

    /// Bulk-hydrate one exam from the store and publish.
    ///
    /// On a store read failure the previous fold is kept and republished
    /// with `stale = true`; statistics never fail on an empty collection.
    pub fn watch(&self, exam_id: &str) -> StatisticsUpdate {
        let update = {
            let mut exams = self.exams.lock().unwrap_or_else(|e| e.into_inner());
            let agg = exams.entry(exam_id.to_string()).or_default();
            match self.store.read_all_for_exam(exam_id) {
                Ok(results) => {
                    let mut fresh = ExamAgg::default();
                    for result in &results {
                        fresh.insert(result.percentage);
                    }
                    fresh.published = true;
                    *agg = fresh;
                }
                Err(err) => {
                    tracing::warn!(exam_id, error = %err, "hydration failed; keeping last snapshot");
                    agg.stale = true;
                    agg.published = true;
                }
            }
            StatisticsUpdate {
                stats: agg.statistics(exam_id),
                loading: false,
                stale: agg.stale,
            }
        };
        self.publish(&update);
        update
    }

    /// Current snapshot without touching the store. `loading` is true only
    /// for exams that have never been hydrated or folded.
    pub fn current(&self, exam_id: &str) -> StatisticsUpdate {
        let exams = self.exams.lock().unwrap_or_else(|e| e.into_inner());
        match exams.get(exam_id) {
            Some(agg) => StatisticsUpdate {
                stats: agg.statistics(exam_id),
                loading: !agg.published,
                stale: agg.stale,
            },
            None => StatisticsUpdate {
                stats: ExamStatistics::zero(exam_id),
                loading: true,
                stale: false,
            },
        }
    }

    fn publish(&self, update: &StatisticsUpdate) {
        let sinks = {
            let guard = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for sink in sinks {
            sink.publish(update);
        }
    }
}

impl ResultListener for StatisticsAggregator {
    fn result_appended(&self, result: &ScoredResult) {
        let update = {
            let mut exams = self.exams.lock().unwrap_or_else(|e| e.into_inner());
            let agg = exams.entry(result.exam_id.clone()).or_default();
            agg.insert(result.percentage);
            agg.published = true;
            StatisticsUpdate {
                stats: agg.statistics(&result.exam_id),
                loading: false,
                stale: agg.stale,
            }
        };
        self.publish(&update);
    }
}
