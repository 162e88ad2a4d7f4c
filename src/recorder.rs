use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use histogram::Histogram;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::dispatcher::StoreError;
use crate::sharded_histogram::{HistogramLimits, OutOfRange, ShardedHistogram};
use crate::workload::CategoryKey;

/// What happened to a single completion event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    Recorded,
    Excluded,
    OutOfRange,
    Uncategorized,
}

/// Live recording shards plus everything captured from them so far.
struct LatencyBucket {
    live: ShardedHistogram,
    captured: Mutex<Histogram>,
}

impl LatencyBucket {
    fn new(limits: HistogramLimits) -> Self {
        Self {
            live: ShardedHistogram::new(limits),
            captured: Mutex::new(limits.build()),
        }
    }

    fn record(&self, micros: u64) -> Result<(), OutOfRange> {
        self.live.record(micros)
    }

    // Folds the current interval into the captured histogram.
    fn capture(&self) -> MutexGuard<'_, Histogram> {
        let mut captured = self.captured.lock();
        self.live.drain_into(&mut captured);
        captured
    }
}

/// Aggregates completion events from any number of threads into
/// per-batch-size latency histograms.
pub struct LatencyRecorder {
    limits: HistogramLimits,
    created: Instant,

    expected: AtomicU64,
    completions: AtomicU64,
    excluded: AtomicU64,
    out_of_range: AtomicU64,
    uncategorized: AtomicU64,
    // Nanoseconds since `created`; zero until the first completion.
    last_update_nanos: AtomicU64,

    overall: LatencyBucket,
    categories: RwLock<HashMap<CategoryKey, Arc<LatencyBucket>>>,
}

impl LatencyRecorder {
    pub fn new(expected: u64, limits: HistogramLimits) -> Self {
        Self {
            limits,
            created: Instant::now(),
            expected: AtomicU64::new(expected),
            completions: AtomicU64::new(0),
            excluded: AtomicU64::new(0),
            out_of_range: AtomicU64::new(0),
            uncategorized: AtomicU64::new(0),
            last_update_nanos: AtomicU64::new(0),
            overall: LatencyBucket::new(limits),
            categories: RwLock::new(HashMap::new()),
        }
    }

    /// Accounts for one finished request.
    pub fn on_completion(
        &self,
        category: Option<CategoryKey>,
        latency: Duration,
        error: Option<&StoreError>,
    ) -> CompletionOutcome {
        let since_created = self.created.elapsed().as_nanos() as u64;
        self.last_update_nanos
            .fetch_max(since_created.max(1), Ordering::Relaxed);

        if let Some(err) = error {
            if err.kind.is_fast_path() {
                debug!(error = %err, "Excluding fast-path failure from statistics");
                self.excluded.fetch_add(1, Ordering::Relaxed);
                return CompletionOutcome::Excluded;
            }
            debug!(error = %err, "Request failed");
        }

        self.completions.fetch_add(1, Ordering::Relaxed);
        let micros = latency.as_micros() as u64;

        if let Err(OutOfRange { value, max_value }) = self.overall.record(micros) {
            warn!(
                latency_us = value,
                max_us = max_value,
                "Got request with latency exceeding the configured maximum trackable value"
            );
            self.out_of_range.fetch_add(1, Ordering::Relaxed);
            return CompletionOutcome::OutOfRange;
        }

        let category = match category {
            Some(category) => category,
            None => {
                warn!(latency_us = micros, "Dropping sample of a request without keys");
                self.uncategorized.fetch_add(1, Ordering::Relaxed);
                return CompletionOutcome::Uncategorized;
            }
        };

        // Already bounds-checked by the overall histogram, which shares the limits.
        let _ = self.bucket(category).record(micros);
        CompletionOutcome::Recorded
    }

    fn bucket(&self, category: CategoryKey) -> Arc<LatencyBucket> {
        if let Some(bucket) = self.categories.read().get(&category) {
            return bucket.clone();
        }
        let limits = self.limits;
        self.categories
            .write()
            .entry(category)
            .or_insert_with(|| Arc::new(LatencyBucket::new(limits)))
            .clone()
    }

    /// Latency in microseconds at percentile `p` (0 <= p < 100) over all
    /// categories, or `None` while the captured snapshot is empty or lags
    /// behind the number of recorded completions.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if !valid_percentile(p) {
            warn!(percentile = p, "Percentile must be in [0, 100)");
            return None;
        }
        let snapshot = self.overall.capture();
        let entries = snapshot.entries();
        if entries == 0 || entries < self.recorded_count() {
            debug!(
                entries,
                recorded = self.recorded_count(),
                "Latency snapshot is not complete yet"
            );
            return None;
        }
        snapshot.percentile(p).ok()
    }

    /// Latency at percentile `p` for one batch size, `None` if nothing was
    /// recorded for it.
    pub fn category_percentile(&self, category: CategoryKey, p: f64) -> Option<u64> {
        if !valid_percentile(p) {
            return None;
        }
        let bucket = self.categories.read().get(&category).cloned()?;
        let snapshot = bucket.capture();
        if snapshot.entries() == 0 {
            return None;
        }
        snapshot.percentile(p).ok()
    }

    pub fn all_category_percentiles(&self, p: f64) -> BTreeMap<CategoryKey, u64> {
        let categories: Vec<CategoryKey> = self.categories.read().keys().copied().collect();
        categories
            .into_iter()
            .filter_map(|category| {
                self.category_percentile(category, p)
                    .map(|latency| (category, latency))
            })
            .collect()
    }

    pub fn is_run_complete(&self) -> bool {
        self.completed_count() == self.expected_total()
    }

    /// Monotonic time of the most recent completion, if any arrived.
    pub fn last_update(&self) -> Option<Instant> {
        match self.last_update_nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(self.created + Duration::from_nanos(nanos)),
        }
    }

    pub fn expected_total(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }

    /// Lowers the target when the workload ran out before the planned count.
    pub fn set_expected_total(&self, expected: u64) {
        self.expected.store(expected, Ordering::Relaxed);
    }

    pub fn completed_count(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn excluded_count(&self) -> u64 {
        self.excluded.load(Ordering::Relaxed)
    }

    pub fn out_of_range_count(&self) -> u64 {
        self.out_of_range.load(Ordering::Relaxed)
    }

    pub fn uncategorized_count(&self) -> u64 {
        self.uncategorized.load(Ordering::Relaxed)
    }

    fn recorded_count(&self) -> u64 {
        self.completed_count()
            .saturating_sub(self.out_of_range_count())
    }
}

fn valid_percentile(p: f64) -> bool {
    (0.0..100.0).contains(&p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::StoreErrorKind;

    fn recorder(expected: u64) -> LatencyRecorder {
        LatencyRecorder::new(expected, HistogramLimits::new(1_000_000, 3).unwrap())
    }

    #[test]
    fn percentile_unavailable_before_samples() {
        let recorder = recorder(10);
        assert_eq!(recorder.percentile(50.0), None);
        assert_eq!(recorder.category_percentile(5, 50.0), None);
        assert!(recorder.last_update().is_none());
    }

    #[test]
    fn percentiles_after_snapshot() {
        let recorder = recorder(100);
        for i in 1..=100u64 {
            let outcome = recorder.on_completion(Some(5), Duration::from_micros(i * 10), None);
            assert_eq!(outcome, CompletionOutcome::Recorded);
        }
        assert!(recorder.is_run_complete());

        let median = recorder.percentile(50.0).unwrap();
        assert!((490..=510).contains(&median), "median was {}", median);
        // The snapshot is kept; a second query sees the same data.
        assert_eq!(recorder.percentile(50.0), Some(median));

        let by_category = recorder.all_category_percentiles(50.0);
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category[&5], recorder.category_percentile(5, 50.0).unwrap());
    }

    #[test]
    fn categories_are_kept_apart() {
        let recorder = recorder(4);
        recorder.on_completion(Some(1), Duration::from_micros(100), None);
        recorder.on_completion(Some(1), Duration::from_micros(100), None);
        recorder.on_completion(Some(8), Duration::from_micros(900), None);
        recorder.on_completion(Some(8), Duration::from_micros(900), None);

        let medians = recorder.all_category_percentiles(50.0);
        assert_eq!(medians.keys().copied().collect::<Vec<_>>(), vec![1, 8]);
        assert!(medians[&1] < medians[&8]);
    }

    #[test]
    fn fast_path_errors_are_excluded() {
        let recorder = recorder(1);
        let err = StoreError::new(StoreErrorKind::Overloaded, "busy");
        let outcome = recorder.on_completion(Some(3), Duration::from_micros(5), Some(&err));
        assert_eq!(outcome, CompletionOutcome::Excluded);
        assert_eq!(recorder.completed_count(), 0);
        assert_eq!(recorder.excluded_count(), 1);
        assert!(recorder.all_category_percentiles(50.0).is_empty());
        assert_eq!(recorder.percentile(50.0), None);
        assert!(recorder.last_update().is_some());
    }

    #[test]
    fn other_errors_are_recorded() {
        let recorder = recorder(1);
        let err = StoreError::new(StoreErrorKind::Other, "read timeout");
        let outcome = recorder.on_completion(Some(3), Duration::from_micros(5), Some(&err));
        assert_eq!(outcome, CompletionOutcome::Recorded);
        assert_eq!(recorder.completed_count(), 1);
    }

    #[test]
    fn out_of_range_latency_is_dropped() {
        let recorder = recorder(2);
        let outcome = recorder.on_completion(Some(2), Duration::from_secs(5), None);
        assert_eq!(outcome, CompletionOutcome::OutOfRange);
        assert_eq!(recorder.out_of_range_count(), 1);
        assert!(recorder.all_category_percentiles(50.0).is_empty());

        recorder.on_completion(Some(2), Duration::from_micros(10), None);
        assert!(recorder.percentile(50.0).is_some());
    }

    #[test]
    fn uncategorized_samples_only_reach_the_overall_histogram() {
        let recorder = recorder(1);
        let outcome = recorder.on_completion(None, Duration::from_micros(10), None);
        assert_eq!(outcome, CompletionOutcome::Uncategorized);
        assert_eq!(recorder.uncategorized_count(), 1);
        assert!(recorder.all_category_percentiles(50.0).is_empty());
        assert!(recorder.percentile(50.0).is_some());
    }

    #[test]
    fn completion_boundary() {
        let recorder = recorder(3);
        for _ in 0..2 {
            recorder.on_completion(Some(1), Duration::from_micros(1), None);
        }
        assert!(!recorder.is_run_complete());
        recorder.on_completion(Some(1), Duration::from_micros(1), None);
        assert!(recorder.is_run_complete());

        recorder.set_expected_total(4);
        assert!(!recorder.is_run_complete());
    }

    #[test]
    fn concurrent_completions() {
        let recorder = Arc::new(recorder(8_000));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        recorder.on_completion(Some(t % 3 + 1), Duration::from_micros(i), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(recorder.is_run_complete());
        assert!(recorder.percentile(99.0).is_some());
        assert_eq!(recorder.all_category_percentiles(50.0).len(), 3);
    }
}
