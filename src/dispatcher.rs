use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::recorder::LatencyRecorder;
use crate::workload::Request;

/// Coarse classification of a failed store operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    Unavailable,
    Overloaded,
    Bootstrapping,
    Unprepared,
    Validation,
    Other,
}

impl StoreErrorKind {
    /// Errors the coordinator answers without doing real work. These never
    /// reach the latency histograms.
    pub fn is_fast_path(self) -> bool {
        !matches!(self, StoreErrorKind::Other)
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreErrorKind::Unavailable => "unavailable",
            StoreErrorKind::Overloaded => "overloaded",
            StoreErrorKind::Bootstrapping => "bootstrapping",
            StoreErrorKind::Unprepared => "unprepared",
            StoreErrorKind::Validation => "validation",
            StoreErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind} error: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The data store the benchmark talks to.
///
/// Connection selection, encoding and retries (none) are the client's
/// business; each call resolves exactly once.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<(), StoreError>;
}

/// Fires requests at the store without waiting for them.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn StoreClient>,
    recorder: Arc<LatencyRecorder>,
    in_flight: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn StoreClient>, recorder: Arc<LatencyRecorder>) -> Self {
        Self {
            store,
            recorder,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns the request and returns immediately. The latency clock starts
    /// now, so time spent waiting for the runtime counts against the store.
    pub fn issue(&self, request: Request) -> JoinHandle<()> {
        let issued_at = Instant::now();
        let store = self.store.clone();
        let recorder = self.recorder.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let category = request.category();
            let result = store.execute(&request).await;
            in_flight.fetch_sub(1, Ordering::Relaxed);
            recorder.on_completion(category, issued_at.elapsed(), result.err().as_ref());
        })
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn recorder(&self) -> &Arc<LatencyRecorder> {
        &self.recorder
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::*;
    use parking_lot::Mutex;

    /// In-memory store answering every request after a fixed delay.
    pub struct FakeStore {
        pub delay: Duration,
        pub fail_with: Option<StoreErrorKind>,
        pub seen: Mutex<Vec<Request>>,
    }

    impl FakeStore {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_with: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(kind: StoreErrorKind) -> Self {
            Self {
                fail_with: Some(kind),
                ..Self::new(Duration::from_millis(0))
            }
        }
    }

    #[async_trait]
    impl StoreClient for FakeStore {
        async fn execute(&self, request: &Request) -> Result<(), StoreError> {
            if self.delay > Duration::from_millis(0) {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().push(request.clone());
            match self.fail_with {
                Some(kind) => Err(StoreError::new(kind, "injected")),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::testing::FakeStore;
    use super::*;
    use crate::sharded_histogram::HistogramLimits;

    fn recorder(expected: u64) -> Arc<LatencyRecorder> {
        let limits = HistogramLimits::new(250_000_000, 3).unwrap();
        Arc::new(LatencyRecorder::new(expected, limits))
    }

    fn request(keys: &[&str]) -> Request {
        let batch_size = keys.len();
        let keys: BTreeSet<String> = keys.iter().map(|k| k.to_string()).collect();
        Request::read(keys, batch_size, Arc::new(BTreeSet::new()))
    }

    #[test]
    fn only_other_errors_count_against_the_store() {
        assert!(StoreErrorKind::Overloaded.is_fast_path());
        assert!(StoreErrorKind::Unavailable.is_fast_path());
        assert!(StoreErrorKind::Validation.is_fast_path());
        assert!(!StoreErrorKind::Other.is_fast_path());
    }

    #[tokio::test]
    async fn issue_does_not_wait_for_completion() {
        let store = Arc::new(FakeStore::new(Duration::from_millis(50)));
        let recorder = recorder(1);
        let dispatcher = Dispatcher::new(store.clone(), recorder.clone());

        let handle = dispatcher.issue(request(&["user1", "user2"]));
        assert_eq!(dispatcher.in_flight(), 1);
        assert_eq!(recorder.completed_count(), 0);

        handle.await.unwrap();
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(recorder.completed_count(), 1);
        assert!(recorder.category_percentile(2, 50.0).unwrap() >= 50_000);
        assert_eq!(store.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn overloaded_completion_is_excluded() {
        let store = Arc::new(FakeStore::failing(StoreErrorKind::Overloaded));
        let recorder = recorder(1);
        let dispatcher = Dispatcher::new(store, recorder.clone());

        dispatcher.issue(request(&["user1"])).await.unwrap();
        assert_eq!(recorder.completed_count(), 0);
        assert_eq!(recorder.excluded_count(), 1);
        assert!(recorder.all_category_percentiles(50.0).is_empty());
    }
}
