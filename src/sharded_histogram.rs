use std::sync::Arc;

use anyhow::Result;
use histogram::Histogram;
use parking_lot::Mutex;
use thread_local::ThreadLocal;

/// Shape shared by every histogram of a run.
#[derive(Clone, Copy, Debug)]
pub struct HistogramLimits {
    max_value: u64,
    precision: u32,
}

impl HistogramLimits {
    pub fn new(max_value: u64, precision: u32) -> Result<Self> {
        let limits = Self {
            max_value,
            precision,
        };
        anyhow::ensure!(
            limits.try_build().is_some(),
            "Invalid histogram configuration: max value {}, precision {}",
            max_value,
            precision
        );
        Ok(limits)
    }

    fn try_build(&self) -> Option<Histogram> {
        Histogram::configure()
            .max_value(self.max_value)
            .precision(self.precision)
            .build()
    }

    pub fn build(&self) -> Histogram {
        self.try_build()
            .expect("histogram limits are validated on construction")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfRange {
    pub value: u64,
    pub max_value: u64,
}

/// A sharded histogram.
///
/// This structure is optimized for frequent writes and seldom reads.
/// For each program thread, it keeps a separate instance of the Histogram
/// structure. When the histogram is needed for reading, all shards are drained
/// into a caller-provided histogram.
///
/// Each shard is protected by a separate parking_lot::Mutex - assuming that
/// the structure is read unfrequently, they will be uncontended most of the time.
pub struct ShardedHistogram {
    shards: ThreadLocal<Arc<Mutex<Histogram>>>,
    all: Mutex<Vec<Arc<Mutex<Histogram>>>>,
    limits: HistogramLimits,
}

impl ShardedHistogram {
    pub fn new(limits: HistogramLimits) -> Self {
        Self {
            shards: ThreadLocal::new(),
            all: Mutex::new(Vec::new()),
            limits,
        }
    }

    /// Records `value` into the calling thread's shard.
    ///
    /// Values above the configured maximum are rejected instead of being
    /// clamped into the last bucket.
    pub fn record(&self, value: u64) -> Result<(), OutOfRange> {
        let out_of_range = OutOfRange {
            value,
            max_value: self.limits.max_value,
        };
        if value > self.limits.max_value {
            return Err(out_of_range);
        }

        let shard = self.shards.get_or(|| {
            let shard = Arc::new(Mutex::new(self.limits.build()));
            self.all.lock().push(shard.clone());
            shard
        });
        let result = shard.lock().increment(value);
        result.map_err(|_| out_of_range)
    }

    /// Moves everything recorded since the previous drain into `target` and
    /// resets the shards for the next interval.
    pub fn drain_into(&self, target: &mut Histogram) {
        for shard in self.all.lock().iter() {
            let mut shard = shard.lock();
            target.merge(&mut *shard);
            shard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HistogramLimits {
        HistogramLimits::new(1_000_000, 3).unwrap()
    }

    #[test]
    fn drains_shards_from_all_threads() {
        let hist = Arc::new(ShardedHistogram::new(limits()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hist = hist.clone();
                std::thread::spawn(move || {
                    for v in 1..=100 {
                        hist.record(v).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut combined = limits().build();
        hist.drain_into(&mut combined);
        assert_eq!(combined.entries(), 400);

        let mut next_interval = limits().build();
        hist.drain_into(&mut next_interval);
        assert_eq!(next_interval.entries(), 0);
    }

    #[test]
    fn rejects_values_above_maximum() {
        let hist = ShardedHistogram::new(limits());
        assert_eq!(
            hist.record(2_000_000),
            Err(OutOfRange {
                value: 2_000_000,
                max_value: 1_000_000
            })
        );
        let mut combined = limits().build();
        hist.drain_into(&mut combined);
        assert_eq!(combined.entries(), 0);
    }
}
