use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::configuration::BenchDescription;
use crate::dispatcher::{Dispatcher, StoreClient};
use crate::pacer::Pacer;
use crate::recorder::LatencyRecorder;
use crate::sharded_histogram::HistogramLimits;
use crate::workload::{self, CategoryKey, Workload};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const HISTOGRAM_PRECISION: u32 = 3;
const ARRIVAL_SEED_OFFSET: u64 = 3;
const CATEGORY_PERCENTILE: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Configuring,
    Connecting,
    Issuing,
    Draining,
    Reporting,
    Done,
}

/// Everything the report needs once a run is over.
#[derive(Debug)]
pub struct RunSummary {
    pub label: &'static str,
    pub expected: u64,
    pub issued: u64,
    pub completed: u64,
    pub excluded: u64,
    pub out_of_range: u64,
    pub uncategorized: u64,
    /// Whether every expected completion arrived before the drain gave up.
    pub complete: bool,

    pub issue_duration: Duration,
    pub total_duration: Duration,
    /// Completions per second between the start of issuing and the last
    /// completion.
    pub throughput: Option<f64>,
    /// Requests offered per second while issuing.
    pub sending_rate: Option<f64>,

    /// `None` marks a percentile that could not be computed.
    pub percentiles: Vec<(f64, Option<u64>)>,
    /// Median latency per batch size.
    pub category_medians: BTreeMap<CategoryKey, u64>,
}

impl RunSummary {
    /// Requests that never produced a counted completion, `None` on a
    /// complete run.
    pub fn failure_count(&self) -> Option<u64> {
        if self.complete {
            None
        } else {
            Some(self.expected.saturating_sub(self.completed))
        }
    }
}

/// Drives one benchmark from configuration to summary.
pub struct RunController {
    desc: Arc<BenchDescription>,
    phase: RunPhase,
    workload: Box<dyn Workload>,
}

impl RunController {
    /// Builds the workload up front so that a bad source (an unreadable
    /// trace, an invalid distribution) fails before any connection is made.
    pub fn new(desc: Arc<BenchDescription>) -> Result<Self> {
        let workload = workload::from_description(&desc)?;
        Ok(Self {
            desc,
            phase: RunPhase::Configuring,
            workload,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Moves the run forward; phases are never revisited.
    pub fn enter(&mut self, next: RunPhase) {
        debug_assert!(next > self.phase, "{:?} -> {:?}", self.phase, next);
        debug!(from = ?self.phase, to = ?next, "Run phase change");
        self.phase = next;
    }

    /// Issues the workload against `store`, waits for the stragglers and
    /// summarizes the result. Leaves the controller in `Reporting`.
    pub async fn run(&mut self, store: Arc<dyn StoreClient>) -> Result<RunSummary> {
        let desc = self.desc.clone();
        let limits = HistogramLimits::new(desc.max_latency_micros, HISTOGRAM_PRECISION)?;
        let recorder = Arc::new(LatencyRecorder::new(desc.planned_operations(), limits));
        let dispatcher = Dispatcher::new(store, recorder.clone());
        let mut pacer = Pacer::new(
            desc.pacing,
            desc.arrival_distribution().build()?,
            desc.seed.wrapping_add(ARRIVAL_SEED_OFFSET),
        );

        let issued = Arc::new(AtomicU64::new(0));
        // Dropping the handle at the end of the run stops the reporter.
        let _reporter_handle = if desc.debug {
            let reporter = ProgressReporter::new(dispatcher.clone(), issued.clone());
            let (reporter, handle) = reporter.run().remote_handle();
            tokio::spawn(reporter);
            Some(handle)
        } else {
            None
        };

        self.enter(RunPhase::Issuing);
        info!(
            mode = desc.report_label(),
            experiment = ?desc.experiment,
            utilization_pct = desc.utilization,
            operations = desc.planned_operations(),
            interarrival_us = desc.interarrival.as_micros() as u64,
            pacing = ?pacer.mode(),
            "Issuing requests"
        );

        let issue_start = Instant::now();
        for _ in 0..desc.planned_operations() {
            let iteration_start = Instant::now();
            let request = match self.workload.next_request()? {
                Some(request) => request,
                None => {
                    let count = issued.load(Ordering::Relaxed);
                    warn!(issued = count, "Workload ran out before the planned operation count");
                    recorder.set_expected_total(count);
                    break;
                }
            };
            let _ = dispatcher.issue(request);
            issued.fetch_add(1, Ordering::Relaxed);
            pacer.pace(iteration_start.elapsed()).await;
        }
        let issue_duration = issue_start.elapsed();
        let issued_count = issued.load(Ordering::Relaxed);
        info!(
            issued = issued_count,
            seconds = issue_duration.as_secs_f64(),
            "Completed issuing"
        );

        self.enter(RunPhase::Draining);
        let complete = drain(&recorder, desc.drain_poll_interval, desc.drain_idle_timeout).await;

        self.enter(RunPhase::Reporting);
        let percentiles = desc
            .report_percentiles()
            .iter()
            .map(|&p| (p, recorder.percentile(p)))
            .collect();

        let throughput = recorder.last_update().and_then(|last| {
            let elapsed = last.checked_duration_since(issue_start)?.as_secs_f64();
            if elapsed > 0.0 {
                Some(recorder.completed_count() as f64 / elapsed)
            } else {
                None
            }
        });
        let sending_rate = if issue_duration > Duration::from_secs(0) {
            Some(issued_count as f64 / issue_duration.as_secs_f64())
        } else {
            None
        };

        Ok(RunSummary {
            label: desc.report_label(),
            expected: recorder.expected_total(),
            issued: issued_count,
            completed: recorder.completed_count(),
            excluded: recorder.excluded_count(),
            out_of_range: recorder.out_of_range_count(),
            uncategorized: recorder.uncategorized_count(),
            complete,
            issue_duration,
            total_duration: issue_start.elapsed(),
            throughput,
            sending_rate,
            percentiles,
            category_medians: recorder.all_category_percentiles(CATEGORY_PERCENTILE),
        })
    }
}

// Waits until every expected completion arrived, or until nothing completed
// for `idle_timeout`. Returns whether the run is complete.
async fn drain(recorder: &LatencyRecorder, poll_interval: Duration, idle_timeout: Duration) -> bool {
    let drain_start = Instant::now();
    loop {
        if recorder.is_run_complete() {
            return true;
        }
        let last_progress = recorder
            .last_update()
            .map_or(drain_start, |last| last.max(drain_start));
        if last_progress.elapsed() >= idle_timeout {
            warn!(
                completed = recorder.completed_count(),
                expected = recorder.expected_total(),
                "No completions for {:?}, giving up on draining",
                idle_timeout
            );
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

struct ProgressReporter {
    dispatcher: Dispatcher,
    issued: Arc<AtomicU64>,
    start_time: Instant,

    previous_completed: u64,
    previous_report_time: Instant,
}

impl ProgressReporter {
    pub fn new(dispatcher: Dispatcher, issued: Arc<AtomicU64>) -> Self {
        let now = Instant::now();
        Self {
            dispatcher,
            issued,
            start_time: now,

            previous_completed: 0,
            previous_report_time: now,
        }
    }

    pub async fn run(mut self) {
        loop {
            let next = self.previous_report_time + REPORT_INTERVAL;
            tokio::time::sleep_until(next.into()).await;
            self.print_report(next);
        }
    }

    fn print_report(&mut self, now: Instant) {
        let elapsed = now - self.start_time;
        let recorder = self.dispatcher.recorder();
        let completed = recorder.completed_count();

        let delta = completed.saturating_sub(self.previous_completed);
        let time_delta = now - self.previous_report_time;
        let per_sec = delta as f64 / time_delta.as_secs_f64();

        println!(
            "{:?}: issued {} completed {} excluded {} in flight {} {:.0}ops/s",
            elapsed,
            self.issued.load(Ordering::Relaxed),
            completed,
            recorder.excluded_count(),
            self.dispatcher.in_flight(),
            per_sec,
        );

        self.previous_completed = completed;
        self.previous_report_time = now;
    }
}
