pub mod cli;
mod goflags;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use scylla::frame::types::Consistency;

use crate::distribution::DistributionSpec;
use crate::pacer::PacingMode;

/// Everything needed to run one benchmark, validated before connecting.
pub struct BenchDescription {
    pub mode: WorkloadMode,
    pub source: WorkloadSourceKind,
    pub experiment: Experiment,

    pub nodes: Vec<String>,
    pub consistency: Consistency,

    pub operation_count: u64,
    pub rows: u64,
    pub field_count: usize,

    pub batch_size: DistributionSpec,
    pub skew: DistributionSpec,
    pub value_size: DistributionSpec,

    pub utilization: u64,
    pub interarrival: Duration,
    pub arrival: ArrivalProcess,
    pub pacing: PacingMode,

    pub seed: u64,
    pub max_latency_micros: u64,
    pub drain_poll_interval: Duration,
    pub drain_idle_timeout: Duration,
    pub csv_path: PathBuf,
    pub debug: bool,
}

impl BenchDescription {
    /// Number of operations the issuing loop is going to attempt.
    pub fn planned_operations(&self) -> u64 {
        match self.mode {
            WorkloadMode::Read => self.operation_count,
            WorkloadMode::Write => self.rows,
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        (0..self.field_count).map(|i| format!("field{}", i)).collect()
    }

    pub fn arrival_distribution(&self) -> DistributionSpec {
        let micros = self.interarrival.as_micros() as i64;
        match self.arrival {
            ArrivalProcess::Constant => DistributionSpec::Constant(micros),
            ArrivalProcess::Poisson => DistributionSpec::Exponential(micros.max(1) as f64),
        }
    }

    pub fn report_percentiles(&self) -> &'static [f64] {
        match self.mode {
            WorkloadMode::Read => &[10.0, 20.0, 30.0, 40.0, 50.0, 95.0, 99.0],
            WorkloadMode::Write => &[50.0, 95.0, 99.0],
        }
    }

    pub fn report_label(&self) -> &'static str {
        match self.mode {
            WorkloadMode::Read => "MULTIGET",
            WorkloadMode::Write => "WRITE",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkloadMode {
    Write,
    Read,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadSourceKind {
    Synthetic,
    Trace(PathBuf),
}

/// Hardware scenario the cluster was sized for. Both numbers depend on the
/// cluster setup and the underlying hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Experiment {
    Memory,
    Disk,
}

impl Experiment {
    pub fn default_rows(self) -> u64 {
        match self {
            Experiment::Memory => 100_000,
            Experiment::Disk => 250_000_000,
        }
    }

    /// Inter-arrival time, in microseconds, that saturates the cluster with
    /// single-key reads.
    pub fn read_saturation_interarrival(self) -> f64 {
        match self {
            Experiment::Memory => 300.0,
            Experiment::Disk => 100.0,
        }
    }
}

impl std::str::FromStr for Experiment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Experiment::Memory),
            "disk" => Ok(Experiment::Disk),
            _ => Err(anyhow::anyhow!("Invalid experiment scenario: {:?}", s)),
        }
    }
}

/// How the gaps between two issued requests are drawn around the computed
/// inter-arrival time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArrivalProcess {
    Constant,
    Poisson,
}

impl std::str::FromStr for ArrivalProcess {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(ArrivalProcess::Constant),
            "poisson" => Ok(ArrivalProcess::Poisson),
            _ => Err(anyhow::anyhow!("Invalid arrival process: {:?}", s)),
        }
    }
}

// Trace runs do not know their batch sizes up front; this is the mean batch
// size of the traces the scenario was calibrated with.
const TRACE_BATCH_COMPENSATION: f64 = 8.0;
const WRITE_INTERARRIVAL_MICROS: u64 = 800;

/// Target gap between two issued requests, in whole microseconds.
///
/// Reads scale the saturating rate of the scenario down to the requested
/// utilization and divide by the average batch size, since a batch of `n`
/// keys costs roughly `n` single reads.
pub fn compute_interarrival(
    mode: WorkloadMode,
    experiment: Experiment,
    utilization: u64,
    batch_compensation: f64,
) -> Result<Duration> {
    if mode == WorkloadMode::Write {
        return Ok(Duration::from_micros(WRITE_INTERARRIVAL_MICROS));
    }
    anyhow::ensure!(utilization > 0, "Utilization must be positive");
    anyhow::ensure!(
        batch_compensation.is_finite() && batch_compensation > 0.0,
        "Mean batch size must be positive, got {}",
        batch_compensation
    );
    let micros = experiment.read_saturation_interarrival()
        / (utilization as f64 / 100.0)
        / batch_compensation;
    Ok(Duration::from_micros(micros as u64))
}

pub fn batch_compensation(source: &WorkloadSourceKind, batch_size: &DistributionSpec) -> Result<f64> {
    match source {
        WorkloadSourceKind::Trace(_) => Ok(TRACE_BATCH_COMPENSATION),
        WorkloadSourceKind::Synthetic => batch_size.build()?.mean().ok_or_else(|| {
            anyhow::anyhow!(
                "The batch size distribution {} has no mean to derive the arrival rate from",
                batch_size
            )
        }),
    }
}

pub fn parse_consistency(s: &str) -> Result<Consistency> {
    match s {
        "any" => Ok(Consistency::Any),
        "one" => Ok(Consistency::One),
        "two" => Ok(Consistency::Two),
        "three" => Ok(Consistency::Three),
        "quorum" => Ok(Consistency::Quorum),
        "all" => Ok(Consistency::All),
        "local_quorum" => Ok(Consistency::LocalQuorum),
        "each_quorum" => Ok(Consistency::EachQuorum),
        "local_one" => Ok(Consistency::LocalOne),
        _ => Err(anyhow::anyhow!("Invalid consistency: {:?}", s)),
    }
}
