use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use scylla::frame::types::Consistency;

use crate::configuration::goflags::GoFlagSet;
use crate::configuration::{
    batch_compensation, compute_interarrival, parse_consistency, ArrivalProcess,
    BenchDescription, Experiment, WorkloadMode, WorkloadSourceKind,
};
use crate::distribution::{has_parameter_list, parse_distribution, DistributionSpec};
use crate::pacer::PacingMode;

// Standard deviation of the `-bsz normal` shorthand.
const NORMAL_BATCH_STDDEV: f64 = 75.0;
// Largest batch the `-bsz zipfian` shorthand can produce.
const ZIPFIAN_BATCH_MAX: i64 = 5000;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub enum CliOutcome {
    Run(BenchDescription),
    Help(String),
}

pub fn parse_cli_args(mut args: impl Iterator<Item = String>) -> Result<CliOutcome> {
    // Skip the program name
    args.next();

    let mut flag = GoFlagSet::new();

    let read = flag.bool_var("read", false, "read rows from the database");
    let write = flag.bool_var("write", false, "populate the database with rows (default)");
    let help = flag.bool_var("help", false, "print this message and exit");
    flag.alias("h", "help");
    let debug = flag.bool_var(
        "debug",
        false,
        "log at debug level and report progress every few seconds",
    );

    let nodes = flag.string_var("host", "127.0.0.1:9042", "comma-separated contact points");
    let consistency = flag.var(
        "consistency",
        Consistency::One,
        "one",
        "consistency level",
        parse_consistency,
    );

    let ops = flag.u64_var(
        "ops",
        10_000_000,
        "total number of operations to generate for read workloads",
    );
    flag.alias("operations-count", "ops");
    let utilization = flag.u64_var(
        "util",
        75,
        "target system utilization for read workloads, in percent",
    );
    flag.alias("utilization", "util");

    let workload = flag.var(
        "workload",
        false,
        "synthetic",
        "type of read workload: 'synthetic' or 'trace'",
        |s| match s {
            "trace" => Ok(true),
            "synthetic" => Ok(false),
            _ => Err(anyhow::anyhow!("Invalid workload type: {:?}", s)),
        },
    );
    let trace_file = flag.string_var("trc", "", "path to the trace file for trace workloads");
    flag.alias("trace-file", "trc");
    let experiment = flag.var(
        "exp",
        Experiment::Memory,
        "memory",
        "experiment scenario: 'memory' or 'disk' intensive",
        |s| s.parse(),
    );
    let rows = flag.u64_var(
        "rows",
        0,
        "number of rows in the table (0 for the scenario's row count)",
    );

    let batch_dist = flag.string_var(
        "bsz",
        "normal",
        "batch size distribution: 'normal', 'zipfian', 'constant' or a full description like 'uniform:1..20'",
    );
    flag.alias("batch-distr", "bsz");
    let batch_param = flag.f64_var("bszp", 10.0, "batch size distribution parameter");
    let skew_dist = flag.string_var(
        "skw",
        "uniform",
        "access skew distribution: 'zipfian', 'uniform' or a full description",
    );
    flag.alias("skew-distr", "skw");
    let skew_param = flag.f64_var("skwp", 2.0, "skew distribution parameter");
    let value_dist = flag.string_var(
        "value",
        "constant",
        "value size distribution for insertions: 'fbpareto', 'constant' or a full description",
    );
    flag.alias("value-distr", "value");
    let value_param = flag.f64_var("valuep", 1000.0, "value size distribution parameter");

    let arrival = flag.var(
        "arrival",
        ArrivalProcess::Constant,
        "constant",
        "inter-arrival process: 'constant' or 'poisson'",
        |s| s.parse(),
    );
    let pacing = flag.var(
        "pacing",
        None,
        "auto",
        "pacing: 'compensated', 'unpaced' or 'auto' (compensated reads, unpaced writes)",
        |s| match s {
            "auto" => Ok(None),
            _ => Ok(Some(s.parse::<PacingMode>()?)),
        },
    );

    let fields = flag.u64_var("fields", 1, "number of value columns per row");
    let seed = flag.u64_var("seed", 46, "base seed of the random generators");
    let max_latency = flag.u64_var(
        "max-latency",
        250_000_000,
        "highest trackable latency in microseconds",
    );
    let drain_timeout = flag.u64_var(
        "drain-timeout",
        10,
        "seconds without completions after which draining gives up",
    );
    let csv_path = flag.string_var("csv", "batchStats.csv", "per-batch-size latency CSV output");

    flag.parse_args(args)?;

    if help.get() {
        return Ok(CliOutcome::Help(flag.usage()));
    }

    anyhow::ensure!(
        !(read.get() && write.get()),
        "Only one of -read and -write can be given"
    );
    let mode = if read.get() {
        WorkloadMode::Read
    } else {
        WorkloadMode::Write
    };

    let source = if workload.get() {
        anyhow::ensure!(
            trace_file.is_set() && !trace_file.get().is_empty(),
            "Trace workloads need a trace file (-trc)"
        );
        WorkloadSourceKind::Trace(PathBuf::from(trace_file.get()))
    } else {
        WorkloadSourceKind::Synthetic
    };

    let experiment = experiment.get();
    let rows = match rows.get() {
        0 => experiment.default_rows(),
        rows => rows,
    };

    let batch_param = batch_param.get();
    let batch_size = resolve_distribution("-bsz", &batch_dist.get(), |name| match name {
        "normal" => Some(DistributionSpec::Normal {
            mean: batch_param,
            stddev: NORMAL_BATCH_STDDEV,
        }),
        "zipfian" => Some(DistributionSpec::Zipfian {
            range: 1..=ZIPFIAN_BATCH_MAX,
            skew: batch_param,
        }),
        "constant" => Some(DistributionSpec::Constant(batch_param as i64)),
        "poisson" => Some(DistributionSpec::Poisson(batch_param)),
        _ => None,
    })?;

    let skew_param = skew_param.get();
    let skew = resolve_distribution("-skw", &skew_dist.get(), |name| match name {
        "zipfian" => Some(DistributionSpec::zipfian_items(rows, skew_param)),
        "uniform" => Some(DistributionSpec::Uniform(1..=rows as i64)),
        _ => None,
    })?;

    let value_param = value_param.get();
    let value_size = resolve_distribution("-value", &value_dist.get(), |name| match name {
        "fbpareto" | "pareto" => Some(DistributionSpec::ParetoValueSize),
        "constant" => Some(DistributionSpec::Constant(value_param as i64)),
        _ => None,
    })?;

    // Validate the generators before anything connects
    batch_size.build().context("Invalid batch size distribution")?;
    skew.build().context("Invalid skew distribution")?;
    value_size.build().context("Invalid value size distribution")?;

    let compensation = match mode {
        WorkloadMode::Read => batch_compensation(&source, &batch_size)?,
        WorkloadMode::Write => 1.0,
    };
    let interarrival = compute_interarrival(mode, experiment, utilization.get(), compensation)?;

    let pacing = pacing.get().unwrap_or(match mode {
        WorkloadMode::Read => PacingMode::Compensated,
        WorkloadMode::Write => PacingMode::Unpaced,
    });

    anyhow::ensure!(fields.get() > 0, "At least one field is needed");
    anyhow::ensure!(drain_timeout.get() > 0, "The drain timeout must be positive");

    let nodes: Vec<String> = nodes
        .get()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    anyhow::ensure!(!nodes.is_empty(), "At least one contact point is needed");

    Ok(CliOutcome::Run(BenchDescription {
        mode,
        source,
        experiment,
        nodes,
        consistency: consistency.get(),
        operation_count: ops.get(),
        rows,
        field_count: fields.get() as usize,
        batch_size,
        skew,
        value_size,
        utilization: utilization.get(),
        interarrival,
        arrival: arrival.get(),
        pacing,
        seed: seed.get(),
        max_latency_micros: max_latency.get(),
        drain_poll_interval: DRAIN_POLL_INTERVAL,
        drain_idle_timeout: Duration::from_secs(drain_timeout.get()),
        csv_path: PathBuf::from(csv_path.get()),
        debug: debug.get(),
    }))
}

// Accepts either a complete description (`zipfian:1..5000,2`) or one of the
// bare names, whose parameter comes from the companion `-...p` flag.
fn resolve_distribution(
    flag: &str,
    s: &str,
    shorthand: impl Fn(&str) -> Option<DistributionSpec>,
) -> Result<DistributionSpec> {
    if has_parameter_list(s) {
        return parse_distribution(s).with_context(|| format!("Invalid value for {}", flag));
    }
    shorthand(s).ok_or_else(|| anyhow::anyhow!("Unsupported distribution for {}: {:?}", flag, s))
}
