use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::run::RunSummary;
use crate::workload::CategoryKey;

/// Human-readable end-of-run report, one fact per line.
pub fn render_summary(summary: &RunSummary) -> String {
    let label = summary.label;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Completed {} operations in {} seconds",
        summary.issued,
        summary.issue_duration.as_secs_f64()
    );
    let _ = writeln!(
        out,
        "Experiment completed in {} seconds",
        summary.total_duration.as_secs_f64()
    );
    let _ = writeln!(out, "[{}-SUCCESS] Count: {}", label, summary.completed);
    if let Some(failures) = summary.failure_count() {
        let _ = writeln!(out, "[{}-FAILURE] Count: {}", label, failures);
    }
    if summary.excluded > 0 {
        let _ = writeln!(out, "[{}-EXCLUDED] Count: {}", label, summary.excluded);
    }
    if summary.out_of_range > 0 {
        let _ = writeln!(out, "[{}-OUT-OF-RANGE] Count: {}", label, summary.out_of_range);
    }
    if summary.uncategorized > 0 {
        let _ = writeln!(out, "[{}-UNCATEGORIZED] Count: {}", label, summary.uncategorized);
    }

    let qualifier = if summary.complete { "" } else { " (incomplete run)" };
    for (p, latency) in &summary.percentiles {
        match latency {
            Some(latency) => {
                let _ = writeln!(
                    out,
                    "[{}] {}th Percentile Latency (us): {}{}",
                    label, p, latency, qualifier
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "[{}] {}th Percentile Latency (us): unavailable",
                    label, p
                );
            }
        }
    }

    let _ = writeln!(out, "Throughput: {} reqs/sec", rate(summary.throughput));
    let _ = writeln!(out, "Sending rate: {} reqs/sec", rate(summary.sending_rate));
    out
}

fn rate(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.0}", value),
        None => "unavailable".to_owned(),
    }
}

/// Writes one `size,latency` row per observed batch size.
pub fn write_category_csv(path: &Path, medians: &BTreeMap<CategoryKey, u64>) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_csv(&mut writer, medians)
        .and_then(|_| writer.flush())
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn write_csv(writer: &mut impl Write, medians: &BTreeMap<CategoryKey, u64>) -> io::Result<()> {
    writeln!(writer, "size,latency")?;
    for (size, latency) in medians {
        writeln!(writer, "{},{}", size, latency)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn summary(complete: bool) -> RunSummary {
        RunSummary {
            label: "MULTIGET",
            expected: 10,
            issued: 10,
            completed: if complete { 10 } else { 7 },
            excluded: 0,
            out_of_range: 0,
            uncategorized: 0,
            complete,
            issue_duration: Duration::from_secs(2),
            total_duration: Duration::from_secs(3),
            throughput: Some(3.4),
            sending_rate: Some(5.0),
            percentiles: vec![(50.0, Some(420)), (99.0, None)],
            category_medians: vec![(1, 100), (5, 420)].into_iter().collect(),
        }
    }

    #[test]
    fn renders_percentiles_and_rates() {
        let text = render_summary(&summary(true));
        assert!(text.contains("Completed 10 operations in 2 seconds\n"));
        assert!(text.contains("[MULTIGET-SUCCESS] Count: 10\n"));
        assert!(!text.contains("FAILURE"));
        assert!(!text.contains("OUT-OF-RANGE"));
        assert!(!text.contains("UNCATEGORIZED"));
        assert!(text.contains("[MULTIGET] 50th Percentile Latency (us): 420\n"));
        assert!(text.contains("[MULTIGET] 99th Percentile Latency (us): unavailable\n"));
        assert!(text.contains("Throughput: 3 reqs/sec\n"));
        assert!(text.contains("Sending rate: 5 reqs/sec\n"));
    }

    #[test]
    fn incomplete_runs_are_labelled() {
        let text = render_summary(&summary(false));
        assert!(text.contains("[MULTIGET-FAILURE] Count: 3\n"));
        assert!(text.contains("Latency (us): 420 (incomplete run)\n"));
    }

    #[test]
    fn dropped_samples_are_counted() {
        let mut summary = summary(true);
        summary.excluded = 4;
        summary.out_of_range = 2;
        summary.uncategorized = 1;
        let text = render_summary(&summary);
        assert!(text.contains("[MULTIGET-EXCLUDED] Count: 4\n"));
        assert!(text.contains("[MULTIGET-OUT-OF-RANGE] Count: 2\n"));
        assert!(text.contains("[MULTIGET-UNCATEGORIZED] Count: 1\n"));
    }

    #[test]
    fn writes_batch_size_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batchStats.csv");
        write_category_csv(&path, &summary(true).category_medians).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "size,latency\n1,100\n5,420\n");
    }
}
