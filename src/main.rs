#[macro_use]
extern crate async_trait;

mod configuration;
mod dispatcher;
mod distribution;
mod generator;
mod pacer;
mod recorder;
mod report;
mod run;
mod sharded_histogram;
mod store;
mod trace;
mod workload;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use configuration::cli::{parse_cli_args, CliOutcome};
use run::{RunController, RunPhase};
use store::ScyllaStore;

#[tokio::main]
async fn main() -> Result<()> {
    let desc = match parse_cli_args(std::env::args())? {
        CliOutcome::Run(desc) => Arc::new(desc),
        CliOutcome::Help(usage) => {
            println!("Usage of scylla-openloop:\n{}", usage);
            return Ok(());
        }
    };

    let default_level = if desc.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut controller = RunController::new(desc.clone())?;

    controller.enter(RunPhase::Connecting);
    let connect_start = std::time::Instant::now();
    let store = ScyllaStore::connect(&desc.nodes, &desc.field_names(), desc.consistency).await?;
    info!(elapsed = ?connect_start.elapsed(), "Setup completed");

    let summary = controller.run(Arc::new(store)).await?;

    print!("{}", report::render_summary(&summary));
    report::write_category_csv(&desc.csv_path, &summary.category_medians)?;
    controller.enter(RunPhase::Done);
    println!("All done");

    Ok(())
}
