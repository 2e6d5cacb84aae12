mod cli;
mod sim;
mod telemetry;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use crate::cli::Cli;

const CELL_WIDTH: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    info!(
        target = "sheet.sim",
        clients = cli.clients,
        edits = cli.edits,
        rows = cli.rows,
        cols = cli.cols,
        reject_rate = cli.reject_rate,
        latency_ms = cli.latency_ms,
        seed = cli.seed,
        "starting simulation"
    );
    let report = sim::run(&cli).await?;

    print!(
        "{}",
        sim::render(&report.frame, cli.rows as usize, cli.cols as usize, CELL_WIDTH)
    );
    println!();
    println!(
        "clients={} edits={} commits={} failed={} durable_cells={}",
        cli.clients,
        cli.edits,
        report.commits,
        report.failures,
        report.durable.len()
    );
    if !cli.quiet_metrics {
        println!();
        print!("{}", String::from_utf8_lossy(&sheet_sync::metrics::gather()));
    }

    if !report.converged() {
        for divergence in &report.divergences {
            eprintln!(
                "client {} diverged at row {} col {}: local={:?} durable={:?}",
                divergence.client,
                divergence.row,
                divergence.col,
                divergence.local,
                divergence.durable
            );
        }
        bail!("{} divergent cells", report.divergences.len());
    }
    info!(target = "sheet.sim", "all clients converged");
    Ok(())
}
