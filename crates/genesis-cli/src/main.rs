//! Genesis CLI entrypoint.

use anyhow::Result;
use clap::Parser;
use console::style;
use genesis_core::run::StepState;
use genesis_runner::DockerEngine;
use genesis_scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser)]
#[command(name = "genesis")]
#[command(author, version, about = "Run a container CI pipeline against a local Docker daemon", long_about = None)]
struct Cli {
    /// Path to the pipeline document
    #[arg(default_value = ".genesis.yml")]
    config: PathBuf,

    /// Seconds between scheduler cycles
    #[arg(long, default_value_t = 2)]
    interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let pipeline = config::load_pipeline(&cli.config)?;

    println!(
        "\n{} Running pipeline: {}",
        style("▶").cyan().bold(),
        style(&pipeline.name).bold()
    );

    let engine = Arc::new(DockerEngine::new()?);
    let scheduler =
        Scheduler::new(engine).with_poll_interval(Duration::from_secs(cli.interval.max(1)));

    let report = scheduler.run(&pipeline).await?;

    println!();
    for step in &report.steps {
        let mark = match step.state {
            StepState::Succeeded => style("✓").green(),
            StepState::Failed => style("✗").red(),
            StepState::Cancelled => style("-").yellow(),
            StepState::Waiting | StepState::Running => style("?").dim(),
        };
        println!("  {} {} ({})", mark, step.name, step.state);
    }

    if report.is_success() {
        println!(
            "\n{} Pipeline succeeded in {} ms",
            style("✔").green().bold(),
            report.duration_ms
        );
        Ok(())
    } else {
        println!(
            "\n{} Pipeline failed after {} ms",
            style("✖").red().bold(),
            report.duration_ms
        );
        std::process::exit(1);
    }
}
