//! anr-watch - simulate and configure the ANR detector from the shell

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::Parser;
use simulate::{Scenario, SkipPlan};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "anr-watch")]
#[command(about = "ANR watch - main-loop stall detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a simulated main loop under the detector
    Simulate {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Busy time of each iteration in milliseconds
        #[arg(long, value_delimiter = ',', default_value = "900,150")]
        busy: Vec<u64>,
        /// Idle time before each iteration in milliseconds
        #[arg(long, default_value_t = 50)]
        idle: u64,
        /// Threshold override in milliseconds
        #[arg(short, long)]
        threshold: Option<u64>,
        /// Call skip_current during this iteration (1-based)
        #[arg(long)]
        skip_iteration: Option<usize>,
        /// Extend the skip by a timed window of this many seconds
        #[arg(long, requires = "skip_iteration")]
        skip_for: Option<f64>,
        /// Print reports and status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check configuration validity
    Check {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the default configuration as TOML
    Defaults,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Simulate {
            config: path,
            busy,
            idle,
            threshold,
            skip_iteration,
            skip_for,
            json,
        }) => {
            let config = config::resolve(path.as_deref(), threshold)?;
            let skip = skip_iteration.map(|iteration| SkipPlan {
                iteration,
                seconds: skip_for,
            });
            let scenario = Scenario::new(&busy, idle).with_skip(skip);
            let report = simulate::run(config, &scenario)?;

            if json {
                for op in &report.operations {
                    println!("{}", serde_json::to_string(op).context("failed to encode report")?);
                }
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report.status).context("failed to encode status")?
                );
            } else {
                for op in &report.operations {
                    let kind = if op.is_finished { "finished" } else { "stalled" };
                    println!(
                        "{kind:>8} #{} {} start={:.3}s duration={:.3}s",
                        op.index, op.activity, op.start, op.duration
                    );
                }
                let status = &report.status;
                println!(
                    "spans={} stalled={} delivered={} suppressed={} dropped={}",
                    status.spans_opened,
                    status.stalled_spans,
                    status.delivered,
                    status.suppressed,
                    status.dropped
                );
            }
        }
        Some(Commands::Check { config: path }) => {
            let loaded = config::load(&path)?;
            println!(
                "{}: OK (threshold {}ms, timer thread {:?}, delivery thread {:?})",
                path.display(),
                loaded.threshold_ms,
                loaded.timer_thread_name,
                loaded.delivery_thread_name
            );
        }
        Some(Commands::Defaults) => {
            print!("{}", config::defaults_toml()?);
        }
        None => {
            println!("anr-watch v{} - Use --help for commands", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
