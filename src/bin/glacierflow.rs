//! Run the orbital bias correction for one or more glaciers from a TOML configuration

use anyhow::{bail, Context, Result};
use clap::Parser;
use glacierflow::{process_glaciers, ProcessingConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Orbital bias correction of glacier velocity fields")]
struct Args {
    /// TOML processing configuration
    config: PathBuf,

    /// Glaciers to process with the same configuration (defaults to the configured glacier).
    /// `{glacier}` in the configured input paths is replaced by each name.
    #[arg(long, num_args = 1..)]
    glaciers: Vec<String>,

    /// Glacier worker threads (0 = one per CPU); overrides the configuration
    #[arg(long)]
    workers: Option<usize>,

    /// Skip diagnostic plots
    #[arg(long, default_value_t = false)]
    no_plots: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ProcessingConfig::from_toml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.no_plots {
        config.write_plots = false;
    }
    let workers = args.workers.unwrap_or(config.workers);

    let configs: Vec<ProcessingConfig> = if args.glaciers.is_empty() {
        vec![config]
    } else {
        args.glaciers.iter().map(|g| config.for_glacier(g)).collect()
    };

    let reports = process_glaciers(configs, workers)?;

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(summary) => println!(
                "{}: {} corrected, {} already present, {} skipped ({} records, {} orbit pairs skipped)",
                summary.glacier,
                summary.corrected,
                summary.already_present,
                summary.skipped,
                summary.records,
                summary.pairs_skipped
            ),
            Err(e) => {
                failed += 1;
                println!("{}: FAILED ({})", report.glacier, e);
            }
        }
    }

    if failed == reports.len() && !reports.is_empty() {
        bail!("all {} glaciers failed", failed);
    }
    Ok(())
}
