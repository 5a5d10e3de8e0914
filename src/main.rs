//! regrid CLI: plan-driven spreadsheet normalization.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "regrid",
    version,
    about = "Plan-driven spreadsheet normalization with synthesized scripts and sandboxed re-runs"
)]
struct Cli {
    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file
    #[arg(short, long, global = true, default_value = regrid::config::SETTINGS_FILE)]
    config: PathBuf,

    /// Projects directory (overrides the settings file)
    #[arg(long, global = true)]
    projects_root: Option<PathBuf>,

    #[command(subcommand)]
    command: regrid::cli::Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .init();

    let opts = regrid::cli::GlobalOpts {
        config: cli.config,
        projects_root: cli.projects_root,
    };
    if let Err(e) = regrid::cli::dispatch(cli.command, &opts).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
