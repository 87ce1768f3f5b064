use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use prefill::{
    config::{Config, ConfigArgs},
    pipeline::Pipeline,
    storage::LocalStorage,
};

/// Command line utility to fill a time-series data store from the text
/// exposition format read on stdin.
#[derive(Parser)]
#[command(name = "prefill", about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("prefill {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = Config::from_args(cli.config).context("invalid configuration")?;

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = rt.block_on(run(cfg));
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "prefill failed");
    }
    result
}

async fn run(cfg: Config) -> Result<()> {
    info!(path = %cfg.storage.path.display(), "prefilling");
    let storage = LocalStorage::new(cfg.storage.clone());
    let mut pipeline = Pipeline::from_config(storage, &cfg);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    pipeline.run(stdin).await?;

    info!("shut down cleanly");
    Ok(())
}
