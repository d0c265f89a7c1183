use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use gatehouse::config::{load_config, GatehouseConfig};
use gatehouse::lifecycle::startup;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "Connection admission and session lifecycle engine", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => GatehouseConfig::default(),
    };

    if cli.check {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }

    match startup::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
