use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use copilot_usage::app;
use copilot_usage::cli::{Cli, Commands};
use copilot_usage::config::TrackerConfig;
use copilot_usage::reconcile::UsageQuery;
use copilot_usage::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("copilot-usage error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = TrackerConfig::load_or_init()?;

    match cli.command {
        Commands::Query {
            limit,
            since,
            session_id,
            json,
        } => {
            let query = UsageQuery {
                limit,
                since,
                session_id,
            };
            app::run_query(&config, &query, json)?;
            Ok(0)
        }
        Commands::Watch { interval } => {
            app::run_watch(&config, Duration::from_secs(interval.max(1)))?;
            Ok(0)
        }
        Commands::Status => {
            app::print_status(&config)?;
            Ok(0)
        }
        Commands::Doctor => app::doctor(&config),
    }
}
