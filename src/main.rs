use clap::Parser;
use opsdesk::app::{App, run_agent};
use opsdesk::cli::{Args, Command};
use opsdesk::config::Config;
use opsdesk::logging::setup_logging;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Config must load before logging so startup logs are never dropped.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting opsdesk"
    );

    match args.command {
        Command::Serve => match App::new(config).await {
            Ok(app) => app.run().await,
            Err(e) => {
                error!(error = ?e, "Failed to initialize application");
                ExitCode::FAILURE
            }
        },
        Command::Agent(agent) => match run_agent(&config, agent).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = ?e, "Agent failed");
                ExitCode::FAILURE
            }
        },
    }
}
