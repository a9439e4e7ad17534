mod cluster;
mod commands;
mod config;
mod context;
mod engine;
mod errors;
mod host;
mod logging;
#[macro_use]
mod utils;

use crate::commands::{Cli, USAGE};
use crate::config::ProvisionerConfig;
use crate::context::Context;
use crate::engine::ProcessRunner;
use crate::utils::cancel::{cancel_on_signals, cancellation};
use crate::utils::get_version_string;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let (config_path, dry_run, command) = match commands::parse_args(env::args().skip(1)) {
        Ok(Cli::Version) => {
            println!("{}", get_version_string());
            return ExitCode::SUCCESS;
        }
        Ok(Cli::Help) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Ok(Cli::Run {
            config,
            dry_run,
            command,
        }) => (config, dry_run, command),
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    // Keeps the OTLP exporter alive until the run is over
    let _provider = match logging::setup_tracing() {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match ProvisionerConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (handle, token) = cancellation();
    cancel_on_signals(handle);

    let report_path = config.report_path.clone();
    let mut ctx = Context::new(config, Arc::new(ProcessRunner), token);
    ctx.dry_run = dry_run;

    let report = commands::run(&ctx, command).await;
    println!("{}", report.render());

    if let Some(path) = report_path.filter(|_| !dry_run) {
        if let Err(e) = report.write_json(&path) {
            error!("Failed to write the run report: {e}");
        }
    }

    ExitCode::from(report.exit_code())
}
