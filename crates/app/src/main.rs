mod cli;

use anyhow::Result;
use clap::Parser;
use dashboard::DashboardConfig;
use tracing::info;
use vision_api::{
    ApiConfig,
    telemetry::{self, TelemetryOptions},
};

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = telemetry::init(&TelemetryOptions {
        chrome_trace_path: cli.chrome_trace.clone(),
    });
    telemetry::init_metrics_recorder();

    match cli.command {
        Command::Api(args) => {
            let config = ApiConfig::try_from(args)?;
            info!(
                port = config.port,
                workers = config.pool.workers,
                queue = config.pool.queue_capacity,
                pipeline = %config.pipeline,
                "starting vision API"
            );
            actix_web::rt::System::new().block_on(vision_api::run(config))
        }
        Command::Dashboard(args) => {
            let config = DashboardConfig::try_from(args)?;
            info!(port = config.port, api = %config.api_base_url, "starting dashboard");
            actix_web::rt::System::new().block_on(dashboard::run(config))
        }
    }
}
