use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dashboard::DashboardArgs;
use vision_api::ApiArgs;

#[derive(Parser, Debug)]
#[command(name = "vision-app", version, about = "Synchronous image processing service")]
pub struct Cli {
    /// Write a Chrome trace JSON file of request and stage spans.
    #[arg(
        long = "chrome-trace",
        env = "VISION_CHROME_TRACE",
        global = true,
        value_name = "PATH"
    )]
    pub chrome_trace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve `POST /process` and `GET /health`.
    Api(ApiArgs),
    /// Serve the interactive dashboard in front of the API.
    Dashboard(DashboardArgs),
}
