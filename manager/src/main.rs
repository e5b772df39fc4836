//! Runner Manager - Entry Point
//!
//! Starts, stops, rebuilds and redeploys containerized GitHub Actions runners,
//! and runs the scheduled update pipeline.

use clap::Parser;
use colored::Colorize;

use runner_manager::cli::Cli;

#[tokio::main]
async fn main() {
    // `.env` is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
