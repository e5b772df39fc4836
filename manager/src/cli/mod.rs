//! Command line interface

pub mod context;
pub mod images;
pub mod output;
pub mod runners;
pub mod scheduler;
pub mod webhook;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::utils::version_info;

/// Automation engine for self-hosted GitHub Actions runner fleets
#[derive(Debug, Parser)]
#[command(
    name = "runner-manager",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Path of the runners configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "RUNNER_MANAGER_CONFIG",
        default_value = "runners_config.yaml"
    )]
    pub config: PathBuf,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler, liveness probes and status server until interrupted
    Scheduler,

    /// Start every configured runner, removing containers above the count
    StartRunners,

    /// Stop every configured runner
    StopRunners,

    /// Deregister and delete every configured runner
    RemoveRunners,

    /// Show configured runners and their status
    ListRunners,

    /// Build the images of runners with a `build_image`
    BuildRunnersImages,

    /// Check whether a newer runner base image is available
    CheckBaseImageUpdate(images::CheckArgs),

    /// Send test notifications
    #[command(subcommand)]
    Webhook(webhook::WebhookCommand),

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        let Cli {
            config,
            json,
            command,
        } = self;

        match command {
            Command::Version => {
                println!("{}", serde_json::to_string_pretty(&version_info())?);
                Ok(())
            }
            Command::Scheduler => scheduler::run(&config).await,
            Command::StartRunners => runners::start(&config, json).await,
            Command::StopRunners => runners::stop(&config, json).await,
            Command::RemoveRunners => runners::remove(&config, json).await,
            Command::ListRunners => runners::list(&config, json).await,
            Command::BuildRunnersImages => images::build(&config, json).await,
            Command::CheckBaseImageUpdate(args) => images::check(&config, &args, json).await,
            Command::Webhook(command) => webhook::run(&config, command, json).await,
        }
    }
}
