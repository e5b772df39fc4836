//! `webhook test` and `webhook test-all`

use std::path::Path;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};

use crate::cli::context::Session;
use crate::cli::output;
use crate::notify::dispatcher::DeliveryRecord;
use crate::notify::events::{EventKind, NotificationEvent};

#[derive(Debug, Subcommand)]
pub enum WebhookCommand {
    /// Send a sample notification for one event type
    Test(TestArgs),

    /// Send a sample notification for every event type
    TestAll(TestAllArgs),
}

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Event type, e.g. `runner_started`
    #[arg(long)]
    pub event: EventKind,

    /// Only send to this provider (slack, discord, teams, generic)
    #[arg(long)]
    pub provider: Option<String>,
}

#[derive(Debug, Args)]
pub struct TestAllArgs {
    #[arg(long)]
    pub provider: Option<String>,
}

pub async fn run(config: &Path, command: WebhookCommand, json: bool) -> Result<()> {
    let session = Session::open(config).await?;

    let (kinds, provider) = match command {
        WebhookCommand::Test(args) => (vec![args.event], args.provider),
        WebhookCommand::TestAll(args) => (EventKind::ALL.to_vec(), args.provider),
    };

    let dispatcher = &session.state.dispatcher;
    if dispatcher.active_providers(provider.as_deref()).is_empty() {
        session.close().await?;
        bail!(
            "No enabled webhook provider{}",
            provider.map(|p| format!(" named {}", p)).unwrap_or_default()
        );
    }

    let mut records: Vec<DeliveryRecord> = Vec::new();
    for kind in kinds {
        let event = NotificationEvent::sample(kind);
        let delivered = dispatcher.deliver_now(&event, provider.as_deref()).await;
        if delivered.is_empty() && !json {
            output::info(&format!("[INFO] No provider subscribed to {}", kind));
        }
        records.extend(delivered);
    }
    session.close().await?;

    if json {
        output::json(&records)?;
    } else {
        for record in &records {
            if record.success {
                output::success(&format!(
                    "[SUCCESS] {} sent to {} ({} attempt(s))",
                    record.kind, record.provider, record.attempts
                ));
            } else {
                output::error(&format!(
                    "{} to {} failed after {} attempt(s): {}",
                    record.kind,
                    record.provider,
                    record.attempts,
                    record.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }

    let failed = records.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{} test notification(s) failed", failed);
    }
    Ok(())
}
