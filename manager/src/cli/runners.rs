//! `start-runners`, `stop-runners`, `remove-runners` and `list-runners`

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::context::Session;
use crate::cli::output;
use crate::lifecycle::fleet::{FleetListing, FleetReport};

fn finish(report: &FleetReport, json: bool) -> Result<()> {
    if json {
        output::json(report)?;
    } else {
        output::report(report);
    }
    if report.has_errors() {
        bail!("{} runner operation(s) failed", report.errors.len());
    }
    Ok(())
}

pub async fn start(config: &Path, json: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let report = session.state.fleet.start_all(session.definitions()).await;
    session.close().await?;
    finish(&report, json)
}

pub async fn stop(config: &Path, json: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let report = session.state.fleet.stop_all(session.definitions()).await;
    session.close().await?;
    finish(&report, json)
}

pub async fn remove(config: &Path, json: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let report = session.state.fleet.remove_all(session.definitions()).await;
    session.close().await?;
    finish(&report, json)
}

pub async fn list(config: &Path, json: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let listing = session.state.fleet.listing(session.definitions()).await;
    session.close().await?;

    let listing = listing?;
    if json {
        return output::json(&listing);
    }
    print_listing(&listing);
    Ok(())
}

fn print_listing(listing: &FleetListing) {
    println!(
        "{:<12} {:<28} {:<26} {:>7}  {}",
        "GROUP".bold(),
        "NAME".bold(),
        "STATUS".bold(),
        "SLOT".bold(),
        "LABELS".bold()
    );

    for group in &listing.groups {
        for runner in group.runners.iter().chain(&group.extra_runners) {
            let status = match runner.status.as_str() {
                "running" | "started" => runner.status.green(),
                "error" => runner.status.red(),
                "will_be_removed" | "running_will_be_removed" => runner.status.magenta(),
                _ => runner.status.yellow(),
            };
            println!(
                "{:<12} {:<28} {:<26} {:>7}  {}",
                group.id,
                runner.name,
                status,
                runner.slot,
                runner.labels.join(", ")
            );
        }
        println!(
            "{:<12} {}",
            "",
            format!("{}/{} running", group.running, group.total).dimmed()
        );
    }

    println!(
        "{}",
        format!(
            "Total: {}/{} runners running",
            listing.total_running, listing.total_count
        )
        .bold()
    );
}
