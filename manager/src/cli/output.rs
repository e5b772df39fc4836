//! Terminal output helpers

use colored::Colorize;
use serde::Serialize;

use crate::lifecycle::fleet::{FleetReport, RunnerRef};

pub fn success(message: &str) {
    println!("{}", message.green());
}

pub fn info(message: &str) {
    println!("{}", message.yellow());
}

pub fn error(message: &str) {
    eprintln!("{}", format!("[ERROR] {}", message).red());
}

pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn reason(runner: &RunnerRef) -> &str {
    runner.reason.as_deref().unwrap_or("unknown reason")
}

/// Print every bucket of a fleet report
pub fn report(report: &FleetReport) {
    for runner in &report.started {
        success(&format!("[INFO] Runner {} started", runner.name));
    }
    for runner in &report.restarted {
        info(&format!("[INFO] Runner {} existed but was stopped, restarted", runner.name));
    }
    for runner in &report.running {
        info(&format!("[INFO] Runner {} already running, nothing to do", runner.name));
    }
    for runner in &report.stopped {
        success(&format!("[INFO] Runner {} stopped", runner.name));
    }
    for runner in &report.removed {
        success(&format!("[INFO] Runner {} removed", runner.name));
    }
    for runner in &report.skipped {
        info(&format!("[INFO] {}: {}", runner.name, reason(runner)));
    }
    for runner in &report.errors {
        error(&format!("{}: {}", runner.name, reason(runner)));
    }
}
