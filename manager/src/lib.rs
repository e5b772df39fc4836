//! Runner Manager Library
//!
//! Lifecycle, scheduling, image update and notification engine for fleets of
//! self-hosted GitHub Actions runners.

pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod filesys;
pub mod lifecycle;
pub mod logs;
pub mod models;
pub mod notify;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod update;
pub mod utils;
pub mod workers;
