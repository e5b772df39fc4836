//! Base image update detection and runner image builds

pub mod build;
pub mod checker;
