//! Time-based automation of check, build and deploy

pub mod engine;
pub mod gate;
pub mod state;
