//! Background workers

pub mod liveness;
pub mod scheduler;
