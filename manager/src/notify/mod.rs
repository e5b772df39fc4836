//! Notification events, providers and dispatch

pub mod dispatcher;
pub mod events;
pub mod providers;
pub mod transport;
