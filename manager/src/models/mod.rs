//! Domain models

pub mod definition;
pub mod image;
pub mod instance;
