//! Configuration: file schema, schedule policy and persistence

pub mod schedule;
pub mod schema;
pub mod store;
