//! Runner lifecycle: state machine, instance table and fleet operations

pub mod fleet;
pub mod fsm;
pub mod manager;
