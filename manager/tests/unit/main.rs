//! Integration-level unit tests

mod test_dispatcher;
mod test_engine;
mod test_fsm;
mod test_lifecycle;
