//! Local HTTP surface of the orchestrator

pub mod handlers;
pub mod serve;
pub mod state;
