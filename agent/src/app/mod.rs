//! Daemon wiring and lifecycle

pub mod options;
pub mod run;
