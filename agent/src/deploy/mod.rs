//! Deployment module

pub mod compose;
pub mod docker;
pub mod fsm;
pub mod materializer;
pub mod pull;
pub mod rewriter;
