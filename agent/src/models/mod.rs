//! Data model shared by the orchestrator, the store and the HTTP surface

pub mod operation;
pub mod stack;
pub mod template;
