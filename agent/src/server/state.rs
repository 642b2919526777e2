//! Server state

use crate::ops::Orchestrator;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Orchestrator,
}

impl ServerState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}
