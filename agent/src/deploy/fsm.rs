//! Finite State Machine for operation status

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Accepted, waiting for the worker
    Queued,

    /// Steps are executing
    Running,

    /// Finished without error
    Success,

    /// Aborted by an error
    Error,
}

impl OperationStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a status transition and return the new status
pub fn transition(from: OperationStatus, to: OperationStatus) -> Result<OperationStatus, String> {
    match (from, to) {
        // From Queued
        (OperationStatus::Queued, OperationStatus::Queued) => Ok(OperationStatus::Queued),
        (OperationStatus::Queued, OperationStatus::Running) => Ok(OperationStatus::Running),
        (OperationStatus::Queued, OperationStatus::Error) => Ok(OperationStatus::Error),

        // From Running
        (OperationStatus::Running, OperationStatus::Running) => Ok(OperationStatus::Running),
        (OperationStatus::Running, OperationStatus::Success) => Ok(OperationStatus::Success),
        (OperationStatus::Running, OperationStatus::Error) => Ok(OperationStatus::Error),

        // Invalid transitions
        (from, to) => Err(format!("Invalid transition: {:?} -> {:?}", from, to)),
    }
}
