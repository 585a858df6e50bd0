use crate::experiment::ExperimentState;
use serde::{Deserialize, Serialize};

/// How an activated experiment finds its patients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Daily enrollment from the eligibility filter.
    Selecting,
    /// A fixed population enrolled up front.
    Preselected,
}

impl ActivationMode {
    pub fn state(&self) -> ExperimentState {
        match self {
            Self::Selecting   => ExperimentState::ActiveSelecting,
            Self::Preselected => ExperimentState::ActivePreselected,
        }
    }
}

/// Operator-issued commands.
/// Variants are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OperatorCommand {
    Activate {
        lookup_name: String,
        mode:        ActivationMode,
    },
    Deactivate {
        lookup_name: String,
    },
    /// Cancel all pending reminders and deactivate, atomically.
    Cancel {
        lookup_name: String,
    },
}

impl OperatorCommand {
    pub fn lookup_name(&self) -> &str {
        match self {
            Self::Activate { lookup_name, .. }
            | Self::Deactivate { lookup_name }
            | Self::Cancel { lookup_name } => lookup_name,
        }
    }
}
