use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The (patient, experiment) uniqueness constraint rejected an insert.
    #[error("Patient {patient_id} is already enrolled in experiment {experiment_id}")]
    DuplicateEnrollment {
        patient_id:    String,
        experiment_id: String,
    },

    #[error("Invalid filter on '{axis}': {reason}")]
    InvalidFilter { axis: String, reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Experiment '{lookup_name}' not found")]
    ExperimentNotFound { lookup_name: String },

    #[error("Experiment {experiment_id} has no treatment groups")]
    NoTreatmentGroups { experiment_id: String },

    #[error("Invalid state transition for '{lookup_name}': {from} -> {to}")]
    InvalidTransition {
        lookup_name: String,
        from:        String,
        to:          String,
    },

    #[error("Unknown {kind} value '{value}'")]
    UnknownValue { kind: &'static str, value: String },

    #[error("Delivery channel error: {reason}")]
    Delivery { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExperimentError {
    /// Failures that only invalidate the record being processed.
    /// Batch loops log these and move on; everything else aborts the pass.
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }
}

pub type ExperimentResult<T> = Result<T, ExperimentError>;
