//! Daily phase trait.
//!
//! RULE: Every daily step implements DailyPhase.
//! The engine runs phases in registration order, once per day, for each
//! active experiment the phase `applies` to.
//! Execution order is fixed and documented in engine.rs.

use crate::{
    config::ExperimentConfig,
    error::ExperimentResult,
    event::ExperimentEvent,
    experiment::Experiment,
    rng::RandomSource,
    store::ExperimentStore,
};
use chrono::NaiveDate;

/// What a phase may touch while it runs.
pub struct PhaseContext<'a> {
    pub store:  &'a ExperimentStore,
    pub config: &'a ExperimentConfig,
    pub date:   NaiveDate,
}

pub trait DailyPhase {
    /// Stable name, used in timing labels and the event log.
    fn name(&self) -> &'static str;

    /// Whether `experiment` takes part in this phase on `date`.
    fn applies(&self, experiment: &Experiment, date: NaiveDate) -> bool;

    /// Run the phase for one experiment. Per-record failures are reported
    /// as events; a returned error aborts the day's run.
    fn run(
        &self,
        ctx: &PhaseContext<'_>,
        experiment: &Experiment,
        rng: &mut dyn RandomSource,
    ) -> ExperimentResult<Vec<ExperimentEvent>>;
}

/// Log a per-record failure and turn it into an event.
/// Errors that are not record-scoped are handed back to the caller.
pub(crate) fn skip_record(
    experiment: &Experiment,
    record_id: &str,
    err: crate::error::ExperimentError,
) -> ExperimentResult<ExperimentEvent> {
    if !err.is_record_scoped() {
        return Err(err);
    }
    log::warn!("{}: skipping {record_id}: {err}", experiment.lookup_name);
    Ok(ExperimentEvent::RecordSkipped {
        experiment_id: experiment.experiment_id.clone(),
        record_id:     record_id.to_string(),
        reason:        err.to_string(),
    })
}
