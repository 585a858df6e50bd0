//! The experiment engine: the daily driver's single entry point.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Enrollment  (experiments that are enrolling on the date)
//!   2. Monitoring  (experiments that are monitoring on the date)
//!        a. result recording  b. visit marking  c. eviction
//!   3. Scheduling  (experiments that are notifying on the date)
//!
//! RULES:
//!   - A phase runs for every applicable experiment before the next phase.
//!   - Phases touch the database only through the store.
//!   - All randomness flows through the RngBank.
//!   - Every phase outcome is recorded in the event log.

use crate::{
    command::OperatorCommand,
    config::ExperimentConfig,
    delivery::{self, DeliveryChannel},
    eligibility::FilterSpec,
    enrollment::{self, EnrollmentPhase},
    error::{ExperimentError, ExperimentResult},
    event::{EventLogEntry, ExperimentEvent},
    experiment::{require_groups, Experiment, ExperimentState},
    metrics::{timed, MetricsSink},
    monitoring::MonitoringPhase,
    notification::DeliveryStatus,
    phase::{DailyPhase, PhaseContext},
    rng::RngBank,
    scheduler::SchedulingPhase,
    store::ExperimentStore,
    types::{now, PatientId},
};
use chrono::{NaiveDate, NaiveDateTime};

const COMMAND_PHASE: &str = "command";
const DISPATCH_PHASE: &str = "dispatch";

/// Counts of what one `conduct_daily` run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailySummary {
    pub experiments_run:         usize,
    pub enrolled:                usize,
    pub duplicates_skipped:      usize,
    pub results_recorded:        usize,
    pub visited:                 usize,
    pub evicted:                 usize,
    pub notifications_cancelled: usize,
    pub notifications_scheduled: usize,
    pub records_skipped:         usize,
}

impl DailySummary {
    fn absorb(&mut self, events: &[ExperimentEvent]) {
        for event in events {
            match event {
                ExperimentEvent::PatientEnrolled { .. }            => self.enrolled += 1,
                ExperimentEvent::DuplicateEnrollmentSkipped { .. } => self.duplicates_skipped += 1,
                ExperimentEvent::ResultRecorded { .. }             => self.results_recorded += 1,
                ExperimentEvent::MembershipVisited { .. }          => self.visited += 1,
                ExperimentEvent::MembershipEvicted { .. }          => self.evicted += 1,
                ExperimentEvent::NotificationsCancelled { count, .. } => {
                    self.notifications_cancelled += count
                }
                ExperimentEvent::NotificationScheduled { .. } => self.notifications_scheduled += 1,
                ExperimentEvent::RecordSkipped { .. }         => self.records_skipped += 1,
                _ => {}
            }
        }
    }
}

pub struct ExperimentEngine {
    pub config:   ExperimentConfig,
    pub rng_bank: RngBank,
    store:        ExperimentStore,
    phases:       Vec<Box<dyn DailyPhase>>,
    metrics:      Option<Box<dyn MetricsSink>>,
}

impl ExperimentEngine {
    pub fn new(config: ExperimentConfig, store: ExperimentStore) -> Self {
        Self {
            rng_bank: RngBank::new(config.master_seed),
            config,
            store,
            phases: Vec::new(),
            metrics: None,
        }
    }

    /// Build a fully wired engine with all phases registered.
    /// Call this instead of new() + manual register() calls.
    pub fn build(config: ExperimentConfig, store: ExperimentStore) -> Self {
        let mut engine = Self::new(config, store);
        // EXECUTION ORDER: fixed, documented, never reordered.
        engine.register(Box::new(EnrollmentPhase));
        engine.register(Box::new(MonitoringPhase));
        engine.register(Box::new(SchedulingPhase));
        engine
    }

    /// In-memory, migrated engine with the test config and the given seed.
    pub fn build_test(seed: u64) -> ExperimentResult<Self> {
        let store = ExperimentStore::in_memory()?;
        store.migrate()?;
        let config = ExperimentConfig {
            master_seed: seed,
            ..ExperimentConfig::default_test()
        };
        Ok(Self::build(config, store))
    }

    pub fn with_metrics(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Register a phase. Call in the documented execution order.
    pub fn register(&mut self, phase: Box<dyn DailyPhase>) {
        self.phases.push(phase);
    }

    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    /// Run every phase for every applicable active experiment.
    pub fn conduct_daily(&self, date: NaiveDate) -> ExperimentResult<DailySummary> {
        timed("conduct_daily", self.metrics.as_deref(), || {
            let experiments = self.store.active_experiments()?;
            let mut summary = DailySummary::default();
            let mut touched = std::collections::BTreeSet::new();

            for phase in &self.phases {
                for experiment in &experiments {
                    if !phase.applies(experiment, date) {
                        continue;
                    }
                    touched.insert(experiment.experiment_id.as_str());
                    let events = self.run_phase(phase.as_ref(), experiment, date)?;
                    summary.absorb(&events);
                }
            }

            summary.experiments_run = touched.len();
            log::info!("Daily run for {date}: {summary:?}");
            Ok(summary)
        })
    }

    fn run_phase(
        &self,
        phase: &dyn DailyPhase,
        experiment: &Experiment,
        date: NaiveDate,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        let ctx = self.context(date);
        let mut rng = self.rng_bank.for_experiment(&experiment.lookup_name, date);
        let label = format!("{}.{}", experiment.lookup_name, phase.name());
        let events = timed(&label, self.metrics.as_deref(), || {
            phase.run(&ctx, experiment, &mut rng)
        })?;
        self.persist(date, phase.name(), &events)?;
        Ok(events)
    }

    // ── Manual operations ──────────────────────────────────────

    /// Look up an experiment by lookup name, with its groups and templates.
    pub fn experiment(&self, lookup_name: &str) -> ExperimentResult<Experiment> {
        self.store
            .experiment_by_lookup_name(lookup_name)?
            .ok_or_else(|| ExperimentError::ExperimentNotFound {
                lookup_name: lookup_name.to_string(),
            })
    }

    /// Run enrollment for one experiment with explicit filters and limit.
    pub fn enroll_patients(
        &self,
        lookup_name: &str,
        date: NaiveDate,
        filters: &FilterSpec,
        limit: i64,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        let experiment = self.experiment(lookup_name)?;
        let ctx = self.context(date);
        let mut rng = self.rng_bank.for_experiment(&experiment.lookup_name, date);
        let label = format!("{lookup_name}.enroll_patients");
        let events = timed(&label, self.metrics.as_deref(), || {
            enrollment::enroll_patients(&ctx, &experiment, filters, limit, &mut rng)
        })?;
        self.persist(date, "enroll_patients", &events)?;
        Ok(events)
    }

    pub fn enroll_preselected(
        &self,
        lookup_name: &str,
        date: NaiveDate,
        patient_ids: &[PatientId],
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        let experiment = self.experiment(lookup_name)?;
        let ctx = self.context(date);
        let mut rng = self.rng_bank.for_experiment(&experiment.lookup_name, date);
        let label = format!("{lookup_name}.enroll_preselected");
        let events = timed(&label, self.metrics.as_deref(), || {
            enrollment::enroll_preselected(&ctx, &experiment, patient_ids, &mut rng)
        })?;
        self.persist(date, "enroll_preselected", &events)?;
        Ok(events)
    }

    pub fn apply_command(
        &self,
        command: &OperatorCommand,
        date: NaiveDate,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        log::info!("Operator command on {date}: {command:?}");
        let events = match command {
            OperatorCommand::Activate { lookup_name, mode } => {
                let experiment = self.experiment(lookup_name)?;
                let target = mode.state();
                if experiment.cancelled_at.is_some() {
                    return Err(invalid_transition(&experiment, "cancelled", target));
                }
                if experiment.state == target {
                    Vec::new()
                } else if experiment.state.is_active() {
                    return Err(invalid_transition(&experiment, experiment.state.as_str(), target));
                } else {
                    require_groups(&experiment)?;
                    self.change_state(&experiment, target)?
                }
            }
            OperatorCommand::Deactivate { lookup_name } => {
                let experiment = self.experiment(lookup_name)?;
                if experiment.state.is_active() {
                    self.change_state(&experiment, ExperimentState::Inactive)?
                } else {
                    Vec::new()
                }
            }
            OperatorCommand::Cancel { lookup_name } => return self.cancel(lookup_name, date),
        };
        self.persist(date, COMMAND_PHASE, &events)?;
        Ok(events)
    }

    /// Cancel pending notifications and deactivate in one transaction.
    /// Cancelling twice is a no-op.
    pub fn cancel(&self, lookup_name: &str, date: NaiveDate) -> ExperimentResult<Vec<ExperimentEvent>> {
        let experiment = self.experiment(lookup_name)?;
        if experiment.cancelled_at.is_some() {
            log::debug!("{lookup_name} already cancelled");
            return Ok(Vec::new());
        }

        let at = now();
        let cancelled = self.store.in_transaction(|store| {
            let count = store.cancel_pending_notifications(&experiment.experiment_id, at)?;
            store.mark_experiment_cancelled(&experiment.experiment_id, at)?;
            Ok(count)
        })?;
        log::info!("{lookup_name}: cancelled with {cancelled} pending notifications");

        let mut events = Vec::new();
        if experiment.state.is_active() {
            events.push(ExperimentEvent::ExperimentStateChanged {
                experiment_id: experiment.experiment_id.clone(),
                from:          experiment.state,
                to:            ExperimentState::Inactive,
            });
        }
        events.push(ExperimentEvent::ExperimentCancelled {
            experiment_id:           experiment.experiment_id.clone(),
            notifications_cancelled: cancelled,
        });
        self.persist(date, COMMAND_PHASE, &events)?;
        Ok(events)
    }

    fn change_state(
        &self,
        experiment: &Experiment,
        to: ExperimentState,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        self.store.set_experiment_state(&experiment.experiment_id, to, now())?;
        log::info!(
            "{}: {} -> {}",
            experiment.lookup_name,
            experiment.state.as_str(),
            to.as_str()
        );
        Ok(vec![ExperimentEvent::ExperimentStateChanged {
            experiment_id: experiment.experiment_id.clone(),
            from:          experiment.state,
            to,
        }])
    }

    // ── Delivery ───────────────────────────────────────────────

    pub fn dispatch_due(
        &self,
        date: NaiveDate,
        channel: &dyn DeliveryChannel,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        let events = timed("dispatch_due", self.metrics.as_deref(), || {
            delivery::dispatch_due(&self.store, date, channel, self.config.batch_size)
        })?;
        self.persist(date, DISPATCH_PHASE, &events)?;
        Ok(events)
    }

    pub fn record_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        at: NaiveDateTime,
    ) -> ExperimentResult<ExperimentEvent> {
        let event = delivery::record_delivery_status(&self.store, provider_message_id, status, at)?;
        self.persist(at.date(), DISPATCH_PHASE, std::slice::from_ref(&event))?;
        Ok(event)
    }

    // ── Event log ──────────────────────────────────────────────

    /// Query events for a run date. Used by tests and replay tooling.
    pub fn events_for_date(&self, date: NaiveDate) -> ExperimentResult<Vec<EventLogEntry>> {
        self.store.events_for_date(date)
    }

    fn persist(&self, date: NaiveDate, phase: &str, events: &[ExperimentEvent]) -> ExperimentResult<()> {
        for event in events {
            self.store.append_event(&EventLogEntry::from_event(date, phase, event)?)?;
        }
        Ok(())
    }

    fn context(&self, date: NaiveDate) -> PhaseContext<'_> {
        PhaseContext {
            store:  &self.store,
            config: &self.config,
            date,
        }
    }
}

fn invalid_transition(experiment: &Experiment, from: &str, to: ExperimentState) -> ExperimentError {
    ExperimentError::InvalidTransition {
        lookup_name: experiment.lookup_name.clone(),
        from:        from.to_string(),
        to:          to.as_str().to_string(),
    }
}
