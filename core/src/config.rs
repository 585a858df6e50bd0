use crate::{
    eligibility::FilterSpec,
    error::ExperimentResult,
    experiment::{Experiment, ExperimentState, ExperimentType, ReminderTemplate, TreatmentGroup},
    store::ExperimentStore,
    types::new_id,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSeed {
    pub remind_on_in_days: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSeed {
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub reminder_templates: Vec<TemplateSeed>,
}

/// Declarative description of one experiment, as read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSeed {
    pub lookup_name: String,
    pub experiment_type: ExperimentType,
    #[serde(default = "default_state")]
    pub state: ExperimentState,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_patients_per_day: i64,
    #[serde(default)]
    pub filters: FilterSpec,
    pub treatment_groups: Vec<GroupSeed>,
}

impl ExperimentSeed {
    /// Materialise the seed with fresh identifiers.
    pub fn build(&self) -> Experiment {
        let experiment_id = new_id();
        let treatment_groups = self
            .treatment_groups
            .iter()
            .map(|g| {
                let group_id = new_id();
                TreatmentGroup {
                    templates: g
                        .reminder_templates
                        .iter()
                        .map(|t| ReminderTemplate {
                            template_id: new_id(),
                            treatment_group_id: group_id.clone(),
                            remind_on_in_days: t.remind_on_in_days,
                            message: t.message.clone(),
                        })
                        .collect(),
                    group_id,
                    experiment_id: experiment_id.clone(),
                    description: g.description.clone(),
                    weight: g.weight,
                }
            })
            .collect();
        Experiment {
            experiment_id,
            lookup_name: self.lookup_name.clone(),
            state: self.state,
            experiment_type: self.experiment_type,
            start_date: self.start_date,
            end_date: self.end_date,
            max_patients_per_day: self.max_patients_per_day,
            filters: self.filters.clone(),
            cancelled_at: None,
            treatment_groups,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_state() -> ExperimentState {
    ExperimentState::Inactive
}

fn default_batch_size() -> usize {
    1000
}

fn default_min_patient_age() -> u32 {
    18
}

/// Runtime configuration for the daily driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Rows per page for eligibility and monitoring scans.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Patients enrolled anywhere within this many days are not eligible again.
    pub monitoring_buffer_days: i64,
    /// Extra days after a template's due date on which it may still be scheduled.
    #[serde(default)]
    pub schedule_catch_up_days: i64,
    #[serde(default = "default_min_patient_age")]
    pub min_patient_age: u32,
    pub master_seed: u64,
    #[serde(default)]
    pub experiments: Vec<ExperimentSeed>,
}

impl ExperimentConfig {
    /// Load from `{data_dir}/experiment_config.json`.
    /// In tests, use ExperimentConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/experiment_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {path}: {e}"))?;
        if config.batch_size == 0 {
            anyhow::bail!("{path}: batch_size must be positive");
        }
        Ok(config)
    }

    /// Hard-coded config for tests. No experiments; tests seed their own.
    pub fn default_test() -> Self {
        Self {
            batch_size: 1000,
            monitoring_buffer_days: 14,
            schedule_catch_up_days: 0,
            min_patient_age: 18,
            master_seed: 42,
            experiments: Vec::new(),
        }
    }

    /// Persist configured experiments that are not in the store yet.
    /// Existing lookup names are left untouched.
    pub fn seed_experiments(&self, store: &ExperimentStore) -> ExperimentResult<Vec<Experiment>> {
        let mut created = Vec::new();
        for seed in &self.experiments {
            if store.experiment_by_lookup_name(&seed.lookup_name)?.is_some() {
                log::debug!("Experiment '{}' already present, not seeding", seed.lookup_name);
                continue;
            }
            let experiment = seed.build();
            store.insert_experiment(&experiment)?;
            log::info!(
                "Seeded experiment '{}' with {} treatment groups",
                experiment.lookup_name,
                experiment.treatment_groups.len()
            );
            created.push(experiment);
        }
        Ok(created)
    }
}
