//! Random treatment group assignment.
//!
//! Simple randomisation: each patient is drawn independently, weighted by
//! group weight, with no correction for imbalance already on the books.

use crate::{
    error::{ExperimentError, ExperimentResult},
    experiment::{Experiment, TreatmentGroup},
    rng::RandomSource,
};

pub struct CohortAssigner<'a> {
    groups:       Vec<&'a TreatmentGroup>,
    total_weight: f64,
}

impl<'a> CohortAssigner<'a> {
    pub fn new(experiment: &'a Experiment) -> ExperimentResult<Self> {
        let mut groups: Vec<&TreatmentGroup> = experiment.treatment_groups.iter().collect();
        if groups.is_empty() {
            return Err(ExperimentError::NoTreatmentGroups {
                experiment_id: experiment.experiment_id.clone(),
            });
        }
        // Deterministic order before drawing.
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        let total_weight: f64 = groups.iter().map(|g| g.weight.max(0.0)).sum();
        Ok(Self { groups, total_weight })
    }

    pub fn assign(&self, rng: &mut dyn RandomSource) -> &'a TreatmentGroup {
        // All-zero weights fall back to a uniform draw.
        if self.total_weight <= 0.0 {
            let idx = rng.next_u64_below(self.groups.len() as u64) as usize;
            return self.groups[idx];
        }

        let roll = rng.next_f64() * self.total_weight;
        let mut cumulative = 0.0;
        for &group in &self.groups {
            cumulative += group.weight.max(0.0);
            if roll < cumulative {
                return group;
            }
        }
        self.groups[self.groups.len() - 1]
    }
}
