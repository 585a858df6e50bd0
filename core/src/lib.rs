pub mod clinical;
pub mod cohort;
pub mod command;
pub mod config;
pub mod delivery;
pub mod eligibility;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod event;
pub mod eviction;
pub mod experiment;
pub mod ledger;
pub mod membership;
pub mod metrics;
pub mod monitoring;
pub mod notification;
pub mod phase;
pub mod rng;
pub mod scheduler;
pub mod store;
pub mod types;
