//! Two-lane DAG scheduler

pub mod core;

pub use core::{RunSignals, SKIPPED_BY_BAIL, SKIPPED_BY_CONDITION, SchedulerOutcome, run_graph};
