//! Run orchestration and result types

pub mod core;
pub mod result;

pub use core::{Runner, RunnerConfig};
pub use result::{ExecutionRecord, RequestResult, RunResult, RunSummary, TestResult, TestStatus};
