#![allow(missing_docs)]

mod checks;
mod config;
mod drain;
mod engine;
mod source;
mod stats;

pub use checks::{
    verify_backpressure, verify_burst, verify_failure, verify_flood, verify_no_reentrant_pull,
    CheckResult,
};
pub use config::{ScenarioKind, ScenarioType, TestConfig};
pub use drain::{drain, pump, DrainReport};
pub use engine::{run_scenario, verify, ScenarioRun};
pub use source::ScriptedSource;
pub use stats::{ScenarioStats, SharedStats, StatsSink};

/// Message carried by the error a failing scenario raises.
pub const FAILURE_MESSAGE: &str = "scripted source failure";

/// Chunk value for the `index`-th produced chunk.
#[inline]
pub fn chunk_value(index: u32) -> readable::Value {
    readable::Value::Number(f64::from(index))
}
