//! Execution context - the per-iteration mutable state
//!
//! One context exists per iteration and is owned by the script queue's
//! worker for its whole life; request workers only ever see immutable
//! snapshots taken on the queue. The `current_*` slots are set inside
//! queued commands, never speculatively, so scripts running on the queue
//! observe a consistent view even while I/O overlaps.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use questplugin::{ProtocolRequest, ProtocolResponse};

use crate::collection::model::{CollectionInfo, Variable};
use crate::cookies::CookieJar;
use crate::events::RunEmitter;
use crate::runner::result::{ExecutionRecord, TestResult};
use crate::vars::ScopeStack;

/// Where the iteration count came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationSource {
    /// Rows of `testData` drive the iterations
    Data,
    /// A bare iteration cap (no data rows)
    Cap,
}

/// The per-iteration execution state
pub struct ExecutionContext {
    pub collection: CollectionInfo,
    pub protocol: String,

    /// LIFO variable frames; bottom is the collection scope
    pub scopes: ScopeStack,
    /// Named environment selected for the run; writes persist run-wide
    pub environment: BTreeMap<String, Variable>,
    /// Process-level variables supplied by the embedder
    pub globals: BTreeMap<String, Variable>,

    pub iteration: u32,
    pub iteration_total: u32,
    pub iteration_source: IterationSource,
    /// Current `testData` row, when iterating over data
    pub iteration_row: Option<serde_json::Map<String, Value>>,

    /// Run-wide cookie jar, handed from iteration to iteration
    pub jar: CookieJar,
    /// Run-wide abort signal
    pub abort: CancellationToken,
    /// Event sink bound to this iteration
    pub emitter: RunEmitter,

    /// Set by the queue during a request's pre-phase
    pub current_request: Option<ProtocolRequest>,
    /// Set by the queue during a request's post-phase
    pub current_response: Option<ProtocolResponse>,
    /// Typed path of the item whose script is executing
    pub current_path: Option<String>,
    /// Plugin event name, while an event script is executing
    pub current_event: Option<String>,
    /// Payload the plugin emitted with the current event
    pub current_event_data: Option<Value>,

    /// Tests recorded by the currently executing script invocation
    pub current_tests: Vec<TestResult>,
    /// Completed requests, oldest first
    pub history: Vec<ExecutionRecord>,
}

impl ExecutionContext {
    /// Flattened variable view: globals lowest, then environment, then
    /// the scope stack (innermost frame wins), with the iteration row
    /// underneath everything as a read-only floor.
    pub fn flatten_variables(&self) -> serde_json::Map<String, Value> {
        let mut flat = serde_json::Map::new();
        if let Some(row) = &self.iteration_row {
            for (name, value) in row {
                flat.insert(name.clone(), value.clone());
            }
        }
        for layer in [&self.globals, &self.environment] {
            for (name, variable) in layer {
                if variable.enabled() {
                    flat.insert(name.clone(), Value::String(variable.value().to_string()));
                }
            }
        }
        for (name, variable) in self.scopes.flatten() {
            flat.insert(name, Value::String(variable.value().to_string()));
        }
        flat
    }

    /// Drain the tests recorded by the last script invocation
    pub fn take_tests(&mut self) -> Vec<TestResult> {
        std::mem::take(&mut self.current_tests)
    }
}
