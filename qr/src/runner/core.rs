//! Collection runner
//!
//! The per-run orchestrator: plugin preparation, option merging, the
//! external-library gate, validation, the iteration loop, and result
//! aggregation. Each iteration gets a fresh context and a fresh task
//! graph; variable layers, the cookie jar, and execution history are
//! carried from one iteration to the next through the script queue.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use questplugin::{PluginRegistry, load_required, resolve_plugins};

use crate::collection::analyzer::analyze;
use crate::collection::filter::{FilterSpec, apply_filter};
use crate::collection::model::{Collection, Variable};
use crate::collection::options::RunOptions;
use crate::collection::path;
use crate::collection::validator::validate;
use crate::context::{ExecutionContext, IterationSource};
use crate::cookies::CookieJar;
use crate::error::{RunnerError, ScriptPhase};
use crate::events::bus::{EventBus, RunEmitter};
use crate::events::types::RunEvent;
use crate::graph::compiler::compile;
use crate::libload::LibraryLoader;
use crate::scheduler::core::{RunSignals, run_graph};
use crate::script::queue::ScriptQueue;
use crate::util::non_blank;
use crate::vars::ScopeStack;

use super::result::{ExecutionRecord, RequestResult, RunResult, RunSummary};

/// Everything the embedder chooses about a run
#[derive(Default)]
pub struct RunnerConfig {
    /// Directories scanned for `plugin-*` packages
    pub plugin_dirs: Vec<PathBuf>,
    /// Run-level option overrides, deep-merged over collection options.
    /// Sparse on purpose: only set what should override.
    pub options: Value,
    /// Named environment selected for this run
    pub environment: BTreeMap<String, Variable>,
    /// Process-level variables
    pub globals: BTreeMap<String, Variable>,
    /// Optional request filter
    pub filter: Option<FilterSpec>,
    /// External abort signal; when supplied, the caller owns
    /// cancellation and bail does not fire
    pub abort: Option<CancellationToken>,
}

/// Runs collections
pub struct Runner {
    config: RunnerConfig,
    registry: Arc<PluginRegistry>,
    bus: Arc<EventBus>,
}

/// Variable layers and shared resources that survive across iterations
struct Carried {
    collection_vars: BTreeMap<String, Variable>,
    environment: BTreeMap<String, Variable>,
    globals: BTreeMap<String, Variable>,
    jar: CookieJar,
    history: Vec<ExecutionRecord>,
}

impl Runner {
    /// Create a runner with its own registry and event bus
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_registry(config, Arc::new(PluginRegistry::new()))
    }

    /// Create a runner over an existing registry (native plugins are
    /// registered there before the run)
    pub fn with_registry(config: RunnerConfig, registry: Arc<PluginRegistry>) -> Self {
        Self {
            config,
            registry,
            bus: Arc::new(EventBus::with_default_capacity()),
        }
    }

    /// The event bus reporters subscribe to
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// The plugin registry backing this runner
    pub fn registry(&self) -> Arc<PluginRegistry> {
        Arc::clone(&self.registry)
    }

    /// Execute a collection to completion
    pub async fn run(&self, collection: Collection) -> Result<RunResult, RunnerError> {
        let started = Instant::now();
        info!(collection = %collection.info.name, protocol = %collection.info.protocol, "Run starting");

        // Plugin preparation: scan, analyze, load what is required
        if !self.config.plugin_dirs.is_empty() {
            let resolved = resolve_plugins(&self.config.plugin_dirs)?;
            let requirements = analyze(&collection);
            let report = load_required(&resolved, &requirements, &self.registry).await;
            for failure in &report.failures {
                warn!(error = %failure, "Plugin failed to load; dependent requests will fail on demand");
            }
        }

        // The collection's protocol plugin must exist up front
        let protocol = collection.info.protocol.trim().to_string();
        self.registry
            .protocol(&protocol)
            .map_err(|e| RunnerError::MissingPlugin(e.to_string()))?;

        let options = RunOptions::resolve(&collection.options, &self.config.options)?;

        // External libraries: explicit gate, then fetch and re-init the
        // engine with the result (the queue spawns with them below)
        let mut library_loader = LibraryLoader::new(options.library_registry.as_deref());
        let libraries = library_loader.load_all(&options).await?;

        let working = match &self.config.filter {
            Some(filter) => apply_filter(&collection, filter),
            None => collection.clone(),
        };

        let emitter = self.bus.emitter_for(working.info.clone());
        let validation = validate(&working, &options, &self.registry);
        if options.execution.strict && !validation.is_ok() {
            info!(issues = validation.issues.len(), "Validation failed; run will not start");
            emitter.emit(RunEvent::BeforeRun {
                envelope: emitter.collection_envelope(),
            });
            emitter.emit(RunEvent::AfterRun {
                envelope: emitter.collection_envelope(),
                summary: RunSummary::default(),
                aborted: false,
            });
            return Ok(RunResult {
                collection: working.info.clone(),
                iterations: 0,
                results: Vec::new(),
                summary: RunSummary::default(),
                aborted: false,
                abort_reason: None,
                validation_errors: validation.issues,
                expected_tests: validation.expected_tests,
            });
        }
        if !validation.is_ok() {
            for issue in &validation.issues {
                warn!(%issue, "Validation finding (non-strict)");
            }
        }

        // Fail configuration problems before any event is emitted
        compile(&working, &options.execution)?;

        let total_iterations = iteration_plan(&working, &options);
        let signals = RunSignals::new(self.config.abort.clone());
        let options = Arc::new(options);
        let (queue, queue_join) = ScriptQueue::spawn(Arc::clone(&self.registry), Arc::clone(&options), libraries)?;

        emitter.emit(RunEvent::BeforeRun {
            envelope: emitter.collection_envelope(),
        });

        let mut carried = Carried {
            collection_vars: working.variables.clone(),
            environment: self.config.environment.clone(),
            globals: self.config.globals.clone(),
            jar: CookieJar::new(),
            history: Vec::new(),
        };
        let mut results: Vec<RequestResult> = Vec::new();
        let mut aborted = false;
        let mut abort_reason: Option<String> = None;

        // Collection pre-script: once per run, not per iteration
        if let Some(source) = non_blank(working.collection_pre_script.as_deref()) {
            let ctx = build_context(&working, &signals, &emitter, &mut carried, 0, total_iterations);
            queue.install_context(ctx).await?;
            let outcome = queue
                .run_lifecycle_script(source.to_string(), ScriptPhase::CollectionPre, path::collection())
                .await;
            harvest(queue.take_context().await?, &mut carried);
            if let Err(e) = outcome {
                warn!(error = %e, "Collection pre-script failed; aborting run");
                aborted = true;
                abort_reason = Some(e.to_string());
                signals.abort.cancel();
            }
        }

        if !aborted {
            for iteration in 0..total_iterations {
                if signals.abort.is_cancelled() {
                    aborted = true;
                    break;
                }
                let iteration_emitter = emitter.for_iteration(iteration, total_iterations);
                iteration_emitter.emit(RunEvent::BeforeIteration {
                    envelope: iteration_emitter.collection_envelope(),
                });

                let ctx = build_context(&working, &signals, &iteration_emitter, &mut carried, iteration, total_iterations);
                queue.install_context(ctx).await?;

                let graph = match compile(&working, &options.execution) {
                    Ok(graph) => graph,
                    Err(e) => {
                        aborted = true;
                        abort_reason = Some(e.to_string());
                        harvest(queue.take_context().await?, &mut carried);
                        break;
                    }
                };
                debug!(iteration, nodes = graph.len(), "Iteration starting");

                let outcome = run_graph(
                    graph,
                    queue.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&options),
                    iteration_emitter.clone(),
                    protocol.clone(),
                    iteration,
                    signals.clone(),
                )
                .await;

                results.extend(outcome.results);
                harvest(queue.take_context().await?, &mut carried);
                iteration_emitter.emit(RunEvent::AfterIteration {
                    envelope: iteration_emitter.collection_envelope(),
                });

                if let Some(fatal) = outcome.fatal {
                    aborted = true;
                    abort_reason = Some(fatal.to_string());
                    break;
                }
                if signals.abort.is_cancelled() {
                    aborted = true;
                    break;
                }
            }
        }

        if aborted && abort_reason.is_none() {
            abort_reason = Some(if signals.bail_fired.load(std::sync::atomic::Ordering::SeqCst) {
                "bail: a test failed".to_string()
            } else {
                "aborted by caller".to_string()
            });
        }

        // Collection post-script: once, skipped when the run aborted
        if !aborted {
            if let Some(source) = non_blank(working.collection_post_script.as_deref()) {
                let ctx = build_context(&working, &signals, &emitter, &mut carried, total_iterations.saturating_sub(1), total_iterations);
                queue.install_context(ctx).await?;
                let outcome = queue
                    .run_lifecycle_script(source.to_string(), ScriptPhase::CollectionPost, path::collection())
                    .await;
                harvest(queue.take_context().await?, &mut carried);
                if let Err(e) = outcome {
                    warn!(error = %e, "Collection post-script failed");
                    aborted = true;
                    abort_reason = Some(e.to_string());
                }
            }
        }

        queue.shutdown();
        let _ = queue_join.await;

        let mut summary = RunSummary::default();
        for result in &results {
            summary.absorb(result);
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;

        emitter.emit(RunEvent::AfterRun {
            envelope: emitter.collection_envelope(),
            summary,
            aborted,
        });
        info!(
            requests = summary.total_requests,
            tests = summary.total_tests,
            failed = summary.failed_tests,
            aborted,
            "Run complete"
        );

        Ok(RunResult {
            collection: working.info.clone(),
            iterations: total_iterations,
            results,
            summary,
            aborted,
            abort_reason,
            validation_errors: Vec::new(),
            expected_tests: validation.expected_tests,
        })
    }
}

/// `min(cap, |testData|)` with data; `cap or 1` without
fn iteration_plan(collection: &Collection, options: &RunOptions) -> u32 {
    let data_rows = collection.test_data.len() as u32;
    match (options.iterations, data_rows) {
        (Some(cap), 0) => cap.max(1),
        (None, 0) => 1,
        (Some(cap), rows) => cap.min(rows).max(1),
        (None, rows) => rows,
    }
}

/// Assemble a fresh per-iteration context from the carried state
fn build_context(
    collection: &Collection,
    signals: &RunSignals,
    emitter: &RunEmitter,
    carried: &mut Carried,
    iteration: u32,
    total: u32,
) -> ExecutionContext {
    let row = collection.test_data.get(iteration as usize).cloned();
    ExecutionContext {
        collection: collection.info.clone(),
        protocol: collection.info.protocol.trim().to_string(),
        scopes: ScopeStack::new(collection.info.id.clone(), carried.collection_vars.clone()),
        environment: std::mem::take(&mut carried.environment),
        globals: std::mem::take(&mut carried.globals),
        iteration,
        iteration_total: total,
        iteration_source: if row.is_some() { IterationSource::Data } else { IterationSource::Cap },
        iteration_row: row,
        jar: std::mem::take(&mut carried.jar),
        abort: signals.abort.clone(),
        emitter: emitter.clone(),
        current_request: None,
        current_response: None,
        current_path: None,
        current_event: None,
        current_event_data: None,
        current_tests: Vec::new(),
        history: std::mem::take(&mut carried.history),
    }
}

/// Copy the layers that persist across iterations back out of a context
fn harvest(ctx: ExecutionContext, carried: &mut Carried) {
    carried.collection_vars = ctx.scopes.collection_vars().clone();
    carried.environment = ctx.environment;
    carried.globals = ctx.globals;
    carried.jar = ctx.jar;
    carried.history = ctx.history;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection_with_rows(rows: usize) -> Collection {
        let mut collection = Collection::default();
        for i in 0..rows {
            let mut row = serde_json::Map::new();
            row.insert("i".to_string(), json!(i));
            collection.test_data.push(row);
        }
        collection
    }

    fn options_with_cap(cap: Option<u32>) -> RunOptions {
        RunOptions {
            iterations: cap,
            ..Default::default()
        }
    }

    #[test]
    fn test_iteration_plan_without_data() {
        assert_eq!(iteration_plan(&collection_with_rows(0), &options_with_cap(None)), 1);
        assert_eq!(iteration_plan(&collection_with_rows(0), &options_with_cap(Some(5))), 5);
    }

    #[test]
    fn test_iteration_plan_with_data() {
        assert_eq!(iteration_plan(&collection_with_rows(3), &options_with_cap(None)), 3);
        assert_eq!(iteration_plan(&collection_with_rows(3), &options_with_cap(Some(2))), 2);
        assert_eq!(iteration_plan(&collection_with_rows(3), &options_with_cap(Some(10))), 3);
    }
}
