//! DAG scheduler
//!
//! Drives a compiled task graph with two disjoint lanes: a single
//! script lane (folder boundaries, lifecycle scripts, conditions - all
//! of which serialize through the script queue) and a request pool of
//! `maxConcurrency` workers that only perform protocol I/O. Readiness
//! propagates by predecessor counting; completion of every node ends the
//! run, aborted or not, because aborted and skipped nodes complete
//! without running.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use questplugin::{EmitEvent, PluginRegistry, ProtocolResponse};

use crate::collection::options::RunOptions;
use crate::error::RunnerError;
use crate::events::bus::RunEmitter;
use crate::events::types::{PathType, RunEvent};
use crate::graph::node::{NodeKind, TaskGraph};
use crate::runner::result::RequestResult;
use crate::script::queue::ScriptQueue;

/// Skip reasons surfaced in `RequestResult.scriptError`
pub const SKIPPED_BY_CONDITION: &str = "Skipped by condition";
pub const SKIPPED_BY_BAIL: &str = "Skipped by bail";

/// What one graph execution produced
pub struct SchedulerOutcome {
    pub results: Vec<RequestResult>,
    /// First fail-fast error, when one aborted the run
    pub fatal: Option<RunnerError>,
}

/// Run-wide state shared across iterations
#[derive(Clone)]
pub struct RunSignals {
    /// The run's abort token (child of an external token, or owned)
    pub abort: CancellationToken,
    /// False when the caller supplied the token; bail only fires when
    /// the run owns cancellation semantics
    pub owns_abort: bool,
    /// Set once the first request of the run has dispatched; the
    /// inter-request delay is skipped for that first request
    pub first_request_done: Arc<AtomicBool>,
    /// Set when bail cancelled the run
    pub bail_fired: Arc<AtomicBool>,
}

impl RunSignals {
    pub fn new(external: Option<CancellationToken>) -> Self {
        let owns_abort = external.is_none();
        let abort = external.map(|t| t.child_token()).unwrap_or_default();
        Self {
            abort,
            owns_abort,
            first_request_done: Arc::new(AtomicBool::new(false)),
            bail_fired: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct SchedState {
    remaining: Vec<usize>,
    completed: usize,
    skipped: HashSet<usize>,
    results: Vec<RequestResult>,
    fatal: Option<RunnerError>,
}

struct Shared {
    graph: TaskGraph,
    state: Mutex<SchedState>,
    script_tx: mpsc::UnboundedSender<usize>,
    request_tx: mpsc::UnboundedSender<usize>,
    /// Cancelled when every node has completed
    drained: CancellationToken,
    queue: ScriptQueue,
    registry: Arc<PluginRegistry>,
    options: Arc<RunOptions>,
    emitter: RunEmitter,
    protocol: String,
    iteration: u32,
    signals: RunSignals,
}

/// Execute one compiled graph to completion
pub async fn run_graph(
    graph: TaskGraph,
    queue: ScriptQueue,
    registry: Arc<PluginRegistry>,
    options: Arc<RunOptions>,
    emitter: RunEmitter,
    protocol: String,
    iteration: u32,
    signals: RunSignals,
) -> SchedulerOutcome {
    let total = graph.len();
    if total == 0 {
        return SchedulerOutcome {
            results: Vec::new(),
            fatal: None,
        };
    }

    let (script_tx, mut script_rx) = mpsc::unbounded_channel::<usize>();
    let (request_tx, request_rx) = mpsc::unbounded_channel::<usize>();
    let request_rx = Arc::new(Mutex::new(request_rx));

    let shared = Arc::new(Shared {
        state: Mutex::new(SchedState {
            remaining: graph.preds.clone(),
            completed: 0,
            skipped: HashSet::new(),
            results: Vec::new(),
            fatal: None,
        }),
        graph,
        script_tx,
        request_tx,
        drained: CancellationToken::new(),
        queue,
        registry,
        options,
        emitter,
        protocol,
        iteration,
        signals,
    });

    // Seed both lanes with every root node
    for root in shared.graph.roots() {
        route(&shared, root);
    }

    let script_lane = {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = script_rx.recv() => match maybe {
                        Some(index) => process_script_node(&shared, index).await,
                        None => break,
                    },
                    _ = shared.drained.cancelled() => break,
                }
            }
        })
    };

    let pool_size = shared.options.execution.pool_size();
    let mut workers = Vec::with_capacity(pool_size);
    for worker_id in 0..pool_size {
        let shared = Arc::clone(&shared);
        let request_rx = Arc::clone(&request_rx);
        workers.push(tokio::spawn(async move {
            debug!(worker_id, "request worker starting");
            loop {
                let next = {
                    let mut rx = request_rx.lock().await;
                    tokio::select! {
                        maybe = rx.recv() => maybe,
                        _ = shared.drained.cancelled() => None,
                    }
                };
                match next {
                    Some(index) => process_request_node(&shared, index).await,
                    None => break,
                }
            }
            debug!(worker_id, "request worker stopping");
        }));
    }

    shared.drained.cancelled().await;
    script_lane.await.ok();
    for worker in workers {
        worker.await.ok();
    }

    let mut state = shared.state.lock().await;
    SchedulerOutcome {
        results: std::mem::take(&mut state.results),
        fatal: state.fatal.take(),
    }
}

/// Send a ready node to its lane
fn route(shared: &Arc<Shared>, index: usize) {
    let tx = match shared.graph.nodes[index].kind {
        NodeKind::Request => &shared.request_tx,
        _ => &shared.script_tx,
    };
    let _ = tx.send(index);
}

/// Mark a node complete and propagate readiness
async fn complete_node(shared: &Arc<Shared>, index: usize) {
    let newly_ready: Vec<usize> = {
        let mut state = shared.state.lock().await;
        state.completed += 1;
        let mut ready = Vec::new();
        for &succ in &shared.graph.succs[index] {
            state.remaining[succ] -= 1;
            if state.remaining[succ] == 0 {
                ready.push(succ);
            }
        }
        if state.completed == shared.graph.len() {
            shared.drained.cancel();
        }
        ready
    };
    for succ in newly_ready {
        route(shared, succ);
    }
}

/// Record a fail-fast error and cancel the run
async fn fail_fast(shared: &Arc<Shared>, error: RunnerError) {
    warn!(%error, "Scheduler: aborting run");
    {
        let mut state = shared.state.lock().await;
        if state.fatal.is_none() {
            state.fatal = Some(error);
        }
    }
    shared.signals.abort.cancel();
}

async fn is_skipped(shared: &Arc<Shared>, index: usize) -> bool {
    shared.state.lock().await.skipped.contains(&index)
}

/// Mark a folder's whole interior (scripts, requests, nested folders) as
/// skipped. The folder's exit stays live: it runs and no-ops because no
/// scope was pushed.
async fn skip_subtree(shared: &Arc<Shared>, folder_id: &str) {
    let Some(subtree) = shared.graph.folder_subtrees.get(folder_id) else {
        return;
    };
    debug!(%folder_id, nodes = subtree.len(), "Scheduler: skipping subtree");
    let mut state = shared.state.lock().await;
    state.skipped.extend(subtree.iter().copied());
}

async fn process_script_node(shared: &Arc<Shared>, index: usize) {
    let node = &shared.graph.nodes[index];
    debug!(id = %node.id, kind = ?node.kind, "script lane: node ready");

    if shared.signals.abort.is_cancelled() || is_skipped(shared, index).await {
        complete_node(shared, index).await;
        return;
    }

    // Conditions are scripts; they evaluate on the queue regardless of
    // the node's kind.
    if let Some(condition) = &node.condition {
        match shared.queue.eval_condition(condition.clone(), node.path.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                if node.kind == NodeKind::FolderEnter {
                    if let Some(folder_id) = &node.folder_id {
                        skip_subtree(shared, folder_id).await;
                    }
                }
                complete_node(shared, index).await;
                return;
            }
            Err(e) => {
                fail_fast(shared, e).await;
                complete_node(shared, index).await;
                return;
            }
        }
    }

    let action = match node.kind {
        NodeKind::FolderEnter => {
            let folder_id = node.folder_id.clone().unwrap_or_default();
            shared.queue.enter_folder(folder_id, node.path.clone()).await.map(|_| ())
        }
        NodeKind::FolderExit => {
            let folder_id = node.folder_id.clone().unwrap_or_default();
            shared.queue.exit_folder(folder_id, node.path.clone()).await.map(|_| ())
        }
        NodeKind::Script => match &node.script {
            Some(script) => shared
                .queue
                .run_lifecycle_script(script.source.clone(), script.phase, node.path.clone())
                .await
                .map(|_| ()),
            None => Ok(()),
        },
        NodeKind::Request => unreachable!("request nodes route to the request pool"),
    };

    if let Err(e) = action {
        fail_fast(shared, e).await;
    }
    complete_node(shared, index).await;
}

async fn process_request_node(shared: &Arc<Shared>, index: usize) {
    let node = &shared.graph.nodes[index];
    let spec = node.request.as_ref().expect("request node carries a spec");
    debug!(id = %spec.id, path = %spec.path, "request pool: node ready");

    // Aborted: short-circuit. Bail-skips surface as results; an external
    // abort leaves no trace beyond the run flag.
    if shared.signals.abort.is_cancelled() {
        if shared.signals.bail_fired.load(Ordering::SeqCst) {
            push_skipped(shared, index, SKIPPED_BY_BAIL).await;
        }
        complete_node(shared, index).await;
        return;
    }

    if is_skipped(shared, index).await {
        push_skipped(shared, index, SKIPPED_BY_CONDITION).await;
        complete_node(shared, index).await;
        return;
    }

    if let Some(condition) = &node.condition {
        match shared.queue.eval_condition(condition.clone(), node.path.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                push_skipped(shared, index, SKIPPED_BY_CONDITION).await;
                complete_node(shared, index).await;
                return;
            }
            Err(e) => {
                fail_fast(shared, e).await;
                complete_node(shared, index).await;
                return;
            }
        }
    }

    shared.emitter.emit(RunEvent::BeforeItem {
        envelope: shared.emitter.envelope(PathType::Request, &spec.path),
    });

    // Pre-phase on the script queue
    let prepared = match shared.queue.begin_request((**spec).clone()).await {
        Ok(prepared) => prepared,
        Err(e) => {
            let result = RequestResult {
                id: spec.id.clone(),
                name: spec.name.clone(),
                path: spec.path.clone(),
                iteration: shared.iteration,
                success: false,
                response: None,
                tests: Vec::new(),
                script_error: Some(e.to_string()),
                duration_ms: 0,
            };
            shared.emitter.emit(RunEvent::AfterItem {
                envelope: shared.emitter.envelope(PathType::Request, &spec.path),
                result: result.clone(),
            });
            shared.state.lock().await.results.push(result);
            fail_fast(shared, e).await;
            complete_node(shared, index).await;
            return;
        }
    };

    // Inter-request delay: awaited on the request pool so the script
    // queue stays free; skipped for the run's first request and in
    // parallel mode.
    let is_first = !shared.signals.first_request_done.swap(true, Ordering::SeqCst);
    let delay_ms = shared.options.execution.delay_ms;
    if delay_ms > 0 && !is_first && !shared.options.execution.allow_parallel {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    let plugin = match shared.registry.protocol(&shared.protocol) {
        Ok(plugin) => plugin,
        Err(e) => {
            let error = RunnerError::MissingPlugin(e.to_string());
            finish_failed(shared, index, error).await;
            return;
        }
    };

    // Each emitEvent call funnels through the script queue; the first
    // event-script failure is remembered and fails the request after I/O.
    let event_error: Arc<std::sync::Mutex<Option<RunnerError>>> = Arc::new(std::sync::Mutex::new(None));
    let emit: EmitEvent = {
        let queue = shared.queue.clone();
        let request_id = spec.id.clone();
        let event_error = Arc::clone(&event_error);
        Arc::new(move |name: String, data: Value| {
            let queue = queue.clone();
            let request_id = request_id.clone();
            let event_error = Arc::clone(&event_error);
            Box::pin(async move {
                if let Err(e) = queue.run_event_script(request_id, name, data).await {
                    let mut slot = event_error.lock().expect("event error slot");
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            })
        })
    };

    let started = Instant::now();
    let io = plugin
        .execute(prepared.request.clone(), prepared.context, prepared.options, emit)
        .await;
    let measured_ms = started.elapsed().as_millis() as u64;

    // A throwing plugin is a protocol-level failure: carried in the
    // response, asserted on by tests, never an abort by itself.
    let response = match io {
        Ok(response) => response,
        Err(e) => ProtocolResponse {
            status: 0,
            error: Some(e.to_string()),
            ..Default::default()
        },
    };
    let duration_ms = if response.duration_ms > 0 { response.duration_ms } else { measured_ms };

    // Post-phase on the script queue
    match shared.queue.finish_request(spec.id.clone(), Some(response), duration_ms).await {
        Ok(result) => {
            let script_failed = result.script_error.is_some();
            let tests_failed = result.failed_tests() > 0;
            shared.state.lock().await.results.push(result);

            let event_failure = event_error.lock().expect("event error slot").take();
            if let Some(event_failure) = event_failure {
                fail_fast(shared, event_failure).await;
            } else if script_failed {
                fail_fast(
                    shared,
                    RunnerError::script(crate::error::ScriptPhase::PostRequest, "post-request script failed"),
                )
                .await;
            } else if tests_failed && shared.options.execution.bail && shared.signals.owns_abort {
                debug!(id = %spec.id, "bail: first failed test, cancelling run");
                shared.signals.bail_fired.store(true, Ordering::SeqCst);
                shared.signals.abort.cancel();
            }
        }
        Err(e) => {
            finish_failed(shared, index, e).await;
            return;
        }
    }

    complete_node(shared, index).await;
}

/// Record a failed result for a request that never reached its
/// post-phase, then fail-fast and complete the node.
async fn finish_failed(shared: &Arc<Shared>, index: usize, error: RunnerError) {
    let node = &shared.graph.nodes[index];
    let spec = node.request.as_ref().expect("request node carries a spec");
    let result = RequestResult {
        id: spec.id.clone(),
        name: spec.name.clone(),
        path: spec.path.clone(),
        iteration: shared.iteration,
        success: false,
        response: None,
        tests: Vec::new(),
        script_error: Some(error.to_string()),
        duration_ms: 0,
    };
    shared.emitter.emit(RunEvent::AfterItem {
        envelope: shared.emitter.envelope(PathType::Request, &spec.path),
        result: result.clone(),
    });
    shared.state.lock().await.results.push(result);
    fail_fast(shared, error).await;
    complete_node(shared, index).await;
}

/// Emit the item bracket for a request that never ran and record its
/// skipped result.
async fn push_skipped(shared: &Arc<Shared>, index: usize, reason: &str) {
    let node = &shared.graph.nodes[index];
    let spec = node.request.as_ref().expect("request node carries a spec");
    let result = RequestResult::skipped(&spec.id, &spec.name, &spec.path, shared.iteration, reason);
    shared.emitter.emit(RunEvent::BeforeItem {
        envelope: shared.emitter.envelope(PathType::Request, &spec.path),
    });
    shared.emitter.emit(RunEvent::AfterItem {
        envelope: shared.emitter.envelope(PathType::Request, &spec.path),
        result: result.clone(),
    });
    shared.state.lock().await.results.push(result);
}
