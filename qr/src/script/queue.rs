//! Script execution queue
//!
//! The single-writer discipline behind every script in a run. One
//! worker on the blocking pool owns the engine and the execution
//! context; everything that touches mutable state (scope stack, cookie
//! jar, `current_*` slots, history) arrives here as a command and runs
//! to completion before the next command starts. The mpsc channel IS
//! the FIFO: plugin events, folder boundaries, and request pre/post
//! phases from concurrently executing requests all serialize through it,
//! and a busy queue back-pressures its callers because every send awaits
//! its reply.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use questplugin::{PluginContext, PluginRegistry, ProtocolRequest, ProtocolResponse};

use crate::collection::model::{Auth, ProtocolScript};
use crate::collection::options::RunOptions;
use crate::context::ExecutionContext;
use crate::error::{RunnerError, ScriptPhase};
use crate::events::types::{PathType, RunEvent, ScriptOutcome};
use crate::runner::result::{ExecutionRecord, RequestResult, TestResult};
use crate::vars::{Layers, ProviderLookup, ResolveReport, resolve_value};

use super::engine::ScriptEngine;

/// A script with the path of the item that defined it, for event envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedScript {
    pub owner_path: String,
    pub source: String,
}

/// Everything the queue needs to run a request's pre and post phases
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub id: String,
    pub name: String,
    /// Typed path, e.g. `request:/Users/Get User`
    pub path: String,
    /// Protocol-specific payload, unresolved
    pub data: Value,
    /// Compile-time resolved auth (never `inherit`; absent for `none`)
    pub effective_auth: Option<Auth>,
    /// Inherited pre scripts, collection-outward first
    pub pre_scripts: Vec<SourcedScript>,
    /// Inherited post scripts, request first
    pub post_scripts: Vec<SourcedScript>,
    /// Plugin-event scripts for this request
    pub event_scripts: Vec<ProtocolScript>,
}

/// What the pre-phase hands to the request worker
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request: ProtocolRequest,
    pub context: PluginContext,
    /// Protocol-plugin options from the run options
    pub options: Value,
}

enum ScriptCommand {
    InstallContext {
        ctx: Box<ExecutionContext>,
        reply: oneshot::Sender<()>,
    },
    TakeContext {
        reply: oneshot::Sender<Option<Box<ExecutionContext>>>,
    },
    RunLifecycleScript {
        source: String,
        phase: ScriptPhase,
        path: String,
        reply: oneshot::Sender<Result<ScriptOutcome, RunnerError>>,
    },
    EvalCondition {
        expr: String,
        path: String,
        reply: oneshot::Sender<Result<bool, RunnerError>>,
    },
    EnterFolder {
        id: String,
        path: String,
        reply: oneshot::Sender<()>,
    },
    ExitFolder {
        id: String,
        path: String,
        reply: oneshot::Sender<bool>,
    },
    BeginRequest {
        spec: Box<RequestSpec>,
        reply: oneshot::Sender<Result<PreparedRequest, RunnerError>>,
    },
    RunEventScript {
        request_id: String,
        event_name: String,
        data: Value,
        reply: oneshot::Sender<Result<(), RunnerError>>,
    },
    FinishRequest {
        request_id: String,
        response: Option<ProtocolResponse>,
        duration_ms: u64,
        reply: oneshot::Sender<Result<RequestResult, RunnerError>>,
    },
    Shutdown,
}

/// Cloneable handle to the queue
#[derive(Clone)]
pub struct ScriptQueue {
    tx: mpsc::UnboundedSender<ScriptCommand>,
}

impl ScriptQueue {
    /// Spawn the worker. Must be called from a runtime context; the
    /// worker uses the captured handle to bridge into async plugins.
    pub fn spawn(
        registry: Arc<PluginRegistry>,
        options: Arc<RunOptions>,
        libraries: HashMap<String, String>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), RunnerError> {
        let handle = Handle::current();
        let engine = ScriptEngine::new(Arc::clone(&registry), handle.clone(), libraries)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            engine,
            registry,
            options,
            handle,
            pending: HashMap::new(),
        };
        let join = tokio::task::spawn_blocking(move || worker.run(rx));
        Ok((Self { tx }, join))
    }

    async fn send<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> ScriptCommand) -> Result<R, RunnerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| RunnerError::Config("script queue worker is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| RunnerError::Config("script queue dropped a reply".to_string()))
    }

    /// Hand a fresh iteration context to the worker
    pub async fn install_context(&self, ctx: ExecutionContext) -> Result<(), RunnerError> {
        self.send(|reply| ScriptCommand::InstallContext { ctx: Box::new(ctx), reply }).await
    }

    /// Take the context back at the end of an iteration
    pub async fn take_context(&self) -> Result<ExecutionContext, RunnerError> {
        self.send(|reply| ScriptCommand::TakeContext { reply })
            .await?
            .map(|b| *b)
            .ok_or_else(|| RunnerError::Config("no context installed".to_string()))
    }

    /// Run a collection/folder lifecycle script; events are emitted on
    /// the queue, the returned error drives fail-fast.
    pub async fn run_lifecycle_script(
        &self,
        source: String,
        phase: ScriptPhase,
        path: String,
    ) -> Result<ScriptOutcome, RunnerError> {
        self.send(|reply| ScriptCommand::RunLifecycleScript {
            source,
            phase,
            path,
            reply,
        })
        .await?
    }

    /// Evaluate an item condition on the queue
    pub async fn eval_condition(&self, expr: String, path: String) -> Result<bool, RunnerError> {
        self.send(|reply| ScriptCommand::EvalCondition { expr, path, reply }).await?
    }

    /// Push the folder scope and emit `beforeFolder`
    pub async fn enter_folder(&self, id: String, path: String) -> Result<(), RunnerError> {
        self.send(|reply| ScriptCommand::EnterFolder { id, path, reply }).await
    }

    /// Pop the folder scope if its enter actually ran; returns whether
    /// a frame was popped (and `afterFolder` emitted)
    pub async fn exit_folder(&self, id: String, path: String) -> Result<bool, RunnerError> {
        self.send(|reply| ScriptCommand::ExitFolder { id, path, reply }).await
    }

    /// Run the request pre-phase; returns the prepared request snapshot
    pub async fn begin_request(&self, spec: RequestSpec) -> Result<PreparedRequest, RunnerError> {
        self.send(|reply| ScriptCommand::BeginRequest {
            spec: Box::new(spec),
            reply,
        })
        .await?
    }

    /// Funnel a plugin-emitted event's scripts through the queue
    pub async fn run_event_script(
        &self,
        request_id: String,
        event_name: String,
        data: Value,
    ) -> Result<(), RunnerError> {
        self.send(|reply| ScriptCommand::RunEventScript {
            request_id,
            event_name,
            data,
            reply,
        })
        .await?
    }

    /// Run the request post-phase; returns the complete request result
    pub async fn finish_request(
        &self,
        request_id: String,
        response: Option<ProtocolResponse>,
        duration_ms: u64,
    ) -> Result<RequestResult, RunnerError> {
        self.send(|reply| ScriptCommand::FinishRequest {
            request_id,
            response,
            duration_ms,
            reply,
        })
        .await?
    }

    /// Stop the worker once queued commands drain
    pub fn shutdown(&self) {
        let _ = self.tx.send(ScriptCommand::Shutdown);
    }
}

/// A request between its pre and post phases
struct Pending {
    spec: RequestSpec,
    prepared: ProtocolRequest,
    tests: Vec<TestResult>,
}

/// Bridges `{{$provider:key}}` lookups to registry plugins
struct RegistryProviders {
    registry: Arc<PluginRegistry>,
    handle: Handle,
}

impl ProviderLookup for RegistryProviders {
    fn get(&self, provider: &str, key: &str) -> Result<Option<String>, String> {
        let plugin = self.registry.provider(provider).map_err(|e| e.to_string())?;
        self.handle.block_on(plugin.get_value(key, None)).map_err(|e| e.to_string())
    }
}

struct Worker {
    engine: ScriptEngine,
    registry: Arc<PluginRegistry>,
    options: Arc<RunOptions>,
    handle: Handle,
    pending: HashMap<String, Pending>,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<ScriptCommand>) {
        debug!("ScriptQueue worker starting");
        while let Some(command) = rx.blocking_recv() {
            match command {
                ScriptCommand::InstallContext { ctx, reply } => {
                    self.engine.install_context(*ctx);
                    let _ = reply.send(());
                }
                ScriptCommand::TakeContext { reply } => {
                    let _ = reply.send(self.engine.take_context().map(Box::new));
                }
                ScriptCommand::RunLifecycleScript {
                    source,
                    phase,
                    path,
                    reply,
                } => {
                    let _ = reply.send(self.run_lifecycle_script(&source, phase, &path));
                }
                ScriptCommand::EvalCondition { expr, path, reply } => {
                    let _ = reply.send(self.eval_condition(&expr, &path));
                }
                ScriptCommand::EnterFolder { id, path, reply } => {
                    self.enter_folder(&id, &path);
                    let _ = reply.send(());
                }
                ScriptCommand::ExitFolder { id, path, reply } => {
                    let _ = reply.send(self.exit_folder(&id, &path));
                }
                ScriptCommand::BeginRequest { spec, reply } => {
                    let _ = reply.send(self.begin_request(*spec));
                }
                ScriptCommand::RunEventScript {
                    request_id,
                    event_name,
                    data,
                    reply,
                } => {
                    let _ = reply.send(self.run_event_script(&request_id, &event_name, data));
                }
                ScriptCommand::FinishRequest {
                    request_id,
                    response,
                    duration_ms,
                    reply,
                } => {
                    let _ = reply.send(self.finish_request(&request_id, response, duration_ms));
                }
                ScriptCommand::Shutdown => break,
            }
        }
        debug!("ScriptQueue worker stopping");
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.engine.with_ctx(|ctx| ctx.emitter.emit(event));
    }

    fn envelope(&self, path_type: PathType, path: &str) -> Result<crate::events::Envelope, RunnerError> {
        self.engine.with_ctx(|ctx| ctx.emitter.envelope(path_type, path))
    }

    fn run_lifecycle_script(&mut self, source: &str, phase: ScriptPhase, path: &str) -> Result<ScriptOutcome, RunnerError> {
        let path_type = if path.starts_with("folder:") {
            PathType::Folder
        } else {
            PathType::Collection
        };

        self.engine.with_ctx(|ctx| ctx.current_path = Some(path.to_string()))?;
        self.emit(before_script_event(phase, self.envelope(path_type, path)?));

        let run = self.engine.exec(source, &format!("{phase}:{path}"), phase);
        let outcome = match &run {
            Ok(duration_ms) => ScriptOutcome {
                success: true,
                error: None,
                duration_ms: *duration_ms,
            },
            Err(e) => ScriptOutcome {
                success: false,
                error: Some(e.to_string()),
                duration_ms: 0,
            },
        };

        self.emit(after_script_event(phase, self.envelope(path_type, path)?, outcome.clone()));
        self.engine.with_ctx(|ctx| {
            ctx.current_path = None;
            ctx.current_tests.clear();
        })?;

        run.map(|_| outcome)
    }

    fn eval_condition(&mut self, expr: &str, path: &str) -> Result<bool, RunnerError> {
        self.engine.with_ctx(|ctx| ctx.current_path = Some(path.to_string()))?;
        let result = self.engine.eval_condition(expr, &format!("condition:{path}"));
        self.engine.with_ctx(|ctx| ctx.current_path = None)?;
        result
    }

    fn enter_folder(&mut self, id: &str, path: &str) {
        debug!(%id, %path, "ScriptQueue: enter folder");
        let pushed = self.engine.with_ctx(|ctx| {
            ctx.scopes.push_folder(id);
            ctx.emitter.envelope(PathType::Folder, path)
        });
        if let Ok(envelope) = pushed {
            self.emit(RunEvent::BeforeFolder { envelope });
        }
    }

    fn exit_folder(&mut self, id: &str, path: &str) -> bool {
        debug!(%id, %path, "ScriptQueue: exit folder");
        let popped = self
            .engine
            .with_ctx(|ctx| {
                if ctx.scopes.top_is(id) {
                    ctx.scopes.pop_frame(id);
                    true
                } else {
                    // The matching enter was skipped; nothing to pop
                    false
                }
            })
            .unwrap_or(false);
        if popped {
            if let Ok(envelope) = self.envelope(PathType::Folder, path) {
                self.emit(RunEvent::AfterFolder { envelope });
            }
        }
        popped
    }

    /// Pre-phase: scope push, inherited pre-scripts, variable resolution,
    /// effective auth, cookie snapshot, `current_request` assignment.
    fn begin_request(&mut self, spec: RequestSpec) -> Result<PreparedRequest, RunnerError> {
        debug!(id = %spec.id, path = %spec.path, "ScriptQueue: begin request");
        self.engine.with_ctx(|ctx| {
            ctx.scopes.push_request(&spec.id);
            ctx.current_path = Some(spec.path.clone());
            ctx.current_tests.clear();
        })?;

        for script in &spec.pre_scripts {
            self.emit(RunEvent::BeforePreScript {
                envelope: self.envelope(PathType::Request, &spec.path)?,
            });
            let run = self
                .engine
                .exec(&script.source, &format!("pre:{}", script.owner_path), ScriptPhase::PreRequest);
            let outcome = script_outcome(&run);
            self.emit(RunEvent::AfterPreScript {
                envelope: self.envelope(PathType::Request, &spec.path)?,
                outcome,
            });
            if let Err(e) = run {
                self.abandon_request(&spec.id);
                return Err(e);
            }
        }

        // Resolve variables in the protocol payload, then apply auth
        let providers = RegistryProviders {
            registry: Arc::clone(&self.registry),
            handle: self.handle.clone(),
        };
        let mut report = ResolveReport::default();
        let resolved = self.engine.with_ctx(|ctx| {
            let layers = Layers {
                scopes: &ctx.scopes,
                environment: &ctx.environment,
                globals: &ctx.globals,
                iteration_row: ctx.iteration_row.as_ref(),
            };
            resolve_value(&spec.data, &layers, &providers, &mut report)
        })?;
        let resolved = match resolved {
            Ok(value) => value,
            Err(failure) => {
                self.abandon_request(&spec.id);
                return Err(RunnerError::Plugin(questplugin::PluginError::Execution {
                    name: failure.provider.clone(),
                    reason: failure.to_string(),
                }));
            }
        };
        if !report.unresolved.is_empty() {
            warn!(id = %spec.id, unresolved = ?report.unresolved, "Unresolved template tokens left literal");
        }

        let auth_value = spec
            .effective_auth
            .as_ref()
            .map(|a| serde_json::json!({ "type": a.auth_type, "data": a.data }));
        let cookie_header = self.engine.with_ctx(|ctx| {
            let url = resolved.get("url").and_then(Value::as_str).unwrap_or("");
            ctx.jar.header_for(url)
        })?;

        let mut request = ProtocolRequest {
            id: spec.id.clone(),
            name: spec.name.clone(),
            path: spec.path.clone(),
            data: resolved,
            auth: auth_value,
            cookie_header,
        };

        if let Some(auth) = &spec.effective_auth {
            let plugin = match self.registry.auth(&auth.auth_type) {
                Ok(p) => p,
                Err(e) => {
                    self.abandon_request(&spec.id);
                    return Err(RunnerError::MissingPlugin(e.to_string()));
                }
            };
            let applied = self
                .handle
                .block_on(plugin.apply(request, &auth.data, &self.options.protocol));
            request = match applied {
                Ok(r) => r,
                Err(e) => {
                    self.abandon_request(&spec.id);
                    return Err(RunnerError::Plugin(e));
                }
            };
        }

        // The snapshot the I/O phase observes; set inside the queue,
        // never speculatively.
        let context = self.engine.with_ctx(|ctx| {
            ctx.current_request = Some(request.clone());
            PluginContext {
                protocol: ctx.protocol.clone(),
                iteration: ctx.iteration,
                iteration_total: ctx.iteration_total,
                variables: ctx.flatten_variables(),
            }
        })?;

        self.emit(RunEvent::BeforeRequest {
            envelope: self.envelope(PathType::Request, &spec.path)?,
            request: request.clone(),
        });

        self.pending.insert(
            spec.id.clone(),
            Pending {
                prepared: request.clone(),
                spec,
                tests: Vec::new(),
            },
        );

        Ok(PreparedRequest {
            request,
            context,
            options: self.options.protocol.clone(),
        })
    }

    /// Unwind the pre-phase bookkeeping after a failure
    fn abandon_request(&mut self, id: &str) {
        let _ = self.engine.with_ctx(|ctx| {
            ctx.scopes.pop_frame(id);
            ctx.current_path = None;
            ctx.current_request = None;
            ctx.current_tests.clear();
        });
        self.pending.remove(id);
    }

    /// Run the scripts registered for a plugin-emitted event
    fn run_event_script(&mut self, request_id: &str, event_name: &str, data: Value) -> Result<(), RunnerError> {
        let Some(pending) = self.pending.get(request_id) else {
            warn!(%request_id, %event_name, "Event for unknown request; dropping");
            return Ok(());
        };
        let spec_path = pending.spec.path.clone();
        let prepared = pending.prepared.clone();
        let scripts: Vec<String> = pending
            .spec
            .event_scripts
            .iter()
            .filter(|s| s.event == event_name)
            .map(|s| s.script.clone())
            .collect();
        if scripts.is_empty() {
            return Ok(());
        }

        self.engine.with_ctx(|ctx| {
            ctx.current_path = Some(spec_path.clone());
            ctx.current_event = Some(event_name.to_string());
            ctx.current_event_data = Some(data.clone());
            // Scripts observe the request they belong to, even if another
            // request's pre-phase ran since.
            ctx.current_request = Some(prepared);
        })?;

        for source in &scripts {
            self.emit(RunEvent::BeforeEventScript {
                envelope: self.envelope(PathType::Request, &spec_path)?,
                event_name: event_name.to_string(),
                data: data.clone(),
            });
            let run = self
                .engine
                .exec(source, &format!("event:{event_name}:{spec_path}"), ScriptPhase::Event);
            let outcome = script_outcome(&run);
            self.emit(RunEvent::AfterEventScript {
                envelope: self.envelope(PathType::Request, &spec_path)?,
                event_name: event_name.to_string(),
                outcome,
            });

            let recorded = self.engine.with_ctx(|ctx| ctx.take_tests())?;
            if let Some(pending) = self.pending.get_mut(request_id) {
                pending.tests.extend(recorded);
            }
            if let Err(e) = run {
                self.clear_event_slots()?;
                return Err(e);
            }
        }
        self.clear_event_slots()
    }

    fn clear_event_slots(&mut self) -> Result<(), RunnerError> {
        self.engine.with_ctx(|ctx| {
            ctx.current_event = None;
            ctx.current_event_data = None;
            ctx.current_path = None;
        })
    }

    /// Post-phase: `afterRequest`, history, post-scripts, cookies, scope
    /// pop, `afterItem`. Returns the complete request result.
    fn finish_request(
        &mut self,
        request_id: &str,
        response: Option<ProtocolResponse>,
        duration_ms: u64,
    ) -> Result<RequestResult, RunnerError> {
        debug!(%request_id, "ScriptQueue: finish request");
        let Some(mut pending) = self.pending.remove(request_id) else {
            return Err(RunnerError::Config(format!("finish for unknown request {request_id}")));
        };
        let spec = pending.spec.clone();

        self.engine.with_ctx(|ctx| {
            ctx.current_request = Some(pending.prepared.clone());
            ctx.current_response = response.clone();
            ctx.current_path = Some(spec.path.clone());
            ctx.current_tests.clear();
        })?;

        self.emit(RunEvent::AfterRequest {
            envelope: self.envelope(PathType::Request, &spec.path)?,
            response: response.clone(),
            duration_ms,
        });

        self.engine.with_ctx(|ctx| {
            ctx.history.push(ExecutionRecord {
                id: spec.id.clone(),
                name: spec.name.clone(),
                path: spec.path.clone(),
                status: response.as_ref().map(|r| r.status).unwrap_or(0),
                duration_ms,
            });
        })?;

        let mut script_error = None;
        for script in &spec.post_scripts {
            self.emit(RunEvent::BeforePostScript {
                envelope: self.envelope(PathType::Request, &spec.path)?,
            });
            let run = self
                .engine
                .exec(&script.source, &format!("post:{}", script.owner_path), ScriptPhase::PostRequest);
            let outcome = script_outcome(&run);
            self.emit(RunEvent::AfterPostScript {
                envelope: self.envelope(PathType::Request, &spec.path)?,
                outcome,
            });

            let recorded = self.engine.with_ctx(|ctx| ctx.take_tests())?;
            pending.tests.extend(recorded);

            if let Err(e) = run {
                script_error = Some(e.to_string());
                break;
            }
        }

        // Jar bookkeeping happens here, on the queue: store what the
        // response set, then clear everything when not persisting.
        let persist = self.options.jar.persist;
        self.engine.with_ctx(|ctx| {
            if let Some(response) = &response {
                let url = pending.prepared.data.get("url").and_then(Value::as_str).unwrap_or("");
                let set_cookies = response.set_cookie_headers();
                if !set_cookies.is_empty() {
                    ctx.jar.store_response_cookies(url, &set_cookies);
                }
            }
            if !persist {
                ctx.jar.clear();
            }
        })?;

        let iteration = self.engine.with_ctx(|ctx| ctx.iteration)?;
        let result = RequestResult {
            id: spec.id.clone(),
            name: spec.name.clone(),
            path: spec.path.clone(),
            iteration,
            success: script_error.is_none(),
            response,
            tests: pending.tests,
            script_error: script_error.clone(),
            duration_ms,
        };

        self.engine.with_ctx(|ctx| {
            ctx.scopes.pop_frame(&spec.id);
            ctx.current_request = None;
            ctx.current_response = None;
            ctx.current_path = None;
        })?;

        self.emit(RunEvent::AfterItem {
            envelope: self.envelope(PathType::Request, &spec.path)?,
            result: result.clone(),
        });

        // A post-script failure travels inside the result; the scheduler
        // reads `script_error` there and fail-fasts the run.
        Ok(result)
    }
}

fn script_outcome(run: &Result<u64, RunnerError>) -> ScriptOutcome {
    match run {
        Ok(duration_ms) => ScriptOutcome {
            success: true,
            error: None,
            duration_ms: *duration_ms,
        },
        Err(e) => ScriptOutcome {
            success: false,
            error: Some(e.to_string()),
            duration_ms: 0,
        },
    }
}

fn before_script_event(phase: ScriptPhase, envelope: crate::events::Envelope) -> RunEvent {
    match phase {
        ScriptPhase::CollectionPre => RunEvent::BeforeCollectionPreScript { envelope },
        ScriptPhase::CollectionPost => RunEvent::BeforeCollectionPostScript { envelope },
        ScriptPhase::FolderPre => RunEvent::BeforeFolderPreScript { envelope },
        _ => RunEvent::BeforeFolderPostScript { envelope },
    }
}

fn after_script_event(phase: ScriptPhase, envelope: crate::events::Envelope, outcome: ScriptOutcome) -> RunEvent {
    match phase {
        ScriptPhase::CollectionPre => RunEvent::AfterCollectionPreScript { envelope, outcome },
        ScriptPhase::CollectionPost => RunEvent::AfterCollectionPostScript { envelope, outcome },
        ScriptPhase::FolderPre => RunEvent::AfterFolderPreScript { envelope, outcome },
        _ => RunEvent::AfterFolderPostScript { envelope, outcome },
    }
}
