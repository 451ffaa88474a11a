//! questrun - collection runtime for an API-testing tool
//!
//! A collection is a tree of folders and requests carrying lifecycle
//! scripts, layered variables, auth, and dependency metadata. questrun
//! lowers that tree to a task graph, drives it with a two-lane scheduler
//! (a single script lane and a bounded request pool), runs user scripts
//! in a sandboxed Lua engine behind the `quest.*` API, and emits a
//! structured stream of lifecycle events for reporters.
//!
//! # Core Concepts
//!
//! - **One script at a time**: every script, condition, and folder
//!   boundary serializes through a single-worker queue; that discipline,
//!   not locking, is what keeps shared state race-free while requests
//!   overlap.
//! - **Graph, not tree**: folder boundaries become enter/exit nodes and
//!   `dependsOn` becomes plain precedence edges, so parallel mode falls
//!   out of readiness propagation.
//! - **Plugins as data**: protocols, auth types, and value providers
//!   resolve from on-disk `plugin-*` packages and load lazily.
//!
//! # Modules
//!
//! - [`collection`] - the input model and the passes over it
//! - [`graph`] - task-graph compilation
//! - [`scheduler`] - the two-lane DAG scheduler
//! - [`script`] - the Lua engine and the script queue
//! - [`runner`] - per-run orchestration and results
//! - [`events`] - the lifecycle event stream

pub mod collection;
pub mod context;
pub mod cookies;
pub mod error;
pub mod events;
pub mod graph;
pub mod libload;
pub mod logging;
pub mod runner;
pub mod scheduler;
pub mod script;
pub mod util;
pub mod vars;

// Re-export commonly used types
pub use collection::{
    Auth, Collection, CollectionInfo, ExecutionOptions, FilterSpec, Folder, Item, JarOptions, LibrarySource,
    ProtocolScript, Request, RunOptions, Variable, VariableRecord, analyze, apply_filter, validate,
};
pub use context::{ExecutionContext, IterationSource};
pub use cookies::CookieJar;
pub use error::{RunnerError, ScriptPhase, ValidationIssue};
pub use events::{
    ConsoleLevel, Envelope, EventBus, EventLogger, IterationInfo, PathType, RunEmitter, RunEvent, ScriptOutcome,
    create_event_bus, spawn_event_logger,
};
pub use graph::{NodeKind, TaskGraph, TaskNode, compile};
pub use libload::LibraryLoader;
pub use runner::{
    ExecutionRecord, RequestResult, RunResult, RunSummary, Runner, RunnerConfig, TestResult, TestStatus,
};
pub use scheduler::{RunSignals, SKIPPED_BY_BAIL, SKIPPED_BY_CONDITION, run_graph};
pub use script::{ScriptEngine, ScriptQueue};
pub use vars::{ScopeFrame, ScopeLevel, ScopeStack};
