//! Sandboxed script execution: the engine, the `quest.*` API, and the
//! single-worker queue that serializes every invocation

pub mod engine;
pub mod prelude;
pub mod queue;

pub use engine::{ScriptEngine, lua_error_message};
pub use queue::{PreparedRequest, RequestSpec, ScriptQueue, SourcedScript};
