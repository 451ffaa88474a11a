//! questplugin - plugin kit for the questrun collection runtime
//!
//! A questrun plugin is a directory named `plugin-*` containing a
//! `plugin.json` manifest and a Lua entry chunk. The runtime resolves
//! plugins from disk without loading any code, filters them by what a
//! collection actually requires, loads the survivors, and registers them
//! in the [`PluginRegistry`].
//!
//! Three plugin kinds exist:
//! - **protocol** - performs the I/O for a request (HTTP, SSE, ...)
//! - **auth** - decorates a request with credentials before I/O
//! - **value** - resolves `{{$provider:key}}` variable lookups
//!
//! Native (Rust) implementations of the same contracts can be registered
//! directly; the Lua adapters exist so plugins ship as data.

pub mod contract;
pub mod error;
pub mod loader;
pub mod lua;
pub mod manifest;
pub mod registry;
pub mod resolver;

pub use contract::{
    AuthPlugin, EmitEvent, PluginContext, ProtocolPlugin, ProtocolRequest, ProtocolResponse, ValidationResult,
    ValueProvider,
};
pub use error::PluginError;
pub use loader::{LoadReport, Requirements, load_required};
pub use manifest::{Capabilities, PluginManifest, PluginType, RUNTIME_ID};
pub use registry::PluginRegistry;
pub use resolver::{ResolvedPlugin, resolve_plugins};
