//! Variable scopes and template resolution

pub mod resolver;
pub mod scope;

pub use resolver::{
    Layers, MAX_RESOLVE_DEPTH, NoProviders, ProviderFailure, ProviderLookup, ResolveReport, resolve_str, resolve_value,
    value_to_string,
};
pub use scope::{ScopeFrame, ScopeLevel, ScopeStack};
