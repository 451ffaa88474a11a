//! Plugin contracts
//!
//! The three traits a plugin can satisfy, plus the wire types they
//! exchange with the runtime. Request payloads stay protocol-specific
//! (`serde_json::Value`); the runtime resolves variables and applies
//! effective auth before a plugin ever sees them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// Callback a protocol plugin uses to surface mid-request events
/// (e.g. an SSE message). The call is awaitable: the runtime funnels it
/// through the script queue, so a busy queue back-pressures the plugin.
/// Events for one request are observed in the order they are emitted.
pub type EmitEvent = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// A request as handed to protocol and auth plugins: ids and path for
/// reporting, protocol-specific `data` with variables already expanded,
/// and the effective auth record (never `inherit`, absent for `none`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    pub id: String,
    pub name: String,
    /// Slash path within the collection, e.g. `request:/Users/Get User`
    pub path: String,
    /// Protocol-specific payload (URL, method, headers, body, ...)
    pub data: Value,
    /// Effective auth `{type, data}`, resolved by the compiler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    /// `Cookie:` header materialized from the run's jar, if any applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_header: Option<String>,
}

/// A header value: single or multi-valued, both preserved on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// All values, in order
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(v) => vec![v.as_str()],
            Self::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

/// What a protocol plugin reports back after I/O
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub status: u16,
    #[serde(rename = "statusText", default)]
    pub status_text: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValue>,
    /// Plugin-measured duration in milliseconds
    #[serde(rename = "durationMs", default)]
    pub duration_ms: u64,
    /// Transport-level failure. Carried, not thrown: post-scripts may
    /// assert on it, so it never aborts the run by itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProtocolResponse {
    /// All `Set-Cookie` values in the response, in order
    pub fn set_cookie_headers(&self) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .flat_map(|(_, v)| v.values())
            .collect()
    }
}

/// Snapshot of run state a plugin may consult; captured on the script
/// queue during the request's pre-phase, so it is stable for the whole
/// I/O phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginContext {
    pub protocol: String,
    pub iteration: u32,
    #[serde(rename = "iterationTotal")]
    pub iteration_total: u32,
    /// Flattened variable view (scope precedence already applied)
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
}

/// Outcome of a plugin-assisted validation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A protocol plugin performs the I/O for requests of its protocols
#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    /// Plugin name (unique across the registry)
    fn name(&self) -> &str;

    /// Protocol ids this plugin serves
    fn protocols(&self) -> Vec<String>;

    /// Execute a request. `emit` surfaces mid-request events into the
    /// script queue; implementations must not assume it completes
    /// synchronously.
    async fn execute(
        &self,
        request: ProtocolRequest,
        context: PluginContext,
        options: Value,
        emit: EmitEvent,
    ) -> Result<ProtocolResponse, PluginError>;

    /// Validate a request without executing it
    fn validate(&self, _request: &ProtocolRequest, _options: &Value) -> ValidationResult {
        ValidationResult::ok()
    }
}

/// An auth plugin decorates a request with credentials before I/O
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Auth types this plugin can apply
    fn auth_types(&self) -> Vec<String>;

    /// Return the (possibly mutated) request; the runtime substitutes
    /// the returned value before the I/O phase.
    async fn apply(&self, request: ProtocolRequest, auth: &Value, options: &Value) -> Result<ProtocolRequest, PluginError>;
}

/// A value provider resolves `{{$provider:key}}` lookups
#[async_trait]
pub trait ValueProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Provider ids this plugin serves
    fn value_types(&self) -> Vec<String>;

    /// `Ok(None)` means "unknown key"; an `Err` means the provider is
    /// unavailable and surfaces as a validation error.
    async fn get_value(&self, key: &str, config: Option<&Value>) -> Result<Option<String>, PluginError>;
}
