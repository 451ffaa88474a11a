//! Runtime options
//!
//! Options exist at two levels: a collection may embed defaults, and the
//! embedder passes run-level overrides. The two are deep-merged on the
//! raw JSON (last write wins on scalars, recursive on objects) before
//! deserializing, so an unset override never clobbers a collection value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunnerError;

/// Wall-clock budget for a single script invocation
pub const SCRIPT_BUDGET_SECS: u64 = 30;

/// Execution-shaping options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Allow independent siblings to run concurrently
    #[serde(rename = "allowParallel")]
    pub allow_parallel: bool,
    /// Request-pool size; values below 1 are treated as 1
    #[serde(rename = "maxConcurrency")]
    pub max_concurrency: usize,
    /// Delay before each request's I/O (skipped for the first request of
    /// a run, and entirely in parallel mode)
    #[serde(rename = "delayMs")]
    pub delay_ms: u64,
    /// Stop scheduling new work after the first failed test
    pub bail: bool,
    /// Strict validation: findings abort the run before iterations
    pub strict: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            allow_parallel: false,
            max_concurrency: 4,
            delay_ms: 0,
            bail: false,
            strict: true,
        }
    }
}

impl ExecutionOptions {
    /// Effective request-pool size
    pub fn pool_size(&self) -> usize {
        if self.allow_parallel { self.max_concurrency.max(1) } else { 1 }
    }

    /// True when sibling order edges must be added by the compiler
    pub fn sequential(&self) -> bool {
        !self.allow_parallel || self.max_concurrency <= 1
    }
}

/// Cookie-jar options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JarOptions {
    /// Keep cookies across requests; cleared after each request when false
    pub persist: bool,
}

/// Where an external library comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LibrarySource {
    /// Published package, fetched from the run's registry base URL
    Package { name: String, version: String },
    /// Local file
    Path { name: String, path: String },
    /// Remote URL
    Url { name: String, url: String },
}

impl LibrarySource {
    /// The name scripts pass to `require`
    pub fn require_name(&self) -> &str {
        match self {
            Self::Package { name, .. } | Self::Path { name, .. } | Self::Url { name, .. } => name,
        }
    }
}

/// The full option set for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub execution: ExecutionOptions,
    pub jar: JarOptions,
    /// External Lua libraries scripts may `require`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<LibrarySource>,
    /// Explicit gate for the external-library feature
    #[serde(rename = "allowExternalLibraries")]
    pub allow_external_libraries: bool,
    /// Registry base URL for `LibrarySource::Package` fetches
    #[serde(rename = "libraryRegistry", skip_serializing_if = "Option::is_none")]
    pub library_registry: Option<String>,
    /// Iteration cap; combined with `testData` length by the runner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Protocol-plugin options, passed through opaquely
    #[serde(skip_serializing_if = "Value::is_null")]
    pub protocol: Value,
}

impl RunOptions {
    /// Merge collection-level options with run-level overrides and
    /// deserialize the result. Either side may be `Null`.
    pub fn resolve(collection_level: &Value, run_level: &Value) -> Result<Self, RunnerError> {
        let merged = deep_merge(collection_level.clone(), run_level.clone());
        if merged.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(merged).map_err(|e| RunnerError::Config(format!("invalid options: {e}")))
    }
}

/// Recursive JSON merge: objects merge key-wise, everything else is
/// replaced by the overlay (nulls in the overlay are "unset").
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = RunOptions::resolve(&Value::Null, &Value::Null).unwrap();
        assert!(!options.execution.allow_parallel);
        assert_eq!(options.execution.max_concurrency, 4);
        assert!(options.execution.strict);
        assert!(!options.jar.persist);
        assert_eq!(options.execution.pool_size(), 1);
        assert!(options.execution.sequential());
    }

    #[test]
    fn test_run_level_wins_on_scalars() {
        let collection = json!({ "execution": { "bail": true, "delayMs": 100 } });
        let run = json!({ "execution": { "delayMs": 250 } });
        let options = RunOptions::resolve(&collection, &run).unwrap();
        // delay overridden, bail preserved from the collection level
        assert_eq!(options.execution.delay_ms, 250);
        assert!(options.execution.bail);
    }

    #[test]
    fn test_deep_merge_nested() {
        let merged = deep_merge(
            json!({ "a": { "x": 1, "y": 2 }, "b": [1, 2] }),
            json!({ "a": { "y": 3 }, "b": [9] }),
        );
        assert_eq!(merged, json!({ "a": { "x": 1, "y": 3 }, "b": [9] }));
    }

    #[test]
    fn test_overlay_null_keeps_base(){
        let merged = deep_merge(json!({ "a": 1 }), Value::Null);
        assert_eq!(merged, json!({ "a": 1 }));
    }

    #[test]
    fn test_parallel_pool_size() {
        let options = RunOptions::resolve(
            &Value::Null,
            &json!({ "execution": { "allowParallel": true, "maxConcurrency": 8 } }),
        )
        .unwrap();
        assert_eq!(options.execution.pool_size(), 8);
        assert!(!options.execution.sequential());
    }

    #[test]
    fn test_max_concurrency_one_is_sequential() {
        let options = RunOptions::resolve(
            &Value::Null,
            &json!({ "execution": { "allowParallel": true, "maxConcurrency": 1 } }),
        )
        .unwrap();
        assert!(options.execution.sequential());
    }

    #[test]
    fn test_library_sources() {
        let options = RunOptions::resolve(
            &Value::Null,
            &json!({
                "allowExternalLibraries": true,
                "libraries": [
                    { "kind": "package", "name": "dates", "version": "1.0.0" },
                    { "kind": "path", "name": "local", "path": "/tmp/local.lua" },
                    { "kind": "url", "name": "remote", "url": "https://libs.test/remote.lua" }
                ]
            }),
        )
        .unwrap();
        assert_eq!(options.libraries.len(), 3);
        assert_eq!(options.libraries[0].require_name(), "dates");
        assert_eq!(options.libraries[2].require_name(), "remote");
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = RunOptions::resolve(&Value::Null, &json!({ "execution": { "maxConcurrency": "many" } }));
        assert!(matches!(result, Err(RunnerError::Config(_))));
    }
}
