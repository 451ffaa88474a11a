//! Template resolver
//!
//! Expands `{{name}}`, `{{$provider:key}}`, and `{{$func(args)}}` tokens
//! inside any string field of a request. Resolution is recursive over
//! JSON structure and re-applied to strings until a fixed point or a
//! depth cap, so templates may reference other templates without the
//! runtime diverging. A lookup miss leaves the token literal; strict
//! callers collect the misses instead.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::collection::model::Variable;

use super::scope::ScopeStack;

/// Re-resolution cap preventing divergent templates
pub const MAX_RESOLVE_DEPTH: usize = 10;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("token regex"));
static FUNC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\$(\w+)\((.*)\)$").expect("func regex"));

/// Synchronous bridge to value-provider plugins. The script queue backs
/// this with a registry call; validation uses [`NoProviders`].
pub trait ProviderLookup {
    /// `Ok(None)` = unknown key (token stays literal); `Err` = provider
    /// unavailable, surfaced to the caller.
    fn get(&self, provider: &str, key: &str) -> Result<Option<String>, String>;
}

/// A lookup that knows no providers
pub struct NoProviders;

impl ProviderLookup for NoProviders {
    fn get(&self, _provider: &str, _key: &str) -> Result<Option<String>, String> {
        Ok(None)
    }
}

/// Provider failure during resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub key: String,
    pub message: String,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider {} failed for key {:?}: {}", self.provider, self.key, self.message)
    }
}

/// What a resolution pass reports alongside the expanded value
#[derive(Debug, Default)]
pub struct ResolveReport {
    /// Tokens left literal because no layer defined them
    pub unresolved: Vec<String>,
}

/// The variable layers a resolution reads, highest precedence first
/// inside the stack, then environment, globals, and the iteration row.
pub struct Layers<'a> {
    pub scopes: &'a ScopeStack,
    pub environment: &'a BTreeMap<String, Variable>,
    pub globals: &'a BTreeMap<String, Variable>,
    pub iteration_row: Option<&'a serde_json::Map<String, Value>>,
}

impl Layers<'_> {
    /// Look a name up through every layer; returns the string projection
    /// plus the provider id when the winning entry is provider-backed.
    fn lookup(&self, name: &str) -> Option<(String, Option<String>)> {
        if let Some(var) = self.scopes.get(name) {
            return Some((var.value().to_string(), var.provider().map(str::to_string)));
        }
        for layer in [self.environment, self.globals] {
            if let Some(var) = layer.get(name).filter(|v| v.enabled()) {
                return Some((var.value().to_string(), var.provider().map(str::to_string)));
            }
        }
        if let Some(row) = self.iteration_row {
            if let Some(value) = row.get(name) {
                return Some((value_to_string(value), None));
            }
        }
        None
    }
}

/// String projection of a JSON value, matching what scripts observe
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve every template token in a string
pub fn resolve_str(
    input: &str,
    layers: &Layers<'_>,
    providers: &dyn ProviderLookup,
    report: &mut ResolveReport,
) -> Result<String, ProviderFailure> {
    let mut current = input.to_string();
    for _depth in 0..MAX_RESOLVE_DEPTH {
        if !current.contains("{{") {
            break;
        }
        let (next, changed) = resolve_pass(&current, layers, providers, report)?;
        current = next;
        if !changed {
            break;
        }
    }
    Ok(current)
}

/// One substitution pass; reports whether anything changed
fn resolve_pass(
    input: &str,
    layers: &Layers<'_>,
    providers: &dyn ProviderLookup,
    report: &mut ResolveReport,
) -> Result<(String, bool), ProviderFailure> {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    let mut changed = false;

    for captures in TOKEN_RE.captures_iter(input) {
        let whole = captures.get(0).expect("regex group 0");
        let token = captures[1].trim().to_string();
        out.push_str(&input[last_end..whole.start()]);
        last_end = whole.end();

        match expand_token(&token, layers, providers)? {
            Some(value) => {
                changed = true;
                out.push_str(&value);
            }
            None => {
                debug!(%token, "Resolver: token left literal");
                report.unresolved.push(token);
                out.push_str(whole.as_str());
            }
        }
    }
    out.push_str(&input[last_end..]);
    Ok((out, changed))
}

/// Expand a single token body (the part between the braces)
fn expand_token(
    token: &str,
    layers: &Layers<'_>,
    providers: &dyn ProviderLookup,
) -> Result<Option<String>, ProviderFailure> {
    if let Some(rest) = token.strip_prefix('$') {
        // `$provider:key` - value-provider invocation
        if let Some((provider, key)) = rest.split_once(':') {
            return providers
                .get(provider.trim(), key.trim())
                .map_err(|message| ProviderFailure {
                    provider: provider.trim().to_string(),
                    key: key.trim().to_string(),
                    message,
                });
        }
        // `$func` / `$func(args)` - builtin pseudo-variable
        return Ok(expand_builtin(token));
    }

    match layers.lookup(token) {
        Some((value, Some(provider))) => providers.get(&provider, &value).map_err(|message| ProviderFailure {
            provider,
            key: value,
            message,
        }),
        Some((value, None)) => Ok(Some(value)),
        None => Ok(None),
    }
}

/// Builtin pseudo-variables: `$guid`, `$timestamp`, `$isoTimestamp`,
/// `$randomInt` / `$randomInt(min,max)`
fn expand_builtin(token: &str) -> Option<String> {
    let (name, args) = match FUNC_RE.captures(token) {
        Some(captures) => (captures[1].to_string(), captures[2].to_string()),
        None => (token.trim_start_matches('$').to_string(), String::new()),
    };

    match name.as_str() {
        "guid" | "uuid" => Some(Uuid::new_v4().to_string()),
        "timestamp" => Some(Utc::now().timestamp().to_string()),
        "isoTimestamp" => Some(Utc::now().to_rfc3339()),
        "randomInt" => {
            let (min, max) = parse_range(&args).unwrap_or((0, 1000));
            Some(rand::rng().random_range(min..=max).to_string())
        }
        _ => None,
    }
}

fn parse_range(args: &str) -> Option<(i64, i64)> {
    let (min, max) = args.split_once(',')?;
    let min = min.trim().parse::<i64>().ok()?;
    let max = max.trim().parse::<i64>().ok()?;
    (min <= max).then_some((min, max))
}

/// Resolve every string inside a JSON value, recursively
pub fn resolve_value(
    input: &Value,
    layers: &Layers<'_>,
    providers: &dyn ProviderLookup,
    report: &mut ResolveReport,
) -> Result<Value, ProviderFailure> {
    match input {
        Value::String(s) => Ok(Value::String(resolve_str(s, layers, providers, report)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, layers, providers, report)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve_value(value, layers, providers, report)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
