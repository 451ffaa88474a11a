//! Plugin loader
//!
//! Takes the resolver's output, keeps only plugins a collection actually
//! needs, loads their entry chunks in parallel, and registers the results.
//! A plugin that fails to load is reported and skipped; the first request
//! that later demands its capability fails instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::lua::{LuaAuthPlugin, LuaProtocolPlugin, LuaValueProvider, eval_entry};
use crate::manifest::PluginType;
use crate::registry::PluginRegistry;
use crate::resolver::ResolvedPlugin;

/// What a collection requires from the plugin ecosystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub protocols: BTreeSet<String>,
    pub auth_types: BTreeSet<String>,
    pub value_providers: BTreeSet<String>,
}

impl Requirements {
    /// True when nothing is required at all
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty() && self.auth_types.is_empty() && self.value_providers.is_empty()
    }

    fn matches(&self, plugin: &ResolvedPlugin) -> bool {
        let protocols: Vec<&str> = self.protocols.iter().map(String::as_str).collect();
        let auth_types: Vec<&str> = self.auth_types.iter().map(String::as_str).collect();
        let providers: Vec<&str> = self.value_providers.iter().map(String::as_str).collect();
        plugin.provides_any(&protocols, &auth_types, &providers)
    }
}

/// Outcome of a load pass
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names of plugins registered by this pass
    pub loaded: Vec<String>,
    /// Load failures; the run continues without these plugins
    pub failures: Vec<PluginError>,
}

/// Load every resolved plugin that provides something the collection
/// requires, registering results into `registry`. Loading the same
/// plugin name twice is a no-op.
pub async fn load_required(
    resolved: &HashMap<String, ResolvedPlugin>,
    requirements: &Requirements,
    registry: &Arc<PluginRegistry>,
) -> LoadReport {
    let needed: Vec<ResolvedPlugin> = resolved
        .values()
        .filter(|p| requirements.matches(p))
        .cloned()
        .collect();
    debug!(
        resolved = resolved.len(),
        needed = needed.len(),
        "Plugin load pass starting"
    );

    let loads = needed.into_iter().map(|plugin| {
        let registry = Arc::clone(registry);
        async move {
            if !registry.mark_loaded(&plugin.name) {
                return Ok(None);
            }
            load_one(plugin, &registry).await.map(Some)
        }
    });

    let mut report = LoadReport::default();
    for outcome in join_all(loads).await {
        match outcome {
            Ok(Some(name)) => report.loaded.push(name),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Plugin load failed; continuing without it");
                report.failures.push(e);
            }
        }
    }

    info!(loaded = report.loaded.len(), failed = report.failures.len(), "Plugin load pass complete");
    report
}

/// Load a single plugin's entry chunk and register its exports
async fn load_one(plugin: ResolvedPlugin, registry: &Arc<PluginRegistry>) -> Result<String, PluginError> {
    let source = tokio::fs::read_to_string(&plugin.entry_path)
        .await
        .map_err(|e| PluginError::Load {
            name: plugin.name.clone(),
            reason: format!("cannot read {}: {e}", plugin.entry_path.display()),
        })?;

    let chunk_name = plugin.name.clone();
    let (vm, keys) = tokio::task::spawn_blocking(move || eval_entry(&source, &chunk_name))
        .await
        .map_err(|e| PluginError::Load {
            name: plugin.name.clone(),
            reason: format!("load task panicked: {e}"),
        })??;

    for key in keys {
        match plugin.plugin_type {
            PluginType::Protocol => {
                let adapter =
                    LuaProtocolPlugin::from_export(Arc::clone(&vm), key, &plugin.name, &plugin.capabilities.protocols)?;
                registry.register_protocol(Arc::new(adapter));
            }
            PluginType::Auth => {
                let adapter =
                    LuaAuthPlugin::from_export(Arc::clone(&vm), key, &plugin.name, &plugin.capabilities.auth_types)?;
                registry.register_auth(Arc::new(adapter));
            }
            PluginType::Value => {
                let adapter =
                    LuaValueProvider::from_export(Arc::clone(&vm), key, &plugin.name, &plugin.capabilities.value_types)?;
                registry.register_value(Arc::new(adapter));
            }
        }
    }

    debug!(name = %plugin.name, version = %plugin.version, "Loaded plugin");
    Ok(plugin.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve_plugins;
    use std::fs;
    use std::path::Path;

    fn write_plugin(root: &Path, name: &str, plugin_type: &str, provides: &str, lua: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("plugin.json"),
            format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "main": "main.lua",
                    "questrun": {{
                        "runtime": ["questrun"],
                        "type": "{plugin_type}",
                        "capabilities": {{ "provides": {provides} }}
                    }}
                }}"#
            ),
        )
        .unwrap();
        fs::write(dir.join("main.lua"), lua).unwrap();
    }

    fn requirements(protocols: &[&str], auth_types: &[&str], providers: &[&str]) -> Requirements {
        Requirements {
            protocols: protocols.iter().map(|s| s.to_string()).collect(),
            auth_types: auth_types.iter().map(|s| s.to_string()).collect(),
            value_providers: providers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_filters_by_requirements() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "plugin-http",
            "protocol",
            r#"{"protocols": ["http"]}"#,
            "return { name = 'http', protocols = { 'http' }, execute = function() return { status = 200 } end }",
        );
        write_plugin(
            tmp.path(),
            "plugin-grpc",
            "protocol",
            r#"{"protocols": ["grpc"]}"#,
            "return { name = 'grpc', protocols = { 'grpc' }, execute = function() return { status = 200 } end }",
        );

        let resolved = resolve_plugins(&[tmp.path().to_path_buf()]).unwrap();
        let registry = Arc::new(PluginRegistry::new());
        let report = load_required(&resolved, &requirements(&["http"], &[], &[]), &registry).await;

        assert_eq!(report.loaded, vec!["plugin-http".to_string()]);
        assert!(report.failures.is_empty());
        assert!(registry.has_protocol("http"));
        assert!(!registry.has_protocol("grpc"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_load_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "plugin-vault",
            "value",
            r#"{"valueTypes": ["vault"]}"#,
            "return { name = 'vault', value_types = { 'vault' }, get_value = function(k) return k end }",
        );

        let resolved = resolve_plugins(&[tmp.path().to_path_buf()]).unwrap();
        let registry = Arc::new(PluginRegistry::new());
        let reqs = requirements(&[], &[], &["vault"]);

        let first = load_required(&resolved, &reqs, &registry).await;
        assert_eq!(first.loaded.len(), 1);

        let second = load_required(&resolved, &reqs, &registry).await;
        assert!(second.loaded.is_empty());
        assert!(second.failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broken_plugin_reported_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "plugin-bad",
            "protocol",
            r#"{"protocols": ["http"]}"#,
            "this is not lua at all (",
        );
        write_plugin(
            tmp.path(),
            "plugin-auth",
            "auth",
            r#"{"authTypes": ["basic", "bearer"]}"#,
            r#"return {
                { name = 'basic', auth_types = { 'basic' }, apply = function(r) return r end },
                { name = 'bearer', auth_types = { 'bearer' }, apply = function(r) return r end },
            }"#,
        );

        let resolved = resolve_plugins(&[tmp.path().to_path_buf()]).unwrap();
        let registry = Arc::new(PluginRegistry::new());
        let report = load_required(&resolved, &requirements(&["http"], &["basic", "bearer"], &[]), &registry).await;

        assert_eq!(report.loaded, vec!["plugin-auth".to_string()]);
        assert_eq!(report.failures.len(), 1);
        // The array export registered both auth types
        assert!(registry.has_auth("basic"));
        assert!(registry.has_auth("bearer"));
        // The broken protocol plugin never made it in
        assert!(!registry.has_protocol("http"));
    }
}
