//! Plugin resolver - directory scan without code loading
//!
//! Walks the configured plugin directories, reads each `plugin-*`
//! candidate's manifest, keeps those targeting this runtime, and resolves
//! name conflicts by highest semantic version. No Lua executes here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PluginError;
use crate::manifest::{Capabilities, PLUGIN_PREFIX, PluginManifest, PluginType};

/// A plugin located on disk, ready to be loaded on demand
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub name: String,
    pub version: semver::Version,
    pub plugin_type: PluginType,
    /// Absolute path of the Lua entry chunk
    pub entry_path: PathBuf,
    pub capabilities: Capabilities,
}

impl ResolvedPlugin {
    /// True when this plugin provides at least one of the given protocol,
    /// auth-type, or provider ids.
    pub fn provides_any(&self, protocols: &[&str], auth_types: &[&str], value_types: &[&str]) -> bool {
        self.capabilities.protocols.iter().any(|p| protocols.contains(&p.as_str()))
            || self.capabilities.auth_types.iter().any(|a| auth_types.contains(&a.as_str()))
            || self.capabilities.value_types.iter().any(|v| value_types.contains(&v.as_str()))
    }
}

/// Scan plugin directories into a `name -> ResolvedPlugin` map.
///
/// A malformed manifest (or one targeting a different runtime) is logged
/// and skipped; the scan never halts for one bad plugin. An unreadable
/// directory in the list is a configuration error.
pub fn resolve_plugins(dirs: &[PathBuf]) -> Result<HashMap<String, ResolvedPlugin>, PluginError> {
    let mut resolved: HashMap<String, ResolvedPlugin> = HashMap::new();

    for dir in dirs {
        if !dir.is_dir() {
            return Err(PluginError::Config(format!(
                "plugin directory {} is not readable",
                dir.display()
            )));
        }

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    return Err(PluginError::Config(format!("cannot scan {}: {e}", dir.display())));
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(dir_name) = entry.file_name().to_str() else {
                continue;
            };
            if !dir_name.starts_with(PLUGIN_PREFIX) {
                continue;
            }

            match resolve_one(entry.path()) {
                Ok(plugin) => {
                    debug!(name = %plugin.name, version = %plugin.version, "Resolved plugin");
                    insert_highest(&mut resolved, plugin);
                }
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "Skipping plugin candidate");
                }
            }
        }
    }

    debug!(count = resolved.len(), "Plugin scan complete");
    Ok(resolved)
}

/// Resolve a single plugin directory
fn resolve_one(dir: &Path) -> Result<ResolvedPlugin, PluginError> {
    let manifest = PluginManifest::read_from_dir(dir)?;
    if !manifest.targets_runtime() {
        return Err(PluginError::Config(format!(
            "plugin {} does not target this runtime",
            manifest.name
        )));
    }
    let version = manifest.semver()?;
    let entry_path = dir.join(&manifest.main);
    if !entry_path.is_file() {
        return Err(PluginError::Config(format!(
            "plugin {}: entry {} not found",
            manifest.name,
            entry_path.display()
        )));
    }

    Ok(ResolvedPlugin {
        name: manifest.name.clone(),
        version,
        plugin_type: manifest.questrun.plugin_type,
        entry_path,
        capabilities: manifest.capabilities().clone(),
    })
}

/// Keep the highest version when two directories resolve the same name
fn insert_highest(resolved: &mut HashMap<String, ResolvedPlugin>, plugin: ResolvedPlugin) {
    match resolved.get(&plugin.name) {
        Some(existing) if existing.version >= plugin.version => {
            debug!(
                name = %plugin.name,
                kept = %existing.version,
                dropped = %plugin.version,
                "Version conflict: keeping higher version"
            );
        }
        _ => {
            resolved.insert(plugin.name.clone(), plugin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_plugin(root: &Path, dir_name: &str, name: &str, version: &str, plugin_type: &str, provides: &str) {
        let dir = root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("plugin.json"),
            format!(
                r#"{{
                    "name": "{name}",
                    "version": "{version}",
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
        fs::write(dir.join("main.lua"), "return {}\n").unwrap();
    }

    #[test]
    fn test_scan_finds_prefixed_dirs_only() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "plugin-http", "plugin-http", "1.0.0", "protocol", r#"{"protocols": ["http"]}"#);
        write_plugin(tmp.path(), "not-a-plugin", "not-a-plugin", "1.0.0", "protocol", r#"{"protocols": ["ftp"]}"#);

        let resolved = resolve_plugins(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("plugin-http"));
    }

    #[test]
    fn test_highest_version_wins() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        write_plugin(tmp_a.path(), "plugin-http", "plugin-http", "1.0.0", "protocol", r#"{"protocols": ["http"]}"#);
        write_plugin(tmp_b.path(), "plugin-http", "plugin-http", "1.4.2", "protocol", r#"{"protocols": ["http"]}"#);

        let resolved = resolve_plugins(&[tmp_a.path().to_path_buf(), tmp_b.path().to_path_buf()]).unwrap();
        assert_eq!(resolved["plugin-http"].version, semver::Version::new(1, 4, 2));

        // Order of directories must not matter
        let resolved = resolve_plugins(&[tmp_b.path().to_path_buf(), tmp_a.path().to_path_buf()]).unwrap();
        assert_eq!(resolved["plugin-http"].version, semver::Version::new(1, 4, 2));
    }

    #[test]
    fn test_malformed_manifest_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = tmp.path().join("plugin-broken");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("plugin.json"), "{ not json").unwrap();
        write_plugin(tmp.path(), "plugin-ok", "plugin-ok", "0.1.0", "value", r#"{"valueTypes": ["vault"]}"#);

        let resolved = resolve_plugins(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("plugin-ok"));
    }

    #[test]
    fn test_unreadable_dir_is_config_error() {
        let missing = PathBuf::from("/definitely/not/a/real/dir");
        assert!(matches!(resolve_plugins(&[missing]), Err(PluginError::Config(_))));
    }

    #[test]
    fn test_provides_any() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "plugin-auth", "plugin-auth", "2.0.0", "auth", r#"{"authTypes": ["basic", "bearer"]}"#);
        let resolved = resolve_plugins(&[tmp.path().to_path_buf()]).unwrap();
        let plugin = &resolved["plugin-auth"];
        assert!(plugin.provides_any(&[], &["bearer"], &[]));
        assert!(!plugin.provides_any(&["http"], &["digest"], &["vault"]));
    }
}
