//! Plugin manifest model
//!
//! Every plugin directory carries a `plugin.json` describing the plugin
//! without executing it: name, version, the Lua entry chunk, and a
//! runtime-namespaced block declaring the plugin type and its capabilities.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Runtime identifier a manifest must list to be loadable by this engine
pub const RUNTIME_ID: &str = "questrun";

/// File name of the manifest inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// Directory-name prefix that marks a plugin candidate during scanning
pub const PLUGIN_PREFIX: &str = "plugin-";

/// Plugin classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Performs request I/O
    Protocol,
    /// Decorates requests with credentials
    Auth,
    /// Resolves `{{$provider:key}}` lookups
    Value,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol => write!(f, "protocol"),
            Self::Auth => write!(f, "auth"),
            Self::Value => write!(f, "value"),
        }
    }
}

/// Declared capabilities of a plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Protocol ids this plugin can execute (protocol plugins)
    pub protocols: Vec<String>,
    /// Auth types this plugin can apply (auth plugins)
    #[serde(rename = "authTypes")]
    pub auth_types: Vec<String>,
    /// Value-provider ids this plugin serves (value plugins)
    #[serde(rename = "valueTypes")]
    pub value_types: Vec<String>,
}

impl Capabilities {
    /// True when no capability is declared at all
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty() && self.auth_types.is_empty() && self.value_types.is_empty()
    }
}

/// The runtime-namespaced block of a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeBlock {
    /// Engine identifiers this plugin supports; must include [`RUNTIME_ID`]
    pub runtime: Vec<String>,
    /// Plugin classification
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: CapabilitiesBlock,
}

/// Wrapper matching the manifest's `capabilities.provides` nesting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesBlock {
    #[serde(default)]
    pub provides: Capabilities,
}

/// A parsed `plugin.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name (conventionally the directory name)
    pub name: String,
    /// Semantic version string
    pub version: String,
    /// Entry chunk path, relative to the plugin directory
    pub main: String,
    /// Runtime-namespaced metadata
    #[serde(rename = "questrun")]
    pub questrun: RuntimeBlock,
}

impl PluginManifest {
    /// Parse a manifest from JSON text
    pub fn parse(text: &str) -> Result<Self, PluginError> {
        serde_json::from_str(text).map_err(|e| PluginError::Config(format!("invalid manifest: {e}")))
    }

    /// Read and parse a `plugin.json` from a plugin directory
    pub fn read_from_dir(dir: &Path) -> Result<Self, PluginError> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| PluginError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// True when this manifest targets the questrun engine
    pub fn targets_runtime(&self) -> bool {
        self.questrun.runtime.iter().any(|r| r == RUNTIME_ID)
    }

    /// Parsed semantic version; a bare numeric triple is required
    pub fn semver(&self) -> Result<semver::Version, PluginError> {
        semver::Version::parse(&self.version)
            .map_err(|e| PluginError::Config(format!("plugin {}: bad version {:?}: {e}", self.name, self.version)))
    }

    /// Declared capabilities, flattened out of the `provides` nesting
    pub fn capabilities(&self) -> &Capabilities {
        &self.questrun.capabilities.provides
    }
}
