//! Plugin registry
//!
//! In-memory capability maps: protocol id -> plugin, auth type -> plugin,
//! value-provider id -> provider. Populated during the load phase, then
//! shared behind an `Arc` for the rest of the run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::contract::{AuthPlugin, ProtocolPlugin, ValueProvider};
use crate::error::PluginError;

#[derive(Default)]
struct RegistryInner {
    protocols: HashMap<String, Arc<dyn ProtocolPlugin>>,
    auth_types: HashMap<String, Arc<dyn AuthPlugin>>,
    value_types: HashMap<String, Arc<dyn ValueProvider>>,
    /// Plugin names already loaded; a second load of a name is a no-op
    loaded: HashSet<String>,
}

/// Thread-safe registry of loaded plugins
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a plugin name as loaded. Returns false when the name was
    /// already present, in which case the caller should skip loading.
    pub fn mark_loaded(&self, name: &str) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let fresh = inner.loaded.insert(name.to_string());
        if !fresh {
            debug!(%name, "PluginRegistry: plugin already loaded, skipping");
        }
        fresh
    }

    /// Register a protocol plugin under every protocol it declares
    pub fn register_protocol(&self, plugin: Arc<dyn ProtocolPlugin>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for protocol in plugin.protocols() {
            if inner.protocols.contains_key(&protocol) {
                warn!(%protocol, plugin = %plugin.name(), "PluginRegistry: protocol already registered, keeping first");
                continue;
            }
            info!(%protocol, plugin = %plugin.name(), "Registered protocol plugin");
            inner.protocols.insert(protocol, Arc::clone(&plugin));
        }
    }

    /// Register an auth plugin under every auth type it declares
    pub fn register_auth(&self, plugin: Arc<dyn AuthPlugin>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for auth_type in plugin.auth_types() {
            if inner.auth_types.contains_key(&auth_type) {
                warn!(%auth_type, plugin = %plugin.name(), "PluginRegistry: auth type already registered, keeping first");
                continue;
            }
            info!(%auth_type, plugin = %plugin.name(), "Registered auth plugin");
            inner.auth_types.insert(auth_type, Arc::clone(&plugin));
        }
    }

    /// Register a value provider under every provider id it declares
    pub fn register_value(&self, provider: Arc<dyn ValueProvider>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for value_type in provider.value_types() {
            if inner.value_types.contains_key(&value_type) {
                warn!(%value_type, plugin = %provider.name(), "PluginRegistry: provider already registered, keeping first");
                continue;
            }
            info!(%value_type, plugin = %provider.name(), "Registered value provider");
            inner.value_types.insert(value_type, Arc::clone(&provider));
        }
    }

    /// Look up the plugin for a protocol id
    pub fn protocol(&self, id: &str) -> Result<Arc<dyn ProtocolPlugin>, PluginError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .protocols
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::missing_protocol(id))
    }

    /// Look up the plugin for an auth type
    pub fn auth(&self, auth_type: &str) -> Result<Arc<dyn AuthPlugin>, PluginError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .auth_types
            .get(auth_type)
            .cloned()
            .ok_or_else(|| PluginError::missing_auth(auth_type))
    }

    /// Look up a value provider by id
    pub fn provider(&self, id: &str) -> Result<Arc<dyn ValueProvider>, PluginError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .value_types
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::missing_provider(id))
    }

    /// True when a protocol id is served
    pub fn has_protocol(&self, id: &str) -> bool {
        self.inner.read().expect("registry lock poisoned").protocols.contains_key(id)
    }

    /// True when an auth type is served
    pub fn has_auth(&self, auth_type: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .auth_types
            .contains_key(auth_type)
    }

    /// True when a value-provider id is served
    pub fn has_provider(&self, id: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .value_types
            .contains_key(id)
    }

    /// Registered counts as (protocols, auth types, value types)
    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read().expect("registry lock poisoned");
        (inner.protocols.len(), inner.auth_types.len(), inner.value_types.len())
    }
}
