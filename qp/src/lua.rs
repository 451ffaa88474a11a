//! Lua plugin adapters
//!
//! A plugin entry chunk evaluates to one table (or an array of tables)
//! whose fields implement the contract for its declared type:
//!
//! ```lua
//! return {
//!     name = "http",
//!     protocols = { "http", "https" },
//!     execute = function(request, context, options, emit) ... return response end,
//!     validate = function(request, options) return { errors = {} } end,
//! }
//! ```
//!
//! Each loaded chunk keeps its own VM; tables from the same chunk share
//! it. Calls lock the VM and run on the blocking pool, so plugin Lua can
//! use the awaitable `emit` callback without starving the runtime.

use std::sync::{Arc, Mutex};

use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Table};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::debug;

use crate::contract::{
    AuthPlugin, EmitEvent, PluginContext, ProtocolPlugin, ProtocolRequest, ProtocolResponse, ValidationResult,
    ValueProvider,
};
use crate::error::PluginError;

/// Shared VM handle for one loaded plugin chunk
pub type SharedVm = Arc<Mutex<Lua>>;

/// Evaluate a plugin entry chunk. Returns the VM plus one registry key
/// per exported table (a bare table yields one key, an array yields one
/// per element).
pub fn eval_entry(source: &str, chunk_name: &str) -> Result<(SharedVm, Vec<RegistryKey>), PluginError> {
    let lua = Lua::new();
    let value: mlua::Value = lua
        .load(source)
        .set_name(chunk_name)
        .eval()
        .map_err(|e| PluginError::Load {
            name: chunk_name.to_string(),
            reason: e.to_string(),
        })?;

    let table = match value {
        mlua::Value::Table(t) => t,
        other => {
            return Err(PluginError::Load {
                name: chunk_name.to_string(),
                reason: format!("entry chunk returned {} instead of a table", other.type_name()),
            });
        }
    };

    let mut keys = Vec::new();
    if is_array_of_tables(&table) {
        for element in table.sequence_values::<Table>() {
            let element = element.map_err(|e| PluginError::Load {
                name: chunk_name.to_string(),
                reason: e.to_string(),
            })?;
            keys.push(registry_key(&lua, element, chunk_name)?);
        }
    } else {
        keys.push(registry_key(&lua, table, chunk_name)?);
    }

    debug!(chunk = %chunk_name, exports = keys.len(), "Evaluated plugin entry");
    Ok((Arc::new(Mutex::new(lua)), keys))
}

fn registry_key(lua: &Lua, table: Table, chunk_name: &str) -> Result<RegistryKey, PluginError> {
    lua.create_registry_value(table).map_err(|e| PluginError::Load {
        name: chunk_name.to_string(),
        reason: e.to_string(),
    })
}

fn is_array_of_tables(table: &Table) -> bool {
    table.raw_len() > 0 && matches!(table.raw_get::<mlua::Value>(1), Ok(mlua::Value::Table(_)))
}

/// Read a string-list field from a plugin table, with a fallback
fn string_list(table: &Table, field: &str, fallback: &[String]) -> Vec<String> {
    match table.get::<Vec<String>>(field) {
        Ok(list) if !list.is_empty() => list,
        _ => fallback.to_vec(),
    }
}

/// Read the `name` field from a plugin table, with a fallback
fn table_name(table: &Table, fallback: &str) -> String {
    table.get::<String>("name").unwrap_or_else(|_| fallback.to_string())
}

fn exec_error(name: &str, e: mlua::Error) -> PluginError {
    PluginError::Execution {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

/// A protocol plugin backed by a Lua table
pub struct LuaProtocolPlugin {
    name: String,
    protocols: Vec<String>,
    vm: SharedVm,
    table: Arc<RegistryKey>,
}

impl LuaProtocolPlugin {
    /// Wrap a table exported by `eval_entry`. `fallback_name` and
    /// `fallback_protocols` come from the plugin manifest.
    pub fn from_export(
        vm: SharedVm,
        key: RegistryKey,
        fallback_name: &str,
        fallback_protocols: &[String],
    ) -> Result<Self, PluginError> {
        let (name, protocols) = {
            let lua = vm.lock().expect("lua vm lock poisoned");
            let table: Table = lua.registry_value(&key).map_err(|e| exec_error(fallback_name, e))?;
            (table_name(&table, fallback_name), string_list(&table, "protocols", fallback_protocols))
        };
        Ok(Self {
            name,
            protocols,
            vm,
            table: Arc::new(key),
        })
    }
}

#[async_trait::async_trait]
impl ProtocolPlugin for LuaProtocolPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocols(&self) -> Vec<String> {
        self.protocols.clone()
    }

    async fn execute(
        &self,
        request: ProtocolRequest,
        context: PluginContext,
        options: Value,
        emit: EmitEvent,
    ) -> Result<ProtocolResponse, PluginError> {
        let vm = Arc::clone(&self.vm);
        let key = Arc::clone(&self.table);
        let name = self.name.clone();
        let handle = Handle::current();

        tokio::task::spawn_blocking(move || {
            let lua = vm.lock().expect("lua vm lock poisoned");
            let table: Table = lua.registry_value(&key).map_err(|e| exec_error(&name, e))?;
            let execute: Function = table.get("execute").map_err(|e| exec_error(&name, e))?;

            let req = lua.to_value(&request).map_err(|e| exec_error(&name, e))?;
            let ctx = lua.to_value(&context).map_err(|e| exec_error(&name, e))?;
            let opts = lua.to_value(&options).map_err(|e| exec_error(&name, e))?;
            let emit_fn = lua
                .create_function(move |lua, (event, data): (String, mlua::Value)| {
                    let payload: Value = lua.from_value(data).unwrap_or(Value::Null);
                    handle.block_on((emit)(event, payload));
                    Ok(())
                })
                .map_err(|e| exec_error(&name, e))?;

            let result: mlua::Value = execute.call((req, ctx, opts, emit_fn)).map_err(|e| exec_error(&name, e))?;
            lua.from_value::<ProtocolResponse>(result).map_err(|e| exec_error(&name, e))
        })
        .await
        .map_err(|e| PluginError::Execution {
            name: self.name.clone(),
            reason: format!("execute task panicked: {e}"),
        })?
    }

    fn validate(&self, request: &ProtocolRequest, options: &Value) -> ValidationResult {
        let lua = self.vm.lock().expect("lua vm lock poisoned");
        let Ok(table) = lua.registry_value::<Table>(&self.table) else {
            return ValidationResult::ok();
        };
        let Ok(validate) = table.get::<Function>("validate") else {
            return ValidationResult::ok();
        };
        let run = || -> mlua::Result<ValidationResult> {
            let req = lua.to_value(request)?;
            let opts = lua.to_value(options)?;
            let result: mlua::Value = validate.call((req, opts))?;
            lua.from_value(result)
        };
        match run() {
            Ok(result) => result,
            Err(e) => ValidationResult {
                errors: vec![format!("plugin {} validate failed: {e}", self.name)],
            },
        }
    }
}

/// An auth plugin backed by a Lua table
pub struct LuaAuthPlugin {
    name: String,
    auth_types: Vec<String>,
    vm: SharedVm,
    table: Arc<RegistryKey>,
}

impl LuaAuthPlugin {
    pub fn from_export(
        vm: SharedVm,
        key: RegistryKey,
        fallback_name: &str,
        fallback_auth_types: &[String],
    ) -> Result<Self, PluginError> {
        let (name, auth_types) = {
            let lua = vm.lock().expect("lua vm lock poisoned");
            let table: Table = lua.registry_value(&key).map_err(|e| exec_error(fallback_name, e))?;
            (table_name(&table, fallback_name), string_list(&table, "auth_types", fallback_auth_types))
        };
        Ok(Self {
            name,
            auth_types,
            vm,
            table: Arc::new(key),
        })
    }
}

#[async_trait::async_trait]
impl AuthPlugin for LuaAuthPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn auth_types(&self) -> Vec<String> {
        self.auth_types.clone()
    }

    async fn apply(&self, request: ProtocolRequest, auth: &Value, options: &Value) -> Result<ProtocolRequest, PluginError> {
        let vm = Arc::clone(&self.vm);
        let key = Arc::clone(&self.table);
        let name = self.name.clone();
        let auth = auth.clone();
        let options = options.clone();

        tokio::task::spawn_blocking(move || {
            let lua = vm.lock().expect("lua vm lock poisoned");
            let table: Table = lua.registry_value(&key).map_err(|e| exec_error(&name, e))?;
            let apply: Function = table.get("apply").map_err(|e| exec_error(&name, e))?;

            let req = lua.to_value(&request).map_err(|e| exec_error(&name, e))?;
            let auth_value = lua.to_value(&auth).map_err(|e| exec_error(&name, e))?;
            let opts = lua.to_value(&options).map_err(|e| exec_error(&name, e))?;

            let result: mlua::Value = apply.call((req, auth_value, opts)).map_err(|e| exec_error(&name, e))?;
            lua.from_value::<ProtocolRequest>(result).map_err(|e| exec_error(&name, e))
        })
        .await
        .map_err(|e| PluginError::Execution {
            name: self.name.clone(),
            reason: format!("apply task panicked: {e}"),
        })?
    }
}

/// A value provider backed by a Lua table
pub struct LuaValueProvider {
    name: String,
    value_types: Vec<String>,
    vm: SharedVm,
    table: Arc<RegistryKey>,
}

impl LuaValueProvider {
    pub fn from_export(
        vm: SharedVm,
        key: RegistryKey,
        fallback_name: &str,
        fallback_value_types: &[String],
    ) -> Result<Self, PluginError> {
        let (name, value_types) = {
            let lua = vm.lock().expect("lua vm lock poisoned");
            let table: Table = lua.registry_value(&key).map_err(|e| exec_error(fallback_name, e))?;
            (table_name(&table, fallback_name), string_list(&table, "value_types", fallback_value_types))
        };
        Ok(Self {
            name,
            value_types,
            vm,
            table: Arc::new(key),
        })
    }
}

#[async_trait::async_trait]
impl ValueProvider for LuaValueProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_types(&self) -> Vec<String> {
        self.value_types.clone()
    }

    async fn get_value(&self, key_name: &str, config: Option<&Value>) -> Result<Option<String>, PluginError> {
        let vm = Arc::clone(&self.vm);
        let table_key = Arc::clone(&self.table);
        let name = self.name.clone();
        let key_name = key_name.to_string();
        let config = config.cloned();

        tokio::task::spawn_blocking(move || {
            let lua = vm.lock().expect("lua vm lock poisoned");
            let table: Table = lua.registry_value(&table_key).map_err(|e| exec_error(&name, e))?;
            let get_value: Function = table.get("get_value").map_err(|e| exec_error(&name, e))?;

            let config_value = match &config {
                Some(c) => lua.to_value(c).map_err(|e| exec_error(&name, e))?,
                None => mlua::Value::Nil,
            };
            let result: Option<String> = get_value.call((key_name, config_value)).map_err(|e| exec_error(&name, e))?;
            Ok(result)
        })
        .await
        .map_err(|e| PluginError::Execution {
            name: self.name.clone(),
            reason: format!("get_value task panicked: {e}"),
        })?
    }
}
