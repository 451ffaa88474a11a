//! Script engine
//!
//! One sandboxed Lua VM per run, exposing the `quest.*` API. Every
//! invocation runs to completion on the script queue's worker before the
//! next begins; that single-worker discipline (not a lock) is what makes
//! the mutable [`ExecutionContext`] race-free. The engine owns the
//! context between install/take pairs and reaches it from the Lua
//! callbacks through app data.
//!
//! Scripts get a wall-clock budget enforced by an instruction-count hook
//! that also observes the run's abort token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, LuaSerdeExt, Table, VmState};
use tokio::runtime::Handle;
use tracing::debug;

use questplugin::PluginRegistry;

use crate::collection::options::SCRIPT_BUDGET_SECS;
use crate::context::ExecutionContext;
use crate::error::{RunnerError, ScriptPhase};
use crate::events::types::{ConsoleLevel, PathType, RunEvent};
use crate::runner::result::TestResult;

use super::prelude::{PRELUDE, SKIP_MARKER};

const TIMEOUT_MARKER: &str = "__quest_timeout__";
const ABORT_MARKER: &str = "__quest_abort__";

/// Which variable layer a `quest.*.variables` table operates on
#[derive(Clone, Copy, Debug)]
enum VarLayer {
    /// `quest.variables`: innermost scope frame, reads fall through
    Scope,
    Global,
    Environment,
    Collection,
}

/// State reachable from Lua callbacks
struct EngineState {
    ctx: Option<ExecutionContext>,
    registry: Arc<PluginRegistry>,
    handle: Handle,
    deadline: Option<Instant>,
    /// External library sources, consulted by `require` after builtins
    libraries: HashMap<String, String>,
}

/// The sandboxed script engine
pub struct ScriptEngine {
    lua: Lua,
}

impl ScriptEngine {
    /// Build a fresh engine. `libraries` maps require-names to Lua
    /// sources fetched by the external-library loader.
    pub fn new(
        registry: Arc<PluginRegistry>,
        handle: Handle,
        libraries: HashMap<String, String>,
    ) -> Result<Self, RunnerError> {
        let lua = Lua::new();
        lua.set_app_data(EngineState {
            ctx: None,
            registry,
            handle,
            deadline: None,
            libraries,
        });

        let engine = Self { lua };
        engine.install_bindings().map_err(|e| RunnerError::Config(format!("script engine init: {e}")))?;
        engine.install_hook();
        Ok(engine)
    }

    /// Hand the per-iteration context to the engine
    pub fn install_context(&self, ctx: ExecutionContext) {
        let mut state = self.state_mut();
        state.ctx = Some(ctx);
    }

    /// Take the context back (end of iteration)
    pub fn take_context(&self) -> Option<ExecutionContext> {
        self.state_mut().ctx.take()
    }

    /// Run a closure against the installed context
    pub fn with_ctx<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> Result<R, RunnerError> {
        let mut state = self.state_mut();
        let ctx = state
            .ctx
            .as_mut()
            .ok_or_else(|| RunnerError::Config("no execution context installed".to_string()))?;
        Ok(f(ctx))
    }

    /// Execute a script chunk to completion. Returns the elapsed
    /// milliseconds; failures carry the phase for the error taxonomy.
    pub fn exec(&self, source: &str, chunk_name: &str, phase: ScriptPhase) -> Result<u64, RunnerError> {
        debug!(chunk = %chunk_name, %phase, "ScriptEngine::exec");
        let start = self.arm_deadline();
        let result = self.lua.load(source).set_name(chunk_name).exec();
        self.clear_deadline();

        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => Ok(elapsed),
            Err(e) => Err(classify(e, phase)),
        }
    }

    /// Evaluate a condition expression to a boolean (Lua truthiness).
    /// Bare expressions are wrapped in `return (...)`; statement-style
    /// conditions may `return` explicitly.
    pub fn eval_condition(&self, expr: &str, chunk_name: &str) -> Result<bool, RunnerError> {
        debug!(chunk = %chunk_name, "ScriptEngine::eval_condition");
        self.arm_deadline();
        let wrapped = format!("return ({expr})");
        let result = match self.lua.load(&wrapped).set_name(chunk_name).eval::<mlua::Value>() {
            Ok(v) => Ok(v),
            // Not an expression; run it as a chunk and use its return value
            Err(mlua::Error::SyntaxError { .. }) => self.lua.load(expr).set_name(chunk_name).eval::<mlua::Value>(),
            Err(e) => Err(e),
        };
        self.clear_deadline();

        match result {
            Ok(value) => Ok(truthy(&value)),
            Err(e) => Err(classify(e, ScriptPhase::Condition)),
        }
    }

    /// Check that a chunk parses, without running it
    pub fn compiles(&self, source: &str, chunk_name: &str) -> Result<(), String> {
        self.lua
            .load(source)
            .set_name(chunk_name)
            .into_function()
            .map(|_| ())
            .map_err(|e| lua_error_message(&e))
    }

    fn state_mut(&self) -> mlua::AppDataRefMut<'_, EngineState> {
        self.lua.app_data_mut::<EngineState>().expect("engine state installed at construction")
    }

    fn arm_deadline(&self) -> Instant {
        let start = Instant::now();
        self.state_mut().deadline = Some(start + Duration::from_secs(SCRIPT_BUDGET_SECS));
        start
    }

    fn clear_deadline(&self) {
        self.state_mut().deadline = None;
    }

    /// The budget/abort hook, checked every few thousand instructions
    fn install_hook(&self) {
        let _ = self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(10_000),
            |lua, _debug| {
                let Some(state) = lua.app_data_ref::<EngineState>() else {
                    return Ok(VmState::Continue);
                };
                if state.ctx.as_ref().map(|c| c.abort.is_cancelled()).unwrap_or(false) {
                    return Err(mlua::Error::RuntimeError(ABORT_MARKER.to_string()));
                }
                if state.deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                    return Err(mlua::Error::RuntimeError(TIMEOUT_MARKER.to_string()));
                }
                Ok(VmState::Continue)
            },
        );
    }

    /// Build the `quest` table, `require`, and the console hook
    fn install_bindings(&self) -> mlua::Result<()> {
        let lua = &self.lua;
        let quest = lua.create_table()?;

        quest.set("variables", make_var_table(lua, VarLayer::Scope)?)?;

        let global = lua.create_table()?;
        global.set("variables", make_var_table(lua, VarLayer::Global)?)?;
        quest.set("global", global)?;

        let environment = lua.create_table()?;
        environment.set("variables", make_var_table(lua, VarLayer::Environment)?)?;
        quest.set("environment", environment)?;

        quest.set("collectionVariables", make_var_table(lua, VarLayer::Collection)?)?;

        quest.set("test", make_test_fn(lua)?)?;
        quest.set("vault", make_vault_table(lua)?)?;
        quest.set("iteration", make_iteration_table(lua)?)?;

        // quest.request / quest.response resolve live from the context
        let quest_mt = lua.create_table()?;
        quest_mt.set(
            "__index",
            lua.create_function(|lua, (_t, key): (Table, String)| -> mlua::Result<mlua::Value> {
                let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
                let Some(ctx) = state.ctx.as_ref() else {
                    return Ok(mlua::Value::Nil);
                };
                match key.as_str() {
                    "request" => match &ctx.current_request {
                        Some(request) => {
                            let request = request.clone();
                            drop(state);
                            lua.to_value(&request)
                        }
                        None => Ok(mlua::Value::Nil),
                    },
                    "response" => match &ctx.current_response {
                        Some(response) => {
                            let response = response.clone();
                            drop(state);
                            lua.to_value(&response)
                        }
                        None => Ok(mlua::Value::Nil),
                    },
                    "event" => match &ctx.current_event {
                        Some(name) => {
                            let payload = serde_json::json!({
                                "name": name,
                                "data": ctx.current_event_data.clone().unwrap_or(serde_json::Value::Null),
                            });
                            drop(state);
                            lua.to_value(&payload)
                        }
                        None => Ok(mlua::Value::Nil),
                    },
                    _ => Ok(mlua::Value::Nil),
                }
            })?,
        )?;
        let _ = quest.set_metatable(Some(quest_mt));

        lua.globals().set("quest", quest)?;
        lua.globals().set("__quest_console", make_console_fn(lua)?)?;
        lua.globals().set("require", make_require_fn(lua)?)?;
        lua.globals().set("__quest_loaded", lua.create_table()?)?;

        lua.load(PRELUDE).set_name("quest-prelude").exec()
    }
}

fn state_missing() -> mlua::Error {
    mlua::Error::RuntimeError("engine state missing".to_string())
}

/// Lua truthiness: everything except nil and false
fn truthy(value: &mlua::Value) -> bool {
    !matches!(value, mlua::Value::Nil | mlua::Value::Boolean(false))
}

/// Strip mlua noise (traceback, callback wrapping) from an error
pub fn lua_error_message(error: &mlua::Error) -> String {
    let message = match error {
        mlua::Error::RuntimeError(m) | mlua::Error::SyntaxError { message: m, .. } => m.clone(),
        mlua::Error::CallbackError { cause, .. } => lua_error_message(cause),
        other => other.to_string(),
    };
    message.split("\nstack traceback").next().unwrap_or(&message).trim().to_string()
}

/// Map a Lua failure into the error taxonomy
fn classify(error: mlua::Error, phase: ScriptPhase) -> RunnerError {
    let message = lua_error_message(&error);
    if message.contains(TIMEOUT_MARKER) {
        RunnerError::ScriptTimeout {
            phase,
            budget_secs: SCRIPT_BUDGET_SECS,
        }
    } else if message.contains(ABORT_MARKER) {
        RunnerError::Aborted {
            reason: "script interrupted by abort signal".to_string(),
        }
    } else {
        RunnerError::script(phase, message)
    }
}

/// Stringify a Lua value the way variable stores expect
fn lua_value_to_string(value: &mlua::Value) -> mlua::Result<String> {
    match value {
        mlua::Value::String(s) => Ok(s.to_str()?.to_string()),
        mlua::Value::Integer(i) => Ok(i.to_string()),
        mlua::Value::Number(n) => Ok(n.to_string()),
        mlua::Value::Boolean(b) => Ok(b.to_string()),
        other => Err(mlua::Error::RuntimeError(format!(
            "cannot store a {} as a variable",
            other.type_name()
        ))),
    }
}

fn path_type_of(path: &str) -> PathType {
    if path.starts_with("request:") {
        PathType::Request
    } else if path.starts_with("folder:") {
        PathType::Folder
    } else {
        PathType::Collection
    }
}

/// Build one `get/set/has/unset` table over a variable layer
fn make_var_table(lua: &Lua, layer: VarLayer) -> mlua::Result<Table> {
    use crate::collection::model::Variable;

    let table = lua.create_table()?;

    table.set(
        "get",
        lua.create_function(move |lua, name: String| -> mlua::Result<Option<String>> {
            let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
            let Some(ctx) = state.ctx.as_ref() else { return Ok(None) };
            let found = match layer {
                VarLayer::Scope => ctx.scopes.get(&name).map(|v| v.value().to_string()).or_else(|| {
                    [&ctx.environment, &ctx.globals]
                        .iter()
                        .find_map(|m| m.get(&name).filter(|v| v.enabled()).map(|v| v.value().to_string()))
                        .or_else(|| {
                            ctx.iteration_row
                                .as_ref()
                                .and_then(|row| row.get(&name))
                                .map(crate::vars::value_to_string)
                        })
                }),
                VarLayer::Global => ctx.globals.get(&name).map(|v| v.value().to_string()),
                VarLayer::Environment => ctx.environment.get(&name).map(|v| v.value().to_string()),
                VarLayer::Collection => ctx.scopes.collection_vars().get(&name).map(|v| v.value().to_string()),
            };
            Ok(found)
        })?,
    )?;

    table.set(
        "set",
        lua.create_function(move |lua, (name, value): (String, mlua::Value)| {
            let value = lua_value_to_string(&value)?;
            let mut state = lua.app_data_mut::<EngineState>().ok_or_else(state_missing)?;
            let ctx = state.ctx.as_mut().ok_or_else(state_missing)?;
            match layer {
                VarLayer::Scope => ctx.scopes.set(name, Variable::Text(value)),
                VarLayer::Global => {
                    ctx.globals.insert(name, Variable::Text(value));
                }
                VarLayer::Environment => {
                    ctx.environment.insert(name, Variable::Text(value));
                }
                VarLayer::Collection => {
                    ctx.scopes.collection_vars_mut().insert(name, Variable::Text(value));
                }
            }
            Ok(())
        })?,
    )?;

    table.set(
        "has",
        lua.create_function(move |lua, name: String| -> mlua::Result<bool> {
            let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
            let Some(ctx) = state.ctx.as_ref() else { return Ok(false) };
            let present = match layer {
                VarLayer::Scope => {
                    ctx.scopes.has(&name)
                        || ctx.environment.contains_key(&name)
                        || ctx.globals.contains_key(&name)
                        || ctx.iteration_row.as_ref().map(|r| r.contains_key(&name)).unwrap_or(false)
                }
                VarLayer::Global => ctx.globals.contains_key(&name),
                VarLayer::Environment => ctx.environment.contains_key(&name),
                VarLayer::Collection => ctx.scopes.collection_vars().contains_key(&name),
            };
            Ok(present)
        })?,
    )?;

    table.set(
        "unset",
        lua.create_function(move |lua, name: String| -> mlua::Result<bool> {
            let mut state = lua.app_data_mut::<EngineState>().ok_or_else(state_missing)?;
            let ctx = state.ctx.as_mut().ok_or_else(state_missing)?;
            let removed = match layer {
                VarLayer::Scope => ctx.scopes.unset(&name),
                VarLayer::Global => ctx.globals.remove(&name).is_some(),
                VarLayer::Environment => ctx.environment.remove(&name).is_some(),
                VarLayer::Collection => ctx.scopes.collection_vars_mut().remove(&name).is_some(),
            };
            Ok(removed)
        })?,
    )?;

    Ok(table)
}

/// `quest.test(name, fn)`: run the body, record the result, emit the
/// assertion event. A `quest.skip()` inside the body marks it skipped.
fn make_test_fn(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, (name, body): (String, Function)| {
        // No app-data borrow may be held across this call: the body is
        // arbitrary script and will reach back into the bindings.
        let outcome = body.call::<()>(());

        let mut test = match outcome {
            Ok(()) => TestResult::passed(&name),
            Err(e) => {
                let message = lua_error_message(&e);
                if message.contains(SKIP_MARKER) {
                    TestResult::skipped(&name)
                } else {
                    TestResult::failed(&name, message)
                }
            }
        };

        let mut state = lua.app_data_mut::<EngineState>().ok_or_else(state_missing)?;
        let ctx = state.ctx.as_mut().ok_or_else(state_missing)?;
        test.event = ctx.current_event.clone();
        let path = ctx
            .current_path
            .clone()
            .unwrap_or_else(crate::collection::path::collection);
        let envelope = ctx.emitter.envelope(path_type_of(&path), &path);
        ctx.emitter.emit(RunEvent::Assertion {
            envelope,
            test: test.clone(),
        });
        ctx.current_tests.push(test);
        Ok(())
    })
}

/// `quest.vault.get(provider, key)`: bridge to value-provider plugins
fn make_vault_table(lua: &Lua) -> mlua::Result<Table> {
    let vault = lua.create_table()?;
    vault.set(
        "get",
        lua.create_function(|lua, (provider, key): (String, String)| -> mlua::Result<Option<String>> {
            let (registry, handle) = {
                let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
                (Arc::clone(&state.registry), state.handle.clone())
            };
            let plugin = registry
                .provider(&provider)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            handle
                .block_on(plugin.get_value(&key, None))
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
        })?,
    )?;
    Ok(vault)
}

/// `quest.iteration`: live view of the iteration coordinates and row
fn make_iteration_table(lua: &Lua) -> mlua::Result<Table> {
    let iteration = lua.create_table()?;
    let mt = lua.create_table()?;
    mt.set(
        "__index",
        lua.create_function(|lua, (_t, key): (Table, String)| -> mlua::Result<mlua::Value> {
            let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
            let Some(ctx) = state.ctx.as_ref() else {
                return Ok(mlua::Value::Nil);
            };
            match key.as_str() {
                "current" => Ok(mlua::Value::Integer(ctx.iteration as i64)),
                "total" => Ok(mlua::Value::Integer(ctx.iteration_total as i64)),
                "data" => match &ctx.iteration_row {
                    Some(row) => {
                        let row = row.clone();
                        drop(state);
                        lua.to_value(&row)
                    }
                    None => {
                        drop(state);
                        Ok(mlua::Value::Table(lua.create_table()?))
                    }
                },
                _ => Ok(mlua::Value::Nil),
            }
        })?,
    )?;
    let _ = iteration.set_metatable(Some(mt));
    Ok(iteration)
}

/// The native console hook behind the prelude's `console` table
fn make_console_fn(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, (level, message): (String, String)| {
        let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
        let Some(ctx) = state.ctx.as_ref() else { return Ok(()) };
        let level = match level.as_str() {
            "info" => ConsoleLevel::Info,
            "warn" => ConsoleLevel::Warn,
            "error" => ConsoleLevel::Error,
            _ => ConsoleLevel::Log,
        };
        let path = ctx
            .current_path
            .clone()
            .unwrap_or_else(crate::collection::path::collection);
        ctx.emitter.console(path_type_of(&path), &path, level, message);
        Ok(())
    })
}

/// Restricted `require`: builtin allow-list first, then user-allowed
/// external libraries. Anything else is an error.
fn make_require_fn(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, name: String| -> mlua::Result<mlua::Value> {
        let loaded: Table = lua.globals().get("__quest_loaded")?;
        let cached: mlua::Value = loaded.get(name.as_str())?;
        if !matches!(cached, mlua::Value::Nil) {
            return Ok(cached);
        }

        let module: mlua::Value = match name.as_str() {
            "json" => mlua::Value::Table(make_json_module(lua)?),
            "strings" => mlua::Value::Table(make_strings_module(lua)?),
            _ => {
                let source = {
                    let state = lua.app_data_ref::<EngineState>().ok_or_else(state_missing)?;
                    state.libraries.get(&name).cloned()
                };
                match source {
                    Some(source) => lua.load(&source).set_name(&name).eval()?,
                    None => {
                        return Err(mlua::Error::RuntimeError(format!(
                            "module '{name}' is not on the allow-list"
                        )));
                    }
                }
            }
        };

        loaded.set(name.as_str(), module.clone())?;
        Ok(module)
    })
}

fn make_json_module(lua: &Lua) -> mlua::Result<Table> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|lua, value: mlua::Value| {
            let value: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&value).map_err(|e| mlua::Error::RuntimeError(e.to_string()))
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            lua.to_value(&value)
        })?,
    )?;
    Ok(json)
}

fn make_strings_module(lua: &Lua) -> mlua::Result<Table> {
    let strings = lua.create_table()?;
    strings.set(
        "trim",
        lua.create_function(|_, s: String| Ok(s.trim().to_string()))?,
    )?;
    strings.set(
        "split",
        lua.create_function(|_, (s, sep): (String, String)| {
            let parts: Vec<String> = if sep.is_empty() {
                vec![s]
            } else {
                s.split(&sep).map(str::to_string).collect()
            };
            Ok(parts)
        })?,
    )?;
    strings.set(
        "starts_with",
        lua.create_function(|_, (s, prefix): (String, String)| Ok(s.starts_with(&prefix)))?,
    )?;
    Ok(strings)
}
