//! Collection validator
//!
//! Structural checks, script compilation checks, plugin-assisted
//! request validation, and the static expected-test count. In strict
//! mode findings block the run; otherwise they are advisory and the
//! expected-test count is reported as dynamic (-1).

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use questplugin::{PluginRegistry, ProtocolRequest};

use crate::error::ValidationIssue;
use crate::util::non_blank;

use super::model::{Collection, Item};
use super::options::RunOptions;
use super::path;

static TEST_CALL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"quest\s*\.\s*test\s*\(").expect("test-call regex"));

/// What validation produced
#[derive(Debug)]
pub struct ValidationOutcome {
    pub issues: Vec<ValidationIssue>,
    /// Static `quest.test` count over post-request scripts for one
    /// iteration; -1 outside strict mode
    pub expected_tests: i64,
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validate a collection against the run options and loaded plugins
pub fn validate(collection: &Collection, options: &RunOptions, registry: &PluginRegistry) -> ValidationOutcome {
    let mut issues = Vec::new();

    check_option_conflicts(options, &mut issues);
    check_structure(collection, &mut issues);
    check_scripts(collection, &mut issues);
    check_protocol(collection, registry, &mut issues);
    plugin_checks(collection, options, registry, &mut issues);

    let expected_tests = if options.execution.strict {
        count_expected_tests(collection) as i64
    } else {
        -1
    };

    debug!(issues = issues.len(), expected_tests, "Validation complete");
    ValidationOutcome { issues, expected_tests }
}

/// Option combinations the runtime cannot honor
fn check_option_conflicts(options: &RunOptions, issues: &mut Vec<ValidationIssue>) {
    if options.jar.persist && options.execution.allow_parallel {
        issues.push(ValidationIssue::new(
            path::collection(),
            "jar.persist=true cannot be combined with execution.allowParallel=true: the jar is cleared after each request in parallel mode",
        ));
    }
}

/// Unique ids, resolvable dependencies, no self-dependencies
fn check_structure(collection: &Collection, issues: &mut Vec<ValidationIssue>) {
    let mut ids: HashMap<String, usize> = HashMap::new();
    collection.walk(&mut |item| {
        *ids.entry(item.id().to_string()).or_insert(0) += 1;
    });
    for (id, count) in &ids {
        if *count > 1 {
            issues.push(ValidationIssue::new(
                path::collection(),
                format!("item id {id:?} appears {count} times; ids must be unique"),
            ));
        }
    }

    let known: HashSet<&str> = ids.keys().map(String::as_str).collect();
    walk_with_paths(collection, &mut |item, typed| {
        for dep in item.depends_on() {
            if dep == item.id() {
                issues.push(ValidationIssue::new(typed.clone(), "item depends on itself"));
            } else if !known.contains(dep.as_str()) {
                issues.push(ValidationIssue::new(typed.clone(), format!("dependsOn references unknown item {dep:?}")));
            }
        }
    });
}

/// Every script and condition must at least parse
fn check_scripts(collection: &Collection, issues: &mut Vec<ValidationIssue>) {
    let lua = mlua::Lua::new();
    let mut check = |source: Option<&str>, typed: &str, what: &str, issues: &mut Vec<ValidationIssue>| {
        let Some(source) = non_blank(source) else { return };
        if let Err(e) = lua.load(source).set_name(what).into_function() {
            issues.push(ValidationIssue::new(
                typed,
                format!("{what} does not compile: {}", crate::script::lua_error_message(&e)),
            ));
        }
    };
    let mut check_condition = |expr: Option<&str>, typed: &str, issues: &mut Vec<ValidationIssue>| {
        let Some(expr) = non_blank(expr) else { return };
        let wrapped = format!("return ({expr})");
        if lua.load(&wrapped).into_function().is_err() && lua.load(expr).into_function().is_err() {
            issues.push(ValidationIssue::new(typed, "condition does not compile"));
        }
    };

    let root = path::collection();
    check(collection.collection_pre_script.as_deref(), &root, "collection pre-script", issues);
    check(collection.collection_post_script.as_deref(), &root, "collection post-script", issues);
    check(collection.request_pre_script.as_deref(), &root, "request pre-script hook", issues);
    check(collection.request_post_script.as_deref(), &root, "request post-script hook", issues);

    walk_with_paths(collection, &mut |item, typed| match item {
        Item::Folder(folder) => {
            check(folder.pre_script.as_deref(), &typed, "folder pre-script", issues);
            check(folder.post_script.as_deref(), &typed, "folder post-script", issues);
            check(folder.request_pre_script.as_deref(), &typed, "request pre-script hook", issues);
            check(folder.request_post_script.as_deref(), &typed, "request post-script hook", issues);
            check_condition(folder.condition.as_deref(), &typed, issues);
        }
        Item::Request(request) => {
            check(request.pre_script.as_deref(), &typed, "pre-request script", issues);
            check(request.post_script.as_deref(), &typed, "post-request script", issues);
            check_condition(request.condition.as_deref(), &typed, issues);
            for event in &request.events {
                check(Some(event.script.as_str()), &typed, &format!("{} event script", event.event), issues);
            }
        }
    });
}

fn check_protocol(collection: &Collection, registry: &PluginRegistry, issues: &mut Vec<ValidationIssue>) {
    let protocol = collection.info.protocol.trim();
    if protocol.is_empty() {
        issues.push(ValidationIssue::new(path::collection(), "collection declares no protocol"));
    } else if !registry.has_protocol(protocol) {
        issues.push(ValidationIssue::new(
            path::collection(),
            format!("no loaded plugin provides protocol {protocol:?}"),
        ));
    }
}

/// Give each request to its protocol plugin's `validate`
fn plugin_checks(collection: &Collection, options: &RunOptions, registry: &PluginRegistry, issues: &mut Vec<ValidationIssue>) {
    let Ok(plugin) = registry.protocol(collection.info.protocol.trim()) else {
        return;
    };
    walk_with_paths(collection, &mut |item, typed| {
        let Item::Request(request) = item else { return };
        let probe = ProtocolRequest {
            id: request.id.clone(),
            name: request.name.clone(),
            path: typed.clone(),
            data: request.data.clone(),
            auth: None,
            cookie_header: None,
        };
        for error in plugin.validate(&probe, &options.protocol).errors {
            issues.push(ValidationIssue::new(typed.clone(), error));
        }
    });
}

/// Static count of `quest.test(` calls a single iteration would make:
/// each request contributes its own post-script plus every inherited
/// post hook. A hint for reporters, never used for control flow.
fn count_expected_tests(collection: &Collection) -> usize {
    fn count_in(source: Option<&str>) -> usize {
        non_blank(source).map(|s| TEST_CALL_RE.find_iter(s).count()).unwrap_or(0)
    }

    fn walk(items: &[Item], inherited: usize) -> usize {
        let mut total = 0;
        for item in items {
            match item {
                Item::Folder(folder) => {
                    let inherited = inherited + count_in(folder.request_post_script.as_deref());
                    total += walk(&folder.items, inherited);
                }
                Item::Request(request) => {
                    total += inherited + count_in(request.post_script.as_deref());
                }
            }
        }
        total
    }

    let inherited = count_in(collection.request_post_script.as_deref());
    walk(&collection.items, inherited)
}

/// Depth-first walk handing each item its typed path
fn walk_with_paths(collection: &Collection, visit: &mut dyn FnMut(&Item, String)) {
    fn walk(items: &[Item], parent_slash: &str, visit: &mut dyn FnMut(&Item, String)) {
        for item in items {
            let slash = path::join(parent_slash, item.name());
            match item {
                Item::Folder(folder) => {
                    visit(item, path::folder(&slash));
                    walk(&folder.items, &slash, visit);
                }
                Item::Request(_) => visit(item, path::request(&slash)),
            }
        }
    }
    walk(&collection.items, "", visit);
}
