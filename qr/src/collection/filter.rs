//! Request filter
//!
//! Prunes a collection down to the requests matching a path regex,
//! optionally pulling in the transitive `dependsOn` closure so kept
//! requests still run after their prerequisites. Folders left empty by
//! the filter are dropped entirely, so their lifecycle scripts never
//! execute.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, warn};

use super::model::{Collection, Folder, Item};
use super::path;

/// What to keep
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Regex matched against typed paths (`request:/A/Get`, `folder:/A`);
    /// `None` (or an invalid pattern) keeps everything
    pub pattern: Option<String>,
    /// When false (the default), requests reachable through `dependsOn`
    /// from a kept item are kept as well
    pub exclude_deps: bool,
}

/// Index of the tree built in one walk
#[derive(Default)]
struct TreeIndex {
    /// item id -> typed path
    paths: HashMap<String, String>,
    /// item id -> dependsOn list
    deps: HashMap<String, Vec<String>>,
    /// folder id -> descendant request ids
    folder_requests: HashMap<String, Vec<String>>,
    /// every request id, in document order
    requests: Vec<String>,
}

/// Apply a filter, returning the pruned collection
pub fn apply_filter(collection: &Collection, spec: &FilterSpec) -> Collection {
    let Some(pattern) = spec.pattern.as_deref().filter(|p| !p.trim().is_empty()) else {
        return collection.clone();
    };
    let regex = match Regex::new(pattern) {
        Ok(r) => r,
        Err(e) => {
            warn!(%pattern, error = %e, "Invalid filter regex; running unfiltered");
            return collection.clone();
        }
    };

    let mut index = TreeIndex::default();
    index_items(&collection.items, "", &mut Vec::new(), &mut index);

    // Direct matches: a folder match pulls its whole subtree
    let mut kept: HashSet<String> = HashSet::new();
    let mut needed: Vec<String> = Vec::new();
    for (id, typed) in &index.paths {
        if !regex.is_match(typed) {
            continue;
        }
        if let Some(descendants) = index.folder_requests.get(id) {
            kept.extend(descendants.iter().cloned());
            needed.push(id.clone());
            needed.extend(descendants.iter().cloned());
        } else {
            kept.insert(id.clone());
            needed.push(id.clone());
        }
    }

    // Dependency closure, transitively
    if !spec.exclude_deps {
        let mut seen: HashSet<String> = needed.iter().cloned().collect();
        while let Some(id) = needed.pop() {
            for dep in index.deps.get(&id).into_iter().flatten() {
                if !seen.insert(dep.clone()) {
                    continue;
                }
                if let Some(descendants) = index.folder_requests.get(dep) {
                    for descendant in descendants {
                        if kept.insert(descendant.clone()) && seen.insert(descendant.clone()) {
                            needed.push(descendant.clone());
                        }
                    }
                } else {
                    kept.insert(dep.clone());
                }
                needed.push(dep.clone());
            }
        }
    }

    debug!(kept = kept.len(), total = index.requests.len(), "Filter keep-set computed");

    let mut filtered = collection.clone();
    filtered.items = prune_items(&collection.items, &kept);

    // Drop references to items the filter removed, so the compiler does
    // not chase ghosts (scenario: excluded dependencies).
    let surviving: HashSet<String> = surviving_ids(&filtered.items);
    strip_dangling_deps(&mut filtered.items, &surviving);
    filtered
}

fn index_items(items: &[Item], parent_slash: &str, open_folders: &mut Vec<String>, index: &mut TreeIndex) {
    for item in items {
        let slash = path::join(parent_slash, item.name());
        match item {
            Item::Folder(folder) => {
                index.paths.insert(folder.id.clone(), path::folder(&slash));
                index.deps.insert(folder.id.clone(), folder.depends_on.clone());
                index.folder_requests.insert(folder.id.clone(), Vec::new());
                open_folders.push(folder.id.clone());
                index_items(&folder.items, &slash, open_folders, index);
                open_folders.pop();
            }
            Item::Request(request) => {
                index.paths.insert(request.id.clone(), path::request(&slash));
                index.deps.insert(request.id.clone(), request.depends_on.clone());
                index.requests.push(request.id.clone());
                for folder_id in open_folders.iter() {
                    index
                        .folder_requests
                        .get_mut(folder_id)
                        .expect("open folder indexed")
                        .push(request.id.clone());
                }
            }
        }
    }
}

/// Rebuild an item list keeping only matching requests; folders survive
/// only when something inside them did.
fn prune_items(items: &[Item], kept: &HashSet<String>) -> Vec<Item> {
    let mut out = Vec::new();
    for item in items {
        match item {
            Item::Request(request) => {
                if kept.contains(&request.id) {
                    out.push(item.clone());
                }
            }
            Item::Folder(folder) => {
                let inner = prune_items(&folder.items, kept);
                if !inner.is_empty() {
                    out.push(Item::Folder(Folder {
                        items: inner,
                        ..folder.clone()
                    }));
                }
            }
        }
    }
    out
}

fn surviving_ids(items: &[Item]) -> HashSet<String> {
    let mut ids = HashSet::new();
    fn walk(items: &[Item], ids: &mut HashSet<String>) {
        for item in items {
            ids.insert(item.id().to_string());
            if let Item::Folder(folder) = item {
                walk(&folder.items, ids);
            }
        }
    }
    walk(items, &mut ids);
    ids
}

fn strip_dangling_deps(items: &mut [Item], surviving: &HashSet<String>) {
    for item in items {
        match item {
            Item::Request(request) => {
                request.depends_on.retain(|dep| surviving.contains(dep));
            }
            Item::Folder(folder) => {
                folder.depends_on.retain(|dep| surviving.contains(dep));
                strip_dangling_deps(&mut folder.items, surviving);
            }
        }
    }
}
