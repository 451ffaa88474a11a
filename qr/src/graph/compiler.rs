//! Task graph compiler
//!
//! Lowers a (possibly filtered) collection tree into the typed DAG the
//! scheduler executes. Folder boundaries become enter/exit nodes, folder
//! lifecycle scripts become script nodes, and every request becomes one
//! I/O node carrying its resolved inherited script lists and effective
//! auth. Sequential mode adds document-order edges between siblings;
//! parallel mode leaves independent siblings unordered.
//!
//! `dependsOn` may reference any non-ancestor item in the tree
//! (cross-subtree edges are plain precedence edges); the only structural
//! requirement is acyclicity, checked twice - over the raw dependency
//! lists for a readable error, then over the final edge set.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::collection::model::{Auth, Collection, Folder, Item, Request};
use crate::collection::options::ExecutionOptions;
use crate::collection::path;
use crate::error::{RunnerError, ScriptPhase};
use crate::script::queue::{RequestSpec, SourcedScript};
use crate::util::non_blank;

use super::node::{NodeKind, ScriptNode, TaskGraph, TaskNode};

/// Compile a collection into a task graph
pub fn compile(collection: &Collection, options: &ExecutionOptions) -> Result<TaskGraph, RunnerError> {
    debug!(sequential = options.sequential(), items = collection.items.len(), "Compiling task graph");
    validate_dependencies(collection)?;

    let mut builder = Builder {
        sequential: options.sequential(),
        nodes: Vec::new(),
        edges: BTreeSet::new(),
        entries: HashMap::new(),
        open_folders: Vec::new(),
        folder_subtrees: HashMap::new(),
        deps: Vec::new(),
    };

    let collection_auth = collection.auth.as_ref().filter(|a| !a.is_inherit());
    let mut pre_chain = Vec::new();
    if let Some(source) = non_blank(collection.request_pre_script.as_deref()) {
        pre_chain.push(SourcedScript {
            owner_path: path::collection(),
            source: source.to_string(),
        });
    }
    let mut post_chain = Vec::new();
    if let Some(source) = non_blank(collection.request_post_script.as_deref()) {
        post_chain.push(SourcedScript {
            owner_path: path::collection(),
            source: source.to_string(),
        });
    }

    builder.compile_children(&collection.items, "", collection_auth, &pre_chain, &post_chain);
    builder.add_dependency_edges()?;
    builder.finish()
}

/// Reject `dependsOn` cycles over the raw item lists, with the cycle
/// path in the error.
fn validate_dependencies(collection: &Collection) -> Result<(), RunnerError> {
    let mut dep_map: HashMap<String, Vec<String>> = HashMap::new();
    collection.walk(&mut |item| {
        dep_map.insert(item.id().to_string(), item.depends_on().to_vec());
    });

    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut stack_path = Vec::new();

    for id in dep_map.keys() {
        if !visited.contains(id.as_str())
            && has_cycle(id, &dep_map, &mut visited, &mut in_stack, &mut stack_path)
        {
            return Err(RunnerError::Config(format!(
                "dependency cycle: {}",
                stack_path.join(" -> ")
            )));
        }
    }
    Ok(())
}

fn has_cycle<'a>(
    node: &'a str,
    graph: &'a HashMap<String, Vec<String>>,
    visited: &mut HashSet<&'a str>,
    in_stack: &mut HashSet<&'a str>,
    stack_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    in_stack.insert(node);
    stack_path.push(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str()) && has_cycle(dep, graph, visited, in_stack, stack_path) {
                    return true;
                }
            } else if in_stack.contains(dep.as_str()) {
                stack_path.push(dep.clone());
                return true;
            }
        }
    }

    in_stack.remove(node);
    stack_path.pop();
    false
}

struct Builder {
    sequential: bool,
    nodes: Vec<TaskNode>,
    edges: BTreeSet<(usize, usize)>,
    /// item id -> (entry node, exit node); requests map to themselves
    entries: HashMap<String, (usize, usize)>,
    open_folders: Vec<String>,
    folder_subtrees: HashMap<String, Vec<usize>>,
    deps: Vec<(String, Vec<String>)>,
}

impl Builder {
    fn add_node(&mut self, node: TaskNode) -> usize {
        let index = self.nodes.len();
        for folder_id in &self.open_folders {
            self.folder_subtrees
                .get_mut(folder_id)
                .expect("open folder registered")
                .push(index);
        }
        self.nodes.push(node);
        index
    }

    fn edge(&mut self, from: usize, to: usize) {
        if from != to {
            self.edges.insert((from, to));
        }
    }

    /// Compile an item list, wiring sibling order when sequential.
    /// Returns (first entries, last exits): all entry nodes a parent must
    /// precede and all exit nodes that must precede what follows.
    fn compile_children(
        &mut self,
        items: &[Item],
        parent_slash: &str,
        inherited_auth: Option<&Auth>,
        pre_chain: &[SourcedScript],
        post_chain: &[SourcedScript],
    ) -> (Vec<usize>, Vec<usize>) {
        let mut spans = Vec::with_capacity(items.len());
        for item in items {
            let span = match item {
                Item::Folder(folder) => self.compile_folder(folder, parent_slash, inherited_auth, pre_chain, post_chain),
                Item::Request(request) => {
                    self.compile_request(request, parent_slash, inherited_auth, pre_chain, post_chain)
                }
            };
            spans.push(span);
        }

        if self.sequential {
            for pair in spans.windows(2) {
                self.edge(pair[0].1, pair[1].0);
            }
            match spans.as_slice() {
                [] => (Vec::new(), Vec::new()),
                [only] => (vec![only.0], vec![only.1]),
                [first, .., last] => (vec![first.0], vec![last.1]),
            }
        } else {
            (
                spans.iter().map(|(entry, _)| *entry).collect(),
                spans.iter().map(|(_, exit)| *exit).collect(),
            )
        }
    }

    fn compile_folder(
        &mut self,
        folder: &Folder,
        parent_slash: &str,
        inherited_auth: Option<&Auth>,
        pre_chain: &[SourcedScript],
        post_chain: &[SourcedScript],
    ) -> (usize, usize) {
        let slash = path::join(parent_slash, &folder.name);
        let typed = path::folder(&slash);

        let enter = self.add_node(TaskNode {
            id: format!("enter:{}", folder.id),
            kind: NodeKind::FolderEnter,
            path: typed.clone(),
            condition: folder.condition.clone(),
            script: None,
            request: None,
            folder_id: Some(folder.id.clone()),
        });

        self.open_folders.push(folder.id.clone());
        self.folder_subtrees.insert(folder.id.clone(), Vec::new());

        let pre = non_blank(folder.pre_script.as_deref()).map(|source| {
            self.add_node(TaskNode {
                id: format!("pre:{}", folder.id),
                kind: NodeKind::Script,
                path: typed.clone(),
                condition: None,
                script: Some(ScriptNode {
                    source: source.to_string(),
                    phase: ScriptPhase::FolderPre,
                }),
                request: None,
                folder_id: Some(folder.id.clone()),
            })
        });

        let folder_auth = effective_auth(folder.auth.as_ref(), inherited_auth);
        let mut child_pre = pre_chain.to_vec();
        if let Some(source) = non_blank(folder.request_pre_script.as_deref()) {
            child_pre.push(SourcedScript {
                owner_path: typed.clone(),
                source: source.to_string(),
            });
        }
        let mut child_post = post_chain.to_vec();
        if let Some(source) = non_blank(folder.request_post_script.as_deref()) {
            child_post.push(SourcedScript {
                owner_path: typed.clone(),
                source: source.to_string(),
            });
        }

        let (child_entries, child_exits) = self.compile_children(&folder.items, &slash, folder_auth, &child_pre, &child_post);

        let post = non_blank(folder.post_script.as_deref()).map(|source| {
            self.add_node(TaskNode {
                id: format!("post:{}", folder.id),
                kind: NodeKind::Script,
                path: typed.clone(),
                condition: None,
                script: Some(ScriptNode {
                    source: source.to_string(),
                    phase: ScriptPhase::FolderPost,
                }),
                request: None,
                folder_id: Some(folder.id.clone()),
            })
        });

        self.open_folders.pop();

        let exit = self.add_node(TaskNode {
            id: format!("exit:{}", folder.id),
            kind: NodeKind::FolderExit,
            path: typed,
            condition: None,
            script: None,
            request: None,
            folder_id: Some(folder.id.clone()),
        });

        // enter -> pre -> children -> post -> exit, collapsing absent stages
        let head = pre.unwrap_or(enter);
        if pre.is_some() {
            self.edge(enter, head);
        }
        let tail = post.unwrap_or(exit);
        if post.is_some() {
            self.edge(tail, exit);
        }
        if child_entries.is_empty() {
            self.edge(head, tail);
        } else {
            for entry in child_entries {
                self.edge(head, entry);
            }
            for child_exit in child_exits {
                self.edge(child_exit, tail);
            }
        }

        self.entries.insert(folder.id.clone(), (enter, exit));
        self.deps.push((folder.id.clone(), folder.depends_on.clone()));
        (enter, exit)
    }

    fn compile_request(
        &mut self,
        request: &Request,
        parent_slash: &str,
        inherited_auth: Option<&Auth>,
        pre_chain: &[SourcedScript],
        post_chain: &[SourcedScript],
    ) -> (usize, usize) {
        let slash = path::join(parent_slash, &request.name);
        let typed = path::request(&slash);

        let mut pre_scripts = pre_chain.to_vec();
        if let Some(source) = non_blank(request.pre_script.as_deref()) {
            pre_scripts.push(SourcedScript {
                owner_path: typed.clone(),
                source: source.to_string(),
            });
        }
        // Post lists run request-first, then inner folders outward
        let mut post_scripts = Vec::with_capacity(post_chain.len() + 1);
        if let Some(source) = non_blank(request.post_script.as_deref()) {
            post_scripts.push(SourcedScript {
                owner_path: typed.clone(),
                source: source.to_string(),
            });
        }
        post_scripts.extend(post_chain.iter().rev().cloned());

        let auth = effective_auth(request.auth.as_ref(), inherited_auth).cloned();

        let index = self.add_node(TaskNode {
            id: request.id.clone(),
            kind: NodeKind::Request,
            path: typed.clone(),
            condition: request.condition.clone(),
            script: None,
            request: Some(Box::new(RequestSpec {
                id: request.id.clone(),
                name: request.name.clone(),
                path: typed,
                data: request.data.clone(),
                effective_auth: auth,
                pre_scripts,
                post_scripts,
                event_scripts: request.events.clone(),
            })),
            folder_id: None,
        });

        self.entries.insert(request.id.clone(), (index, index));
        self.deps.push((request.id.clone(), request.depends_on.clone()));
        (index, index)
    }

    /// `Y -> X` for every `X dependsOn Y`, from Y's exit to X's entry
    fn add_dependency_edges(&mut self) -> Result<(), RunnerError> {
        let deps = std::mem::take(&mut self.deps);
        for (item_id, item_deps) in &deps {
            let (entry, _) = self.entries[item_id.as_str()];
            for dep in item_deps {
                let Some(&(_, dep_exit)) = self.entries.get(dep.as_str()) else {
                    return Err(RunnerError::Config(format!(
                        "item {item_id} depends on unknown item {dep}"
                    )));
                };
                self.edge(dep_exit, entry);
            }
        }
        Ok(())
    }

    /// Materialize pred counts and successor lists, rejecting any cycle
    /// the raw dependency check could not see (e.g. a dependency on an
    /// ancestor folder, or a backward dependency under sequential order).
    fn finish(self) -> Result<TaskGraph, RunnerError> {
        let count = self.nodes.len();
        let mut preds = vec![0usize; count];
        let mut succs = vec![Vec::new(); count];
        for &(from, to) in &self.edges {
            preds[to] += 1;
            succs[from].push(to);
        }

        // Kahn's algorithm as the final acyclicity gate
        let mut remaining = preds.clone();
        let mut ready: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;
        while let Some(index) = ready.pop() {
            processed += 1;
            for &succ in &succs[index] {
                remaining[succ] -= 1;
                if remaining[succ] == 0 {
                    ready.push(succ);
                }
            }
        }
        if processed != count {
            return Err(RunnerError::Config(
                "dependency graph contains a cycle (possibly through a folder boundary)".to_string(),
            ));
        }

        debug!(nodes = count, edges = self.edges.len(), "Task graph compiled");
        Ok(TaskGraph {
            nodes: self.nodes,
            preds,
            succs,
            folder_subtrees: self.folder_subtrees,
        })
    }
}

/// Walk `inherit` to the nearest concrete ancestor auth; `none` means
/// "no auth at all".
fn effective_auth<'a>(own: Option<&'a Auth>, inherited: Option<&'a Auth>) -> Option<&'a Auth> {
    let resolved = match own {
        Some(auth) if auth.is_inherit() => inherited,
        Some(auth) => Some(auth),
        None => inherited,
    };
    resolved.filter(|auth| !auth.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::model::Collection;

    fn sequential() -> ExecutionOptions {
        ExecutionOptions::default()
    }

    fn parallel() -> ExecutionOptions {
        ExecutionOptions {
            allow_parallel: true,
            max_concurrency: 4,
            ..Default::default()
        }
    }

    fn tree() -> Collection {
        Collection::parse(
            r#"{
                "info": { "id": "c", "name": "C", "version": "1", "protocol": "http" },
                "auth": { "type": "basic", "data": { "user": "u" } },
                "requestPreScript": "quest.variables.set('from', 'collection')",
                "items": [
                    {
                        "type": "folder", "id": "f1", "name": "A",
                        "preScript": "quest.variables.set('in', 'A')",
                        "postScript": "quest.variables.unset('in')",
                        "requestPreScript": "quest.variables.set('from', 'folder')",
                        "items": [
                            {
                                "type": "request", "id": "r1", "name": "One",
                                "preScript": "quest.variables.set('from', 'request')",
                                "data": { "url": "http://x/1" }
                            },
                            {
                                "type": "request", "id": "r2", "name": "Two",
                                "auth": { "type": "none" },
                                "data": { "url": "http://x/2" },
                                "postScript": "quest.test('t', function() end)"
                            }
                        ]
                    },
                    {
                        "type": "request", "id": "r3", "name": "Three",
                        "dependsOn": ["f1"],
                        "data": { "url": "http://x/3" }
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    fn index_of(graph: &TaskGraph, id: &str) -> usize {
        graph.nodes.iter().position(|n| n.id == id).unwrap()
    }

    fn has_edge(graph: &TaskGraph, from: &str, to: &str) -> bool {
        let from = index_of(graph, from);
        let to = index_of(graph, to);
        graph.succs[from].contains(&to)
    }

    #[test]
    fn test_node_inventory() {
        let graph = compile(&tree(), &sequential()).unwrap();
        // enter/pre/r1/r2/post/exit + r3
        assert_eq!(graph.len(), 7);
        assert_eq!(graph.request_count(), 3);
        assert_eq!(graph.nodes[index_of(&graph, "r1")].path, "request:/A/One");
        assert_eq!(graph.nodes[index_of(&graph, "enter:f1")].path, "folder:/A");
    }

    #[test]
    fn test_folder_edges() {
        let graph = compile(&tree(), &sequential()).unwrap();
        assert!(has_edge(&graph, "enter:f1", "pre:f1"));
        assert!(has_edge(&graph, "pre:f1", "r1"));
        assert!(has_edge(&graph, "r1", "r2"));
        assert!(has_edge(&graph, "r2", "post:f1"));
        assert!(has_edge(&graph, "post:f1", "exit:f1"));
        // dependsOn: folder exit precedes the dependent request
        assert!(has_edge(&graph, "exit:f1", "r3"));
    }

    #[test]
    fn test_parallel_drops_sibling_order() {
        let graph = compile(&tree(), &parallel()).unwrap();
        assert!(!has_edge(&graph, "r1", "r2"));
        // Structural folder edges stay
        assert!(has_edge(&graph, "pre:f1", "r1"));
        assert!(has_edge(&graph, "pre:f1", "r2"));
        assert!(has_edge(&graph, "r1", "post:f1"));
        assert!(has_edge(&graph, "r2", "post:f1"));
        // dependsOn edges stay
        assert!(has_edge(&graph, "exit:f1", "r3"));
    }

    #[test]
    fn test_inherited_script_lists() {
        let graph = compile(&tree(), &sequential()).unwrap();
        let r1 = graph.nodes[index_of(&graph, "r1")].request.as_ref().unwrap();
        let owners: Vec<&str> = r1.pre_scripts.iter().map(|s| s.owner_path.as_str()).collect();
        assert_eq!(owners, vec!["collection:/", "folder:/A", "request:/A/One"]);

        let r2 = graph.nodes[index_of(&graph, "r2")].request.as_ref().unwrap();
        let owners: Vec<&str> = r2.post_scripts.iter().map(|s| s.owner_path.as_str()).collect();
        // request first, then outward (no folder/collection post hooks here)
        assert_eq!(owners, vec!["request:/A/Two"]);
    }

    #[test]
    fn test_effective_auth_resolution() {
        let graph = compile(&tree(), &sequential()).unwrap();
        // r1 inherits the collection's basic auth
        let r1 = graph.nodes[index_of(&graph, "r1")].request.as_ref().unwrap();
        assert_eq!(r1.effective_auth.as_ref().unwrap().auth_type, "basic");
        // r2 opts out with type "none"
        let r2 = graph.nodes[index_of(&graph, "r2")].request.as_ref().unwrap();
        assert!(r2.effective_auth.is_none());
    }

    #[test]
    fn test_folder_subtree_map() {
        let graph = compile(&tree(), &sequential()).unwrap();
        let subtree = &graph.folder_subtrees["f1"];
        let ids: Vec<&str> = subtree.iter().map(|&i| graph.nodes[i].id.as_str()).collect();
        assert_eq!(ids, vec!["pre:f1", "r1", "r2", "post:f1"]);
    }

    #[test]
    fn test_roots() {
        let graph = compile(&tree(), &sequential()).unwrap();
        assert_eq!(graph.roots(), vec![index_of(&graph, "enter:f1")]);

        let graph = compile(&tree(), &parallel()).unwrap();
        // r3 still waits on f1 through its dependency
        assert_eq!(graph.roots(), vec![index_of(&graph, "enter:f1")]);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let collection = Collection::parse(
            r#"{
                "info": { "id": "c", "name": "C", "version": "1", "protocol": "http" },
                "items": [
                    { "type": "request", "id": "a", "name": "A", "dependsOn": ["b"], "data": {} },
                    { "type": "request", "id": "b", "name": "B", "dependsOn": ["a"], "data": {} }
                ]
            }"#,
        )
        .unwrap();
        let err = compile(&collection, &parallel()).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_dependency_on_ancestor_rejected() {
        let collection = Collection::parse(
            r#"{
                "info": { "id": "c", "name": "C", "version": "1", "protocol": "http" },
                "items": [
                    {
                        "type": "folder", "id": "f", "name": "F",
                        "items": [
                            { "type": "request", "id": "r", "name": "R", "dependsOn": ["f"], "data": {} }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        // The raw lists are acyclic, but the folder boundary makes this
        // unsatisfiable; the final Kahn pass catches it.
        let err = compile(&collection, &parallel()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let collection = Collection::parse(
            r#"{
                "info": { "id": "c", "name": "C", "version": "1", "protocol": "http" },
                "items": [
                    { "type": "request", "id": "a", "name": "A", "dependsOn": ["ghost"], "data": {} }
                ]
            }"#,
        )
        .unwrap();
        let err = compile(&collection, &sequential()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let collection = tree();
        let first = compile(&collection, &sequential()).unwrap();
        let second = compile(&collection, &sequential()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_folder_chains_through() {
        let collection = Collection::parse(
            r#"{
                "info": { "id": "c", "name": "C", "version": "1", "protocol": "http" },
                "items": [
                    { "type": "folder", "id": "f", "name": "Empty", "items": [] }
                ]
            }"#,
        )
        .unwrap();
        let graph = compile(&collection, &sequential()).unwrap();
        assert_eq!(graph.len(), 2);
        assert!(has_edge(&graph, "enter:f", "exit:f"));
    }
}
