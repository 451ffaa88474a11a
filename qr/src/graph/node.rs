//! Task graph node and edge model
//!
//! The compiled form of a collection: typed nodes with explicit
//! precedence edges, stored as predecessor counts plus successor lists
//! so the scheduler can propagate readiness in O(edges).

use std::collections::HashMap;

use crate::error::ScriptPhase;
use crate::script::queue::RequestSpec;

/// What a node does when it becomes ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Push the folder scope, emit `beforeFolder`
    FolderEnter,
    /// Pop the scope (if pushed), emit `afterFolder`
    FolderExit,
    /// A folder lifecycle script
    Script,
    /// The I/O node for a request
    Request,
}

/// Payload of a [`NodeKind::Script`] node
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptNode {
    pub source: String,
    /// `FolderPre` or `FolderPost`
    pub phase: ScriptPhase,
}

/// One compiled unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    /// Unique node id: the item id for requests, `enter:`/`exit:`/
    /// `pre:`/`post:` prefixed folder ids otherwise
    pub id: String,
    pub kind: NodeKind,
    /// Typed path, e.g. `folder:/A` or `request:/A/Get`
    pub path: String,
    /// Condition expression, evaluated on the script queue
    pub condition: Option<String>,
    pub script: Option<ScriptNode>,
    pub request: Option<Box<RequestSpec>>,
    /// Owning folder id for enter/exit/script nodes
    pub folder_id: Option<String>,
}

/// The compiled DAG
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
    /// Unsatisfied-predecessor count per node (at compile time)
    pub preds: Vec<usize>,
    /// Successor indices per node
    pub succs: Vec<Vec<usize>>,
    /// For each folder id: every node index strictly inside its subtree
    /// (lifecycle scripts included, the folder's own enter/exit excluded)
    pub folder_subtrees: HashMap<String, Vec<usize>>,
}

impl TaskGraph {
    /// Node indices with no predecessors
    pub fn roots(&self) -> Vec<usize> {
        self.preds
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Count of request nodes
    pub fn request_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Request).count()
    }
}
