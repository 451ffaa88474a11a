//! Scope stack
//!
//! A LIFO stack of variable frames mirroring the lexical position during
//! execution: collection at the bottom, then entered folders, then the
//! in-flight request. Only the script queue's worker touches the stack,
//! so it needs no lock; requests observe flattened snapshots taken there.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collection::model::Variable;

/// Which lexical level a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Collection,
    Folder,
    Request,
}

/// One variable frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeFrame {
    pub level: ScopeLevel,
    /// Item id that pushed this frame
    pub id: String,
    pub vars: BTreeMap<String, Variable>,
}

/// The stack of frames; bottom frame is always the collection scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeStack {
    frames: Vec<ScopeFrame>,
}

impl ScopeStack {
    /// Create a stack with the collection frame at the bottom
    pub fn new(collection_id: impl Into<String>, vars: BTreeMap<String, Variable>) -> Self {
        Self {
            frames: vec![ScopeFrame {
                level: ScopeLevel::Collection,
                id: collection_id.into(),
                vars,
            }],
        }
    }

    /// Push an empty folder frame
    pub fn push_folder(&mut self, id: impl Into<String>) {
        let id = id.into();
        debug!(%id, depth = self.frames.len(), "ScopeStack: push folder frame");
        self.frames.push(ScopeFrame {
            level: ScopeLevel::Folder,
            id,
            vars: BTreeMap::new(),
        });
    }

    /// Push an empty request frame
    pub fn push_request(&mut self, id: impl Into<String>) {
        let id = id.into();
        debug!(%id, depth = self.frames.len(), "ScopeStack: push request frame");
        self.frames.push(ScopeFrame {
            level: ScopeLevel::Request,
            id,
            vars: BTreeMap::new(),
        });
    }

    /// Pop the topmost frame with the given id. Request frames from
    /// parallel requests may interleave, so this removes by id rather
    /// than insisting the frame is on top; folder frames always are.
    /// The collection frame is never popped.
    pub fn pop_frame(&mut self, id: &str) -> Option<ScopeFrame> {
        let position = self.frames.iter().rposition(|f| f.id == id && f.level != ScopeLevel::Collection)?;
        debug!(%id, position, "ScopeStack: pop frame");
        Some(self.frames.remove(position))
    }

    /// True when the top frame carries the given id
    pub fn top_is(&self, id: &str) -> bool {
        self.frames.last().map(|f| f.id == id).unwrap_or(false)
    }

    /// Read a variable, innermost frame first, skipping disabled entries
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.vars.get(name).filter(|v| v.enabled()))
    }

    /// Write to the innermost frame
    pub fn set(&mut self, name: impl Into<String>, value: Variable) {
        if let Some(frame) = self.frames.last_mut() {
            frame.vars.insert(name.into(), value);
        }
    }

    /// Remove from the innermost frame that defines the name
    pub fn unset(&mut self, name: &str) -> bool {
        for frame in self.frames.iter_mut().rev() {
            if frame.vars.remove(name).is_some() {
                return true;
            }
        }
        false
    }

    /// True when any frame defines the name (enabled entries only)
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The collection frame's variables
    pub fn collection_vars(&self) -> &BTreeMap<String, Variable> {
        &self.frames[0].vars
    }

    /// Mutable access to the collection frame's variables
    pub fn collection_vars_mut(&mut self) -> &mut BTreeMap<String, Variable> {
        &mut self.frames[0].vars
    }

    /// Flatten to a precedence-applied map (innermost wins)
    pub fn flatten(&self) -> BTreeMap<String, Variable> {
        let mut flat = BTreeMap::new();
        for frame in &self.frames {
            for (name, value) in &frame.vars {
                if value.enabled() {
                    flat.insert(name.clone(), value.clone());
                }
            }
        }
        flat
    }

    /// Current stack depth (collection frame included)
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(s: &str) -> Variable {
        Variable::Text(s.to_string())
    }

    #[test]
    fn test_precedence_innermost_wins() {
        let mut vars = BTreeMap::new();
        vars.insert("host".to_string(), var("collection.test"));
        let mut stack = ScopeStack::new("c1", vars);

        stack.push_folder("f1");
        stack.set("host", var("folder.test"));
        assert_eq!(stack.get("host").unwrap().value(), "folder.test");

        stack.push_request("r1");
        stack.set("host", var("request.test"));
        assert_eq!(stack.get("host").unwrap().value(), "request.test");

        stack.pop_frame("r1");
        assert_eq!(stack.get("host").unwrap().value(), "folder.test");

        stack.pop_frame("f1");
        assert_eq!(stack.get("host").unwrap().value(), "collection.test");
    }

    #[test]
    fn test_pop_by_id_out_of_order() {
        let mut stack = ScopeStack::new("c1", BTreeMap::new());
        stack.push_request("a");
        stack.push_request("b");

        // Parallel requests can finish out of stack order
        let frame = stack.pop_frame("a").unwrap();
        assert_eq!(frame.id, "a");
        assert_eq!(stack.depth(), 2);
        assert!(stack.top_is("b"));
        assert!(stack.pop_frame("a").is_none());
    }

    #[test]
    fn test_collection_frame_never_pops() {
        let mut stack = ScopeStack::new("c1", BTreeMap::new());
        assert!(stack.pop_frame("c1").is_none());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_unset_innermost_definition() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), var("outer"));
        let mut stack = ScopeStack::new("c1", vars);
        stack.push_folder("f1");
        stack.set("x", var("inner"));

        assert!(stack.unset("x"));
        assert_eq!(stack.get("x").unwrap().value(), "outer");
        assert!(stack.unset("x"));
        assert!(!stack.has("x"));
        assert!(!stack.unset("x"));
    }

    #[test]
    fn test_disabled_variables_invisible() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), var("visible"));
        let mut stack = ScopeStack::new("c1", vars);
        stack.push_folder("f1");
        stack.set(
            "x",
            Variable::Record(crate::collection::model::VariableRecord {
                value: "hidden".to_string(),
                enabled: Some(false),
                ..Default::default()
            }),
        );

        // The disabled inner entry falls through to the outer one
        assert_eq!(stack.get("x").unwrap().value(), "visible");
        let flat = stack.flatten();
        assert_eq!(flat["x"].value(), "visible");
    }

    #[test]
    fn test_flatten_precedence() {
        let mut vars = BTreeMap::new();
        vars.insert("a".to_string(), var("1"));
        vars.insert("b".to_string(), var("2"));
        let mut stack = ScopeStack::new("c1", vars);
        stack.push_folder("f1");
        stack.set("b", var("20"));
        stack.set("c", var("30"));

        let flat = stack.flatten();
        assert_eq!(flat["a"].value(), "1");
        assert_eq!(flat["b"].value(), "20");
        assert_eq!(flat["c"].value(), "30");
    }
}
