//! Collection tree model
//!
//! The user-facing document: a header, layered variables, lifecycle
//! scripts, and an ordered tree of folders and requests. Field names
//! follow the collection JSON format (camelCase).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Collection header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Protocol id for every request in this collection
    #[serde(default)]
    pub protocol: String,
}

/// Auth record; `"none"` and `"inherit"` are special types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Auth {
    pub fn is_none(&self) -> bool {
        self.auth_type == "none"
    }

    pub fn is_inherit(&self) -> bool {
        self.auth_type == "inherit"
    }
}

/// A variable: bare string, or a record with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    Text(String),
    Record(VariableRecord),
}

/// The record form of a variable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
    #[serde(rename = "isSecret", default, skip_serializing_if = "Option::is_none")]
    pub is_secret: Option<bool>,
    /// Value-provider id; when set, the value field is the provider key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Variable {
    /// String projection used by comparisons and template expansion
    pub fn value(&self) -> &str {
        match self {
            Self::Text(s) => s,
            Self::Record(r) => &r.value,
        }
    }

    /// Disabled variables are invisible to lookups
    pub fn enabled(&self) -> bool {
        match self {
            Self::Text(_) => true,
            Self::Record(r) => r.enabled.unwrap_or(true),
        }
    }

    /// Provider id, when this variable is provider-backed
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Record(r) => r.provider.as_deref().filter(|p| !p.trim().is_empty()),
            Self::Text(_) => None,
        }
    }
}

impl From<&str> for Variable {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A plugin-event script, e.g. `{event: "onMessage", script: "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolScript {
    pub event: String,
    pub script: String,
}

/// A folder: grouping node with lifecycle scripts and nested items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// Runs once when the folder is entered
    #[serde(rename = "preScript", default, skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<String>,
    /// Runs once before the folder is exited
    #[serde(rename = "postScript", default, skip_serializing_if = "Option::is_none")]
    pub post_script: Option<String>,
    /// Inherited by every descendant request's pre-phase
    #[serde(rename = "requestPreScript", default, skip_serializing_if = "Option::is_none")]
    pub request_pre_script: Option<String>,
    /// Inherited by every descendant request's post-phase
    #[serde(rename = "requestPostScript", default, skip_serializing_if = "Option::is_none")]
    pub request_post_script: Option<String>,
    #[serde(default)]
    pub items: Vec<Item>,
}

/// A request: the I/O leaf
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub name: String,
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// Protocol-specific payload (URL, method, body, ...)
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "preScript", default, skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<String>,
    #[serde(rename = "postScript", default, skip_serializing_if = "Option::is_none")]
    pub post_script: Option<String>,
    /// Plugin-event scripts, run while this request's I/O is in flight
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ProtocolScript>,
}

/// A tree item: folder or request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Item {
    Folder(Folder),
    Request(Request),
}

impl Item {
    pub fn id(&self) -> &str {
        match self {
            Self::Folder(f) => &f.id,
            Self::Request(r) => &r.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Folder(f) => &f.name,
            Self::Request(r) => &r.name,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Folder(f) => &f.depends_on,
            Self::Request(r) => &r.depends_on,
        }
    }

    pub fn condition(&self) -> Option<&str> {
        match self {
            Self::Folder(f) => f.condition.as_deref(),
            Self::Request(r) => r.condition.as_deref(),
        }
    }
}

/// The top-level collection document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub info: CollectionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Variable>,
    /// Iteration rows; each drives one data-driven pass over the tree
    #[serde(rename = "testData", default, skip_serializing_if = "Vec::is_empty")]
    pub test_data: Vec<serde_json::Map<String, Value>>,
    /// Runs once per run, before the first iteration
    #[serde(rename = "collectionPreScript", default, skip_serializing_if = "Option::is_none")]
    pub collection_pre_script: Option<String>,
    /// Runs once per run, after the last iteration
    #[serde(rename = "collectionPostScript", default, skip_serializing_if = "Option::is_none")]
    pub collection_post_script: Option<String>,
    /// Inherited by every request's pre-phase
    #[serde(rename = "requestPreScript", default, skip_serializing_if = "Option::is_none")]
    pub request_pre_script: Option<String>,
    /// Inherited by every request's post-phase
    #[serde(rename = "requestPostScript", default, skip_serializing_if = "Option::is_none")]
    pub request_post_script: Option<String>,
    /// Collection-level runtime options, merged under run-level overrides
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Collection {
    /// Parse a collection from JSON text
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Count requests in the whole tree
    pub fn request_count(&self) -> usize {
        fn count(items: &[Item]) -> usize {
            items
                .iter()
                .map(|item| match item {
                    Item::Request(_) => 1,
                    Item::Folder(f) => count(&f.items),
                })
                .sum()
        }
        count(&self.items)
    }

    /// Visit every item depth-first, parents before children
    pub fn walk(&self, visit: &mut dyn FnMut(&Item)) {
        fn walk_items(items: &[Item], visit: &mut dyn FnMut(&Item)) {
            for item in items {
                visit(item);
                if let Item::Folder(f) = item {
                    walk_items(&f.items, visit);
                }
            }
        }
        walk_items(&self.items, visit);
    }

    /// Find an item anywhere in the tree by id
    pub fn find_item(&self, id: &str) -> Option<&Item> {
        fn find<'a>(items: &'a [Item], id: &str) -> Option<&'a Item> {
            for item in items {
                if item.id() == id {
                    return Some(item);
                }
                if let Item::Folder(f) = item {
                    if let Some(found) = find(&f.items, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        find(&self.items, id)
    }
}
