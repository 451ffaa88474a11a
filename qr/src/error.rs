//! Runtime error taxonomy
//!
//! Test results drive the user-visible outcome of a run; only the error
//! kinds here abort one. Protocol-level failures are deliberately absent:
//! they travel inside `ProtocolResponse.error` because post-scripts may
//! expect and assert on them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use questplugin::PluginError;

/// Phase a script was executing in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptPhase {
    CollectionPre,
    CollectionPost,
    FolderPre,
    FolderPost,
    PreRequest,
    PostRequest,
    Condition,
    Event,
}

impl std::fmt::Display for ScriptPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CollectionPre => "collectionPre",
            Self::CollectionPost => "collectionPost",
            Self::FolderPre => "folderPre",
            Self::FolderPost => "folderPost",
            Self::PreRequest => "prerequest",
            Self::PostRequest => "postrequest",
            Self::Condition => "condition",
            Self::Event => "event",
        };
        write!(f, "{name}")
    }
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Item path the finding refers to, e.g. `request:/Users/Get User`
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors that abort a run (or prevent it from starting)
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid options or a cyclic dependency graph
    #[error("Configuration error: {0}")]
    Config(String),

    /// Strict-mode validation failed
    #[error("Collection validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    /// A capability was demanded that no loaded plugin provides
    #[error("Missing plugin: {0}")]
    MissingPlugin(String),

    /// A script threw; fail-fast aborts the run
    #[error("Script error in {phase} phase: {message}")]
    Script { phase: ScriptPhase, message: String },

    /// A script exceeded its wall-clock budget
    #[error("Script exceeded its {budget_secs}s budget in {phase} phase")]
    ScriptTimeout { phase: ScriptPhase, budget_secs: u64 },

    /// The run was cancelled, by the caller or by bail
    #[error("Run aborted: {reason}")]
    Aborted { reason: String },

    /// External libraries requested without the explicit allow flag
    #[error("Security error: {0}")]
    Security(String),

    /// Plugin machinery failure outside the protocol-error carve-out
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl RunnerError {
    /// Script-error convenience constructor
    pub fn script(phase: ScriptPhase, message: impl Into<String>) -> Self {
        Self::Script {
            phase,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_phase_display() {
        assert_eq!(ScriptPhase::PreRequest.to_string(), "prerequest");
        assert_eq!(ScriptPhase::CollectionPost.to_string(), "collectionPost");
    }

    #[test]
    fn test_validation_error_display() {
        let err = RunnerError::Validation(vec![
            ValidationIssue::new("request:/A", "duplicate id"),
            ValidationIssue::new("folder:/B", "unknown dependency"),
        ]);
        assert!(err.to_string().contains("2 issue(s)"));
    }

    #[test]
    fn test_missing_plugin_from_plugin_error() {
        let err: RunnerError = PluginError::missing_protocol("http").into();
        assert!(err.to_string().contains("http"));
    }
}
