//! Plugin error types

use thiserror::Error;

/// Errors from plugin resolution, loading, and execution
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin directory list itself was unusable
    #[error("Plugin configuration error: {0}")]
    Config(String),

    /// A plugin failed to load; the run continues with the others
    #[error("Failed to load plugin {name}: {reason}")]
    Load { name: String, reason: String },

    /// A capability was requested that no loaded plugin provides
    #[error("No plugin provides {capability} \"{name}\"")]
    Missing { capability: &'static str, name: String },

    /// A plugin threw during execution
    #[error("Plugin {name} failed: {reason}")]
    Execution { name: String, reason: String },
}

impl PluginError {
    /// Missing-protocol convenience constructor
    pub fn missing_protocol(name: impl Into<String>) -> Self {
        Self::Missing {
            capability: "protocol",
            name: name.into(),
        }
    }

    /// Missing-auth convenience constructor
    pub fn missing_auth(name: impl Into<String>) -> Self {
        Self::Missing {
            capability: "auth type",
            name: name.into(),
        }
    }

    /// Missing-provider convenience constructor
    pub fn missing_provider(name: impl Into<String>) -> Self {
        Self::Missing {
            capability: "value provider",
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_display() {
        let err = PluginError::missing_protocol("http");
        assert_eq!(err.to_string(), "No plugin provides protocol \"http\"");
    }

    #[test]
    fn test_load_display() {
        let err = PluginError::Load {
            name: "plugin-http".to_string(),
            reason: "syntax error".to_string(),
        };
        assert!(err.to_string().contains("plugin-http"));
        assert!(err.to_string().contains("syntax error"));
    }
}
