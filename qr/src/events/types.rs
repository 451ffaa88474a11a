//! Lifecycle event types
//!
//! The vocabulary reporters consume. Every event carries an [`Envelope`]
//! identifying where in the collection it happened; request events add
//! the request, response, or result payloads as they become available.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use questplugin::{ProtocolRequest, ProtocolResponse};

use crate::collection::model::CollectionInfo;
use crate::runner::result::{RequestResult, RunSummary, TestResult};

/// What kind of path an envelope points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    Collection,
    Folder,
    Request,
}

/// Iteration coordinates for per-iteration events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationInfo {
    pub current: u32,
    pub total: u32,
}

/// Common header on every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event id
    pub id: String,
    /// Typed item path, e.g. `request:/Users/Get User`
    pub path: String,
    #[serde(rename = "pathType")]
    pub path_type: PathType,
    pub collection: CollectionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationInfo>,
}

/// Outcome of one script invocation, attached to `after...Script` events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "durationMs", default)]
    pub duration_ms: u64,
}

/// Console capture level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// The runtime's lifecycle event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    // === Run lifecycle ===
    BeforeRun { envelope: Envelope },
    AfterRun { envelope: Envelope, summary: RunSummary, aborted: bool },
    BeforeIteration { envelope: Envelope },
    AfterIteration { envelope: Envelope },

    // === Collection lifecycle scripts ===
    BeforeCollectionPreScript { envelope: Envelope },
    AfterCollectionPreScript { envelope: Envelope, outcome: ScriptOutcome },
    BeforeCollectionPostScript { envelope: Envelope },
    AfterCollectionPostScript { envelope: Envelope, outcome: ScriptOutcome },

    // === Folder lifecycle ===
    BeforeFolder { envelope: Envelope },
    AfterFolder { envelope: Envelope },
    BeforeFolderPreScript { envelope: Envelope },
    AfterFolderPreScript { envelope: Envelope, outcome: ScriptOutcome },
    BeforeFolderPostScript { envelope: Envelope },
    AfterFolderPostScript { envelope: Envelope, outcome: ScriptOutcome },

    // === Request lifecycle ===
    BeforeItem { envelope: Envelope },
    AfterItem { envelope: Envelope, result: RequestResult },
    BeforePreScript { envelope: Envelope },
    AfterPreScript { envelope: Envelope, outcome: ScriptOutcome },
    BeforeRequest { envelope: Envelope, request: ProtocolRequest },
    AfterRequest {
        envelope: Envelope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ProtocolResponse>,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    BeforePostScript { envelope: Envelope },
    AfterPostScript { envelope: Envelope, outcome: ScriptOutcome },

    // === Plugin events ===
    BeforeEventScript {
        envelope: Envelope,
        #[serde(rename = "eventName")]
        event_name: String,
        data: Value,
    },
    AfterEventScript {
        envelope: Envelope,
        #[serde(rename = "eventName")]
        event_name: String,
        outcome: ScriptOutcome,
    },

    // === Assertions & console ===
    Assertion { envelope: Envelope, test: TestResult },
    Console { envelope: Envelope, level: ConsoleLevel, message: String },
}

impl RunEvent {
    /// The envelope shared by every variant
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::BeforeRun { envelope }
            | Self::AfterRun { envelope, .. }
            | Self::BeforeIteration { envelope }
            | Self::AfterIteration { envelope }
            | Self::BeforeCollectionPreScript { envelope }
            | Self::AfterCollectionPreScript { envelope, .. }
            | Self::BeforeCollectionPostScript { envelope }
            | Self::AfterCollectionPostScript { envelope, .. }
            | Self::BeforeFolder { envelope }
            | Self::AfterFolder { envelope }
            | Self::BeforeFolderPreScript { envelope }
            | Self::AfterFolderPreScript { envelope, .. }
            | Self::BeforeFolderPostScript { envelope }
            | Self::AfterFolderPostScript { envelope, .. }
            | Self::BeforeItem { envelope }
            | Self::AfterItem { envelope, .. }
            | Self::BeforePreScript { envelope }
            | Self::AfterPreScript { envelope, .. }
            | Self::BeforeRequest { envelope, .. }
            | Self::AfterRequest { envelope, .. }
            | Self::BeforePostScript { envelope }
            | Self::AfterPostScript { envelope, .. }
            | Self::BeforeEventScript { envelope, .. }
            | Self::AfterEventScript { envelope, .. }
            | Self::Assertion { envelope, .. }
            | Self::Console { envelope, .. } => envelope,
        }
    }

    /// Stable event-type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BeforeRun { .. } => "beforeRun",
            Self::AfterRun { .. } => "afterRun",
            Self::BeforeIteration { .. } => "beforeIteration",
            Self::AfterIteration { .. } => "afterIteration",
            Self::BeforeCollectionPreScript { .. } => "beforeCollectionPreScript",
            Self::AfterCollectionPreScript { .. } => "afterCollectionPreScript",
            Self::BeforeCollectionPostScript { .. } => "beforeCollectionPostScript",
            Self::AfterCollectionPostScript { .. } => "afterCollectionPostScript",
            Self::BeforeFolder { .. } => "beforeFolder",
            Self::AfterFolder { .. } => "afterFolder",
            Self::BeforeFolderPreScript { .. } => "beforeFolderPreScript",
            Self::AfterFolderPreScript { .. } => "afterFolderPreScript",
            Self::BeforeFolderPostScript { .. } => "beforeFolderPostScript",
            Self::AfterFolderPostScript { .. } => "afterFolderPostScript",
            Self::BeforeItem { .. } => "beforeItem",
            Self::AfterItem { .. } => "afterItem",
            Self::BeforePreScript { .. } => "beforePreScript",
            Self::AfterPreScript { .. } => "afterPreScript",
            Self::BeforeRequest { .. } => "beforeRequest",
            Self::AfterRequest { .. } => "afterRequest",
            Self::BeforePostScript { .. } => "beforePostScript",
            Self::AfterPostScript { .. } => "afterPostScript",
            Self::BeforeEventScript { .. } => "beforeEventScript",
            Self::AfterEventScript { .. } => "afterEventScript",
            Self::Assertion { .. } => "assertion",
            Self::Console { .. } => "console",
        }
    }
}

/// A timestamped event entry for file persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: RunEvent,
}

impl EventLogEntry {
    pub fn new(event: RunEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
