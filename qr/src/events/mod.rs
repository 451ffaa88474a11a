//! Lifecycle event stream: types, bus, and JSONL persistence

pub mod bus;
pub mod logger;
pub mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, RunEmitter, create_event_bus};
pub use logger::{EventLogger, read_event_log, spawn_event_logger};
pub use types::{
    ConsoleLevel, Envelope, EventLogEntry, IterationInfo, PathType, RunEvent, ScriptOutcome,
};
