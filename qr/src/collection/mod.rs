//! Collection model and the passes that run over it before execution

pub mod analyzer;
pub mod filter;
pub mod model;
pub mod options;
pub mod path;
pub mod validator;

pub use analyzer::analyze;
pub use filter::{FilterSpec, apply_filter};
pub use model::{Auth, Collection, CollectionInfo, Folder, Item, ProtocolScript, Request, Variable, VariableRecord};
pub use options::{ExecutionOptions, JarOptions, LibrarySource, RunOptions, SCRIPT_BUDGET_SECS, deep_merge};
pub use validator::{ValidationOutcome, validate};
