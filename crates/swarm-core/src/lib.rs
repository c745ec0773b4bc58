//! Core data model for swarm: agent records, the compose document, and the
//! error taxonomy shared by the engine and the CLI.

pub mod compose;
pub mod error;
pub mod types;

pub use compose::{ComposeFile, DepCondition, Dependency, Pipeline, PromptSource, TaskDefinition};
pub use error::{Error, Result};
pub use types::{
    AgentRecord, AgentStatus, ExitReason, LogEvent, TaskState, TaskStatus, TerminateMode,
    TimeoutReason, UsageStats,
};
