//! Local execution and debugging engine for serverless actions.
//!
//! The engine runs action code inside a single managed Docker container,
//! speaking the container's init/run HTTP protocol, and can attach a node
//! inspector session to it. See [`LocalEngine`] for the entry points.

pub mod action;
pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod images;
pub mod logs;
pub mod runtime;

pub use action::{
    ActionDescriptor, DebugResult, ExecutionResult, LogLine, LogStream, RuntimeKind,
};
pub use config::EngineConfig;
pub use debug::{classify_debugger_line, DebuggerPhase};
pub use engine::{EnsureOutcome, LocalEngine};
pub use error::{Error, Result};
