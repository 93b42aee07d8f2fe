//! Error taxonomy for the local execution engine.

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote runtimes listing could not be fetched or parsed. The
    /// failure is not cached; a later resolve retries the fetch.
    #[error("could not fetch the runtimes directory: {reason}")]
    ImageDirectoryUnavailable { reason: String },

    /// Both the kill-by-name and remove-by-name fallbacks failed. The
    /// container may be left in an unknown state requiring manual cleanup.
    #[error("failed to stop and remove container '{name}': {reason}")]
    ContainerTeardownFailed { name: String, reason: String },

    /// Creation failed because a stale container still occupies the fixed
    /// name. Retryable once the stale container is gone.
    #[error("container name '{name}' is taken by a stale container; kill it and retry")]
    ContainerNameConflict { name: String },

    /// An init or run call failed at the network layer. The engine tears the
    /// container down before surfacing this, so the next invocation starts
    /// from a clean slate.
    #[error("container API call failed during {phase}: {reason}")]
    ExecutionNetworkError { phase: &'static str, reason: String },

    /// Debug sessions are only supported for nodejs kinds.
    #[error("debugging is not supported for runtime kind '{kind}'")]
    UnsupportedDebugTarget { kind: String },

    /// Archive extraction, manifest parsing, or a file write failed while
    /// preparing the debug staging directory.
    #[error("failed to stage the debug session: {reason}")]
    StagingError { reason: String },

    /// The debuggee signaled completion but the result file could not be
    /// copied out or parsed.
    #[error("failed to retrieve the debug result: {reason}")]
    ResultRetrievalError { reason: String },

    /// A container engine operation failed for a reason the engine does not
    /// classify further.
    #[error("container engine error: {0}")]
    ContainerEngine(String),

    /// Engine construction failed before any container work started.
    #[error("engine setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
