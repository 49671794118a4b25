use thiserror::Error;

/// Failure taxonomy for the engine. Per-target and per-mutant failures are
/// contained to their unit and recorded; they never abort a batch.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sandbox creation failed: {0}")]
    SandboxCreation(String),

    #[error("patch does not apply to {file}: {reason}")]
    PatchApplication { file: String, reason: String },

    #[error("compilation failed: {0}")]
    Compile(String),

    #[error("test failure in {method}: {message}")]
    TestFailure { method: String, message: String },

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("merge conflict on {path}")]
    MergeConflict { path: String },

    #[error("combinatorial conflict between generated artifacts: {names:?}")]
    InterAssertConflict { names: Vec<String> },

    #[error("store error: {0}")]
    Store(String),

    #[error("generator error: {0}")]
    Generator(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
