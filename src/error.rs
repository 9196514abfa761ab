use std::path::PathBuf;

/// Stable error taxonomy surfaced to callers, logs, and `item.last_error`.
///
/// Classification:
/// - Retryable: the phase executor should spend another attempt.
/// - Fatal: the batch should not continue attempting this item this run.
/// - Everything else: user-facing, surfaced as-is with a nonzero exit code.
#[derive(Debug, thiserror::Error)]
pub enum WreckitError {
    #[error(".wreckit directory not found under {0}")]
    RepoNotFound(PathBuf),

    #[error("invalid JSON in {path}: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("schema validation failed for {path}: {errors:?}")]
    SchemaValidation { path: PathBuf, errors: Vec<String> },

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("ambiguous item id '{0}' matches: {1:?}")]
    AmbiguousId(String, Vec<String>),

    #[error("phase {phase} failed for {item_id} after {attempts} attempt(s): {last_error}")]
    PhaseFailed {
        item_id: String,
        phase: String,
        attempts: u32,
        last_error: String,
    },

    #[error("phase {phase} timed out for {item_id} after {timeout_secs}s")]
    PhaseTimedOut {
        item_id: String,
        phase: String,
        timeout_secs: u64,
    },

    #[error("required artifact {path} was not created")]
    ArtifactNotCreated { path: PathBuf },

    #[error("scope violation: disallowed path(s) changed: {paths:?}")]
    ScopeViolation { paths: Vec<String> },

    #[error("research quality check failed: {0:?}")]
    ResearchQuality(Vec<String>),

    #[error("plan quality check failed: {0:?}")]
    PlanQuality(Vec<String>),

    #[error("story quality check failed: {0:?}")]
    StoryQuality(Vec<String>),

    #[error("payload validation failed: {0}")]
    PayloadValidation(String),

    #[error("structured tool call '{tool}' was required but was not invoked")]
    McpToolNotCalled { tool: String },

    #[error("branch operation failed: {0}")]
    BranchError(String),

    #[error("push failed: {0}")]
    PushError(String),

    #[error("PR creation/update failed: {0}")]
    PrCreationError(String),

    #[error("merge conflict on branch {0}")]
    MergeConflict(String),

    #[error("git command failed: {0}")]
    Git(String),

    #[error("{0}")]
    GenericWreckit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WreckitError {
    /// Whether the phase executor should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WreckitError::ArtifactNotCreated { .. }
                | WreckitError::ScopeViolation { .. }
                | WreckitError::ResearchQuality(_)
                | WreckitError::PlanQuality(_)
                | WreckitError::StoryQuality(_)
                | WreckitError::McpToolNotCalled { .. }
                | WreckitError::InvalidJson { .. }
                | WreckitError::SchemaValidation { .. }
        )
    }

    /// Whether this error should halt the batch rather than just fail the item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WreckitError::RepoNotFound(_))
    }

    /// Stable short code, used in log lines and `item.last_error`.
    pub fn code(&self) -> &'static str {
        match self {
            WreckitError::RepoNotFound(_) => "RepoNotFound",
            WreckitError::InvalidJson { .. } => "InvalidJson",
            WreckitError::SchemaValidation { .. } => "SchemaValidation",
            WreckitError::ItemNotFound(_) => "ItemNotFound",
            WreckitError::AmbiguousId(_, _) => "AmbiguousId",
            WreckitError::PhaseFailed { .. } => "PhaseFailed",
            WreckitError::PhaseTimedOut { .. } => "PhaseTimedOut",
            WreckitError::ArtifactNotCreated { .. } => "ArtifactNotCreated",
            WreckitError::ScopeViolation { .. } => "ScopeViolation",
            WreckitError::ResearchQuality(_) => "ResearchQuality",
            WreckitError::PlanQuality(_) => "PlanQuality",
            WreckitError::StoryQuality(_) => "StoryQuality",
            WreckitError::PayloadValidation(_) => "PayloadValidation",
            WreckitError::McpToolNotCalled { .. } => "McpToolNotCalled",
            WreckitError::BranchError(_) => "BranchError",
            WreckitError::PushError(_) => "PushError",
            WreckitError::PrCreationError(_) => "PrCreationError",
            WreckitError::MergeConflict(_) => "MergeConflict",
            WreckitError::Git(_) => "Git",
            WreckitError::GenericWreckit(_) => "GenericWreckit",
            WreckitError::Io(_) => "Io",
        }
    }
}
