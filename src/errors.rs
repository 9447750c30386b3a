//! Typed error hierarchy for the conveyor pipeline.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError`: missing rows and lock poisoning in the SQLite store
//! - `WorkspaceError`: git working-tree operations
//! - `HostError`: repository hosting API failures
//! - `PipelineError`: per-enhancement orchestration failures

use thiserror::Error;

/// Errors from the enhancement/deployment store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Enhancement {id} not found")]
    EnhancementNotFound { id: i64 },

    #[error("Deployment {id} not found")]
    DeploymentNotFound { id: i64 },

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Errors from the shared working tree.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Working tree is not a git repository: {path}")]
    NotARepository { path: String },

    #[error("Branch {branch} not found")]
    BranchNotFound { branch: String },

    #[error("Push of {branch} was rejected: {message}")]
    PushRejected { branch: String, message: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the repository hosting API.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Pull request {number} not found")]
    PullRequestNotFound { number: i64 },

    #[error("Merge of pull request {number} was rejected: {message}")]
    MergeRejected { number: i64, message: String },

    #[error("Host API error: {0}")]
    Api(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from driving a single enhancement through the pipeline. Caught once
/// at the outer boundary of `process`; the error text is persisted verbatim
/// on the failed row.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Planning failed: {0}")]
    Planning(#[source] anyhow::Error),

    #[error("Code generation failed for task {task_id}: {source}")]
    CodeGen {
        task_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
