//! Error types for the Hearth core.
//!
//! Uses `thiserror` for the public error type with structured variants
//! covering admission, lifecycle, engine, and coordinator failures. All
//! errors propagate synchronously to the caller; the core never retries
//! internally, since retry policy belongs to the transport layer.

use std::path::PathBuf;

/// Top-level error type for the Hearth core library.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown model: {model_id}")]
    UnknownModel { model_id: String },

    #[error("Model already registered: {model_id}")]
    ModelAlreadyRegistered { model_id: String },

    #[error("Invalid descriptor for model '{model_id}': {reason}")]
    InvalidDescriptor { model_id: String, reason: String },

    #[error("Model artifact not readable: {path}")]
    ArtifactUnreadable { path: PathBuf },

    #[error(
        "Insufficient resources to load '{model_id}': needs {needed_mb} MB, at most {reclaimable_mb} MB reclaimable"
    )]
    InsufficientResources {
        model_id: String,
        needed_mb: u64,
        reclaimable_mb: u64,
    },

    #[error("System under resource pressure, load of '{model_id}' rejected")]
    SystemUnderPressure { model_id: String },

    #[error("Loading '{model_id}' timed out after {timeout_secs}s")]
    LoadTimeout { model_id: String, timeout_secs: u64 },

    #[error("Eviction of '{model_id}' timed out after {timeout_secs}s waiting for in-flight requests to drain")]
    EvictionTimeout { model_id: String, timeout_secs: u64 },

    #[error("Engine failed to load '{model_id}': {message}")]
    EngineLoadFailure { model_id: String, message: String },

    #[error("Engine failure: {message}")]
    EngineFailure { message: String },

    #[error("Model '{model_id}' is overloaded: queue wait exceeded {waited_ms}ms")]
    Overloaded { model_id: String, waited_ms: u64 },

    #[error("Resource data is stale; refusing to trust the last snapshot")]
    StaleResourceData,

    #[error("Conflicting lifecycle transition for '{model_id}': {reason}")]
    TransitionConflict { model_id: String, reason: String },

    #[error("Request was cancelled before dispatch")]
    RequestCancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether the transport layer should surface this as a transient
    /// "system busy" condition rather than a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::InsufficientResources { .. }
                | CoreError::SystemUnderPressure { .. }
                | CoreError::LoadTimeout { .. }
                | CoreError::EvictionTimeout { .. }
                | CoreError::Overloaded { .. }
                | CoreError::StaleResourceData
        )
    }
}

/// A type alias for results using the top-level `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;
