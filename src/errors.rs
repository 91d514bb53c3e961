use thiserror::Error;

/// Typed error hierarchy for oxiclaw.
///
/// Use at module boundaries (transport, container runs, IPC handling, KB
/// pipeline, scheduling). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant allows seamless conversion
/// via the `?` operator.
#[derive(Debug, Error)]
pub enum OxiclawError {
    #[error("Transport unavailable: {0}")]
    Transport(String),

    #[error("Chat {0} is not a registered group")]
    NotRegistered(String),

    #[error("Unauthorized: group '{from_group}' may not touch '{target}'")]
    Unauthorized { from_group: String, target: String },

    #[error("Invalid schedule: {0}")]
    ScheduleParse(String),

    #[error("Container run timed out after {0}s")]
    ContainerTimeout(u64),

    #[error("Container output exceeded {0} bytes")]
    ContainerOversize(usize),

    #[error("Container exited with an error: {0}")]
    ContainerExit(String),

    #[error("Content extraction failed: {0}")]
    Extraction(String),

    #[error("URL already ingested as source {0}")]
    AlreadyIngested(String),

    #[error("Duplicate content, matches source {0}")]
    DuplicateContent(String),

    #[error("Embeddings provider unavailable: {0}")]
    EmbeddingsUnavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using OxiclawError.
pub type OxiclawResult<T> = std::result::Result<T, OxiclawError>;

impl OxiclawError {
    /// Whether the failure is transient (retry makes sense) as opposed to a
    /// permanent rejection of the input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OxiclawError::Transport(_)
                | OxiclawError::ContainerTimeout(_)
                | OxiclawError::EmbeddingsUnavailable(_)
                | OxiclawError::Store(_)
        )
    }
}

impl From<rusqlite::Error> for OxiclawError {
    fn from(e: rusqlite::Error) -> Self {
        OxiclawError::Store(e.to_string())
    }
}
