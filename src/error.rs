use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by chat sessions and the engine behind them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Document directory missing, empty or unreadable.
    #[error("corpus load failed: {0}")]
    CorpusLoad(String),

    /// Embedding, indexing or model setup failed, or no engine is bound.
    #[error("query engine unavailable: {0}")]
    EngineBuild(String),

    /// A single query failed while retrieving or generating.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("session {0} already has a query in flight")]
    Busy(Uuid),
}

impl ChatError {
    /// Short machine-readable tag, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::CorpusLoad(_) => "corpus_load",
            ChatError::EngineBuild(_) => "engine_build",
            ChatError::Retrieval(_) => "retrieval",
            ChatError::Busy(_) => "busy",
        }
    }
}
