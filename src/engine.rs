//! The seam between a chat session and whatever answers its questions.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChatError;

/// Lazily produced answer fragments. The stream ends when generation is
/// complete; an `Err` item aborts the answer.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// A fully initialized retrieval + generation engine.
///
/// Every call to [`QueryEngine::stream`] starts a fresh answer; engines
/// keep no conversational state of their own.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn stream(&self, query: &str) -> Result<FragmentStream, ChatError>;
}
