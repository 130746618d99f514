//! Per-user conversational state around a query engine.
//!
//! A [`ChatSession`] owns an ordered transcript and mediates between user
//! input and the bound [`QueryEngine`], assembling streamed fragments into
//! a single assistant reply.
//!
//! Contract details that callers rely on:
//!
//! - Only one `submit` runs per session; a second one fails with
//!   [`ChatError::Busy`] instead of queueing.
//! - A failed `submit` leaves its user message in place and appends no
//!   assistant message.
//! - `reset` clears the transcript immediately. An answer still being
//!   generated at that moment is returned as [`SubmitOutcome::Discarded`]
//!   and never recorded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::QueryEngine;
use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry. Content never changes after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unbound,
    Blocked,
    Idle,
    Generating,
}

/// What a call to `submit` did to the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input; nothing recorded, engine not called.
    Ignored,
    /// The reply was appended after the user message.
    Answered(Message),
    /// The session was reset while generating; the reply was dropped.
    Discarded(Message),
}

/// Reported after every fragment: the fragment itself and the running text.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub fragment: &'a str,
    pub text: &'a str,
}

enum EngineSlot {
    Unbound,
    Blocked(ChatError),
    Bound(Arc<dyn QueryEngine>),
}

pub struct ChatSession {
    id: Uuid,
    transcript: Mutex<Vec<Message>>,
    engine: RwLock<EngineSlot>,
    generating: AtomicBool,
    /// Bumped by every reset so an in-flight reply can tell it is stale.
    epoch: AtomicU64,
    last_active: Mutex<Instant>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("messages", &self.lock_transcript().len())
            .finish()
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::create()
    }
}

impl ChatSession {
    /// Fresh session with a new id, an empty transcript and no engine.
    pub fn create() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        log::debug!("session {id} created");
        Self {
            id,
            transcript: Mutex::new(Vec::new()),
            engine: RwLock::new(EngineSlot::Unbound),
            generating: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach an already initialized engine. Replaces a previous binding
    /// or blocked state; the transcript is untouched.
    pub fn bind_engine(&self, engine: Arc<dyn QueryEngine>) {
        *self.write_engine() = EngineSlot::Bound(engine);
        log::info!("session {} bound to query engine", self.id);
    }

    /// Record an initialization failure. Until a later `bind_engine`,
    /// every submission is rejected with this error.
    pub fn block(&self, error: ChatError) {
        log::error!("session {} blocked: {error}", self.id);
        *self.write_engine() = EngineSlot::Blocked(error);
    }

    /// The initialization failure of a blocked session.
    pub fn init_error(&self) -> Option<ChatError> {
        match &*self.read_engine() {
            EngineSlot::Blocked(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Mark the session as in use by its owner.
    pub fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the session was last touched, submitted to or reset.
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn state(&self) -> SessionState {
        if self.generating.load(Ordering::Acquire) {
            return SessionState::Generating;
        }
        match &*self.read_engine() {
            EngineSlot::Unbound => SessionState::Unbound,
            EngineSlot::Blocked(_) => SessionState::Blocked,
            EngineSlot::Bound(_) => SessionState::Idle,
        }
    }

    /// Snapshot of the transcript in chronological order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock_transcript().clone()
    }

    pub fn message_count(&self) -> usize {
        self.lock_transcript().len()
    }

    /// Clear the transcript. Idempotent and never fails; the engine
    /// binding is kept.
    pub fn reset(&self) {
        let mut transcript = self.lock_transcript();
        transcript.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.touch();
        log::info!("session {} reset", self.id);
    }

    pub async fn submit(&self, text: &str) -> Result<SubmitOutcome, ChatError> {
        self.submit_with(text, |_| {}).await
    }

    /// Ask the bound engine about `text`, calling `on_progress` after
    /// every streamed fragment.
    pub async fn submit_with<F>(
        &self,
        text: &str,
        mut on_progress: F,
    ) -> Result<SubmitOutcome, ChatError>
    where
        F: FnMut(Progress<'_>) + Send,
    {
        self.touch();
        if text.trim().is_empty() {
            log::debug!("session {} ignored blank input", self.id);
            return Ok(SubmitOutcome::Ignored);
        }

        let engine = self.bound_engine()?;
        let _in_flight = InFlight::acquire(&self.generating).ok_or(ChatError::Busy(self.id))?;

        let epoch = {
            let mut transcript = self.lock_transcript();
            transcript.push(Message::user(text));
            self.epoch.load(Ordering::Acquire)
        };

        let answer = match generate(&*engine, text, &mut on_progress).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("session {} query failed: {e}", self.id);
                return Err(e);
            }
        };

        self.touch();
        let reply = Message::assistant(answer);
        let mut transcript = self.lock_transcript();
        if self.epoch.load(Ordering::Acquire) != epoch {
            log::info!("session {} was reset during generation, reply dropped", self.id);
            return Ok(SubmitOutcome::Discarded(reply));
        }
        transcript.push(reply.clone());
        Ok(SubmitOutcome::Answered(reply))
    }

    fn bound_engine(&self) -> Result<Arc<dyn QueryEngine>, ChatError> {
        match &*self.read_engine() {
            EngineSlot::Bound(engine) => Ok(Arc::clone(engine)),
            EngineSlot::Blocked(error) => Err(error.clone()),
            EngineSlot::Unbound => Err(ChatError::EngineBuild(format!(
                "no query engine bound to session {}",
                self.id
            ))),
        }
    }

    fn lock_transcript(&self) -> MutexGuard<'_, Vec<Message>> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_engine(&self) -> std::sync::RwLockReadGuard<'_, EngineSlot> {
        self.engine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_engine(&self) -> std::sync::RwLockWriteGuard<'_, EngineSlot> {
        self.engine.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn generate<F>(
    engine: &dyn QueryEngine,
    query: &str,
    on_progress: &mut F,
) -> Result<String, ChatError>
where
    F: FnMut(Progress<'_>) + Send,
{
    let mut fragments = engine.stream(query).await.map_err(as_retrieval)?;
    let mut text = String::new();
    while let Some(fragment) = fragments.next().await {
        let fragment = fragment.map_err(as_retrieval)?;
        text.push_str(&fragment);
        on_progress(Progress {
            fragment: &fragment,
            text: &text,
        });
    }
    Ok(text)
}

fn as_retrieval(error: ChatError) -> ChatError {
    match error {
        ChatError::Retrieval(_) => error,
        other => ChatError::Retrieval(other.to_string()),
    }
}

/// Holds the session's generating flag for the duration of one submit.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
