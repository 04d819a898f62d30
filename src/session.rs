//! Session Manager
//!
//! Tracks backend conversation identity and the local turn counter for one
//! agent instance.
//!
//! ```text
//! NoSession ──first turn──▶ Active ──turn_count == max_turns──▶ Exhausted
//!                             │                                    │
//!                             └──── close / frame timeout ─────────┴──▶ Closed
//! ```
//!
//! With continuation disabled every turn is stateless and the session falls
//! back to `NoSession` once it completes.
//!
//! A turn holds a [`TurnGuard`] while it is in flight. Completing the guard
//! counts the turn; dropping it without completion releases the session
//! untouched, which is how cancellation leaves the session `Active`.

use crate::config::ModelOptions;
use crate::error::{LocalModelError, Result};
use crate::frame::RequestPayload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoSession,
    Active,
    Exhausted,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NoSession => write!(f, "no_session"),
            SessionState::Active => write!(f, "active"),
            SessionState::Exhausted => write!(f, "exhausted"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    session_id: Option<String>,
    turn_count: u32,
    busy: bool,
    closed_reason: Option<String>,
}

/// Session state for one agent instance
#[derive(Debug, Clone)]
pub struct SessionManager {
    max_turns: u32,
    continue_conversation: bool,
    inner: Arc<Mutex<Inner>>,
}

impl SessionManager {
    /// A `resume` id starts the session `Active` on that backend session
    pub fn new(max_turns: u32, continue_conversation: bool, resume: Option<String>) -> Self {
        let state = if resume.is_some() {
            SessionState::Active
        } else {
            SessionState::NoSession
        };
        Self {
            max_turns: max_turns.max(1),
            continue_conversation,
            inner: Arc::new(Mutex::new(Inner {
                state,
                session_id: resume,
                turn_count: 0,
                busy: false,
                closed_reason: None,
            })),
        }
    }

    pub fn from_options(options: &ModelOptions) -> Self {
        Self::new(
            options.max_turns,
            options.continue_conversation,
            options.resume.clone(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn turn_count(&self) -> u32 {
        self.lock().turn_count
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Claim the session for a new turn and attach continuation info
    ///
    /// Fails without side effects when a turn is in flight, the turn budget
    /// is used up, or the session was closed.
    pub fn begin_turn(&self, payload: &mut RequestPayload) -> Result<TurnGuard> {
        let mut inner = self.lock();
        if inner.busy {
            return Err(LocalModelError::SessionBusy);
        }
        match inner.state {
            SessionState::Closed => {
                return Err(LocalModelError::SessionClosed {
                    reason: inner
                        .closed_reason
                        .clone()
                        .unwrap_or_else(|| "closed".to_string()),
                });
            }
            SessionState::Exhausted => {
                return Err(LocalModelError::SessionLimit {
                    turns: inner.turn_count,
                    max_turns: self.max_turns,
                });
            }
            SessionState::NoSession | SessionState::Active => {}
        }

        match &inner.session_id {
            Some(id) => {
                payload.continue_conversation = true;
                payload.resume = Some(id.clone());
            }
            None => {
                payload.continue_conversation = false;
                payload.resume = None;
            }
        }

        inner.state = SessionState::Active;
        inner.busy = true;
        let turn_number = inner.turn_count + 1;

        tracing::debug!(
            session_id = inner.session_id.as_deref().unwrap_or("none"),
            turn = turn_number,
            max_turns = self.max_turns,
            "Turn started"
        );

        Ok(TurnGuard {
            inner: Arc::clone(&self.inner),
            max_turns: self.max_turns,
            continue_conversation: self.continue_conversation,
            turn_number,
            finished: false,
        })
    }

    /// Discard the session identifier; later turns fail until [`reset`](Self::reset)
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.lock();
        tracing::info!(
            session_id = inner.session_id.as_deref().unwrap_or("none"),
            reason = %reason,
            "Session closed"
        );
        inner.state = SessionState::Closed;
        inner.session_id = None;
        inner.closed_reason = Some(reason);
    }

    /// Start over with no backend session
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::NoSession;
        inner.session_id = None;
        inner.turn_count = 0;
        inner.closed_reason = None;
    }
}

/// Exclusive claim on a session for one in-flight turn
#[derive(Debug)]
pub struct TurnGuard {
    inner: Arc<Mutex<Inner>>,
    max_turns: u32,
    continue_conversation: bool,
    turn_number: u32,
    finished: bool,
}

impl TurnGuard {
    pub fn turn_number(&self) -> u32 {
        self.turn_number
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a finalized turn and record the backend session id it reported
    pub fn complete(mut self, session_id: Option<String>) -> SessionState {
        self.finished = true;
        let max_turns = self.max_turns;
        let continue_conversation = self.continue_conversation;
        let mut inner = self.lock();
        inner.busy = false;
        if inner.state != SessionState::Active {
            return inner.state;
        }

        if continue_conversation {
            inner.turn_count += 1;
            if session_id.is_some() {
                inner.session_id = session_id;
            }
            if inner.turn_count >= max_turns {
                inner.state = SessionState::Exhausted;
                tracing::info!(
                    turns = inner.turn_count,
                    max_turns,
                    "Session turn budget used up"
                );
            }
        } else {
            // Stateless call: the backend session ends with the turn
            inner.session_id = None;
            inner.state = SessionState::NoSession;
        }
        inner.state
    }

    /// Release after a failed turn; a frame timeout closes the session
    pub fn fail(mut self, error: &LocalModelError) -> SessionState {
        self.finished = true;
        let mut inner = self.lock();
        inner.busy = false;
        if matches!(error, LocalModelError::BackendTimeout { .. }) {
            inner.state = SessionState::Closed;
            inner.session_id = None;
            inner.closed_reason = Some(error.to_string());
            tracing::warn!("Session closed after backend timeout");
        }
        inner.state
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(turn = self.turn_number, "Turn abandoned");
            self.lock().busy = false;
        }
    }
}
