//! Per-session conversation context.
//!
//! The intent detector only ever needs the most recent map a turn established, and
//! the extractor the preceding user message, so that is all a session keeps. The
//! number of sessions is capped; the least recently active one is dropped first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::schema::CanonicalMetricMap;

pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Ocr,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    /// Canonical map this turn produced or established, if any.
    pub extraction: Option<CanonicalMetricMap>,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(
        role: TurnRole,
        text: impl Into<String>,
        extraction: Option<CanonicalMetricMap>,
    ) -> Self {
        Self {
            role,
            text: text.into(),
            extraction,
            at: Utc::now(),
        }
    }
}

/// What a session remembers between messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    /// Latest non-empty map established by a turn.
    pub baseline: Option<CanonicalMetricMap>,
    pub previous_user_text: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
    /// Store-wide push sequence number; the smallest is evicted first.
    touched: u64,
}

impl SessionContext {
    fn absorb(&mut self, turn: ConversationTurn, touched: u64) {
        if let Some(map) = turn.extraction.filter(|m| !m.is_empty()) {
            self.baseline = Some(map);
        }
        if turn.role == TurnRole::User {
            self.previous_user_text = Some(turn.text);
        }
        self.last_active = Some(turn.at);
        self.touched = touched;
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, SessionContext>>>,
    sequence: Arc<AtomicU64>,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Fold a turn into the session, evicting the least recently active session
    /// when a new one would exceed the cap.
    pub async fn push(&self, session_id: &str, turn: ConversationTurn) {
        let mut sessions = self.inner.write().await;
        let touched = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        if !sessions.contains_key(session_id) && sessions.len() >= self.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, ctx)| ctx.touched)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!("Evicting idle session {}", oldest);
                sessions.remove(&oldest);
            }
        }
        sessions.entry(session_id.to_string()).or_default().absorb(turn, touched);
    }

    pub async fn context(&self, session_id: &str) -> SessionContext {
        let sessions = self.inner.read().await;
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
