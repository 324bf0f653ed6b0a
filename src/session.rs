//! Per-session state shared across requests.
//!
//! Sessions are value types owned exclusively by the store; callers hold only
//! a `session_id` and look state up on demand. Updates happen under the map
//! entry so concurrent requests for the same session serialize on the shard
//! lock and never observe a torn session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::config::LoopDetectionConfiguration;
use crate::tool_loop::{LoopVerdict, ToolCallTracker};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub loop_config: LoopDetectionConfiguration,
    /// Created lazily on the first structured tool call; never shared across
    /// sessions.
    pub tool_tracker: Option<ToolCallTracker>,
    /// One-shot counter: incremented when a response matches the edit-failure
    /// patterns, consumed and cleared by the next outbound request.
    pub edit_precision_pending: u32,
    /// `set(model=…)` override applied before prefix routing.
    pub model_override: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: String, loop_config: LoopDetectionConfiguration) -> Self {
        Self {
            id,
            loop_config,
            tool_tracker: None,
            edit_precision_pending: 0,
            model_override: None,
            created_at: Utc::now(),
        }
    }
}

/// Concurrent session store.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    default_loop_config: LoopDetectionConfiguration,
}

impl SessionStore {
    pub fn new(default_loop_config: LoopDetectionConfiguration) -> Self {
        Self {
            sessions: DashMap::new(),
            default_loop_config,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run `f` against the session, creating it first if needed.
    pub fn with_session_mut<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id, "creating session");
                Session::new(session_id.to_string(), self.default_loop_config.clone())
            });
        f(entry.value_mut())
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn loop_config(&self, session_id: &str) -> LoopDetectionConfiguration {
        self.sessions
            .get(session_id)
            .map(|s| s.loop_config.clone())
            .unwrap_or_else(|| self.default_loop_config.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Track a structured tool call against the session's tracker, creating
    /// the tracker lazily from the session's loop configuration.
    pub fn track_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: &str,
        force_block: bool,
    ) -> Option<LoopVerdict> {
        self.with_session_mut(session_id, |session| {
            let config = session.loop_config.tool_loop_config();
            let tracker = session
                .tool_tracker
                .get_or_insert_with(|| ToolCallTracker::new(config));
            tracker.track_tool_call(tool_name, arguments, force_block)
        })
    }

    /// Record an edit-precision trigger for the session.
    pub fn note_edit_failure(&self, session_id: &str) -> u32 {
        self.with_session_mut(session_id, |session| {
            session.edit_precision_pending += 1;
            session.edit_precision_pending
        })
    }

    /// Consume the one-shot edit-precision counter.
    pub fn take_edit_precision_pending(&self, session_id: &str) -> u32 {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => std::mem::take(&mut session.edit_precision_pending),
            None => 0,
        }
    }
}
