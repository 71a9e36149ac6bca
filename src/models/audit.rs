//! Session-audit ledger, processed-session markers, and the shown-lesson log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EngramId;

/// One write-once row per session: what was shown, under what
/// environment, for later outcome evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAudit {
    /// Session identifier.
    pub session_id: String,
    /// Engrams shown during the session.
    pub shown_engram_ids: Vec<EngramId>,
    /// Environment tags active during the session.
    pub env_tags: Vec<String>,
    /// Repository active during the session, if any.
    pub repo: Option<String>,
    /// Path to the session transcript, if known.
    pub transcript_path: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Outcome of evaluator processing for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The evaluator successfully folded scores into the EMA table.
    Completed,
    /// The evaluator failed; `retry_count` was incremented.
    Failed,
}

/// `(session_id) -> (status, retry_count, processed_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSessionMarker {
    /// Session identifier.
    pub session_id: String,
    /// Current processing status.
    pub status: SessionStatus,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Timestamp of the last processing attempt.
    pub processed_at: DateTime<Utc>,
}

impl ProcessedSessionMarker {
    /// Strict `retry_count < 3`: three attempts total, per the resolved
    /// Open Question on the evaluator's retry bound.
    pub const MAX_RETRIES: u32 = 3;

    /// Whether this session should still be attempted by the evaluator.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.status != SessionStatus::Completed && self.retry_count < Self::MAX_RETRIES
    }
}

/// `(session_id, engram_id, source_hook_event)`. Live within one session;
/// cleared on session end once the audit row has been written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShownLesson {
    /// Session identifier.
    pub session_id: String,
    /// The engram that was shown.
    pub engram_id: EngramId,
    /// Which hook event triggered the retrieval (`UserPromptSubmit`,
    /// `PreToolUse`, ...).
    pub source_hook_event: String,
}
