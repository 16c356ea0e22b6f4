//! # Session State and Messages
//!
//! Lifecycle states, consumer notifications, commands and the end-of-session summary.
//!
//! ## Session Lifecycle:
//! 1. **NotStarted**: created, nothing acquired
//! 2. **AcquiringPermissions**: opening the microphone
//! 3. **Connecting**: session with the endpoint is being opened
//! 4. **Active**: the exam is running
//! 5. **Interrupted**: published briefly on barge-in, then back to `Active`
//! 6. **Finished** / **Errored**: terminal

use crate::dispatcher::ScoreState;
use crate::error::SessionError;
use crate::gate::{ActivityState, GateFlags};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NotStarted,
    AcquiringPermissions,
    Connecting,
    Active,
    /// Transient, published on interruption before returning to `Active`
    Interrupted,
    Finished,
    Errored(SessionError),
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::NotStarted => "not_started",
            SessionState::AcquiringPermissions => "acquiring_permissions",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Interrupted => "interrupted",
            SessionState::Finished => "finished",
            SessionState::Errored(_) => "errored",
        }
    }

    /// `Finished` and `Errored` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Errored(_))
    }
}

/// Events published to the consumer, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    StatusChanged(SessionState),
    ScoreUpdated(ScoreState),
    Feedback(String),
    /// Human-readable reason of a fatal error
    Error(String),
    ActivityChanged(ActivityState),
}

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: String,
    pub flags: GateFlags,
    pub score: ScoreState,
    /// Output-clock time the next segment would start at
    pub next_start_time: f64,
    pub active_segments: usize,
    pub frames_forwarded: u64,
    pub frames_gated: u64,
    pub frames_overflowed: u64,
}

/// Commands sent through a `SessionHandle`.
#[derive(Debug)]
pub enum SessionCommand {
    Start,
    StartAnswering,
    StopAnswering,
    Interrupt,
    End,
    Spectrum(oneshot::Sender<Vec<u8>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// What the controller returns when the session is over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub correct_count: u32,
    pub questions_asked: u32,
    pub total_questions: u32,
    pub final_state: String,
    /// Human-readable reason when the session errored
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Percentage of correct answers over the configured question count.
    pub fn percentage(&self) -> f64 {
        if self.total_questions == 0 {
            return 0.0;
        }
        100.0 * self.correct_count as f64 / self.total_questions as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Finished.is_terminal());
        assert!(SessionState::Errored(SessionError::TeardownRace).is_terminal());
        assert!(!SessionState::Interrupted.is_terminal());
        assert!(!SessionState::NotStarted.is_terminal());
        assert_eq!(SessionState::AcquiringPermissions.as_str(), "acquiring_permissions");
    }

    #[test]
    fn test_summary_percentage() {
        let summary = SessionSummary {
            session_id: Uuid::new_v4(),
            correct_count: 3,
            questions_asked: 4,
            total_questions: 4,
            final_state: "finished".to_string(),
            error: None,
            started_at: None,
            ended_at: Utc::now(),
        };
        assert_eq!(summary.percentage(), 75.0);
    }
}
