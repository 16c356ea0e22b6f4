//! # Exam Voice Engine
//!
//! Real-time voice engine for spoken exams: streams the student's microphone to a
//! conversational endpoint, plays back the examiner's synthesized speech without
//! gaps or overlap, and keeps score through the examiner's grading tool calls.
//!
//! ## Module Organization:
//! - `audio`: codec, capture pipeline, playback scheduler, analyser, devices
//! - `gate`: turn-taking between the student and the examiner
//! - `transport`: duplex session with the endpoint
//! - `dispatcher`: grading tool calls
//! - `session`: the session controller actor
//! - `exam`: exam parameters and system instructions
//! - `config`: layered application configuration
//! - `error`: error taxonomy

pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exam;
pub mod gate;
pub mod session;
pub mod transport;

pub use error::{SessionError, SessionResult};
pub use exam::ExamSessionConfig;
pub use session::{SessionController, SessionHandle, SessionNotification, SessionState};
