//! # Exam Session
//!
//! Lifecycle supervision of one voice exam.
//!
//! ## Key Components:
//! - **controller**: the session actor and its `SessionHandle`
//! - **state**: lifecycle states, notifications, commands and the summary
//! - **resources**: the per-session resource aggregate released exactly once

pub mod controller;
pub mod resources;
pub mod state;

pub use controller::{EngineSettings, SessionController, SessionHandle};
pub use state::{SessionNotification, SessionSnapshot, SessionState, SessionSummary};
