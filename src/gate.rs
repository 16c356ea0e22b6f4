//! # Turn-Taking Gate
//!
//! Mutual-exclusion policy between capturing the student's voice and playing the
//! examiner's speech. The capture pipeline asks one question per frame
//! (`should_forward`) and never reasons about the individual flags.
//!
//! ## Transitions:
//! - `start_answering`: only when the assistant is silent; sets `user_answering`
//! - `stop_answering`: clears `user_answering`
//! - `assistant_started`: first segment of a turn; speaking on, answering off
//! - `assistant_finished`: last active segment ended; speaking off
//! - `interrupt`: speaking off immediately, whatever is still queued
//!
//! The session publishes the gate's verdict into a `GateSignal` after every
//! event, so the capture thread decides pass or drop at the frame boundary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The two gate flags. Never both true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateFlags {
    pub assistant_speaking: bool,
    pub user_answering: bool,
}

/// Observable sub-state of an active session, derived from the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivityState {
    Listening,
    Speaking,
}

impl ActivityState {
    pub fn as_str(&self) -> &str {
        match self {
            ActivityState::Listening => "listening",
            ActivityState::Speaking => "speaking",
        }
    }
}

#[derive(Debug, Default)]
pub struct TurnGate {
    flags: GateFlags,
}

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the microphone for the student's answer.
    ///
    /// Returns `false` (and changes nothing) while the assistant is speaking.
    pub fn start_answering(&mut self) -> bool {
        if self.flags.assistant_speaking {
            return false;
        }
        self.flags.user_answering = true;
        true
    }

    pub fn stop_answering(&mut self) {
        self.flags.user_answering = false;
    }

    /// Assistant speech pre-empts capture. Returns `true` if speech just began.
    pub fn assistant_started(&mut self) -> bool {
        let began = !self.flags.assistant_speaking;
        self.flags.assistant_speaking = true;
        self.flags.user_answering = false;
        began
    }

    /// The last active playback segment ended.
    pub fn assistant_finished(&mut self) {
        self.flags.assistant_speaking = false;
    }

    /// Barge-in. Returns whether the assistant was speaking.
    pub fn interrupt(&mut self) -> bool {
        let was_speaking = self.flags.assistant_speaking;
        self.flags.assistant_speaking = false;
        was_speaking
    }

    /// Whether a captured frame may be forwarded to the endpoint.
    pub fn should_forward(&self) -> bool {
        !self.flags.assistant_speaking && self.flags.user_answering
    }

    pub fn flags(&self) -> GateFlags {
        self.flags
    }

    pub fn activity(&self) -> ActivityState {
        if self.flags.assistant_speaking {
            ActivityState::Speaking
        } else {
            ActivityState::Listening
        }
    }
}

/// Gate verdict shared with the capture thread.
///
/// Packs the open bit and an epoch into one atomic word. Every closed to open
/// flip starts a new epoch, so frames stamped in an earlier window can be told
/// apart from frames of the current answer.
#[derive(Debug, Clone, Default)]
pub struct GateSignal(Arc<AtomicU64>);

impl GateSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish whether capture may pass. Only the session actor writes.
    pub fn publish(&self, open: bool) {
        let current = self.0.load(Ordering::Acquire);
        if (current & 1 == 1) == open {
            return;
        }
        let epoch = current >> 1;
        let next = if open { ((epoch + 1) << 1) | 1 } else { epoch << 1 };
        self.0.store(next, Ordering::Release);
    }

    /// Epoch of the current open window, `None` while the gate is closed.
    pub fn open_epoch(&self) -> Option<u64> {
        let current = self.0.load(Ordering::Acquire);
        (current & 1 == 1).then_some(current >> 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_starts_a_new_epoch_per_opening() {
        let signal = GateSignal::new();
        assert_eq!(signal.open_epoch(), None);

        signal.publish(true);
        let first = signal.open_epoch().unwrap();
        signal.publish(true);
        assert_eq!(signal.open_epoch(), Some(first));

        signal.publish(false);
        assert_eq!(signal.open_epoch(), None);
        signal.publish(true);
        assert_eq!(signal.open_epoch(), Some(first + 1));

        // Clones observe the same verdict
        let reader = signal.clone();
        signal.publish(false);
        assert_eq!(reader.open_epoch(), None);
    }

    #[test]
    fn test_initial_state_drops_frames() {
        let gate = TurnGate::new();
        assert!(!gate.should_forward());
        assert_eq!(gate.activity(), ActivityState::Listening);
    }

    #[test]
    fn test_start_answering_opens_gate() {
        let mut gate = TurnGate::new();
        assert!(gate.start_answering());
        assert!(gate.should_forward());
        gate.stop_answering();
        assert!(!gate.should_forward());
    }

    #[test]
    fn test_start_answering_is_noop_while_speaking() {
        let mut gate = TurnGate::new();
        gate.assistant_started();
        assert!(!gate.start_answering());
        assert_eq!(
            gate.flags(),
            GateFlags {
                assistant_speaking: true,
                user_answering: false
            }
        );
    }

    #[test]
    fn test_assistant_speech_preempts_answer() {
        let mut gate = TurnGate::new();
        gate.start_answering();
        assert!(gate.assistant_started());
        assert!(!gate.assistant_started());
        assert!(!gate.flags().user_answering);
        assert!(!gate.should_forward());
        assert_eq!(gate.activity(), ActivityState::Speaking);
    }

    #[test]
    fn test_interrupt_clears_speaking() {
        let mut gate = TurnGate::new();
        gate.assistant_started();
        assert!(gate.interrupt());
        assert!(!gate.flags().assistant_speaking);
        assert!(!gate.interrupt());
        assert!(gate.start_answering());
    }

    #[test]
    fn test_flags_never_both_true() {
        let ops: [fn(&mut TurnGate); 5] = [
            |g| {
                g.start_answering();
            },
            |g| g.stop_answering(),
            |g| {
                g.assistant_started();
            },
            |g| g.assistant_finished(),
            |g| {
                g.interrupt();
            },
        ];
        // Walk every sequence of three operations
        for a in ops.iter() {
            for b in ops.iter() {
                for c in ops.iter() {
                    let mut g = TurnGate::new();
                    a(&mut g);
                    b(&mut g);
                    c(&mut g);
                    let f = g.flags();
                    assert!(!(f.assistant_speaking && f.user_answering));
                }
            }
        }
    }
}
