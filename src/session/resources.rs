//! # Session Resources
//!
//! The per-session resource aggregate: microphone, transport, speaker and the
//! segment-end timers. Released exactly once, whichever terminal trigger wins.

use crate::audio::device::{Microphone, Speaker};
use crate::audio::scheduler::SegmentId;
use crate::error::SessionError;
use crate::transport::Transport;
use std::collections::HashMap;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Default)]
pub struct SessionResources {
    pub microphone: Option<Box<dyn Microphone>>,
    pub transport: Option<Box<dyn Transport>>,
    pub speaker: Option<Box<dyn Speaker>>,
    timers: HashMap<SegmentId, AbortHandle>,
    released: bool,
}

impl SessionResources {
    pub fn new(microphone: Box<dyn Microphone>, speaker: Box<dyn Speaker>) -> Self {
        Self {
            microphone: Some(microphone),
            transport: None,
            speaker: Some(speaker),
            timers: HashMap::new(),
            released: false,
        }
    }

    pub fn track_timer(&mut self, id: SegmentId, handle: AbortHandle) {
        if let Some(previous) = self.timers.insert(id, handle) {
            previous.abort();
        }
    }

    /// Forget a timer that fired.
    pub fn timer_fired(&mut self, id: SegmentId) {
        self.timers.remove(&id);
    }

    /// Cancel the end timer of a stopped segment.
    pub fn cancel_timer(&mut self, id: SegmentId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// Tear everything down: close the transport, stop the microphone, cancel
    /// segment timers and close the speaker.
    ///
    /// The second and later calls change nothing and report `TeardownRace`.
    pub fn release(&mut self) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::TeardownRace);
        }
        self.released = true;

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(mut speaker) = self.speaker.take() {
            speaker.close();
        }

        debug!("Session resources released");
        Ok(())
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::CaptureSink;
    use crate::audio::codec::PlaybackSegment;
    use crate::error::SessionResult;
    use crate::transport::OutboundMessage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Counts {
        mic_stops: Arc<AtomicU32>,
        transport_closes: Arc<AtomicU32>,
        speaker_closes: Arc<AtomicU32>,
    }

    struct Mic(Counts);
    impl Microphone for Mic {
        fn start(&mut self, _sink: CaptureSink) -> SessionResult<()> {
            Ok(())
        }
        fn stop(&mut self) {
            self.0.mic_stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Out(Counts);
    impl Speaker for Out {
        fn play(&mut self, _: SegmentId, _: &PlaybackSegment, _: f64) -> SessionResult<()> {
            Ok(())
        }
        fn stop(&mut self, _: SegmentId, _: f64) {}
        fn close(&mut self) {
            self.0.speaker_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Link(Counts);
    impl Transport for Link {
        fn send(&self, _: OutboundMessage) -> SessionResult<()> {
            Ok(())
        }
        fn close(&mut self) {
            self.0.transport_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_release_runs_exactly_once() {
        let counts = Counts::default();
        let mut resources =
            SessionResources::new(Box::new(Mic(counts.clone())), Box::new(Out(counts.clone())));
        resources.transport = Some(Box::new(Link(counts.clone())));

        let timer = tokio::spawn(std::future::pending::<()>());
        resources.track_timer(1, timer.abort_handle());

        assert!(resources.release().is_ok());
        assert_eq!(resources.release(), Err(SessionError::TeardownRace));
        drop(resources);

        assert_eq!(counts.mic_stops.load(Ordering::SeqCst), 1);
        assert_eq!(counts.transport_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counts.speaker_closes.load(Ordering::SeqCst), 1);
        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
