//! # Capture Pipeline
//!
//! Moves microphone audio from the device callback to the endpoint.
//!
//! ## Stages:
//! 1. **Device thread**: the backend pushes arbitrary-sized sample blocks into a
//!    `CaptureSink`, which slices them into fixed frames (`FrameSlicer`). At each
//!    frame boundary the sink reads the published `GateSignal`: frames completed
//!    while the gate is closed are dropped on the spot, the rest are stamped with
//!    the epoch of the open window
//! 2. **Mailbox**: each frame is posted with `try_send` into a one-frame channel;
//!    when the session actor falls behind, frames are dropped, never queued
//! 3. **Session actor**: `CapturePipeline::process_frame` checks the turn gate and
//!    the frame's epoch, then either encodes and sends the frame or discards it
//!
//! A frame that reaches the pipeline is consumed exactly once either way.

use crate::audio::codec::AudioFrame;
use crate::error::SessionResult;
use crate::gate::{GateSignal, TurnGate};
use crate::transport::{OutboundMessage, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Frames held between the device thread and the session: one capture period.
pub const MAILBOX_FRAMES: usize = 1;

/// Default capture frame length in samples (256 ms at 16 kHz).
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Accumulates samples and hands out exact `frame_size` frames.
#[derive(Debug)]
pub struct FrameSlicer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append a block and return every frame it completes.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let wanted = self.frame_size - self.pending.len();
            let take = wanted.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                frames.push(frame);
            }
        }

        frames
    }

    /// Throw away the partial frame.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// One sliced frame and the gate epoch it was captured in.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub epoch: u64,
    pub samples: Vec<f32>,
}

#[derive(Debug, Default)]
struct DropCounters {
    overflowed: AtomicU64,
    gated: AtomicU64,
}

/// Device-side end of the capture mailbox.
///
/// Owned by the microphone backend's callback thread.
pub struct CaptureSink {
    slicer: FrameSlicer,
    signal: GateSignal,
    /// Epoch the pending partial frame belongs to
    epoch: Option<u64>,
    tx: mpsc::Sender<CapturedFrame>,
    counters: Arc<DropCounters>,
}

impl CaptureSink {
    /// Create a sink reading `signal` and the receiving end of its mailbox.
    pub fn channel(frame_size: usize, signal: GateSignal) -> (Self, CaptureMailbox) {
        let (tx, rx) = mpsc::channel(MAILBOX_FRAMES);
        let counters = Arc::new(DropCounters::default());
        let sink = Self {
            slicer: FrameSlicer::new(frame_size),
            signal,
            epoch: None,
            tx,
            counters: counters.clone(),
        };
        (sink, CaptureMailbox { rx, counters })
    }

    /// Push captured samples. Never blocks.
    ///
    /// Returns `false` once the session side is gone, so the backend can stop.
    pub fn push(&mut self, samples: &[f32]) -> bool {
        if self.tx.is_closed() {
            return false;
        }

        // A partial frame never spans two gate windows
        let epoch = self.signal.open_epoch();
        if epoch != self.epoch {
            self.slicer.clear();
            self.epoch = epoch;
        }

        let frames = self.slicer.push(samples);
        let Some(epoch) = epoch else {
            self.counters
                .gated
                .fetch_add(frames.len() as u64, Ordering::Relaxed);
            return true;
        };

        for samples in frames {
            match self.tx.try_send(CapturedFrame { epoch, samples }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = self.counters.overflowed.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(total, "Capture mailbox full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Session-side end of the capture mailbox.
pub struct CaptureMailbox {
    rx: mpsc::Receiver<CapturedFrame>,
    counters: Arc<DropCounters>,
}

impl CaptureMailbox {
    pub async fn recv(&mut self) -> Option<CapturedFrame> {
        self.rx.recv().await
    }

    /// Frames dropped because the mailbox was full.
    pub fn overflow_count(&self) -> u64 {
        self.counters.overflowed.load(Ordering::Relaxed)
    }

    /// Frames the sink dropped because the gate was closed when they completed.
    pub fn gated_count(&self) -> u64 {
        self.counters.gated.load(Ordering::Relaxed)
    }
}

/// What happened to one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Forwarded,
    /// Dropped by the turn gate
    Gated,
    /// Captured in an earlier gate window
    Stale,
    /// The transport refused the frame
    SendFailed,
}

/// Per-session capture statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub forwarded: u64,
    pub gated: u64,
    pub stale: u64,
    pub send_failed: u64,
}

#[derive(Debug, Default)]
pub struct CapturePipeline {
    stats: CaptureStats,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate, encode and forward one frame.
    ///
    /// Only frames stamped with the epoch of the currently open window pass.
    pub fn process_frame(
        &mut self,
        frame: &CapturedFrame,
        gate: &TurnGate,
        signal: &GateSignal,
        transport: &dyn Transport,
    ) -> FrameOutcome {
        if !gate.should_forward() {
            self.stats.gated += 1;
            return FrameOutcome::Gated;
        }
        if signal.open_epoch() != Some(frame.epoch) {
            self.stats.stale += 1;
            trace!(epoch = frame.epoch, "Dropping frame from an earlier answer window");
            return FrameOutcome::Stale;
        }

        match forward(&frame.samples, transport) {
            Ok(()) => {
                self.stats.forwarded += 1;
                FrameOutcome::Forwarded
            }
            Err(e) => {
                self.stats.send_failed += 1;
                warn!("Failed to send audio frame: {}", e);
                FrameOutcome::SendFailed
            }
        }
    }

    /// Drop a frame that arrived while no session was open.
    pub fn discard(&mut self) {
        self.stats.gated += 1;
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}

fn forward(samples: &[f32], transport: &dyn Transport) -> SessionResult<()> {
    let frame = AudioFrame::from_samples(samples);
    trace!(samples = frame.sample_count(), "Forwarding capture frame");
    transport.send(OutboundMessage::AudioFrame(frame.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
        fail: bool,
    }

    impl Transport for RecordingTransport {
        fn send(&self, message: OutboundMessage) -> SessionResult<()> {
            if self.fail {
                return Err(SessionError::ConnectionLost("closed".to_string()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn open_signal() -> GateSignal {
        let signal = GateSignal::new();
        signal.publish(true);
        signal
    }

    fn frame_for(signal: &GateSignal, samples: &[f32]) -> CapturedFrame {
        CapturedFrame {
            epoch: signal.open_epoch().unwrap_or(0),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_slicer_produces_exact_frames() {
        let mut slicer = FrameSlicer::new(4);
        assert!(slicer.push(&[0.1, 0.2, 0.3]).is_empty());
        let frames = slicer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1], vec![0.5, 0.6, 0.7, 0.8]);

        // The two leftover samples are gone after a clear
        slicer.clear();
        assert!(slicer.push(&[0.0; 3]).is_empty());
        assert_eq!(slicer.push(&[0.0]).len(), 1);
    }

    #[test]
    fn test_gated_while_not_answering() {
        let gate = TurnGate::new();
        let signal = GateSignal::new();
        let transport = RecordingTransport::default();
        let mut pipeline = CapturePipeline::new();

        assert_eq!(
            pipeline.process_frame(&frame_for(&signal, &[0.0; 16]), &gate, &signal, &transport),
            FrameOutcome::Gated
        );
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_nothing_forwarded_while_assistant_speaks() {
        let mut gate = TurnGate::new();
        gate.start_answering();
        gate.assistant_started();
        let signal = open_signal();
        let transport = RecordingTransport::default();
        let mut pipeline = CapturePipeline::new();

        for _ in 0..50 {
            pipeline.process_frame(&frame_for(&signal, &[0.5; 16]), &gate, &signal, &transport);
        }
        assert_eq!(pipeline.stats().forwarded, 0);
        assert_eq!(pipeline.stats().gated, 50);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forwards_encoded_frame_when_answering() {
        let mut gate = TurnGate::new();
        gate.start_answering();
        let signal = open_signal();
        let transport = RecordingTransport::default();
        let mut pipeline = CapturePipeline::new();

        let outcome =
            pipeline.process_frame(&frame_for(&signal, &[1.0, -1.0]), &gate, &signal, &transport);
        assert_eq!(outcome, FrameOutcome::Forwarded);
        assert_eq!(
            transport.sent.lock().unwrap()[0],
            OutboundMessage::AudioFrame(vec![0xFF, 0x7F, 0x00, 0x80])
        );
    }

    #[test]
    fn test_frame_from_earlier_window_is_stale() {
        let mut gate = TurnGate::new();
        gate.start_answering();
        let signal = open_signal();
        let old = frame_for(&signal, &[0.5; 4]);

        // Gate closed and reopened before the frame was processed
        signal.publish(false);
        signal.publish(true);

        let transport = RecordingTransport::default();
        let mut pipeline = CapturePipeline::new();
        assert_eq!(
            pipeline.process_frame(&old, &gate, &signal, &transport),
            FrameOutcome::Stale
        );
        assert_eq!(
            pipeline.process_frame(&frame_for(&signal, &[0.5; 4]), &gate, &signal, &transport),
            FrameOutcome::Forwarded
        );
        assert_eq!(pipeline.stats().stale, 1);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_send_failure_is_counted() {
        let mut gate = TurnGate::new();
        gate.start_answering();
        let signal = open_signal();
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let mut pipeline = CapturePipeline::new();
        assert_eq!(
            pipeline.process_frame(&frame_for(&signal, &[0.0; 4]), &gate, &signal, &transport),
            FrameOutcome::SendFailed
        );
        assert_eq!(pipeline.stats().send_failed, 1);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_instead_of_queueing() {
        let (mut sink, mut mailbox) = CaptureSink::channel(2, open_signal());
        // Three frames into a one-frame mailbox
        assert!(sink.push(&[0.0; 6]));
        assert_eq!(mailbox.overflow_count(), 2);

        assert_eq!(mailbox.recv().await.unwrap().samples.len(), 2);
        assert!(mailbox.rx.try_recv().is_err());

        drop(mailbox);
        assert!(!sink.push(&[0.0; 2]));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_closed_gate_drops_at_capture() {
        let signal = GateSignal::new();
        let (mut sink, mut mailbox) = CaptureSink::channel(4, signal.clone());

        assert!(sink.push(&[0.5; 8]));
        assert_eq!(mailbox.gated_count(), 2);
        assert!(mailbox.rx.try_recv().is_err());

        // Half a frame captured while closed never completes a frame after opening
        assert!(sink.push(&[0.5; 2]));
        signal.publish(true);
        assert!(sink.push(&[0.1; 4]));
        let frame = mailbox.recv().await.unwrap();
        assert_eq!(frame.samples, vec![0.1; 4]);
        assert_eq!(Some(frame.epoch), signal.open_epoch());
    }
}
