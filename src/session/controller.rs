//! # Session Controller
//!
//! The actor that owns one exam session. Every piece of mutable session state
//! (turn gate, playback scheduler, score, resources) lives inside a single tokio
//! task; everything else talks to it through channels.
//!
//! ## Inputs:
//! - **Commands** from `SessionHandle` (start, answer, interrupt, end, queries)
//! - **Internal events**: the connect result and segment-ended timers
//! - **Captured frames** from the microphone mailbox
//! - **Transport events** from the open session
//!
//! ## Lifecycle:
//! ```text
//! NotStarted --start--> AcquiringPermissions --mic ok--> Connecting --opened--> Active
//! Active --(end | remote close | questions exhausted)--> Finished
//! any non-terminal --fatal error--> Errored
//! ```
//! Resources are torn down exactly once, on the first terminal transition.

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::capture::{CaptureMailbox, CapturePipeline, CaptureSink, CapturedFrame};
use crate::audio::codec::{self, OUTPUT_SAMPLE_RATE};
use crate::audio::device::{Microphone, Speaker};
use crate::audio::scheduler::{OutputClock, PlaybackScheduler, SegmentEnd, SegmentId};
use crate::dispatcher::{score_tool_declaration, ToolCallDispatcher};
use crate::error::{SessionError, SessionResult};
use crate::exam::ExamSessionConfig;
use crate::gate::{GateSignal, TurnGate};
use crate::session::resources::SessionResources;
use crate::session::state::{
    SessionCommand, SessionNotification, SessionSnapshot, SessionState, SessionSummary,
};
use crate::transport::{
    Connector, SessionOpenRequest, ToolCall, TransportConnection, TransportEvent,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine parameters that do not belong to the exam itself.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub voice: String,
    /// Samples per outbound frame
    pub frame_size: usize,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub analyser_fft_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            voice: "Puck".to_string(),
            frame_size: crate::audio::capture::DEFAULT_FRAME_SIZE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            output_channels: 1,
            analyser_fft_size: crate::audio::analyser::DEFAULT_FFT_SIZE,
        }
    }
}

/// Cloneable handle used to drive a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn send(&self, command: SessionCommand) -> SessionResult<()> {
        self.tx
            .send(command)
            .map_err(|_| SessionError::ChannelClosed("session has ended".to_string()))
    }

    pub fn start(&self) -> SessionResult<()> {
        self.send(SessionCommand::Start)
    }

    /// The student starts answering (push-to-talk down).
    pub fn start_answering(&self) -> SessionResult<()> {
        self.send(SessionCommand::StartAnswering)
    }

    pub fn stop_answering(&self) -> SessionResult<()> {
        self.send(SessionCommand::StopAnswering)
    }

    /// Barge in on the examiner.
    pub fn interrupt(&self) -> SessionResult<()> {
        self.send(SessionCommand::Interrupt)
    }

    pub fn end(&self) -> SessionResult<()> {
        self.send(SessionCommand::End)
    }

    /// Spectrum of the audio playing right now.
    pub async fn spectrum(&self) -> SessionResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Spectrum(reply))?;
        rx.await
            .map_err(|_| SessionError::ChannelClosed("session has ended".to_string()))
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply))?;
        rx.await
            .map_err(|_| SessionError::ChannelClosed("session has ended".to_string()))
    }
}

enum Internal {
    Connected(SessionResult<TransportConnection>),
    SegmentEnded(SegmentId),
}

pub struct SessionController {
    session_id: Uuid,
    exam: ExamSessionConfig,
    settings: EngineSettings,
    connector: Arc<dyn Connector>,

    state: SessionState,
    gate: TurnGate,
    /// The gate's verdict as seen by the capture thread
    gate_signal: GateSignal,
    scheduler: PlaybackScheduler,
    dispatcher: ToolCallDispatcher,
    capture: CapturePipeline,
    analyser: SpectrumAnalyser,
    clock: OutputClock,
    resources: SessionResources,

    /// All graded questions asked; finish at the end of the closing turn
    questions_exhausted: bool,
    turn_complete: bool,
    frames_overflowed: u64,
    frames_gated_at_capture: u64,
    started_at: Option<DateTime<Utc>>,
    connect_task: Option<JoinHandle<()>>,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    mailbox: Option<CaptureMailbox>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    notifications: mpsc::UnboundedSender<SessionNotification>,
}

impl SessionController {
    /// Create a session. Nothing is acquired until `SessionHandle::start`.
    pub fn new(
        exam: ExamSessionConfig,
        settings: EngineSettings,
        connector: Arc<dyn Connector>,
        microphone: Box<dyn Microphone>,
        speaker: Box<dyn Speaker>,
    ) -> (
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionNotification>,
    ) {
        let session_id = Uuid::new_v4();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();

        let controller = Self {
            session_id,
            exam,
            analyser: SpectrumAnalyser::new(settings.analyser_fft_size),
            settings,
            connector,
            state: SessionState::NotStarted,
            gate: TurnGate::new(),
            gate_signal: GateSignal::new(),
            scheduler: PlaybackScheduler::new(),
            dispatcher: ToolCallDispatcher::new(),
            capture: CapturePipeline::new(),
            clock: OutputClock::start(),
            resources: SessionResources::new(microphone, speaker),
            questions_exhausted: false,
            turn_complete: false,
            frames_overflowed: 0,
            frames_gated_at_capture: 0,
            started_at: None,
            connect_task: None,
            commands,
            internal_tx,
            internal_rx,
            mailbox: None,
            transport_events: None,
            notifications,
        };

        let handle = SessionHandle {
            session_id,
            tx: command_tx,
        };

        (controller, handle, notification_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Run the session until it finishes or errors.
    #[tracing::instrument(name = "exam_session", skip_all, fields(session_id = %self.session_id))]
    pub async fn run(mut self) -> SessionSummary {
        info!(questions = self.exam.total_questions(), "Session created");

        while !self.state.is_terminal() {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All session handles dropped, ending session");
                        self.finish();
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                frame = recv_frame(&mut self.mailbox) => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        debug!("Capture mailbox closed");
                        self.close_mailbox();
                    }
                },
                event = recv_event(&mut self.transport_events) => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        self.transport_events = None;
                        self.handle_transport_event(TransportEvent::Closed(None));
                    }
                },
            }
            self.publish_gate();
        }

        self.summary()
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => self.start(),
            SessionCommand::StartAnswering => {
                if !self.is_running() {
                    debug!(state = self.state.as_str(), "Answer requested outside an active session");
                } else if !self.gate.start_answering() {
                    debug!("Answer ignored while the examiner is speaking");
                }
            }
            SessionCommand::StopAnswering => self.gate.stop_answering(),
            SessionCommand::Interrupt => {
                if self.is_running() {
                    info!("Student barged in");
                    self.interrupt_playback();
                }
            }
            SessionCommand::End => {
                info!("Session ended by user");
                self.finish();
            }
            SessionCommand::Spectrum(reply) => {
                let window = self
                    .scheduler
                    .window_at(self.clock.now(), self.analyser.fft_size());
                let _ = reply.send(self.analyser.snapshot(&window));
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn start(&mut self) {
        if self.state != SessionState::NotStarted {
            warn!(state = self.state.as_str(), "Session already started");
            return;
        }
        self.started_at = Some(Utc::now());
        self.transition(SessionState::AcquiringPermissions);

        let (sink, mailbox) =
            CaptureSink::channel(self.settings.frame_size, self.gate_signal.clone());
        let acquired = match self.resources.microphone.as_mut() {
            Some(microphone) => microphone.start(sink),
            None => Err(SessionError::PermissionDenied("no microphone".to_string())),
        };
        if let Err(e) = acquired {
            let denied = match e {
                SessionError::PermissionDenied(_) => e,
                other => SessionError::PermissionDenied(other.to_string()),
            };
            self.fail(denied);
            return;
        }
        self.mailbox = Some(mailbox);

        self.transition(SessionState::Connecting);
        self.clock = OutputClock::start();

        let request = SessionOpenRequest {
            system_instructions: self.exam.system_instructions(),
            output_voice: self.settings.voice.clone(),
            tools: vec![score_tool_declaration()],
        };
        let connector = self.connector.clone();
        let tx = self.internal_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = connector.connect(request).await;
            let _ = tx.send(Internal::Connected(result));
        }));
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected(Ok(connection)) => {
                self.connect_task = None;
                if self.state != SessionState::Connecting {
                    // Nobody is waiting for this session any more
                    let mut transport = connection.transport;
                    transport.close();
                    return;
                }
                debug!("Transport connected, waiting for setup to complete");
                self.resources.transport = Some(connection.transport);
                self.transport_events = Some(connection.events);
            }
            Internal::Connected(Err(e)) => {
                self.connect_task = None;
                error!("Failed to open session: {}", e);
                let e = if e.is_fatal() {
                    e
                } else {
                    SessionError::ConnectionLost(e.to_string())
                };
                self.fail(e);
            }
            Internal::SegmentEnded(id) => {
                self.resources.timer_fired(id);
                if self.scheduler.segment_ended(id) == SegmentEnd::Drained {
                    self.gate.assistant_finished();
                    self.notify(SessionNotification::ActivityChanged(self.gate.activity()));
                    self.finish_if_exhausted();
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: &CapturedFrame) {
        match self.resources.transport.as_deref() {
            Some(transport) if self.is_running() => {
                self.capture
                    .process_frame(frame, &self.gate, &self.gate_signal, transport);
            }
            _ => self.capture.discard(),
        }
    }

    /// Let the capture thread see the gate as it stands after this event.
    fn publish_gate(&self) {
        self.gate_signal
            .publish(self.is_running() && self.gate.should_forward());
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            TransportEvent::Opened => {
                if self.state == SessionState::Connecting {
                    info!("Live session opened");
                    self.transition(SessionState::Active);
                }
            }
            TransportEvent::AudioSegment(bytes) => {
                if self.is_running() {
                    self.play_segment(&bytes);
                }
            }
            TransportEvent::ToolCall(call) => {
                if self.is_running() {
                    self.handle_tool_call(&call);
                }
            }
            TransportEvent::Interrupted => {
                if self.is_running() {
                    debug!("Endpoint interrupted the current turn");
                    self.interrupt_playback();
                }
            }
            TransportEvent::TurnComplete => {
                self.turn_complete = true;
                self.finish_if_exhausted();
            }
            TransportEvent::Closed(reason) => {
                if self.is_running() {
                    info!(reason = ?reason, "Live session closed");
                    self.finish();
                } else {
                    let reason = reason.unwrap_or_else(|| "closed before setup completed".to_string());
                    self.fail(SessionError::ConnectionLost(reason));
                }
            }
            TransportEvent::Error(reason) => {
                error!("Transport error: {}", reason);
                self.fail(SessionError::ConnectionLost(reason));
            }
        }
    }

    fn play_segment(&mut self, bytes: &[u8]) {
        let segment = match codec::decode(
            bytes,
            self.settings.output_sample_rate,
            self.settings.output_channels,
        ) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("Skipping audio segment: {}", e);
                return;
            }
        };

        let timing = self.scheduler.schedule(segment, self.clock.now());
        self.turn_complete = false;

        let played = match (
            self.resources.speaker.as_mut(),
            self.scheduler.segment(timing.id),
        ) {
            (Some(speaker), Some(segment)) => speaker.play(timing.id, segment, timing.start_at),
            _ => Ok(()),
        };
        if let Err(e) = played {
            self.fail(e);
            return;
        }

        let tx = self.internal_tx.clone();
        let deadline = self.clock.instant_at(timing.end_at());
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(Internal::SegmentEnded(timing.id));
        });
        self.resources.track_timer(timing.id, timer.abort_handle());

        if self.gate.assistant_started() {
            self.notify(SessionNotification::ActivityChanged(self.gate.activity()));
        }
        debug!(
            id = timing.id,
            start_at = timing.start_at,
            duration = timing.duration,
            "Segment scheduled"
        );
    }

    fn handle_tool_call(&mut self, call: &ToolCall) {
        let dispatch = match self.dispatcher.dispatch(call) {
            Ok(dispatch) => dispatch,
            Err(_) => return,
        };

        if let Some(transport) = self.resources.transport.as_deref() {
            if let Err(e) = transport.send(dispatch.ack) {
                warn!("Failed to acknowledge tool call {}: {}", call.id, e);
            }
        }

        if dispatch.score.questions_asked >= self.exam.total_questions() && !self.questions_exhausted {
            info!(
                correct = dispatch.score.correct_count,
                asked = dispatch.score.questions_asked,
                "All questions graded"
            );
            self.questions_exhausted = true;
        }

        self.notify(SessionNotification::ScoreUpdated(dispatch.score));
        self.notify(SessionNotification::Feedback(dispatch.feedback));
    }

    /// Stop everything that is playing and reset the clock.
    fn interrupt_playback(&mut self) {
        self.stop_playback();
        if self.gate.interrupt() {
            self.notify(SessionNotification::ActivityChanged(self.gate.activity()));
        }
        self.analyser.reset();
        self.transition(SessionState::Interrupted);
        self.transition(SessionState::Active);
    }

    fn stop_playback(&mut self) {
        let now = self.clock.now();
        for stopped in self.scheduler.stop_all() {
            self.resources.cancel_timer(stopped.id);
            if let Some(speaker) = self.resources.speaker.as_mut() {
                speaker.stop(stopped.id, now);
            }
        }
    }

    fn finish_if_exhausted(&mut self) {
        if self.questions_exhausted && self.turn_complete && !self.scheduler.is_playing() {
            info!("Exam complete");
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.teardown();
        self.transition(SessionState::Finished);
    }

    fn fail(&mut self, error: SessionError) {
        if self.state.is_terminal() {
            return;
        }
        if !error.is_fatal() {
            warn!(code = error.code(), "Non-fatal error: {}", error);
            return;
        }
        error!(code = error.code(), "Session failed: {}", error);
        self.teardown();
        let message = error.user_message();
        self.transition(SessionState::Errored(error));
        self.notify(SessionNotification::Error(message));
    }

    fn teardown(&mut self) {
        self.stop_playback();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        match self.resources.release() {
            Ok(()) => info!(
                forwarded = self.capture.stats().forwarded,
                gated = self.capture.stats().gated,
                stale = self.capture.stats().stale,
                "Session resources released"
            ),
            Err(e) => debug!("{}", e),
        }
        self.close_mailbox();
        self.transport_events = None;
    }

    fn close_mailbox(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            self.frames_overflowed = mailbox.overflow_count();
            self.frames_gated_at_capture = mailbox.gated_count();
        }
    }

    fn transition(&mut self, state: SessionState) {
        debug!(from = self.state.as_str(), to = state.as_str(), "State change");
        self.state = state.clone();
        self.notify(SessionNotification::StatusChanged(state));
    }

    fn notify(&self, notification: SessionNotification) {
        // The consumer may have stopped listening; the session carries on
        let _ = self.notifications.send(notification);
    }

    fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Interrupted)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let stats = self.capture.stats();
        SessionSnapshot {
            session_id: self.session_id,
            state: self.state.as_str().to_string(),
            flags: self.gate.flags(),
            score: self.dispatcher.score().clone(),
            next_start_time: self.scheduler.next_start_time(),
            active_segments: self.scheduler.active_count(),
            frames_forwarded: stats.forwarded,
            frames_gated: stats.gated
                + stats.stale
                + self
                    .mailbox
                    .as_ref()
                    .map(|m| m.gated_count())
                    .unwrap_or(self.frames_gated_at_capture),
            frames_overflowed: self
                .mailbox
                .as_ref()
                .map(|m| m.overflow_count())
                .unwrap_or(self.frames_overflowed),
        }
    }

    fn summary(&self) -> SessionSummary {
        let score = self.dispatcher.score();
        let error = match &self.state {
            SessionState::Errored(e) => Some(e.user_message()),
            _ => None,
        };
        SessionSummary {
            session_id: self.session_id,
            correct_count: score.correct_count,
            questions_asked: score.questions_asked,
            total_questions: self.exam.total_questions(),
            final_state: self.state.as_str().to_string(),
            error,
            started_at: self.started_at,
            ended_at: Utc::now(),
        }
    }
}

async fn recv_frame(mailbox: &mut Option<CaptureMailbox>) -> Option<CapturedFrame> {
    match mailbox {
        Some(mailbox) => mailbox.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
