//! # Transport / Session Client
//!
//! One duplex logical session per exam with the remote conversational endpoint.
//!
//! ## Key Components:
//! - **Connector**: opens the session with the system instructions, output voice and tools
//! - **Transport**: outbound half; fire-and-forget audio frames and tool responses
//! - **TransportEvent**: inbound half; one tagged event stream read by the session actor
//! - **protocol**: JSON wire format of the Live bidirectional API
//! - **websocket**: `LiveClient`, the WebSocket implementation
//!
//! The transport never retries. A transport-level failure is reported as
//! `TransportEvent::Error` and the session controller decides what happens next.

pub mod protocol;
pub mod websocket;

use crate::error::SessionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use websocket::LiveClient;

/// A function the remote model may call during the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: serde_json::Value,
}

/// Everything sent when the session is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOpenRequest {
    pub system_instructions: String,
    pub output_voice: String,
    pub tools: Vec<FunctionDeclaration>,
}

/// A function call emitted by the remote model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Inbound events, in the order the endpoint produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The endpoint accepted the session configuration
    Opened,
    /// 16-bit PCM speech at the output sample rate
    AudioSegment(Vec<u8>),
    ToolCall(ToolCall),
    /// The endpoint cancelled the model's current turn
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The session closed, with an optional reason
    Closed(Option<String>),
    /// Transport-level failure
    Error(String),
}

/// Outbound messages.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One encoded `AudioFrame`
    AudioFrame(Vec<u8>),
    /// Acknowledgement of a tool call, keyed by the call id
    ToolResponse {
        id: String,
        name: String,
        result: String,
    },
}

/// Outbound half of an open session.
///
/// `send` must never block: implementations queue the message and return.
pub trait Transport: Send {
    fn send(&self, message: OutboundMessage) -> SessionResult<()>;

    /// Close the session. Calling it more than once is harmless.
    fn close(&mut self);
}

/// An opened session: the outbound handle plus the inbound event stream.
pub struct TransportConnection {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens duplex sessions with the endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: SessionOpenRequest) -> SessionResult<TransportConnection>;
}
