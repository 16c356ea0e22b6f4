//! # Live WebSocket Client
//!
//! `Connector` implementation for the Live bidirectional WebSocket API.
//!
//! ## Task Layout:
//! - **Writer task**: drains an unbounded queue of outgoing messages into the socket,
//!   so `Transport::send` never waits on the network
//! - **Reader task**: decodes server frames into `TransportEvent`s and posts them,
//!   in arrival order, to the session's event channel
//!
//! `connect` returns once the socket is open and the `setup` message is queued;
//! `TransportEvent::Opened` follows when the endpoint answers with `setupComplete`.

use crate::config::EndpointConfig;
use crate::error::{SessionError, SessionResult};
use crate::transport::protocol::{decode_server_message, encode_outbound, encode_setup};
use crate::transport::{
    Connector, OutboundMessage, SessionOpenRequest, Transport, TransportConnection, TransportEvent,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Client for the Live bidirectional endpoint.
#[derive(Debug, Clone)]
pub struct LiveClient {
    url: String,
    api_key: String,
    model: String,
}

impl LiveClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_config(endpoint: &EndpointConfig) -> Self {
        Self::new(&endpoint.url, &endpoint.api_key, &endpoint.model)
    }

    /// Endpoint URL with the API key query parameter.
    fn request_url(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, separator, self.api_key)
    }
}

#[async_trait]
impl Connector for LiveClient {
    async fn connect(&self, request: SessionOpenRequest) -> SessionResult<TransportConnection> {
        info!(url = %self.url, model = %self.model, voice = %request.output_voice, "Opening live session");

        let (socket, _response) = connect_async(self.request_url())
            .await
            .map_err(|e| SessionError::ConnectionLost(format!("connect failed: {}", e)))?;
        let (mut sink, mut stream) = socket.split();

        let setup = encode_setup(&self.model, &request)?;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // The setup message must be the first frame on the socket
        out_tx
            .send(Message::Text(setup))
            .map_err(|_| SessionError::ConnectionLost("writer queue closed".to_string()))?;

        let writer_events = event_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("Live socket write failed: {}", e);
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Live socket writer stopped");
        });

        let reader = tokio::spawn(async move {
            let mut closed = false;
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Ignoring non-UTF-8 binary frame: {}", e);
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        info!(reason = ?reason, "Live session closed by endpoint");
                        let _ = event_tx.send(TransportEvent::Closed(reason));
                        closed = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Live socket error: {}", e);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        closed = true;
                        break;
                    }
                };

                match decode_server_message(&text) {
                    Ok(events) => {
                        for event in events {
                            if event_tx.send(event).is_err() {
                                // Session no longer listening
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Undecodable server message: {}", e),
                }
            }
            if !closed {
                let _ = event_tx.send(TransportEvent::Closed(None));
            }
        });

        let transport = LiveTransport {
            out_tx: Some(out_tx),
            reader: Some(reader),
            writer: Some(writer),
        };

        Ok(TransportConnection {
            transport: Box::new(transport),
            events: event_rx,
        })
    }
}

/// Outbound half of a live session.
pub struct LiveTransport {
    out_tx: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Transport for LiveTransport {
    fn send(&self, message: OutboundMessage) -> SessionResult<()> {
        let tx = self
            .out_tx
            .as_ref()
            .ok_or_else(|| SessionError::ConnectionLost("session already closed".to_string()))?;
        let text = encode_outbound(&message)?;
        tx.send(Message::Text(text))
            .map_err(|_| SessionError::ConnectionLost("writer task stopped".to_string()))
    }

    fn close(&mut self) {
        if let Some(tx) = self.out_tx.take() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "session ended".into(),
            })));
            debug!("Live session close requested");
        }
        // Late inbound frames are no longer of interest
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer exits on its own after flushing the close frame
        self.writer.take();
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_carries_key() {
        let client = LiveClient::new("wss://example.test/ws", "abc123", "m");
        assert_eq!(client.request_url(), "wss://example.test/ws?key=abc123");

        let client = LiveClient::new("wss://example.test/ws?alt=1", "k", "m");
        assert_eq!(client.request_url(), "wss://example.test/ws?alt=1&key=k");

        let client = LiveClient::new("ws://localhost:9000", "", "m");
        assert_eq!(client.request_url(), "ws://localhost:9000");
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut transport = LiveTransport {
            out_tx: Some(out_tx),
            reader: None,
            writer: None,
        };
        assert!(transport.send(OutboundMessage::AudioFrame(vec![0, 0])).is_ok());
        transport.close();
        transport.close();
        let err = transport.send(OutboundMessage::AudioFrame(vec![0, 0])).unwrap_err();
        assert!(matches!(err, SessionError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_endpoint_is_connection_lost() {
        let client = LiveClient::new("ws://127.0.0.1:1", "", "m");
        let request = SessionOpenRequest {
            system_instructions: String::new(),
            output_voice: "Puck".to_string(),
            tools: Vec::new(),
        };
        match client.connect(request).await {
            Err(SessionError::ConnectionLost(_)) => {}
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
