//! # Live API Wire Protocol
//!
//! JSON messages exchanged with the Live bidirectional endpoint.
//!
//! ## Message Format:
//! - **Client → Server**: `setup` (once, first), `realtimeInput` (audio frames,
//!   base64 PCM), `toolResponse` (acknowledgements)
//! - **Server → Client**: `setupComplete`, `serverContent` (audio parts,
//!   `interrupted`, `turnComplete`), `toolCall`, `goAway`
//!
//! Decoding turns one server message into zero or more `TransportEvent`s, in the
//! order tool calls → audio → interrupted → turn complete.

use crate::audio::codec::INPUT_SAMPLE_RATE;
use crate::error::SessionResult;
use crate::transport::{FunctionDeclaration, OutboundMessage, SessionOpenRequest, ToolCall, TransportEvent};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Client messages (externally tagged: `{"setup": {...}}` etc.).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<ToolSet>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64-encoded binary payload with its MIME type.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

/// Server message. Several fields may be present at once.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// MIME type of outbound audio frames.
pub fn input_mime_type() -> String {
    format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE)
}

/// Build the `setup` message that opens the session.
pub fn encode_setup(model: &str, request: &SessionOpenRequest) -> SessionResult<String> {
    let message = ClientMessage::Setup(Setup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: request.output_voice.clone(),
                    },
                },
            },
        },
        system_instruction: Content {
            parts: vec![Part {
                text: Some(request.system_instructions.clone()),
                inline_data: None,
            }],
        },
        tools: vec![ToolSet {
            function_declarations: request.tools.clone(),
        }],
    });
    Ok(serde_json::to_string(&message)?)
}

/// Serialize an outbound message.
pub fn encode_outbound(message: &OutboundMessage) -> SessionResult<String> {
    let wire = match message {
        OutboundMessage::AudioFrame(bytes) => ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: input_mime_type(),
                data: B64.encode(bytes),
            }],
        }),
        OutboundMessage::ToolResponse { id, name, result } => {
            ClientMessage::ToolResponse(ToolResponse {
                function_responses: vec![FunctionResponse {
                    id: id.clone(),
                    name: name.clone(),
                    response: serde_json::json!({ "result": result }),
                }],
            })
        }
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Decode one server message into transport events.
///
/// ## Errors:
/// A message that is not valid JSON is a `Protocol` error. A single audio part
/// with an undecodable payload is skipped with a warning; the rest of the
/// message is still delivered.
pub fn decode_server_message(text: &str) -> SessionResult<Vec<TransportEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(TransportEvent::Opened);
    }

    if let Some(tool_call) = message.tool_call {
        for call in tool_call.function_calls {
            events.push(TransportEvent::ToolCall(ToolCall {
                id: call.id,
                name: call.name,
                args: call.args,
            }));
        }
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                let Some(blob) = part.inline_data else {
                    continue;
                };
                match B64.decode(blob.data.as_bytes()) {
                    Ok(bytes) => events.push(TransportEvent::AudioSegment(bytes)),
                    Err(e) => warn!("Dropping audio part with bad base64 payload: {}", e),
                }
            }
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        debug!(time_left = ?go_away.time_left, "Endpoint announced disconnect");
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn open_request() -> SessionOpenRequest {
        SessionOpenRequest {
            system_instructions: "ROLE: examiner".to_string(),
            output_voice: "Puck".to_string(),
            tools: vec![crate::dispatcher::score_tool_declaration()],
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let json = encode_setup("models/test-model", &open_request()).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        let setup = &v["setup"];
        assert_eq!(setup["model"], "models/test-model");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "ROLE: examiner");
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "reportAnswerResult"
        );
    }

    #[test]
    fn test_audio_frame_encoding() {
        let json = encode_outbound(&OutboundMessage::AudioFrame(vec![1, 2, 3, 4])).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        let chunk = &v["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], B64.encode([1u8, 2, 3, 4]));
    }

    #[test]
    fn test_tool_response_encoding() {
        let json = encode_outbound(&OutboundMessage::ToolResponse {
            id: "call-7".to_string(),
            name: "reportAnswerResult".to_string(),
            result: "Grade logged.".to_string(),
        })
        .unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        let response = &v["toolResponse"]["functionResponses"][0];
        assert_eq!(response["id"], "call-7");
        assert_eq!(response["response"]["result"], "Grade logged.");
    }

    #[test]
    fn test_decode_setup_complete() {
        let events = decode_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::Opened]);
    }

    #[test]
    fn test_decode_audio_parts() {
        let data = B64.encode([0u8, 0, 255, 127]);
        let text = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}},
                        {"text": "ignored"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "!!!"}}
                    ]
                },
                "turnComplete": true
            }
        })
        .to_string();

        let events = decode_server_message(&text).unwrap();
        assert_eq!(
            events,
            vec![
                TransportEvent::AudioSegment(vec![0, 0, 255, 127]),
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_decode_tool_call_before_interrupt() {
        let text = json!({
            "toolCall": {
                "functionCalls": [
                    {"id": "c1", "name": "reportAnswerResult", "args": {"isCorrect": true}}
                ]
            },
            "serverContent": {"interrupted": true}
        })
        .to_string();

        let events = decode_server_message(&text).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            TransportEvent::ToolCall(call) => {
                assert_eq!(call.id, "c1");
                assert_eq!(call.args["isCorrect"], true);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events[1], TransportEvent::Interrupted);
    }

    #[test]
    fn test_decode_unknown_message_yields_nothing() {
        assert!(decode_server_message(r#"{"usageMetadata": {}}"#).unwrap().is_empty());
        assert!(decode_server_message(r#"{"goAway": {"timeLeft": "5s"}}"#).unwrap().is_empty());
        assert!(decode_server_message("not json").is_err());
    }
}
