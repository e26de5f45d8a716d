//! # Wire Protocol
//!
//! JSON message shapes exchanged with the Gemini Live bidirectional streaming
//! endpoint.
//!
//! ## Client -> server:
//! - `setup`: model, audio response modality, system instruction, tool declarations
//! - `realtimeInput`: either a base64 PCM audio blob or a text turn (the greeting)
//! - `toolResponse`: one `functionResponses` entry per answered tool call
//!
//! ## Server -> client (parsed into [`ServerEvent`]s):
//! - `setupComplete`: the stream is ready
//! - `serverContent`: audio parts of the model turn, plus turn/interrupt markers
//! - `toolCall`: function calls the client must answer
//! - `goAway`: the server will close soon
//! - `error`: the server rejected something
//!
//! The server sends JSON in both text and binary frames.

use crate::config::AppConfig;
use crate::error::{AppResult, SessionError};
use crate::audio::codec::decode_base64;
use crate::tools::{location_properties, ToolCallRequest, ToolPayload, ToolResult};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Instruction that sets the assistant's persona and flow.
pub fn system_instruction(city: &str) -> String {
    format!(
        r#"You are "Soundscape {city}", a warm, upbeat AI city guide for {city}.

SESSION FLOW:
1. You speak first every time. Say: "Hi! I'm Soundscape {city}. I can share live weather, current construction updates, or upcoming events. Which one would you like?"
2. Only handle those three topics. If the user asks for anything else, politely decline and remind them you can help with weather, construction, or events, then re-prompt.
3. When the user chooses one of the supported topics, call the matching tool. Never fabricate data.
4. Summarize the tool output in under 40 words (unless you need to list multiple events) and finish with "Need anything else from weather, construction, or events?"
"#
    )
}

/// Top-level client message. Serializes as `{"setup": ...}`, `{"realtimeInput": ...}`
/// or `{"toolResponse": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponsePayload),
}

impl ClientMessage {
    /// One captured audio frame.
    pub fn audio(data: String, mime_type: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(AudioBlob { data, mime_type }),
            text: None,
        })
    }

    /// A synthetic user text turn.
    pub fn text(text: impl Into<String>) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            text: Some(text.into()),
        })
    }

    pub fn tool_response(result: ToolResult) -> Self {
        ClientMessage::ToolResponse(ToolResponsePayload {
            function_responses: vec![FunctionResponse {
                id: result.id,
                name: result.name,
                response: FunctionResult { result: result.payload },
            }],
        })
    }

    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|e| SessionError::Transport(format!("serialize: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<ToolSet>,
}

impl SetupPayload {
    /// Setup for an audio conversation with the given tools.
    pub fn new(config: &AppConfig, declarations: Vec<FunctionDeclaration>) -> Self {
        let model = if config.session.model.starts_with("models/") {
            config.session.model.clone()
        } else {
            format!("models/{}", config.session.model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction(&config.location.city),
                }],
            },
            tools: vec![ToolSet {
                function_declarations: declarations,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// A tool as advertised to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl FunctionDeclaration {
    /// Declaration taking a single optional string `location` argument.
    pub fn with_location(name: &str, description: &str, location_description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({
                "type": "OBJECT",
                "properties": location_properties(location_description),
                "required": [],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioBlob {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponsePayload {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: FunctionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResult {
    pub result: ToolPayload,
}

/// Something the server told us, in the order it appeared in the message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Decoded PCM bytes of one audio part
    Audio(Vec<u8>),
    ToolCall(Vec<ToolCallRequest>),
    TurnComplete,
    Interrupted,
    GoAway,
    Error(String),
    /// A part of the message that could not be used; the rest of the message still applies
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<RawServerContent>,
    #[serde(default)]
    tool_call: Option<RawToolCall>,
    #[serde(default)]
    go_away: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    #[serde(default)]
    model_turn: Option<RawTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    inline_data: Option<RawBlob>,
}

#[derive(Debug, Deserialize)]
struct RawBlob {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolCall {
    #[serde(default)]
    function_calls: Vec<RawFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct RawFunctionCall {
    id: Option<String>,
    name: Option<String>,
    #[serde(default, alias = "arguments")]
    args: Option<Map<String, Value>>,
}

impl RawFunctionCall {
    /// A call without a name is still answered, as an unknown tool.
    fn into_request(self) -> Option<ToolCallRequest> {
        Some(ToolCallRequest {
            id: self.id?,
            name: self.name.unwrap_or_default(),
            arguments: self.args.unwrap_or_default(),
        })
    }
}

fn decode_part(blob: &RawBlob) -> AppResult<Vec<u8>> {
    match blob.data.as_str() {
        Some(data) => decode_base64(data),
        None => Err(SessionError::Decode("audio data is not a string".to_string())),
    }
}

/// Parse one inbound frame into events.
///
/// `SessionError::Decode` only when the frame itself is not JSON. A bad audio
/// part or a function call without an id becomes [`ServerEvent::Malformed`]
/// and the other parts are kept. A frame with no recognized field yields an
/// empty list.
pub fn parse_server_message(text: &str) -> AppResult<Vec<ServerEvent>> {
    let raw: RawServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if raw.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = raw.server_content {
        if let Some(turn) = content.model_turn {
            for (index, part) in turn.parts.iter().enumerate() {
                if let Some(blob) = &part.inline_data {
                    events.push(match decode_part(blob) {
                        Ok(pcm) => ServerEvent::Audio(pcm),
                        Err(e) => ServerEvent::Malformed(format!("audio part {}: {}", index, e)),
                    });
                }
            }
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(call) = raw.tool_call {
        let mut requests = Vec::new();
        for raw in call.function_calls {
            let name = raw.name.clone().unwrap_or_default();
            match raw.into_request() {
                Some(request) => requests.push(request),
                None => events.push(ServerEvent::Malformed(format!("function call '{}' without id", name))),
            }
        }
        if !requests.is_empty() {
            events.push(ServerEvent::ToolCall(requests));
        }
    }

    if raw.go_away.is_some() {
        events.push(ServerEvent::GoAway);
    }

    if let Some(error) = raw.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        events.push(ServerEvent::Error(message));
    }

    Ok(events)
}

/// Decode a binary frame as UTF-8 JSON.
pub fn binary_frame_text(bytes: &[u8]) -> AppResult<&str> {
    std::str::from_utf8(bytes).map_err(|e| SessionError::Decode(format!("binary frame is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_samples_base64;
    use serde_json::json;

    #[test]
    fn test_setup_message_shape() {
        let config = AppConfig::default();
        let declarations = vec![FunctionDeclaration::with_location(
            "getWeather",
            "Get the current weather for Brantford.",
            "The city name, e.g., Brantford",
        )];
        let value = serde_json::to_value(ClientMessage::Setup(SetupPayload::new(&config, declarations))).unwrap();

        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.5-flash-native-audio-preview-09-2025");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert!(setup["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Soundscape Brantford"));

        let decl = &setup["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "getWeather");
        assert_eq!(decl["parameters"]["type"], "OBJECT");
        assert_eq!(decl["parameters"]["properties"]["location"]["type"], "STRING");
        assert_eq!(decl["parameters"]["required"], json!([]));
    }

    #[test]
    fn test_realtime_and_tool_response_shapes() {
        let audio = serde_json::to_value(ClientMessage::audio("AAA=".into(), "audio/pcm;rate=16000".into())).unwrap();
        assert_eq!(
            audio,
            json!({"realtimeInput": {"audio": {"data": "AAA=", "mimeType": "audio/pcm;rate=16000"}}})
        );

        let text = serde_json::to_value(ClientMessage::text("hello")).unwrap();
        assert_eq!(text, json!({"realtimeInput": {"text": "hello"}}));

        let response = serde_json::to_value(ClientMessage::tool_response(ToolResult {
            id: "fc-9".into(),
            name: "deleteCity".into(),
            payload: ToolPayload::failure("Unknown tool"),
        }))
        .unwrap();
        assert_eq!(
            response,
            json!({"toolResponse": {"functionResponses": [
                {"id": "fc-9", "name": "deleteCity", "response": {"result": {"error": "Unknown tool"}}}
            ]}})
        );
    }

    #[test]
    fn test_parse_audio_turn() {
        let data = encode_samples_base64(&[0.0, 0.5]);
        let msg = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}},
                    {"text": "ignored"}
                ]},
                "turnComplete": true
            }
        });
        let events = parse_server_message(&msg.to_string()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ServerEvent::Audio(bytes) if bytes.len() == 4));
        assert_eq!(events[1], ServerEvent::TurnComplete);
    }

    #[test]
    fn test_parse_tool_call_and_control_messages() {
        let msg = json!({"toolCall": {"functionCalls": [
            {"id": "a", "name": "getWeather", "args": {"location": "Brantford"}},
            {"id": "b", "name": "getUpcomingEvents"}
        ]}});
        let events = parse_server_message(&msg.to_string()).unwrap();
        match &events[0] {
            ServerEvent::ToolCall(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].location(), Some("Brantford"));
                assert!(calls[1].arguments.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(parse_server_message(r#"{"setupComplete":{}}"#).unwrap(), vec![ServerEvent::SetupComplete]);
        assert_eq!(
            parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap(),
            vec![ServerEvent::Interrupted]
        );
        assert_eq!(
            parse_server_message(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap(),
            vec![ServerEvent::GoAway]
        );
        assert_eq!(
            parse_server_message(r#"{"error":{"code":400,"message":"bad setup"}}"#).unwrap(),
            vec![ServerEvent::Error("bad setup".to_string())]
        );
        assert!(parse_server_message(r#"{"usageMetadata":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_frames() {
        assert!(matches!(parse_server_message("not json"), Err(SessionError::Decode(_))));
        assert!(binary_frame_text(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_bad_parts_do_not_hide_the_rest_of_the_frame() {
        let msg = json!({
            "serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"data": "AAAA"}},
                {"inlineData": {"data": "!!not-base64!!"}},
                {"inlineData": {"data": 42}}
            ]}},
            "toolCall": {"functionCalls": [
                {"id": "fc-9", "name": "getWeather"},
                {"name": "getUpcomingEvents"},
                {"id": "fc-10"}
            ]}
        });
        let events = parse_server_message(&msg.to_string()).unwrap();

        assert_eq!(events[0], ServerEvent::Audio(vec![0, 0, 0]));
        assert!(matches!(&events[1], ServerEvent::Malformed(m) if m.starts_with("audio part 1")));
        assert!(matches!(&events[2], ServerEvent::Malformed(m) if m.starts_with("audio part 2")));
        assert!(matches!(&events[3], ServerEvent::Malformed(m) if m.contains("getUpcomingEvents")));
        match &events[4] {
            ServerEvent::ToolCall(calls) => {
                let ids: Vec<_> = calls.iter().map(|c| (c.id.as_str(), c.name.as_str())).collect();
                assert_eq!(ids, vec![("fc-9", "getWeather"), ("fc-10", "")]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events.len(), 5);
    }
}
