//! Wire protocol for the orchestration server
//!
//! Every message in both directions travels in the same envelope:
//! `{"kind": "...", "payload": {...}, "sessionId": "..."}`. Inbound
//! envelopes are turned into a [`ServerEvent`] at the boundary so payload
//! shapes are checked once, here, instead of at each call site.

use crate::{Result, SessionError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A raw frame as carried by the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Kinds of inbound messages handlers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InterviewStart,
    NextSpeakerInfo,
    InterviewData,
    ActivityInfo,
    AudioChunks,
    AudioStreamingCompleted,
    SpeechToTextResult,
    InterviewEnd,
    Error,
    ConnectionEstablished,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::InterviewStart,
        EventKind::NextSpeakerInfo,
        EventKind::InterviewData,
        EventKind::ActivityInfo,
        EventKind::AudioChunks,
        EventKind::AudioStreamingCompleted,
        EventKind::SpeechToTextResult,
        EventKind::InterviewEnd,
        EventKind::Error,
        EventKind::ConnectionEstablished,
    ];

    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::InterviewStart => "interview_start",
            EventKind::NextSpeakerInfo => "next_speaker_info",
            EventKind::InterviewData => "interview_data",
            EventKind::ActivityInfo => "activity_info",
            EventKind::AudioChunks => "audio_chunks",
            EventKind::AudioStreamingCompleted => "audio_streaming_completed",
            EventKind::SpeechToTextResult => "speech_to_text_result",
            EventKind::InterviewEnd => "interview_end",
            EventKind::Error => "error",
            EventKind::ConnectionEstablished => "connection_established",
        }
    }

    /// Look up a kind by its wire name
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

/// One roster entry as announced by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_automated")]
    pub is_automated: bool,
}

fn default_automated() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InterviewStart {
    pub participants: Vec<RosterEntry>,
    pub opening_remarks: Option<String>,
    /// Who delivers the opening remarks; the first automated participant if absent
    pub speaker: Option<String>,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NextSpeakerInfo {
    pub speaker: String,
    pub requires_human_input: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InterviewData {
    pub speaker: String,
    pub content: String,
    pub topic: Option<String>,
    pub subtopic: Option<String>,
    pub requires_human_input: bool,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActivityInfo {
    pub scenario: String,
    pub task: String,
    pub starter_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpeechToTextResult {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InterviewEnd {
    pub closing_remarks: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerError {
    pub message: String,
    pub code: Option<String>,
}

/// Inbound protocol events, one variant per message kind
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    InterviewStart(InterviewStart),
    NextSpeakerInfo(NextSpeakerInfo),
    InterviewData(InterviewData),
    ActivityInfo(ActivityInfo),
    /// Fragment of a synthesized speech stream
    AudioChunks(Vec<u8>),
    AudioStreamingCompleted,
    SpeechToTextResult(SpeechToTextResult),
    InterviewEnd(InterviewEnd),
    Error(ServerError),
    ConnectionEstablished,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::InterviewStart(_) => EventKind::InterviewStart,
            ServerEvent::NextSpeakerInfo(_) => EventKind::NextSpeakerInfo,
            ServerEvent::InterviewData(_) => EventKind::InterviewData,
            ServerEvent::ActivityInfo(_) => EventKind::ActivityInfo,
            ServerEvent::AudioChunks(_) => EventKind::AudioChunks,
            ServerEvent::AudioStreamingCompleted => EventKind::AudioStreamingCompleted,
            ServerEvent::SpeechToTextResult(_) => EventKind::SpeechToTextResult,
            ServerEvent::InterviewEnd(_) => EventKind::InterviewEnd,
            ServerEvent::Error(_) => EventKind::Error,
            ServerEvent::ConnectionEstablished => EventKind::ConnectionEstablished,
        }
    }

    /// Parse a frame into an event.
    ///
    /// Returns `Ok(None)` for kinds this client does not know about, so newer
    /// servers can add messages without breaking older clients. Binary frames
    /// are always speech audio.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>> {
        match frame {
            Frame::Binary(bytes) => Ok(Some(ServerEvent::AudioChunks(bytes.clone()))),
            Frame::Text(text) => Self::from_json(text),
        }
    }

    pub fn from_json(text: &str) -> Result<Option<Self>> {
        let envelope: RawEnvelope = serde_json::from_str(text)?;

        let Some(kind) = EventKind::from_wire(&envelope.kind) else {
            return Ok(None);
        };

        let payload = if envelope.payload.is_null() {
            Value::Object(Default::default())
        } else {
            envelope.payload
        };

        let event = match kind {
            EventKind::InterviewStart => ServerEvent::InterviewStart(serde_json::from_value(payload)?),
            EventKind::NextSpeakerInfo => ServerEvent::NextSpeakerInfo(serde_json::from_value(payload)?),
            EventKind::InterviewData => ServerEvent::InterviewData(serde_json::from_value(payload)?),
            EventKind::ActivityInfo => ServerEvent::ActivityInfo(serde_json::from_value(payload)?),
            EventKind::AudioChunks => ServerEvent::AudioChunks(decode_audio_payload(&payload)?),
            EventKind::AudioStreamingCompleted => ServerEvent::AudioStreamingCompleted,
            EventKind::SpeechToTextResult => {
                ServerEvent::SpeechToTextResult(serde_json::from_value(payload)?)
            }
            EventKind::InterviewEnd => ServerEvent::InterviewEnd(serde_json::from_value(payload)?),
            EventKind::Error => ServerEvent::Error(serde_json::from_value(payload)?),
            EventKind::ConnectionEstablished => ServerEvent::ConnectionEstablished,
        };

        Ok(Some(event))
    }
}

/// Accepts a base64 string, `{"audio": "<base64>"}` or a plain byte array
fn decode_audio_payload(payload: &Value) -> Result<Vec<u8>> {
    match payload {
        Value::String(encoded) => BASE64
            .decode(encoded)
            .map_err(|e| SessionError::ProtocolError(format!("Invalid base64 audio: {}", e))),
        Value::Object(map) => match map.get("audio").or_else(|| map.get("data")) {
            Some(inner) => decode_audio_payload(inner),
            None => Err(SessionError::ProtocolError(
                "Audio chunk payload has no audio field".to_string(),
            )),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| {
                        SessionError::ProtocolError("Audio byte array out of range".to_string())
                    })
            })
            .collect(),
        other => Err(SessionError::ProtocolError(format!(
            "Unsupported audio payload: {}",
            other
        ))),
    }
}

/// Outbound messages sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    StartInterview,
    LoadConfig { config_id: String },
    InstructionAck,
    /// Base64 encoded recording of the candidate's answer
    RawAudioData { audio: String },
    DoneProblemSolving { code: String },
    InterviewEnd,
    AudioPlaybackCompleted,
}

#[derive(Serialize)]
struct Envelope<'a> {
    kind: &'a str,
    payload: Value,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::StartInterview => "start_interview",
            ClientMessage::LoadConfig { .. } => "load_config",
            ClientMessage::InstructionAck => "instruction_ack",
            ClientMessage::RawAudioData { .. } => "raw_audio_data",
            ClientMessage::DoneProblemSolving { .. } => "done_problem_solving",
            ClientMessage::InterviewEnd => "interview_end",
            ClientMessage::AudioPlaybackCompleted => "audio_playback_completed",
        }
    }

    fn payload(&self) -> Value {
        match self {
            ClientMessage::LoadConfig { config_id } => json!({ "configId": config_id }),
            ClientMessage::RawAudioData { audio } => json!({ "audio": audio }),
            ClientMessage::DoneProblemSolving { code } => json!({ "code": code }),
            ClientMessage::StartInterview
            | ClientMessage::InstructionAck
            | ClientMessage::InterviewEnd
            | ClientMessage::AudioPlaybackCompleted => json!({}),
        }
    }

    /// Serialize into the wire envelope
    pub fn to_envelope(&self, session_id: &str) -> Result<String> {
        let envelope = Envelope {
            kind: self.kind(),
            payload: self.payload(),
            session_id,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_speaker() {
        let text = r#"{"kind":"next_speaker_info","payload":{"speaker":"Ada","requiresHumanInput":false},"sessionId":"s1"}"#;
        let event = ServerEvent::from_json(text).unwrap().unwrap();
        assert_eq!(
            event,
            ServerEvent::NextSpeakerInfo(NextSpeakerInfo {
                speaker: "Ada".to_string(),
                requires_human_input: false,
            })
        );
        assert_eq!(event.kind(), EventKind::NextSpeakerInfo);
    }

    #[test]
    fn test_unknown_kind_is_dropped() {
        let text = r#"{"kind":"panel_reshuffle","payload":{}}"#;
        assert!(ServerEvent::from_json(text).unwrap().is_none());
    }

    #[test]
    fn test_missing_payload_uses_defaults() {
        let text = r#"{"kind":"interview_end"}"#;
        let event = ServerEvent::from_json(text).unwrap().unwrap();
        assert_eq!(event, ServerEvent::InterviewEnd(InterviewEnd::default()));
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(ServerEvent::from_json("{not json").is_err());
    }

    #[test]
    fn test_interview_start_roster() {
        let text = r#"{
            "kind": "interview_start",
            "payload": {
                "participants": [
                    {"id": "a1", "name": "Ada"},
                    {"id": "c1", "name": "Casey", "isAutomated": false}
                ],
                "openingRemarks": "Welcome!",
                "voice": "alloy"
            },
            "sessionId": "s1"
        }"#;
        let Some(ServerEvent::InterviewStart(start)) = ServerEvent::from_json(text).unwrap() else {
            panic!("expected interview_start");
        };
        assert_eq!(start.participants.len(), 2);
        assert!(start.participants[0].is_automated);
        assert!(!start.participants[1].is_automated);
        assert_eq!(start.opening_remarks.as_deref(), Some("Welcome!"));
        assert_eq!(start.voice.as_deref(), Some("alloy"));
    }

    #[test]
    fn test_audio_payload_forms() {
        let encoded = BASE64.encode([1u8, 2, 3]);

        let as_string = format!(r#"{{"kind":"audio_chunks","payload":"{}"}}"#, encoded);
        let as_object = format!(r#"{{"kind":"audio_chunks","payload":{{"audio":"{}"}}}}"#, encoded);
        let as_array = r#"{"kind":"audio_chunks","payload":[1,2,3]}"#.to_string();

        for text in [as_string, as_object, as_array] {
            let event = ServerEvent::from_json(&text).unwrap().unwrap();
            assert_eq!(event, ServerEvent::AudioChunks(vec![1, 2, 3]));
        }
    }

    #[test]
    fn test_binary_frame_is_audio() {
        let event = ServerEvent::from_frame(&Frame::Binary(vec![9, 9])).unwrap().unwrap();
        assert_eq!(event, ServerEvent::AudioChunks(vec![9, 9]));
    }

    #[test]
    fn test_client_envelope_shape() {
        let message = ClientMessage::DoneProblemSolving {
            code: "fn main() {}".to_string(),
        };
        let text = message.to_envelope("session-7").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["kind"], "done_problem_solving");
        assert_eq!(value["payload"]["code"], "fn main() {}");
        assert_eq!(value["sessionId"], "session-7");
    }

    #[test]
    fn test_every_kind_has_unique_wire_name() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
    }
}
