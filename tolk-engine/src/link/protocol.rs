//! Wire protocol for the remote speech service
//!
//! JSON text messages, one top-level object per frame, discriminated by a
//! `type` field. Audio payloads are base64 PCM16 little-endian, 24 kHz
//! mono, in both directions.

use serde::{Deserialize, Serialize};

/// Server-side turn detection advertised in the session update; `None`
/// serializes as `null`, which disables it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    /// Defaults used when the server-VAD preset is active
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Transcription model selection for recognized-source text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Session parameters sent after connecting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionParams {
    pub input_audio_format: String,
    pub modalities: Vec<String>,
    pub instructions: String,
    pub turn_detection: Option<TurnDetection>,
    pub input_audio_transcription: TranscriptionConfig,
}

/// Body of a `response.create`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseParams {
    pub modalities: Vec<String>,
    pub instructions: String,
}

/// Client → service messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams },

    /// One chunk of utterance audio (base64 PCM16, 24 kHz mono)
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    /// Terminates the current utterance upload
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseParams },
}

/// Reference to a server-assigned response id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseRef {
    pub id: String,
}

/// Distinguished soft-failure code: the remote already has an active
/// response and rejected ours. Never retried.
pub const CODE_ACTIVE_RESPONSE: &str = "conversation_already_has_active_response";

/// Service → client messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Source-language transcript, delivered after a commit
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { transcript: String },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },

    /// Translated-text stream
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        transcript: Option<String>,
    },

    /// Translated-audio stream (base64 PCM16, 24 kHz mono)
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Terminal event for a response
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseRef },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },

    /// Any message type this client does not consume
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Whether this error event is the distinguished active-response
    /// soft failure.
    pub fn is_active_response_conflict(&self) -> bool {
        matches!(
            self,
            ServerEvent::Error { code: Some(code), .. } if code == CODE_ACTIVE_RESPONSE
        )
    }
}
