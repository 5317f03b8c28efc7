//! Realtime event-channel protocol types
//!
//! JSON messages exchanged over the `oai-events` data channel. Inbound kinds
//! not consumed by the state machine deserialize to [`ServerEvent::Other`]
//! and are skipped.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Inbound protocol events consumed by the session state machine
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Assistant audio chunk — the assistant is speaking
    #[serde(rename = "response.audio.delta")]
    AudioDelta,

    /// Remote output buffer started playing
    #[serde(rename = "output_audio_buffer.started")]
    OutputAudioStarted,

    /// Remote output buffer drained — assistant audio stopped
    #[serde(rename = "output_audio_buffer.stopped")]
    OutputAudioStopped,

    /// Assistant turn complete
    #[serde(rename = "response.done")]
    ResponseDone,

    /// Remote VAD detected the user speaking
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// Completed transcription of the user's utterance
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted {
        /// Transcribed user speech
        transcript: String,
    },

    /// Completed transcript of the assistant's spoken response
    #[serde(rename = "response.audio_transcript.done")]
    ResponseTranscriptDone {
        /// Assistant speech as text
        transcript: String,
    },

    /// Assistant requested a tool call with fully streamed arguments
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        /// Tool name (e.g. `search_pubmed`)
        name: String,
        /// Correlation id the result must be tagged with
        call_id: String,
        /// Arguments as a JSON string
        arguments: String,
    },

    /// Any event kind the machine does not consume
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Parse an inbound event-channel message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] if the payload is not a valid
    /// protocol message.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedEvent(e.to_string()))
    }
}

/// Outbound protocol messages sent over the event channel
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Ask the assistant to produce (or continue) a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Optional response configuration
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },

    /// Cancel the in-flight assistant response (barge-in)
    #[serde(rename = "response.cancel")]
    ResponseCancel,

    /// Deliver a correlated tool-call result
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// The function call output item
        item: FunctionCallOutput,
    },
}

impl ClientEvent {
    /// Bare continuation request with no instructions
    #[must_use]
    pub const fn response_create() -> Self {
        Self::ResponseCreate { response: None }
    }

    /// Response request carrying instructions (used for the greeting)
    #[must_use]
    pub fn response_with_instructions(instructions: &str) -> Self {
        Self::ResponseCreate {
            response: Some(ResponseConfig {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions: Some(instructions.to_string()),
            }),
        }
    }

    /// Tool result tagged with its originating call id
    #[must_use]
    pub fn function_call_output(call_id: &str, output: &str) -> Self {
        Self::ConversationItemCreate {
            item: FunctionCallOutput {
                kind: "function_call_output".to_string(),
                call_id: call_id.to_string(),
                output: output.to_string(),
            },
        }
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Configuration for a `response.create` request
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResponseConfig {
    /// Requested output modalities
    pub modalities: Vec<String>,

    /// Instructions for this response only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// `conversation.item.create` payload for a tool result
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FunctionCallOutput {
    /// Always `function_call_output`
    #[serde(rename = "type")]
    pub kind: String,

    /// Correlation id from `response.function_call_arguments.done`
    pub call_id: String,

    /// Serialized tool result
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_call_event() {
        let raw = r#"{
            "type": "response.function_call_arguments.done",
            "name": "search_pubmed",
            "call_id": "call_123",
            "arguments": "{\"query\":\"sarcopenia\"}"
        }"#;

        let event = ServerEvent::parse(raw).unwrap();
        assert_eq!(
            event,
            ServerEvent::FunctionCallArgumentsDone {
                name: "search_pubmed".to_string(),
                call_id: "call_123".to_string(),
                arguments: "{\"query\":\"sarcopenia\"}".to_string(),
            }
        );
    }

    #[test]
    fn parses_transcript_event() {
        let raw = r#"{
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_1",
            "transcript": "hey bot stop"
        }"#;

        let event = ServerEvent::parse(raw).unwrap();
        assert_eq!(
            event,
            ServerEvent::InputTranscriptCompleted {
                transcript: "hey bot stop".to_string()
            }
        );
    }

    #[test]
    fn unknown_kind_is_other() {
        let event = ServerEvent::parse(r#"{"type":"session.updated"}"#).unwrap();
        assert_eq!(event, ServerEvent::Other);
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(ServerEvent::parse("not json").is_err());
        assert!(ServerEvent::parse(r#"{"no_type":1}"#).is_err());
    }

    #[test]
    fn greeting_serializes_with_instructions() {
        let json = ClientEvent::response_with_instructions("Say hi")
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "response.create");
        assert_eq!(value["response"]["instructions"], "Say hi");
        assert_eq!(value["response"]["modalities"][0], "text");
    }

    #[test]
    fn bare_continuation_omits_response() {
        let json = ClientEvent::response_create().to_json().unwrap();
        assert_eq!(json, r#"{"type":"response.create"}"#);
    }

    #[test]
    fn tool_output_is_correlated() {
        let json = ClientEvent::function_call_output("call_9", "{\"ok\":true}")
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "conversation.item.create");
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "call_9");
        assert_eq!(value["item"]["output"], "{\"ok\":true}");
    }
}
