//! Wire message schema for the voice channel.
//!
//! Every payload carries a discriminated `type` field. Unrecognized or
//! malformed messages are logged and dropped by the channel that reads
//! them; they never close it.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};

/// A tagged channel message, client↔backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// One utterance's audio, client → backend.
    AudioData {
        /// Base64-encoded audio payload (transport encoding only).
        #[serde(rename = "audioData")]
        audio_data: String,
        /// Session this utterance belongs to.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Transcribed text, backend → client (or client → backend in
    /// polling mode, where transcription happens client-side).
    Transcript {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    /// Backend-reported failure for the in-flight request.
    Error { message: String },
    /// Barge-in notice: stop processing the current turn.
    Interrupt,
}

impl WireMessage {
    /// Parse a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedMessage`] when the payload is not a
    /// recognized tagged message. Callers log and drop it.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CallError::MalformedMessage(e.to_string()))
    }

    /// Serialize for a text transport.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (should not happen for
    /// well-formed messages).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CallError::Channel(format!("encode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_data_serializes_with_camel_case_fields() {
        let msg = WireMessage::AudioData {
            audio_data: "AAAA".into(),
            session_id: "s-1".into(),
        };
        let json = msg.to_json().expect("serialize");
        assert!(json.contains("\"type\":\"audio_data\""));
        assert!(json.contains("\"audioData\":\"AAAA\""));
        assert!(json.contains("\"sessionId\":\"s-1\""));
    }

    #[test]
    fn transcript_round_trips() {
        let raw = r#"{"type":"transcript","text":"hello coach","isFinal":true}"#;
        let msg = WireMessage::parse(raw).expect("parse");
        assert_eq!(
            msg,
            WireMessage::Transcript {
                text: "hello coach".into(),
                is_final: true,
            }
        );
    }

    #[test]
    fn interrupt_is_bare_tag() {
        let json = WireMessage::Interrupt.to_json().expect("serialize");
        assert_eq!(json, r#"{"type":"interrupt"}"#);
        assert_eq!(WireMessage::parse(&json).expect("parse"), WireMessage::Interrupt);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = WireMessage::parse(r#"{"type":"telemetry","x":1}"#).expect_err("reject");
        assert!(matches!(err, CallError::MalformedMessage(_)));
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(
            WireMessage::parse("not json").expect_err("reject"),
            CallError::MalformedMessage(_)
        ));
    }
}
