//! # Control Protocol
//!
//! JSON control messages multiplexed with binary audio frames on the same
//! WebSocket. Control messages are always sent as self-contained JSON text
//! frames; the transport frame type (text vs. binary) is what distinguishes
//! them from audio; payloads are never inspected to decide.
//!
//! ## Message Format (client → server):
//! - `{"type":"init","speaker":"...","mode":"..."}`: start a dialog session
//! - `{"type":"tts_text","start":b,"end":b,"is_user_querying":b,"content":"..."}`
//!   : push text for the service to synthesize
//! - `{"type":"text_query","content":"..."}`: conversational text query
//!
//! ## Ordering:
//! Control messages and audio frames share one ordered channel. The remote
//! service processes them in send order, so `init` must be flushed before any
//! `tts_text`/`text_query`, and capture must not start pushing audio until
//! the `init` send has returned.

use crate::error::ClientResult;
use serde::{Deserialize, Serialize};

/// A control message, tagged on the wire by its `"type"` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Initialize the dialog session with a synthesis voice and a mode
    #[serde(rename = "init")]
    Init {
        /// Synthesis voice identifier
        speaker: String,
        /// Session mode (e.g. "audio")
        mode: String,
    },

    /// Push a span of text for synthesis
    #[serde(rename = "tts_text")]
    TtsText {
        /// This span starts an utterance
        start: bool,
        /// This span ends an utterance
        end: bool,
        /// The user is currently querying (suppresses barge-in synthesis)
        is_user_querying: bool,
        /// The text to synthesize
        content: String,
    },

    /// Conversational text query answered with synthesized speech
    #[serde(rename = "text_query")]
    TextQuery {
        /// The query text
        content: String,
    },
}

impl ControlMessage {
    /// Serialize to the single JSON text frame that goes on the wire.
    pub fn to_json(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame received from the wire.
    pub fn from_json(text: &str) -> ClientResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Flags for a `tts_text` frame. The defaults describe the common case of a
/// complete, self-contained utterance pushed while the user is not speaking.
#[derive(Debug, Clone, Copy)]
pub struct TtsTextOptions {
    pub start: bool,
    pub end: bool,
    pub is_user_querying: bool,
}

impl Default for TtsTextOptions {
    fn default() -> Self {
        Self {
            start: true,
            end: true,
            is_user_querying: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// The wire shapes are fixed by the remote service; assert them exactly.
    #[test]
    fn test_init_wire_shape() {
        let msg = ControlMessage::Init {
            speaker: "zh_female_vv_jupiter_bigtts".to_string(),
            mode: "audio".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "init",
                "speaker": "zh_female_vv_jupiter_bigtts",
                "mode": "audio"
            })
        );
    }

    #[test]
    fn test_tts_text_wire_shape() {
        let msg = ControlMessage::TtsText {
            start: true,
            end: false,
            is_user_querying: false,
            content: "你好".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tts_text",
                "start": true,
                "end": false,
                "is_user_querying": false,
                "content": "你好"
            })
        );
    }

    #[test]
    fn test_text_query_wire_shape() {
        let msg = ControlMessage::TextQuery {
            content: "hello".to_string(),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"text_query","content":"hello"}"#
        );
    }

    #[test]
    fn test_round_trip() {
        let msg = ControlMessage::TtsText {
            start: false,
            end: true,
            is_user_querying: true,
            content: "tail".to_string(),
        };
        let parsed = ControlMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ControlMessage::from_json(r#"{"type":"bogus","content":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_default_tts_options() {
        let opts = TtsTextOptions::default();
        assert!(opts.start);
        assert!(opts.end);
        assert!(!opts.is_user_querying);
    }
}
