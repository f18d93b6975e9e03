// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]

use mlld_core::ErrorCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────────

/// Frame-level protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line could not be parsed as a frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    /// A request named an unknown method.
    #[error("unknown request '{0}'")]
    UnknownRequest(String),
}

impl ProtocolError {
    /// The catalog code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFrame(_) => ErrorCode::InvalidFrame,
            Self::UnknownRequest(_) => ErrorCode::UnknownRequest,
        }
    }
}

// ── Request kinds ───────────────────────────────────────────────────────

/// The request methods the live runtime serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// Interpret a whole program.
    Process,
    /// Evaluate an expression; streams `state:write` events during the run.
    Execute,
    /// Parse and validate only.
    Analyze,
    /// Replace a named piece of embedder state.
    UpdateState,
    /// Cancel the in-flight run.
    Cancel,
    /// Shut the session down.
    Close,
}

impl RequestKind {
    /// Parse the wire spelling.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownRequest`] for unrecognized methods.
    pub fn parse(method: &str) -> Result<Self, ProtocolError> {
        match method {
            "process" => Ok(Self::Process),
            "execute" => Ok(Self::Execute),
            "analyze" => Ok(Self::Analyze),
            "update-state" => Ok(Self::UpdateState),
            "cancel" => Ok(Self::Cancel),
            "close" => Ok(Self::Close),
            other => Err(ProtocolError::UnknownRequest(other.to_string())),
        }
    }
}

// ── Frames ──────────────────────────────────────────────────────────────

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameError {
    /// Catalog code (`MLD-X###`).
    pub code: String,
    /// Rendered diagnostic.
    pub message: String,
}

/// One NDJSON frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// An embedder-initiated request.
    Request {
        /// Correlation id, echoed on the response.
        id: u64,
        /// Method name (`process`, `execute`, …).
        method: String,
        /// Method parameters.
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        params: serde_json::Value,
    },
    /// The runtime's answer to a request.
    Response {
        /// Correlation id of the request.
        id: u64,
        /// Result payload on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Error payload on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    /// A push notification.
    Event {
        /// Event name: `state:write`, `progress`, `stage`, `error`.
        event: String,
        /// Event payload.
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        payload: serde_json::Value,
    },
}

impl Frame {
    /// A successful response.
    #[must_use]
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn err(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(FrameError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    /// A `state:write` event carrying partial output.
    #[must_use]
    pub fn state_write(content: impl Into<String>) -> Self {
        Self::Event {
            event: "state:write".to_string(),
            payload: serde_json::json!({ "content": content.into() }),
        }
    }
}

// ── Codec ───────────────────────────────────────────────────────────────

/// Line-oriented frame codec.
#[derive(Debug, Clone, Copy)]
pub struct NdjsonCodec;

impl NdjsonCodec {
    /// Encode one frame as a newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Serialization failures propagate (they indicate a programming error).
    pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFrame`] on malformed input.
    pub fn decode(line: &str) -> Result<Frame, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Decode every non-blank line, one result per line.
    #[must_use]
    pub fn decode_batch(input: &str) -> Vec<Result<Frame, ProtocolError>> {
        input
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::decode)
            .collect()
    }

    /// Validate a batch, returning `(1-based line, error)` pairs.
    #[must_use]
    pub fn validate(input: &str) -> Vec<(usize, ProtocolError)> {
        input
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .filter_map(|(idx, l)| Self::decode(l).err().map(|e| (idx + 1, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames_round_trip() {
        let frame = Frame::Request {
            id: 7,
            method: "execute".into(),
            params: serde_json::json!({"nodes": []}),
        };
        let line = NdjsonCodec::encode(&frame).unwrap();
        assert!(line.ends_with('\n'));
        let back = NdjsonCodec::decode(&line).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn response_carries_result_xor_error() {
        let ok = Frame::ok(1, serde_json::json!({"output": "x"}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["type"], "response");
        assert!(json.get("error").is_none());

        let err = Frame::err(2, "MLD-L001", "denied");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["code"], "MLD-L001");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn all_request_methods_parse() {
        for method in ["process", "execute", "analyze", "update-state", "cancel", "close"] {
            RequestKind::parse(method).unwrap();
        }
        let err = RequestKind::parse("reboot").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownRequest);
    }

    #[test]
    fn batch_decode_reports_lines_one_based() {
        let input = "\n{\"type\":\"event\",\"event\":\"progress\"}\nnot-json\n";
        let results = NdjsonCodec::decode_batch(input);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());

        let errors = NdjsonCodec::validate(input);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 3);
    }

    #[test]
    fn state_write_event_shape() {
        let frame = Frame::state_write("partial");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "state:write");
        assert_eq!(json["payload"]["content"], "partial");
    }
}
