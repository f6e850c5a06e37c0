// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

/// Hard cap on a serialized envelope. Oversize frames are dropped before
/// parsing.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// A single message on a broker channel.
///
/// The `type`/`payload` pair is an adjacently-tagged enum so dispatch is an
/// explicit match; unknown tags fail deserialization and are dropped by the
/// receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    /// Sender clock, epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    /// Wrap a payload with the current timestamp and no message id.
    pub fn new(payload: Payload) -> Self {
        Self { payload, timestamp: epoch_ms(), message_id: None }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON wire form, enforcing [`MAX_ENVELOPE_BYTES`].
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        if text.len() > MAX_ENVELOPE_BYTES {
            return Err(EnvelopeError::Oversize(text.len()));
        }
        serde_json::from_str(text).map_err(EnvelopeError::Malformed)
    }
}

/// Envelope parse failures, kept separate so callers can answer oversize
/// frames differently from malformed ones.
#[derive(Debug)]
pub enum EnvelopeError {
    Oversize(usize),
    Malformed(serde_json::Error),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversize(n) => write!(f, "envelope exceeds {MAX_ENVELOPE_BYTES} bytes ({n})"),
            Self::Malformed(e) => write!(f, "malformed envelope: {e}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Tagged payload union. Wire names match the `type` field exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    /// Viewer keystrokes bound for one session's PTY. `data` is base64.
    #[serde(rename = "terminal:input")]
    TerminalInput { session_id: i64, data: String },

    /// PTY output bound for every viewer of the owning user. `data` is base64.
    #[serde(rename = "terminal:output")]
    TerminalOutput { session_id: i64, data: String },

    /// Geometry change. `session_id = 0` means "main" on the agent side.
    #[serde(rename = "terminal:resize")]
    TerminalResize { session_id: i64, rows: u16, cols: u16 },

    /// Scrollback request (no `data`) and its reply (`data` set, base64).
    #[serde(rename = "terminal:history")]
    TerminalHistory {
        session_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },

    /// A PTY exited.
    #[serde(rename = "terminal:exit")]
    TerminalExit { session_id: i64, code: i32 },

    /// Broker instructs an agent to bind a PTY to a session.
    #[serde(rename = "session:create")]
    SessionCreate {
        session_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        is_default: bool,
    },

    /// Broker instructs an agent to tear a PTY down.
    #[serde(rename = "session:close")]
    SessionClose { session_id: i64 },

    #[serde(rename = "desktop:online")]
    DesktopOnline { desktop_id: i64 },

    #[serde(rename = "desktop:offline")]
    DesktopOffline { desktop_id: i64 },

    /// Liveness probe; answered with `pong`, never routed.
    #[serde(rename = "heartbeat")]
    Heartbeat {},

    #[serde(rename = "pong")]
    Pong {},

    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

impl Payload {
    /// Wire name of this payload's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TerminalInput { .. } => "terminal:input",
            Self::TerminalOutput { .. } => "terminal:output",
            Self::TerminalResize { .. } => "terminal:resize",
            Self::TerminalHistory { .. } => "terminal:history",
            Self::TerminalExit { .. } => "terminal:exit",
            Self::SessionCreate { .. } => "session:create",
            Self::SessionClose { .. } => "session:close",
            Self::DesktopOnline { .. } => "desktop:online",
            Self::DesktopOffline { .. } => "desktop:offline",
            Self::Heartbeat {} => "heartbeat",
            Self::Pong {} => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Envelopes that must survive outbound-queue overflow.
    ///
    /// `terminal:exit` and `session:create` take the drain-and-send slow
    /// path; everything else may be dropped under backpressure.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::TerminalExit { .. } | Self::SessionCreate { .. })
    }

    /// Session id carried by session-scoped payloads.
    pub fn session_id(&self) -> Option<i64> {
        match self {
            Self::TerminalInput { session_id, .. }
            | Self::TerminalOutput { session_id, .. }
            | Self::TerminalResize { session_id, .. }
            | Self::TerminalHistory { session_id, .. }
            | Self::TerminalExit { session_id, .. }
            | Self::SessionCreate { session_id, .. }
            | Self::SessionClose { session_id } => Some(*session_id),
            _ => None,
        }
    }
}

/// Current epoch milliseconds.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
