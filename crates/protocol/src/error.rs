// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::envelope::Payload;

/// Unified error codes shared by REST responses and `error` envelopes.
///
/// The numeric wire code appears in envelope payloads and REST bodies; the
/// string form is for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Internal,
    BadRequest,
    Unauthorized,
    PermissionDenied,
    SessionNotFound,
    SessionEnded,
    AgentOffline,
    PtyFailure,
    Oversize,
}

impl ErrorCode {
    pub fn wire_code(&self) -> u16 {
        match self {
            Self::Internal => 1000,
            Self::BadRequest => 1001,
            Self::Unauthorized => 1002,
            Self::PermissionDenied => 1003,
            Self::SessionNotFound => 1004,
            Self::SessionEnded => 1005,
            Self::AgentOffline => 1006,
            Self::PtyFailure => 1007,
            Self::Oversize => 1008,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Internal => 500,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::PermissionDenied => 403,
            Self::SessionNotFound => 404,
            Self::SessionEnded => 410,
            Self::AgentOffline => 409,
            Self::PtyFailure => 502,
            Self::Oversize => 413,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionEnded => "SESSION_ENDED",
            Self::AgentOffline => "AGENT_OFFLINE",
            Self::PtyFailure => "PTY_FAILURE",
            Self::Oversize => "OVERSIZE",
        }
    }

    /// Build an `error` envelope payload aimed at the originator.
    pub fn to_payload(self, message: impl Into<String>) -> Payload {
        Payload::Error { code: self.wire_code(), message: message.into() }
    }

    pub fn to_body(self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.wire_code(), message: message.into() }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// REST error body. Carries the same numeric codes used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
