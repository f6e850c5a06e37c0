// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn wire_codes_are_stable() {
    assert_eq!(ErrorCode::Internal.wire_code(), 1000);
    assert_eq!(ErrorCode::BadRequest.wire_code(), 1001);
    assert_eq!(ErrorCode::Unauthorized.wire_code(), 1002);
    assert_eq!(ErrorCode::PermissionDenied.wire_code(), 1003);
    assert_eq!(ErrorCode::SessionNotFound.wire_code(), 1004);
    assert_eq!(ErrorCode::SessionEnded.wire_code(), 1005);
    assert_eq!(ErrorCode::AgentOffline.wire_code(), 1006);
    assert_eq!(ErrorCode::PtyFailure.wire_code(), 1007);
    assert_eq!(ErrorCode::Oversize.wire_code(), 1008);
}

#[test]
fn http_mapping() {
    assert_eq!(ErrorCode::PermissionDenied.http_status(), 403);
    assert_eq!(ErrorCode::SessionEnded.http_status(), 410);
    assert_eq!(ErrorCode::AgentOffline.http_status(), 409);
    assert_eq!(ErrorCode::Oversize.http_status(), 413);
}

#[test]
fn error_payload_carries_numeric_code() {
    let payload = ErrorCode::PermissionDenied.to_payload("not your desktop");
    let Payload::Error { code, message } = payload else {
        panic!("wrong payload kind");
    };
    assert_eq!(code, 1003);
    assert_eq!(message, "not your desktop");
}

#[test]
fn body_serializes_flat() {
    let body = ErrorCode::SessionNotFound.to_body("no such session");
    let value = serde_json::to_value(&body).unwrap();
    assert_eq!(value["code"], 1004);
    assert_eq!(value["message"], "no such session");
}
