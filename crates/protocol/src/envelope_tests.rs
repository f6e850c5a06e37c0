// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use base64::Engine;

#[test]
fn input_round_trips() {
    let env = Envelope::new(Payload::TerminalInput {
        session_id: 11,
        data: base64::engine::general_purpose::STANDARD.encode(b"ls\n"),
    });
    let json = env.to_json().unwrap();
    let back = Envelope::from_json(&json).unwrap();
    assert_eq!(back.payload, env.payload);
    assert_eq!(back.timestamp, env.timestamp);
}

#[test]
fn wire_shape_matches_protocol() {
    let env = Envelope {
        payload: Payload::SessionCreate { session_id: 10, working_dir: None, is_default: true },
        timestamp: 1_700_000_000_000,
        message_id: None,
    };
    let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
    assert_eq!(value["type"], "session:create");
    assert_eq!(value["payload"]["session_id"], 10);
    assert_eq!(value["payload"]["is_default"], true);
    assert_eq!(value["timestamp"], 1_700_000_000_000i64);
    // Absent optional fields stay off the wire.
    assert!(value["payload"].get("working_dir").is_none());
    assert!(value.get("message_id").is_none());
}

#[test]
fn parses_external_producer_form() {
    let json = r#"{
        "type": "terminal:resize",
        "payload": {"session_id": 0, "rows": 50, "cols": 200},
        "timestamp": 1700000000000,
        "message_id": "m-1"
    }"#;
    let env = Envelope::from_json(json).unwrap();
    assert_eq!(
        env.payload,
        Payload::TerminalResize { session_id: 0, rows: 50, cols: 200 }
    );
    assert_eq!(env.message_id.as_deref(), Some("m-1"));
}

#[test]
fn history_request_has_no_data() {
    let env = Envelope::new(Payload::TerminalHistory { session_id: 11, data: None });
    let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
    assert!(value["payload"].get("data").is_none());

    let reply = r#"{"type":"terminal:history","payload":{"session_id":11,"data":"aGk="},"timestamp":0}"#;
    let env = Envelope::from_json(reply).unwrap();
    assert_eq!(
        env.payload,
        Payload::TerminalHistory { session_id: 11, data: Some("aGk=".to_owned()) }
    );
}

#[test]
fn unknown_type_is_rejected() {
    let json = r#"{"type":"terminal:paste","payload":{},"timestamp":0}"#;
    assert!(matches!(Envelope::from_json(json), Err(EnvelopeError::Malformed(_))));
}

#[test]
fn oversize_is_rejected_before_parse() {
    let huge = format!(
        r#"{{"type":"terminal:input","payload":{{"session_id":1,"data":"{}"}},"timestamp":0}}"#,
        "A".repeat(MAX_ENVELOPE_BYTES)
    );
    assert!(matches!(Envelope::from_json(&huge), Err(EnvelopeError::Oversize(_))));
}

#[test]
fn critical_classification() {
    assert!(Payload::TerminalExit { session_id: 1, code: 0 }.is_critical());
    assert!(Payload::SessionCreate { session_id: 1, working_dir: None, is_default: false }
        .is_critical());
    assert!(!Payload::TerminalOutput { session_id: 1, data: String::new() }.is_critical());
    assert!(!Payload::Heartbeat {}.is_critical());
}

#[test]
fn base64_payload_round_trip() {
    let raw: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);
    let env = Envelope::new(Payload::TerminalOutput { session_id: 7, data: encoded });
    let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
    let Payload::TerminalOutput { data, .. } = back.payload else {
        panic!("wrong payload kind");
    };
    let decoded = base64::engine::general_purpose::STANDARD.decode(&data).unwrap();
    assert_eq!(decoded, raw);
}

#[test]
fn session_id_extraction() {
    assert_eq!(Payload::SessionClose { session_id: 4 }.session_id(), Some(4));
    assert_eq!(Payload::DesktopOnline { desktop_id: 4 }.session_id(), None);
    assert_eq!(Payload::Pong {}.session_id(), None);
}
