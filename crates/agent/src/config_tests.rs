// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use super::*;

fn parse(args: &[&str]) -> AgentConfig {
    let mut argv = vec!["tether"];
    argv.extend_from_slice(args);
    AgentConfig::parse_from(argv)
}

#[test]
fn requires_a_credential() {
    assert!(parse(&[]).validate().is_err());
    assert!(parse(&["--token", "t"]).validate().is_ok());
    assert!(parse(&["--credentials-path", "/tmp/cred"]).validate().is_ok());
}

#[test]
fn reconnect_bounds_are_validated() {
    let config = parse(&["--token", "t", "--reconnect-initial-secs", "40"]);
    assert!(config.validate().is_err());

    let config = parse(&["--token", "t"]);
    assert_eq!(config.reconnect_initial_secs, 3);
    assert_eq!(config.reconnect_max_secs, 30);
    assert!(config.validate().is_ok());
}

#[test]
fn token_file_is_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cred");
    std::fs::write(&path, "  secret-token\n").unwrap();

    let config = parse(&["--credentials-path", path.to_str().unwrap()]);
    assert_eq!(config.resolve_token().unwrap(), "secret-token");

    std::fs::write(&path, "\n").unwrap();
    assert!(config.resolve_token().is_err());
}

#[test]
fn flag_token_wins_over_file() {
    let config = parse(&["--token", "flag-token", "--credentials-path", "/nonexistent"]);
    assert_eq!(config.resolve_token().unwrap(), "flag-token");
}

#[test]
fn ws_url_converts_scheme_and_carries_identity() {
    let config = parse(&["--token", "t", "--server-url", "https://broker.example.com/"]);
    let url = config.ws_url("tok", "m-1", "i-1", "box", "linux");
    assert_eq!(
        url,
        "wss://broker.example.com/ws/desktop?token=tok&machine_id=m-1&instance=i-1&host=box&os=linux"
    );

    let config = parse(&["--token", "t", "--server-url", "http://127.0.0.1:8080"]);
    assert!(config.ws_url("tok", "m", "i", "h", "o").starts_with("ws://127.0.0.1:8080/ws/desktop?"));
}
