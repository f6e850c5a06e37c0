// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn static_verifier_resolves_identities() {
    let verifier = TokenVerifier::Static(
        StaticVerifier::default().with_viewer("vt", 10).with_agent("at", 10, 7),
    );

    let viewer = verifier.verify_viewer("vt").await.unwrap();
    assert_eq!(viewer.user_id, 10);

    let agent = verifier.verify_agent("at").await.unwrap();
    assert_eq!(agent.user_id, 10);
    assert_eq!(agent.desktop_id, 7);
    assert_eq!(agent.credential_fingerprint, fingerprint("at"));

    assert_eq!(verifier.verify_viewer("wrong").await.unwrap_err(), ErrorCode::Unauthorized);
    assert_eq!(verifier.verify_agent("vt").await.unwrap_err(), ErrorCode::Unauthorized);
    assert_eq!(verifier.verify_viewer("").await.unwrap_err(), ErrorCode::Unauthorized);
}

#[test]
fn fingerprint_is_stable_hex() {
    let fp = fingerprint("token");
    assert_eq!(fp.len(), 64);
    assert_eq!(fp, fingerprint("token"));
    assert_ne!(fp, fingerprint("token2"));
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn blacklist_expires_entries() {
    let blacklist = Blacklist::new();
    let now = epoch_ms();

    blacklist.insert("live", now + 60_000);
    blacklist.insert("dead", now - 1);

    assert!(blacklist.contains("live"));
    assert!(!blacklist.contains("dead"));
    assert!(!blacklist.contains("unknown"));
}

#[test]
fn static_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    std::fs::write(
        &path,
        r#"{
            "viewers": {"v-token": 3},
            "agents": {"a-token": {"user_id": 3, "desktop_id": 12}}
        }"#,
    )
    .unwrap();

    let verifier = StaticVerifier::from_file(&path).unwrap();
    assert_eq!(verifier.verify_viewer("v-token").unwrap().user_id, 3);
    let agent = verifier.verify_agent("a-token").unwrap();
    assert_eq!(agent.desktop_id, 12);
    // Fingerprint is derived when the file does not carry one.
    assert_eq!(agent.credential_fingerprint, fingerprint("a-token"));
}
