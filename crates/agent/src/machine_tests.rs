// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn first_run_creates_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("tether");

    let id = load_or_create(&state).unwrap();
    assert!(uuid::Uuid::parse_str(&id).is_ok());

    // Subsequent runs read the same id back.
    let again = load_or_create(&state).unwrap();
    assert_eq!(id, again);
}

#[test]
fn blank_file_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("machine-id"), "  \n").unwrap();

    let id = load_or_create(dir.path()).unwrap();
    assert!(uuid::Uuid::parse_str(&id).is_ok());
}

#[test]
fn explicit_state_dir_wins() {
    let dir = state_dir(Some(Path::new("/custom/state")));
    assert_eq!(dir, PathBuf::from("/custom/state"));
}

#[test]
fn instance_ids_are_unique_hex() {
    let a = new_instance_id();
    let b = new_instance_id();
    assert_eq!(a.len(), 32);
    assert_ne!(a, b);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}
