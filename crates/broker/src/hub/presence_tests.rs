// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn online_offline_transitions() {
    let presence = PresenceMap::new();
    assert!(!presence.is_online(1));

    presence.set_online(1, "aaaa");
    assert!(presence.is_online(1));
    assert_eq!(presence.get(1).unwrap().instance_id, "aaaa");

    presence.set_offline(1);
    assert!(!presence.is_online(1));
    // The entry survives offline so the last instance id stays known.
    assert_eq!(presence.get(1).unwrap().instance_id, "aaaa");
}

#[test]
fn restart_replaces_instance_id() {
    let presence = PresenceMap::new();
    presence.set_online(1, "first");
    presence.set_offline(1);
    presence.set_online(1, "second");

    let entry = presence.get(1).unwrap();
    assert_eq!(entry.state, PresenceState::Online);
    assert_eq!(entry.instance_id, "second");
}

#[test]
fn heartbeat_refreshes_only_known_agents() {
    let presence = PresenceMap::new();
    presence.heartbeat(7); // unknown: no panic, no entry
    assert!(presence.get(7).is_none());

    presence.set_online(7, "x");
    let before = presence.get(7).unwrap().last_heartbeat;
    std::thread::sleep(std::time::Duration::from_millis(5));
    presence.heartbeat(7);
    assert!(presence.get(7).unwrap().last_heartbeat > before);
}
