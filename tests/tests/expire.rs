//! Expiration-driver behavior beyond the basic roundtrip: the ring
//! expire hook resets instead of removing.

use std::time::Duration;

use libcanopy::{
    events::EventKind,
    wire::{ConfigOp, OpType, ResponseCode},
    AccessLevel,
};

use crate::canopy_test::{fixture_appliance, now, run_ops, FIXTURE_MAC};

#[test]
fn expired_ring_assignment_resets_to_vap_default() {
    let (appliance, _dir) = fixture_appliance();

    // Move the client to the devices ring for a short while. The fixture
    // client connects through the psk VAP, whose default ring is
    // standard.
    let expires = now() + time::Duration::milliseconds(100);
    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Set, &format!("@/clients/{FIXTURE_MAC}/ring"))
            .with_value("devices")
            .with_expires(Some(expires))],
    );
    assert_eq!(response.code, ResponseCode::Ok);

    let sub = appliance.subscribe();

    // Wait for the reset to land as a CHANGE back to the default.
    let ring_path = format!("@/clients/{FIXTURE_MAC}/ring");
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    let mut reset_seen = false;
    while std::time::Instant::now() < deadline && !reset_seen {
        for event in sub.recv_timeout(Duration::from_millis(200)) {
            if event.kind == EventKind::Change
                && event.property == ring_path
                && event.value.as_deref() == Some("standard")
            {
                reset_seen = true;
            }
        }
    }
    assert!(reset_seen, "expected the ring to reset to 'standard'");

    let tree = appliance.tree();
    let path = tree.parse(&ring_path).unwrap();
    assert_eq!(tree.get_prop(&path, now()).unwrap(), "standard");
    let id = tree.lookup(&path).unwrap();
    assert!(tree.node(id).expires().is_none());
    assert_eq!(tree.heap_count(id), 0);
    assert!(tree.validate());
}

#[test]
fn unexpired_properties_survive() {
    let (appliance, _dir) = fixture_appliance();

    let expires = now() + time::Duration::hours(1);
    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Create, "@/tmp/longlived")
            .with_value("v")
            .with_expires(Some(expires))],
    );
    assert_eq!(response.code, ResponseCode::Ok);

    std::thread::sleep(Duration::from_millis(700));

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Get, "@/tmp/longlived")],
    );
    assert_eq!(response.code, ResponseCode::Ok);
}
