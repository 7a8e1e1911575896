//! End-to-end scenarios through the appliance server, fixture-based.

use std::time::Duration;

use libcanopy::{
    events::EventKind,
    wire::{ConfigOp, ConfigQuery, OpType, ResponseCode},
    AccessLevel,
};
use pretty_assertions::assert_eq;

use crate::canopy_test::{fixture_appliance, now, run_ops, FIXTURE_MAC};

#[test]
fn change_ssid_publishes_change_event() {
    let (appliance, _dir) = fixture_appliance();
    let sub = appliance.subscribe();

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("newssid")],
    );
    assert_eq!(response.code, ResponseCode::Ok);
    assert!(appliance.tree().validate());

    let events = sub.recv_timeout(Duration::from_secs(1));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Change);
    assert_eq!(events[0].property, "@/network/vap/psk/ssid");
    assert_eq!(events[0].value.as_deref(), Some("newssid"));

    let tree = appliance.tree();
    let path = tree.parse("@/network/vap/psk/ssid").unwrap();
    assert_eq!(tree.get_prop(&path, now()).unwrap(), "newssid");
}

#[test]
fn overlong_ssid_is_rejected_and_tree_unchanged() {
    let (appliance, _dir) = fixture_appliance();
    let hash_before = appliance.root_hash_hex();

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid")
            .with_value("abcdefghijklmnopqrstuvwxyzabcdefghijkl")],
    );
    assert_eq!(response.code, ResponseCode::Failed);
    assert_eq!(appliance.root_hash_hex(), hash_before);
}

#[test]
fn illegal_dns_name_is_rejected() {
    let (appliance, _dir) = fixture_appliance();
    let hash_before = appliance.root_hash_hex();

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![
            ConfigOp::new(OpType::Create, &format!("@/clients/{FIXTURE_MAC}/dns_name"))
                .with_value("middle.dot"),
        ],
    );
    assert_eq!(response.code, ResponseCode::Failed);
    assert_eq!(appliance.root_hash_hex(), hash_before);
}

#[test]
fn deleting_a_subtree_emits_one_delete_per_leaf() {
    let (appliance, _dir) = fixture_appliance();

    let network_leaves: Vec<String> = {
        let tree = appliance.tree();
        tree.leaf_paths()
            .into_iter()
            .filter(|p| p.starts_with("@/network/"))
            .collect()
    };
    assert!(!network_leaves.is_empty());

    let sub = appliance.subscribe();
    let response = run_ops(
        &appliance,
        AccessLevel::Internal,
        vec![ConfigOp::new(OpType::Delete, "@/network")],
    );
    assert_eq!(response.code, ResponseCode::Ok);

    let tree = appliance.tree();
    assert!(tree.validate());
    assert!(tree
        .leaf_paths()
        .iter()
        .all(|p| !p.starts_with("@/network/")));
    drop(tree);

    let events = sub.recv_timeout(Duration::from_secs(1));
    let mut deleted: Vec<String> = events
        .iter()
        .filter(|e| e.kind == EventKind::Delete)
        .map(|e| e.property.clone())
        .collect();
    deleted.sort();
    let mut expected = network_leaves;
    expected.sort();
    assert_eq!(deleted, expected);
}

#[test]
fn expired_property_fires_once_and_disappears() {
    let (appliance, _dir) = fixture_appliance();
    let sub = appliance.subscribe();

    let expires = now() + time::Duration::milliseconds(100);
    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Create, "@/tmp/x")
            .with_value("v")
            .with_expires(Some(expires))],
    );
    assert_eq!(response.code, ResponseCode::Ok);

    // The CHANGE for the create comes first.
    let events = sub.recv_timeout(Duration::from_secs(1));
    assert!(events.iter().any(|e| e.kind == EventKind::Change));

    // Then exactly one EXPIRE for the path.
    let mut expire_events = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < deadline && expire_events.is_empty() {
        expire_events.extend(
            sub.recv_timeout(Duration::from_millis(200))
                .into_iter()
                .filter(|e| e.kind == EventKind::Expire),
        );
    }
    assert_eq!(expire_events.len(), 1);
    assert_eq!(expire_events[0].property, "@/tmp/x");

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Get, "@/tmp/x")],
    );
    assert_eq!(response.code, ResponseCode::NoProp);
    assert!(appliance.tree().validate());
}

#[test]
fn test_plus_create_compound() {
    let (appliance, _dir) = fixture_appliance();
    let ops = || {
        vec![
            ConfigOp::new(OpType::Test, &format!("@/clients/{FIXTURE_MAC}/dhcp_name")),
            ConfigOp::new(OpType::Create, &format!("@/clients/{FIXTURE_MAC}/dhcp_name"))
                .with_value("test1"),
        ]
    };

    let response = run_ops(&appliance, AccessLevel::Service, ops());
    assert_eq!(response.code, ResponseCode::Ok);
    {
        let tree = appliance.tree();
        let path = tree
            .parse(&format!("@/clients/{FIXTURE_MAC}/dhcp_name"))
            .unwrap();
        assert_eq!(tree.get_prop(&path, now()).unwrap(), "test1");
    }

    // Same batch against a fixture without the client: fails whole.
    let (appliance, _dir) = fixture_appliance();
    let wipe = run_ops(
        &appliance,
        AccessLevel::Internal,
        vec![ConfigOp::new(OpType::Delete, "@/clients")],
    );
    assert_eq!(wipe.code, ResponseCode::Ok);
    let hash_before = appliance.root_hash_hex();

    let response = run_ops(&appliance, AccessLevel::Service, ops());
    assert_eq!(response.code, ResponseCode::NoProp);
    assert_eq!(appliance.root_hash_hex(), hash_before);
}

#[test]
fn writes_below_the_required_level_fail() {
    let (appliance, _dir) = fixture_appliance();

    let response = run_ops(
        &appliance,
        AccessLevel::User,
        vec![ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("nope")],
    );
    assert_eq!(response.code, ResponseCode::Failed);
}

#[test]
fn subtree_delete_requires_every_descendants_level() {
    let (appliance, _dir) = fixture_appliance();
    let hash_before = appliance.root_hash_hex();

    // @/network holds service-level leaves; admin cannot delete it.
    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![ConfigOp::new(OpType::Delete, "@/network")],
    );
    assert_eq!(response.code, ResponseCode::Failed);
    assert_eq!(appliance.root_hash_hex(), hash_before);
}

#[test]
fn failing_batch_leaves_no_trace() {
    let (appliance, _dir) = fixture_appliance();
    let hash_before = appliance.root_hash_hex();

    // The fixture uuid is already real, so rewriting it is illegal.
    let response = run_ops(
        &appliance,
        AccessLevel::Internal,
        vec![
            ConfigOp::new(OpType::Create, "@/tmp/a").with_value("1"),
            ConfigOp::new(OpType::Create, "@/tmp/b").with_value("2"),
            ConfigOp::new(OpType::Set, "@/uuid")
                .with_value("11111111-2222-3333-4444-555555555555"),
        ],
    );
    assert_eq!(response.code, ResponseCode::Failed);

    let tree = appliance.tree();
    assert_eq!(appliance.root_hash_hex(), hash_before);
    assert!(tree.lookup(&tree.parse("@/tmp/a").unwrap()).is_none());
    assert!(tree.lookup(&tree.parse("@/tmp/b").unwrap()).is_none());
}

#[test]
fn testeq_gates_on_current_value() {
    let (appliance, _dir) = fixture_appliance();

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![
            ConfigOp::new(OpType::TestEq, "@/network/vap/psk/ssid").with_value("setme"),
            ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("flipped"),
        ],
    );
    assert_eq!(response.code, ResponseCode::Ok);

    let response = run_ops(
        &appliance,
        AccessLevel::Admin,
        vec![
            ConfigOp::new(OpType::TestEq, "@/network/vap/psk/ssid").with_value("setme"),
            ConfigOp::new(OpType::Set, "@/network/vap/psk/ssid").with_value("flipped-again"),
        ],
    );
    assert_eq!(response.code, ResponseCode::NotEqual);
}

#[test]
fn get_returns_marshaled_subtree() {
    let (appliance, _dir) = fixture_appliance();

    let query = ConfigQuery::get("test-driver", AccessLevel::Admin, "@/network/vap/psk");
    let response = appliance.execute(&query);
    assert_eq!(response.code, ResponseCode::Ok);

    let value = response.value.expect("GET carries a payload");
    let parsed: libcanopy::PropExport = serde_json::from_str(&value).unwrap();
    assert_eq!(parsed.children["ssid"].value, "setme");
}
