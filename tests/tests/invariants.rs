//! Structural and round-trip properties of the fixture tree.

use libcanopy::tree::{leaf_hash, PropTree, MAIN_ROOT};

use crate::canopy_test::{fixture_tree, now};

#[test]
fn fixture_validates_and_leaf_hashes_match_formula() {
    let tree = fixture_tree();
    assert!(tree.validate());

    for path in tree.leaf_paths() {
        let parsed = tree.parse(&path).unwrap();
        let id = tree.lookup(&parsed).unwrap();
        let node = tree.node(id);
        assert_eq!(
            node.hash(),
            leaf_hash(node.path(), node.value()),
            "leaf hash formula violated at {path}"
        );
    }
}

#[test]
fn internal_hash_is_xor_of_children() {
    let tree = fixture_tree();
    let network = tree.lookup(&tree.parse("@/network").unwrap()).unwrap();

    let mut expected = [0u8; 16];
    for child in tree.node(network).child_ids() {
        for (slot, byte) in expected.iter_mut().zip(tree.node(child).hash().iter()) {
            *slot ^= byte;
        }
    }
    assert_eq!(tree.node(network).hash(), expected);
}

#[test]
fn marshal_then_replace_preserves_hashes_and_leaves() {
    let tree = fixture_tree();
    let json = tree.to_json_pretty().unwrap();
    let rebuilt = PropTree::from_json(MAIN_ROOT, &json).unwrap();

    assert_eq!(rebuilt.root_hash(), tree.root_hash());
    assert_eq!(rebuilt.leaf_paths(), tree.leaf_paths());
    assert!(rebuilt.validate());
}

#[test]
fn add_get_roundtrip_and_idempotence() {
    let mut tree = fixture_tree();

    tree.changeset_init();
    let path = tree.parse("@/tmp/scratch").unwrap();
    tree.add(&path, "v", None).unwrap();
    tree.changeset_commit(now());
    assert_eq!(tree.get_prop(&path, now()).unwrap(), "v");
    let hash_once = tree.root_hash();

    tree.changeset_init();
    tree.add(&path, "v", None).unwrap();
    tree.changeset_commit(now());
    assert_eq!(tree.root_hash(), hash_once);
    assert!(tree.validate());
}

#[test]
fn delete_then_readd_restores_leaf_hash() {
    let mut tree = fixture_tree();
    let path = tree.parse("@/network/vap/psk/ssid").unwrap();
    let original_hash = tree.node(tree.lookup(&path).unwrap()).hash();

    tree.changeset_init();
    tree.delete(&path).unwrap();
    tree.changeset_commit(now());
    assert!(tree.lookup(&path).is_none());

    tree.changeset_init();
    tree.add(&path, "setme", None).unwrap();
    tree.changeset_commit(now());

    assert_eq!(tree.node(tree.lookup(&path).unwrap()).hash(), original_hash);
    assert!(tree.validate());
}

#[test]
fn every_expiring_leaf_sits_in_the_heap_exactly_once() {
    let mut tree = fixture_tree();

    tree.changeset_init();
    for i in 0..8 {
        let path = tree.parse(&format!("@/tmp/e{i}")).unwrap();
        let expires = now() + time::Duration::minutes(i + 1);
        tree.add(&path, "v", Some(expires)).unwrap();
    }
    tree.changeset_commit(now());

    let mut with_ttl = 0;
    for path in tree.leaf_paths() {
        let parsed = tree.parse(&path).unwrap();
        let id = tree.lookup(&parsed).unwrap();
        if tree.node(id).expires().is_some() {
            with_ttl += 1;
            assert_eq!(tree.heap_count(id), 1, "{path} should be heaped once");
        } else {
            assert_eq!(tree.heap_count(id), 0, "{path} should not be heaped");
        }
    }
    assert_eq!(with_ttl, 8);
    assert_eq!(tree.heap_len(), 8);
}
