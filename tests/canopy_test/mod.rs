//! Shared fixture plumbing for the integration suite. Every test starts
//! from the same small site: one PSK network, one known client, and a
//! populated firewall, at the current config version.

use std::time::Duration;

use tempfile::TempDir;
use time::OffsetDateTime;

use libcanopy::{
    devices::DeviceDb,
    server::Appliance,
    store::Store,
    tree::{PropTree, MAIN_ROOT},
    wire::{ConfigOp, ConfigQuery, ConfigResponse},
    AccessLevel,
};

pub const FIXTURE_MAC: &str = "64:9a:be:da:b1:9a";

pub const FIXTURE_JSON: &str = r#"{
  "children": {
    "cfgversion": { "value": "13" },
    "uuid": { "value": "b5b1d1e2-92ab-4bf6-9c26-23071475efc0" },
    "site_index": { "value": "0" },
    "apversion": { "value": "0.9.2" },
    "network": {
      "children": {
        "base_address": { "value": "192.168.0.1/24" },
        "vap": {
          "children": {
            "psk": {
              "children": {
                "ssid": { "value": "setme" },
                "keymgmt": { "value": "wpa-psk" },
                "default_ring": { "value": "standard" },
                "rings": { "value": "standard,devices,guest" }
              }
            }
          }
        }
      }
    },
    "clients": {
      "children": {
        "64:9a:be:da:b1:9a": {
          "children": {
            "ring": { "value": "standard" },
            "dhcp_name": { "value": "deskjet" },
            "connection": {
              "children": {
                "vap": { "value": "psk" }
              }
            }
          }
        }
      }
    },
    "firewall": {
      "children": {
        "rules": {
          "children": {
            "default_deny": {
              "children": {
                "active": { "value": "true" },
                "rule": { "value": "BLOCK FROM IFACE wan TO AP" }
              }
            }
          }
        }
      }
    }
  }
}"#;

pub fn fixture_tree() -> PropTree {
    PropTree::from_json(MAIN_ROOT, FIXTURE_JSON).expect("fixture parses")
}

/// A live appliance loaded from the fixture, persisting into a temp dir.
pub fn fixture_appliance() -> (Appliance, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    fs_err::write(dir.path().join("ap_props.json"), FIXTURE_JSON).expect("write fixture");

    let appliance = Appliance::new(
        Store::new(dir.path()),
        DeviceDb::default(),
        Duration::from_millis(50),
    )
    .expect("appliance starts from fixture");

    (appliance, dir)
}

pub fn run_ops(
    appliance: &Appliance,
    level: AccessLevel,
    ops: Vec<ConfigOp>,
) -> ConfigResponse {
    appliance.execute(&ConfigQuery::new("test-driver", level, ops))
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
