//! Tree persistence: the whole tree as one JSON file with a single backup
//! generation. Startup falls back primary → backup → defaults; a fresh
//! defaults load mints the appliance identity.

use std::path::{Path, PathBuf};

use anyhow::Context;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::tree::{PropTree, MAIN_ROOT};

pub const PROPS_FILE: &str = "ap_props.json";
pub const BACKUP_FILE: &str = "ap_props.json.bak";
pub const DEFAULTS_FILE: &str = "ap_defaults.json";

/// Factory defaults used when no defaults file is present on disk. Kept at
/// the current config version so a fresh tree needs no upgrades.
const BUILTIN_DEFAULTS: &str = r#"{
  "children": {
    "cfgversion": { "value": "13" },
    "uuid": { "value": "00000000-0000-0000-0000-000000000000" },
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
                "rings": { "value": "standard,devices,guest,quarantine" }
              }
            },
            "eap": {
              "children": {
                "ssid": { "value": "setme-eap" },
                "keymgmt": { "value": "wpa-eap" },
                "default_ring": { "value": "standard" },
                "rings": { "value": "standard,core" }
              }
            },
            "guest": {
              "children": {
                "ssid": { "value": "setme-guest" },
                "keymgmt": { "value": "wpa-psk" },
                "default_ring": { "value": "guest" },
                "rings": { "value": "guest" }
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

/// On-disk home of the appliance tree.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new<P: AsRef<Path>>(dir: P) -> Store {
        Store {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn props_path(&self) -> PathBuf {
        self.dir.join(PROPS_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }

    pub fn defaults_path(&self) -> PathBuf {
        self.dir.join(DEFAULTS_FILE)
    }

    /// Loads the tree: primary file, then backup, then defaults. A
    /// defaults load generates the appliance UUID and site index.
    pub fn load(&self) -> anyhow::Result<PropTree> {
        for path in [self.props_path(), self.backup_path()] {
            if !path.exists() {
                continue;
            }
            match Self::read_tree(&path) {
                Ok(tree) => {
                    log::info!("loaded property tree from {}", path.display());
                    return Ok(tree);
                }
                Err(err) => {
                    log::warn!("failed to load {}: {err:#}", path.display());
                }
            }
        }
        self.load_defaults()
    }

    fn read_tree(path: &Path) -> anyhow::Result<PropTree> {
        let raw = fs_err::read_to_string(path)?;
        let tree = PropTree::from_json(MAIN_ROOT, &raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        if !tree.validate() {
            // Hashes are recomputed on load, so this only fires on
            // structural corruption.
            anyhow::bail!("tree failed validation after load");
        }
        Ok(tree)
    }

    fn load_defaults(&self) -> anyhow::Result<PropTree> {
        let defaults_path = self.defaults_path();
        let raw = if defaults_path.exists() {
            log::info!("loading defaults from {}", defaults_path.display());
            fs_err::read_to_string(&defaults_path)?
        } else {
            log::info!("no defaults file; using built-in defaults");
            BUILTIN_DEFAULTS.to_owned()
        };

        let mut tree = PropTree::from_json(MAIN_ROOT, &raw).context("parsing defaults")?;

        // A fresh site gets its identity minted here.
        let uuid = Uuid::new_v4();
        log::info!("initializing new site with uuid {uuid}");
        tree.changeset_init();
        let uuid_path = tree.parse("@/uuid")?;
        tree.add(&uuid_path, &uuid.to_string(), None)?;
        let site_path = tree.parse("@/site_index")?;
        if tree.lookup(&site_path).is_none() {
            tree.add(&site_path, "0", None)?;
        }
        tree.changeset_commit(OffsetDateTime::now_utc());

        Ok(tree)
    }

    /// Writes the tree, rotating the previous file to the single backup
    /// generation first.
    pub fn save(&self, tree: &PropTree) -> anyhow::Result<()> {
        self.save_json(&tree.to_json_pretty()?)
    }

    pub fn save_json(&self, json: &str) -> anyhow::Result<()> {
        fs_err::create_dir_all(&self.dir)?;
        let props = self.props_path();
        if props.exists() {
            fs_err::rename(&props, self.backup_path())?;
        }
        fs_err::write(&props, json)?;
        log::debug!("persisted property tree to {}", props.display());
        Ok(())
    }
}
