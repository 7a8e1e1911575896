//! The read-only `@/devices` subtree: identification records for known
//! device models, pre-loaded from the device database at startup and
//! served without ever touching the property tree.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    dispatch::{DispatchError, SubtreeOps},
    path::PropPath,
    tree::{PropExport, PropTree},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub vendor: String,
    pub model: String,
    pub kind: String,
}

/// In-memory projection of the device database, keyed by MAC address.
#[derive(Debug, Clone, Default)]
pub struct DeviceDb {
    records: HashMap<String, DeviceRecord>,
}

impl DeviceDb {
    pub fn new(records: HashMap<String, DeviceRecord>) -> DeviceDb {
        DeviceDb { records }
    }

    pub fn load(path: &Path) -> anyhow::Result<DeviceDb> {
        let raw = fs_err::read_to_string(path)?;
        let records: HashMap<String, DeviceRecord> = serde_json::from_str(&raw)?;
        log::info!("loaded {} device records from {}", records.len(), path.display());
        Ok(DeviceDb { records })
    }

    pub fn get(&self, mac: &str) -> Option<&DeviceRecord> {
        self.records.get(mac)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Subtree ops serving `@/devices` from the loaded database. Reads marshal
/// the records in the same nested form as tree properties; writes and
/// deletes are unsupported.
pub struct DeviceOps {
    export: PropExport,
}

impl DeviceOps {
    pub fn new(db: &DeviceDb) -> DeviceOps {
        let mut children = BTreeMap::new();
        for (mac, record) in &db.records {
            let mut fields = BTreeMap::new();
            fields.insert("vendor".to_owned(), PropExport::leaf(&record.vendor));
            fields.insert("model".to_owned(), PropExport::leaf(&record.model));
            fields.insert("kind".to_owned(), PropExport::leaf(&record.kind));
            children.insert(
                mac.clone(),
                PropExport {
                    children: fields,
                    ..Default::default()
                },
            );
        }
        DeviceOps {
            export: PropExport {
                children,
                ..Default::default()
            },
        }
    }
}

impl SubtreeOps for DeviceOps {
    fn get(
        &self,
        _tree: &mut PropTree,
        path: &PropPath,
        _now: OffsetDateTime,
    ) -> Result<String, DispatchError> {
        // segments[0] is "devices" itself.
        let mut node = &self.export;
        for segment in &path.segments()[1..] {
            node = node.children.get(segment).ok_or_else(|| {
                DispatchError::Tree(crate::tree::TreeError::NoProp(
                    path.to_string_under(crate::tree::MAIN_ROOT),
                ))
            })?;
        }
        serde_json::to_string(node)
            .map_err(|e| DispatchError::Hook(format!("device marshal failed: {e}")))
    }

    fn set(
        &self,
        _tree: &mut PropTree,
        path: &PropPath,
        _value: &str,
        _expires: Option<OffsetDateTime>,
        _create: bool,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::Unsupported(
            path.to_string_under(crate::tree::MAIN_ROOT),
        ))
    }

    fn delete(&self, _tree: &mut PropTree, path: &PropPath) -> Result<Vec<String>, DispatchError> {
        Err(DispatchError::Unsupported(
            path.to_string_under(crate::tree::MAIN_ROOT),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MAIN_ROOT;

    fn sample_db() -> DeviceDb {
        let mut records = HashMap::new();
        records.insert(
            "00:40:54:00:00:01".to_owned(),
            DeviceRecord {
                vendor: "Example Corp".to_owned(),
                model: "Widget 2".to_owned(),
                kind: "printer".to_owned(),
            },
        );
        DeviceDb::new(records)
    }

    #[test]
    fn serves_records_read_only() {
        let ops = DeviceOps::new(&sample_db());
        let mut tree = PropTree::new(MAIN_ROOT);
        let now = OffsetDateTime::now_utc();

        let path = tree.parse("@/devices/00:40:54:00:00:01/vendor").unwrap();
        let got = ops.get(&mut tree, &path, now).unwrap();
        assert_eq!(got, r#"{"value":"Example Corp"}"#);

        let missing = tree.parse("@/devices/ff:ff:ff:ff:ff:ff").unwrap();
        assert!(ops.get(&mut tree, &missing, now).is_err());

        let path = tree.parse("@/devices/00:40:54:00:00:01/kind").unwrap();
        assert!(matches!(
            ops.set(&mut tree, &path, "camera", None, false),
            Err(DispatchError::Unsupported(_))
        ));
        assert!(matches!(
            ops.delete(&mut tree, &path),
            Err(DispatchError::Unsupported(_))
        ));
    }
}
