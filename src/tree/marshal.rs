//! Tree marshaling. The persisted form and the wire form are the same
//! nested JSON structure; parent back pointers are rebuilt on load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::path::PropPath;

use super::{
    node::{NodeId, PropNode},
    tree::{PropTree, TreeError},
};

/// The serialized shape of one node and its subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropExport {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub modified: Option<OffsetDateTime>,

    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, PropExport>,
}

impl PropExport {
    pub fn leaf(value: &str) -> PropExport {
        PropExport {
            value: value.to_owned(),
            ..Default::default()
        }
    }
}

impl PropTree {
    pub fn export_subtree(&self, id: NodeId) -> PropExport {
        let node = self.node(id);
        let mut children = BTreeMap::new();
        for (name, child) in &node.children {
            children.insert(name.clone(), self.export_subtree(*child));
        }
        PropExport {
            value: node.value.clone(),
            modified: node.modified,
            expires: node.expires,
            children,
        }
    }

    pub fn export(&self) -> PropExport {
        self.export_subtree(self.root_id())
    }

    pub fn to_json_pretty(&self) -> Result<String, TreeError> {
        serde_json::to_string_pretty(&self.export())
            .map_err(|e| TreeError::Invalid(format!("marshal failed: {e}")))
    }

    /// Re-creates a subtree under `base` inside the current changeset.
    /// Used by `move_to` and by upgrade hooks.
    pub fn graft(&mut self, base: &PropPath, export: &PropExport) -> Result<(), TreeError> {
        if export.children.is_empty() {
            self.add(base, &export.value, export.expires)
        } else {
            for (name, child) in &export.children {
                self.graft(&base.child(name), child)?;
            }
            Ok(())
        }
    }

    /// Builds a whole tree from its serialized form, restoring parent back
    /// pointers, recomputing all hashes, and rebuilding the expiration
    /// heap. Runs outside any changeset.
    pub fn from_export(root_path: &str, export: &PropExport) -> Result<PropTree, TreeError> {
        if !export.value.is_empty() {
            return Err(TreeError::Invalid(
                "tree root cannot carry a value".to_owned(),
            ));
        }

        let mut tree = PropTree::new(root_path);
        let root = tree.root_id();
        tree.load_children(root, export)?;
        tree.rehash_all();
        tree.heap_rebuild();
        Ok(tree)
    }

    pub fn from_json(root_path: &str, json: &str) -> Result<PropTree, TreeError> {
        let export: PropExport = serde_json::from_str(json)
            .map_err(|e| TreeError::Invalid(format!("unmarshal failed: {e}")))?;
        PropTree::from_export(root_path, &export)
    }

    /// Swaps this tree's contents for the given export. Used by the cloud
    /// mirror's full-tree refresh.
    pub fn replace_from_export(&mut self, export: &PropExport) -> Result<(), TreeError> {
        assert!(
            !self.in_changeset(),
            "cannot replace a tree mid-changeset"
        );
        let mut replacement = PropTree::from_export(self.root_path(), export)?;
        replacement.set_cacheable(self.is_cacheable());
        *self = replacement;
        Ok(())
    }

    fn load_children(&mut self, parent: NodeId, export: &PropExport) -> Result<(), TreeError> {
        for (name, child) in &export.children {
            if !child.value.is_empty() && !child.children.is_empty() {
                return Err(TreeError::Invalid(format!(
                    "node '{name}' carries both a value and children"
                )));
            }

            let path = format!("{}/{}", self.node(parent).path(), name);
            let mut node = PropNode::new(name.clone(), path, Some(parent));
            node.value = child.value.clone();
            node.modified = child.modified;
            node.expires = child.expires;

            let id = self.alloc_raw(node);
            self.node_mut(parent).children.insert(name.clone(), id);
            self.load_children(id, child)?;
        }
        Ok(())
    }
}
