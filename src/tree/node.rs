use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use md5::{Digest, Md5};
use time::OffsetDateTime;

/// 16-byte Merkle fingerprint. Leaves hash `path + ":" + value`; internal
/// nodes XOR their children's hashes.
pub type NodeHash = [u8; 16];

pub fn leaf_hash(path: &str, value: &str) -> NodeHash {
    let mut hasher = Md5::new();
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

pub fn hash_hex(hash: &NodeHash) -> String {
    let mut out = String::with_capacity(32);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn hash_from_hex(source: &str) -> Option<NodeHash> {
    if source.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&source[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Arena handle for a node in a [`PropTree`](super::PropTree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u64);

/// One node of the property tree. A node either carries a non-empty value
/// (a leaf) or children, never both past the instant of construction.
pub struct PropNode {
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) value: String,
    pub(crate) modified: Option<OffsetDateTime>,
    pub(crate) expires: Option<OffsetDateTime>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: BTreeMap<String, NodeId>,
    pub(crate) hash: NodeHash,

    // Changeset scratch: the shallow child-map copy and original hash
    // recorded on first mutation, restored verbatim on revert.
    pub(crate) orig_children: Option<BTreeMap<String, NodeId>>,
    pub(crate) orig_hash: Option<NodeHash>,

    // Position in the expiration heap; None when absent.
    pub(crate) heap_index: Option<usize>,

    // Marshal cache: promoted once the access counter crosses the
    // threshold, invalidated on any commit touching this subtree.
    pub(crate) cached_json: Option<String>,
    pub(crate) get_count: u32,

    // Opaque per-node user data. Never persisted; dropped with the node.
    pub(crate) data: Option<Arc<dyn Any + Send + Sync>>,
}

impl PropNode {
    pub(crate) fn new(name: String, path: String, parent: Option<NodeId>) -> PropNode {
        let hash = leaf_hash(&path, "");
        PropNode {
            name,
            path,
            value: String::new(),
            modified: None,
            expires: None,
            parent,
            children: BTreeMap::new(),
            hash,
            orig_children: None,
            orig_hash: None,
            heap_index: None,
            cached_json: None,
            get_count: 0,
            data: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.modified
    }

    pub fn expires(&self) -> Option<OffsetDateTime> {
        self.expires
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.data.as_ref()
    }

    pub(crate) fn expired_at(&self, now: OffsetDateTime) -> bool {
        matches!(self.expires, Some(expires) if expires <= now)
    }
}

impl fmt::Debug for PropNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropNode")
            .field("path", &self.path)
            .field("value", &self.value)
            .field("expires", &self.expires)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("hash", &hash_hex(&self.hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_hash_is_md5_of_path_colon_value() {
        // md5("@/a:b") computed out-of-band.
        let hash = leaf_hash("@/a", "b");
        assert_eq!(hash_hex(&hash), "925d9ed7236a9b7801612f7424456ae4");
    }

    #[test]
    fn hex_round_trip() {
        let hash = leaf_hash("@/network/ssid", "setme");
        let hex = hash_hex(&hash);
        assert_eq!(hash_from_hex(&hex), Some(hash));
        assert_eq!(hash_from_hex("zz"), None);
    }
}
