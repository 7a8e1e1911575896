use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    events::{Event, EventKind},
    path::{PathError, PropPath},
};

use super::node::{leaf_hash, NodeHash, NodeId, PropNode};

/// Root prefix of the main configuration tree.
pub const MAIN_ROOT: &str = "@";

/// Root prefix of the metrics side tree.
pub const METRICS_ROOT: &str = "@/metrics";

/// Access count after which a node's marshaled form is cached.
const CACHE_THRESHOLD: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("no such property: {0}")]
    NoProp(String),

    #[error("property expired: {0}")]
    Expired(String),

    #[error("not a leaf property: {0}")]
    NotLeaf(String),

    #[error("not an internal property: {0}")]
    NotDir(String),

    #[error("cannot create children under value-bearing property: {0}")]
    LeafConflict(String),

    #[error("illegal operation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// One ordered record of a mutation inside a changeset. Becomes an [`Event`]
/// at commit; `anchor` is the deepest surviving node whose `modified` chain
/// the commit must bump.
struct CsRecord {
    event: Event,
    anchor: Option<NodeId>,
}

/// In-progress changeset state. Only one may exist at a time.
struct Changeset {
    preserved: Vec<NodeId>,
    hashed: Vec<NodeId>,
    created: Vec<NodeId>,
    detached: Vec<NodeId>,
    records: Vec<CsRecord>,
}

impl Changeset {
    fn new() -> Changeset {
        Changeset {
            preserved: Vec::new(),
            hashed: Vec::new(),
            created: Vec::new(),
            detached: Vec::new(),
            records: Vec::new(),
        }
    }
}

/// The typed hierarchical property store.
///
/// Nodes live in an arena keyed by [`NodeId`]; parent links are back
/// pointers that are never serialized and are rebuilt on load. All external
/// mutation happens inside a changeset bracketed by [`changeset_init`]
/// (taken with the tree lock held by the caller) and either
/// [`changeset_commit`] or [`changeset_revert`].
///
/// [`changeset_init`]: PropTree::changeset_init
/// [`changeset_commit`]: PropTree::changeset_commit
/// [`changeset_revert`]: PropTree::changeset_revert
pub struct PropTree {
    nodes: HashMap<NodeId, PropNode>,
    root: NodeId,
    next_id: u64,
    root_path: String,
    cacheable: bool,

    // Expiration heap storage; the algorithms live in `expiry.rs`.
    pub(crate) heap: Vec<NodeId>,

    cs: Option<Changeset>,
}

impl PropTree {
    pub fn new(root_path: &str) -> PropTree {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            PropNode::new(root_path.to_owned(), root_path.to_owned(), None),
        );

        PropTree {
            nodes,
            root,
            next_id: 1,
            root_path: root_path.to_owned(),
            cacheable: false,
            heap: Vec::new(),
            cs: None,
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn set_cacheable(&mut self, cacheable: bool) {
        self.cacheable = cacheable;
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn parse(&self, source: &str) -> Result<PropPath, PathError> {
        PropPath::parse(&self.root_path, source)
    }

    /// Borrow a node. Panics on a stale id; ids handed out by public
    /// lookups are valid until the next commit.
    pub fn node(&self, id: NodeId) -> &PropNode {
        self.nodes.get(&id).expect("stale NodeId")
    }

    pub fn try_node(&self, id: NodeId) -> Option<&PropNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut PropNode {
        self.nodes.get_mut(&id).expect("stale NodeId")
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_hash(&self) -> NodeHash {
        self.node(self.root).hash
    }

    /// Resolves a path to a node id, ignoring expiration and the
    /// trailing-slash constraint.
    pub fn lookup(&self, path: &PropPath) -> Option<NodeId> {
        let mut id = self.root;
        for segment in path.segments() {
            id = self.node(id).child(segment)?;
        }
        Some(id)
    }

    /// Resolves a path, surfacing `NoProp` for missing nodes, `Expired` for
    /// nodes past their TTL, and `NotDir` when a trailing slash resolves to
    /// a leaf.
    pub fn get_node(&self, path: &PropPath, now: OffsetDateTime) -> Result<NodeId, TreeError> {
        let id = self
            .lookup(path)
            .ok_or_else(|| TreeError::NoProp(path.to_string_under(&self.root_path)))?;
        let node = self.node(id);

        if node.expired_at(now) {
            return Err(TreeError::Expired(node.path.clone()));
        }
        if path.is_dir() && id != self.root && node.is_leaf() {
            return Err(TreeError::NotDir(node.path.clone()));
        }

        Ok(id)
    }

    /// Returns a leaf's value; `NotLeaf` when the path names an internal
    /// node.
    pub fn get_prop(&self, path: &PropPath, now: OffsetDateTime) -> Result<String, TreeError> {
        let id = self.get_node(path, now)?;
        let node = self.node(id);
        if !node.is_leaf() {
            return Err(TreeError::NotLeaf(node.path.clone()));
        }
        Ok(node.value.clone())
    }

    /// The children of the node at `path`; empty when the path is missing.
    /// Never an error.
    pub fn get_children(&self, path: &PropPath) -> Vec<NodeId> {
        match self.lookup(path) {
            Some(id) => self.node(id).child_ids().collect(),
            None => Vec::new(),
        }
    }

    pub fn in_changeset(&self) -> bool {
        self.cs.is_some()
    }

    /// Opens a changeset. The caller must already hold the tree lock.
    /// Nesting is a programmer error.
    pub fn changeset_init(&mut self) {
        assert!(
            self.cs.is_none(),
            "changeset already in progress; changesets do not nest"
        );
        self.cs = Some(Changeset::new());
    }

    /// Commits the open changeset: clears preservation scratch, stamps
    /// `modified` on every changed leaf and its ancestors, repairs the
    /// marshal cache, frees detached nodes, and returns the ordered change
    /// events.
    pub fn changeset_commit(&mut self, now: OffsetDateTime) -> Vec<Event> {
        let cs = self.cs.take().expect("commit without changeset");

        // Marshal-cache repair: every node whose hash or child map was
        // touched (which includes all ancestors of any mutation) loses its
        // cached form.
        for &id in cs.hashed.iter().chain(cs.preserved.iter()) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.cached_json = None;
                node.orig_hash = None;
                node.orig_children = None;
            }
        }
        for &id in &cs.created {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.orig_hash = None;
                node.orig_children = None;
            }
        }

        // Timestamp discipline: a committed child bumps every ancestor to
        // the same instant, keeping `modified` monotone along any path.
        for record in &cs.records {
            let mut cursor = record.anchor;
            while let Some(id) = cursor {
                let Some(node) = self.nodes.get_mut(&id) else {
                    break;
                };
                node.modified = Some(now);
                cursor = node.parent;
            }
        }

        for id in cs.detached {
            self.free_subtree(id);
        }

        cs.records.into_iter().map(|r| r.event).collect()
    }

    /// Reverts the open changeset, restoring every preserved child map and
    /// hash verbatim and resynchronizing the expiration heap.
    pub fn changeset_revert(&mut self) {
        let cs = self.cs.take().expect("revert without changeset");

        // Nodes created inside the changeset disappear. The preserved child
        // maps predate them, so restoring the maps cannot resurrect them.
        for id in &cs.created {
            self.heap_remove(*id);
            self.nodes.remove(id);
        }

        for id in cs.preserved {
            if let Some(node) = self.nodes.get_mut(&id) {
                if let Some(orig) = node.orig_children.take() {
                    node.children = orig;
                }
            }
        }
        for id in cs.hashed {
            if let Some(node) = self.nodes.get_mut(&id) {
                if let Some(orig) = node.orig_hash.take() {
                    node.hash = orig;
                }
            }
        }

        // Detached subtrees are reachable again; their heap entries were
        // dropped at detach time and must come back.
        for id in cs.detached {
            if self.nodes.contains_key(&id) {
                self.heap_restore_subtree(id);
            }
        }
    }

    fn cs_mut(&mut self) -> &mut Changeset {
        self.cs
            .as_mut()
            .expect("tree mutation outside of a changeset")
    }

    /// Arena insert without changeset tracking; only for tree construction
    /// on load.
    pub(crate) fn alloc_raw(&mut self, node: PropNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    fn alloc(&mut self, node: PropNode) -> NodeId {
        let id = self.alloc_raw(node);
        self.cs_mut().created.push(id);
        id
    }

    fn preserve_children(&mut self, id: NodeId) {
        let first_touch = {
            let node = self.nodes.get_mut(&id).expect("stale NodeId");
            if node.orig_children.is_none() {
                node.orig_children = Some(node.children.clone());
                true
            } else {
                false
            }
        };
        if first_touch {
            self.cs_mut().preserved.push(id);
        }
    }

    fn preserve_hash(&mut self, id: NodeId) {
        let first_touch = {
            let node = self.nodes.get_mut(&id).expect("stale NodeId");
            if node.orig_hash.is_none() {
                node.orig_hash = Some(node.hash);
                true
            } else {
                false
            }
        };
        if first_touch {
            self.cs_mut().hashed.push(id);
        }
    }

    fn compute_hash(&self, id: NodeId) -> NodeHash {
        let node = self.node(id);
        if node.children.is_empty() {
            leaf_hash(&node.path, &node.value)
        } else {
            let mut hash = [0u8; 16];
            for child in node.children.values() {
                let child_hash = self.node(*child).hash;
                for (slot, byte) in hash.iter_mut().zip(child_hash.iter()) {
                    *slot ^= byte;
                }
            }
            hash
        }
    }

    /// Refreshes the hash of `id` and every ancestor up to the root,
    /// preserving originals on first touch.
    fn rehash_upward(&mut self, id: NodeId) {
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            self.preserve_hash(id);
            let hash = self.compute_hash(id);
            let node = self.node_mut(id);
            node.hash = hash;
            cursor = node.parent;
        }
    }

    fn record(&mut self, event: Event, anchor: Option<NodeId>) {
        self.cs_mut().records.push(CsRecord { event, anchor });
    }

    /// Walks `path` creating missing intermediates. Fails when the final
    /// node already has children or when an intermediate carries a value.
    pub fn insert(&mut self, path: &PropPath) -> Result<NodeId, TreeError> {
        let (id, _) = self.insert_inner(path)?;
        Ok(id)
    }

    fn insert_inner(&mut self, path: &PropPath) -> Result<(NodeId, bool), TreeError> {
        if path.is_root() {
            return Err(TreeError::NotLeaf(self.root_path.clone()));
        }

        let mut id = self.root;
        let mut created = false;
        let mut walked = String::from(&self.root_path);

        for (i, segment) in path.segments().iter().enumerate() {
            let last = i + 1 == path.segments().len();
            walked.push('/');
            walked.push_str(segment);

            let node = self.node(id);
            if !node.value.is_empty() {
                return Err(TreeError::LeafConflict(node.path.clone()));
            }

            match node.child(segment) {
                Some(child) => {
                    if last && !self.node(child).children.is_empty() {
                        return Err(TreeError::NotLeaf(walked));
                    }
                    id = child;
                }
                None => {
                    self.preserve_children(id);
                    let child = self.alloc(PropNode::new(
                        segment.clone(),
                        walked.clone(),
                        Some(id),
                    ));
                    self.node_mut(id).children.insert(segment.clone(), child);
                    id = child;
                    created = true;
                }
            }
        }

        Ok((id, created))
    }

    /// `Add`: create missing intermediates, then set. The dispatcher's
    /// setter hooks run above this layer.
    pub fn add(
        &mut self,
        path: &PropPath,
        value: &str,
        expires: Option<OffsetDateTime>,
    ) -> Result<(), TreeError> {
        self.write(path, value, expires, true)
    }

    /// `Set`: fail when the path does not already exist.
    pub fn set(
        &mut self,
        path: &PropPath,
        value: &str,
        expires: Option<OffsetDateTime>,
    ) -> Result<(), TreeError> {
        self.write(path, value, expires, false)
    }

    fn write(
        &mut self,
        path: &PropPath,
        value: &str,
        expires: Option<OffsetDateTime>,
        create: bool,
    ) -> Result<(), TreeError> {
        if path.is_dir() {
            return Err(TreeError::NotDir(path.to_string_under(&self.root_path)));
        }

        let id = if create {
            let (id, _) = self.insert_inner(path)?;
            id
        } else {
            let id = self
                .lookup(path)
                .ok_or_else(|| TreeError::NoProp(path.to_string_under(&self.root_path)))?;
            if !self.node(id).children.is_empty() {
                return Err(TreeError::NotLeaf(self.node(id).path.clone()));
            }
            id
        };

        let created_here = self.cs.as_ref().is_some_and(|cs| cs.created.contains(&id));

        let final_id = if created_here {
            // Fresh node from this changeset; mutate in place.
            self.heap_remove(id);
            let node = self.node_mut(id);
            node.value = value.to_owned();
            node.expires = expires;
            id
        } else {
            // Replace the leaf in its parent's child map so revert can
            // restore the original by putting the preserved node back.
            let old = self.node(id);
            let parent = old.parent.expect("non-root leaf must have a parent");
            let name = old.name.clone();
            let node_path = old.path.clone();

            let mut replacement = PropNode::new(name.clone(), node_path, Some(parent));
            replacement.value = value.to_owned();
            replacement.expires = expires;

            self.preserve_children(parent);
            self.heap_remove(id);
            let new_id = self.alloc(replacement);
            self.node_mut(parent).children.insert(name, new_id);
            self.cs_mut().detached.push(id);
            new_id
        };

        if expires.is_some() {
            self.heap_insert(final_id);
        }
        self.rehash_upward(final_id);

        self.record(
            Event {
                kind: EventKind::Change,
                property: self.node(final_id).path.clone(),
                value: Some(value.to_owned()),
                expires,
            },
            Some(final_id),
        );

        Ok(())
    }

    /// Removes the node and its subtree, returning every removed path in
    /// preorder. One `DELETE` event is recorded per removed leaf.
    pub fn delete(&mut self, path: &PropPath) -> Result<Vec<String>, TreeError> {
        if path.is_root() {
            return Err(TreeError::Invalid("cannot delete the tree root".into()));
        }

        let id = self
            .lookup(path)
            .ok_or_else(|| TreeError::NoProp(path.to_string_under(&self.root_path)))?;
        if path.is_dir() && self.node(id).is_leaf() {
            return Err(TreeError::NotDir(self.node(id).path.clone()));
        }

        let parent = self.node(id).parent.expect("non-root node has a parent");
        let name = self.node(id).name.clone();

        let mut removed = Vec::new();
        let mut leaves = Vec::new();
        self.walk_subtree(id, &mut |tree, nid| {
            let node = tree.node(nid);
            removed.push(node.path.clone());
            if node.is_leaf() {
                leaves.push(node.path.clone());
            }
        });

        self.preserve_children(parent);
        self.heap_drop_subtree(id);
        self.node_mut(parent).children.remove(&name);
        self.cs_mut().detached.push(id);
        self.rehash_upward(parent);

        for leaf in leaves {
            self.record(
                Event {
                    kind: EventKind::Delete,
                    property: leaf,
                    value: None,
                    expires: None,
                },
                Some(parent),
            );
        }

        Ok(removed)
    }

    /// Driver-side removal of an expired leaf. Records a single `EXPIRE`
    /// event for the leaf and detaches it.
    pub fn expire_remove(&mut self, id: NodeId) -> String {
        let node = self.node(id);
        let parent = node.parent.expect("expired leaf has a parent");
        let name = node.name.clone();
        let node_path = node.path.clone();

        self.preserve_children(parent);
        self.heap_remove(id);
        self.node_mut(parent).children.remove(&name);
        self.cs_mut().detached.push(id);
        self.rehash_upward(parent);

        self.record(
            Event {
                kind: EventKind::Expire,
                property: node_path.clone(),
                value: None,
                expires: None,
            },
            Some(parent),
        );

        node_path
    }

    /// Relocates a subtree, re-pathing every descendant and rehashing both
    /// branches. Implemented as an export of the source subtree followed by
    /// delete and re-graft so the changeset preservation rules hold.
    pub fn move_to(&mut self, old: &PropPath, new: &PropPath) -> Result<(), TreeError> {
        let id = self
            .lookup(old)
            .ok_or_else(|| TreeError::NoProp(old.to_string_under(&self.root_path)))?;
        if self.lookup(new).is_some() {
            return Err(TreeError::Invalid(format!(
                "move target already exists: {}",
                new.to_string_under(&self.root_path)
            )));
        }

        let export = self.export_subtree(id);
        self.delete(old)?;
        self.graft(new, &export)
    }

    /// Attaches opaque user data to a node. The data is never persisted and
    /// is dropped when the node is deleted or replaced.
    pub fn set_data(
        &mut self,
        path: &PropPath,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<(), TreeError> {
        let id = self
            .lookup(path)
            .ok_or_else(|| TreeError::NoProp(path.to_string_under(&self.root_path)))?;
        self.node_mut(id).data = data;
        Ok(())
    }

    pub fn get_data(&self, path: &PropPath) -> Option<Arc<dyn Any + Send + Sync>> {
        let id = self.lookup(path)?;
        self.node(id).data.clone()
    }

    /// Marshal a subtree to JSON, memoizing hot nodes when the tree is
    /// cacheable.
    pub fn get_json(&mut self, path: &PropPath, now: OffsetDateTime) -> Result<String, TreeError> {
        let id = self.get_node(path, now)?;

        if !self.cacheable {
            return self.marshal_json(id);
        }

        self.node_mut(id).get_count += 1;
        if let Some(cached) = &self.node(id).cached_json {
            return Ok(cached.clone());
        }

        let json = self.marshal_json(id)?;
        if self.node(id).get_count >= CACHE_THRESHOLD {
            self.node_mut(id).cached_json = Some(json.clone());
        }
        Ok(json)
    }

    fn marshal_json(&self, id: NodeId) -> Result<String, TreeError> {
        serde_json::to_string(&self.export_subtree(id))
            .map_err(|e| TreeError::Invalid(format!("marshal failed: {e}")))
    }

    pub(crate) fn walk_subtree(&self, id: NodeId, visit: &mut impl FnMut(&PropTree, NodeId)) {
        let mut queue = VecDeque::new();
        queue.push_back(id);
        while let Some(id) = queue.pop_front() {
            visit(self, id);
            queue.extend(self.node(id).child_ids());
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut queue = VecDeque::new();
        queue.push_back(id);
        while let Some(id) = queue.pop_front() {
            if let Some(node) = self.nodes.remove(&id) {
                queue.extend(node.children.values().copied());
            }
        }
    }

    fn heap_drop_subtree(&mut self, id: NodeId) {
        let mut ids = Vec::new();
        self.walk_subtree(id, &mut |_, nid| ids.push(nid));
        for nid in ids {
            self.heap_remove(nid);
        }
    }

    fn heap_restore_subtree(&mut self, id: NodeId) {
        let mut ids = Vec::new();
        self.walk_subtree(id, &mut |tree, nid| {
            if tree.node(nid).expires.is_some() {
                ids.push(nid);
            }
        });
        for nid in ids {
            self.heap_insert(nid);
        }
    }

    /// Recomputes every hash from the stored structure and compares against
    /// the cached values. A self-consistent tree returns true.
    pub fn validate(&self) -> bool {
        self.validate_node(self.root)
    }

    fn validate_node(&self, id: NodeId) -> bool {
        let node = self.node(id);
        for child in node.children.values() {
            if !self.validate_node(*child) {
                return false;
            }
        }
        self.compute_hash(id) == node.hash
    }

    /// Every leaf path in the tree, sorted. Test and diagnostic helper.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.walk_subtree(self.root, &mut |tree, id| {
            let node = tree.node(id);
            if node.is_leaf() && id != tree.root {
                paths.push(node.path.clone());
            }
        });
        paths.sort();
        paths
    }

    /// Recomputes all hashes bottom-up. Used on load.
    pub(crate) fn rehash_all(&mut self) {
        let mut order = Vec::new();
        self.walk_subtree(self.root, &mut |_, id| order.push(id));
        for id in order.into_iter().rev() {
            let hash = self.compute_hash(id);
            self.node_mut(id).hash = hash;
        }
    }
}
