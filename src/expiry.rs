//! The expiration subsystem: an index-tracked min-heap over leaf `expires`
//! timestamps, and a driver thread that pops everything due, clears the
//! TTL, and runs the matching expire hook.
//!
//! The heap's storage lives inside [`PropTree`] (mutations must keep the
//! heap and tree consistent under the single tree lock); the algorithms
//! live here.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};
use time::OffsetDateTime;

use crate::{
    dispatch::{Dispatch, ExpireAction},
    events::{Event, MessageQueue},
    tree::{NodeId, PropTree},
};

impl PropTree {
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// How many times `id` appears in the heap. The invariant is exactly
    /// once for every leaf with a TTL, zero otherwise.
    pub fn heap_count(&self, id: NodeId) -> usize {
        self.heap.iter().filter(|&&entry| entry == id).count()
    }

    pub fn heap_peek(&self) -> Option<(NodeId, OffsetDateTime)> {
        self.heap.first().map(|&id| (id, self.heap_expires(id)))
    }

    fn heap_expires(&self, id: NodeId) -> OffsetDateTime {
        self.node(id)
            .expires()
            .expect("heap entries always carry an expiration")
    }

    fn heap_set_index(&mut self, id: NodeId, index: Option<usize>) {
        self.node_mut(id).heap_index = index;
    }

    fn heap_swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let id_a = self.heap[a];
        let id_b = self.heap[b];
        self.heap_set_index(id_a, Some(a));
        self.heap_set_index(id_b, Some(b));
    }

    fn heap_sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap_expires(self.heap[i]) < self.heap_expires(self.heap[parent]) {
                self.heap_swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn heap_sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < self.heap.len()
                && self.heap_expires(self.heap[left]) < self.heap_expires(self.heap[smallest])
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.heap_expires(self.heap[right]) < self.heap_expires(self.heap[smallest])
            {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.heap_swap(i, smallest);
            i = smallest;
        }
    }

    pub(crate) fn heap_insert(&mut self, id: NodeId) {
        if self.node(id).heap_index.is_some() {
            self.heap_update(id);
            return;
        }
        debug_assert!(self.node(id).expires().is_some());
        self.heap.push(id);
        let i = self.heap.len() - 1;
        self.heap_set_index(id, Some(i));
        self.heap_sift_up(i);
    }

    /// Re-places `id` after its expiration changed; a nil expiration
    /// removes it.
    pub(crate) fn heap_update(&mut self, id: NodeId) {
        match (self.node(id).heap_index, self.node(id).expires()) {
            (Some(_), None) => self.heap_remove(id),
            (Some(i), Some(_)) => {
                self.heap_sift_down(i);
                self.heap_sift_up(i);
            }
            (None, Some(_)) => self.heap_insert(id),
            (None, None) => {}
        }
    }

    pub(crate) fn heap_remove(&mut self, id: NodeId) {
        let Some(node) = self.try_node(id) else {
            return;
        };
        let Some(i) = node.heap_index else {
            return;
        };

        let last = self.heap.len() - 1;
        if i != last {
            self.heap_swap(i, last);
        }
        self.heap.pop();
        self.heap_set_index(id, None);
        if i < self.heap.len() {
            self.heap_sift_down(i);
            self.heap_sift_up(i);
        }
    }

    /// Rebuilds the heap from scratch. Used after loading a tree.
    pub(crate) fn heap_rebuild(&mut self) {
        self.heap.clear();
        let mut with_ttl = Vec::new();
        self.walk_subtree(self.root_id(), &mut |tree, id| {
            if tree.node(id).expires().is_some() {
                with_ttl.push(id);
            }
        });
        for id in with_ttl {
            self.heap_set_index(id, None);
            self.heap_insert(id);
        }
    }

    /// Pops the head if it is due.
    pub(crate) fn heap_pop_due(&mut self, now: OffsetDateTime) -> Option<NodeId> {
        let (id, expires) = self.heap_peek()?;
        if expires > now {
            return None;
        }
        self.heap_remove(id);
        Some(id)
    }
}

/// Sweep interval when nothing is scheduled.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Lateness beyond which a fire draws a warning.
const LATE_WARNING: time::Duration = time::Duration::seconds(1);

/// Coalesced signal telling the driver the heap head may have moved.
pub type RearmHandle = Sender<()>;

/// The single timer thread driving TTL expirations.
pub struct ExpiryDriver {
    shutdown: Sender<()>,

    /// Joined on drop, after the shutdown signal.
    #[allow(unused)]
    job_thread: jod_thread::JoinHandle<()>,
}

impl ExpiryDriver {
    pub fn start(
        tree: Arc<Mutex<PropTree>>,
        dispatch: Arc<Dispatch>,
        events: Arc<MessageQueue<Event>>,
        persist: Option<Sender<()>>,
    ) -> (ExpiryDriver, RearmHandle) {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let (rearm_tx, rearm_rx) = bounded::<()>(1);

        let job_thread = jod_thread::Builder::new()
            .name("expiry driver".to_owned())
            .spawn(move || {
                log::trace!("expiry driver started");
                loop {
                    let timeout = next_deadline(&tree).unwrap_or(SWEEP_INTERVAL);
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(rearm_rx) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                        }
                        default(timeout) => fire(&tree, &dispatch, &events, persist.as_ref()),
                    }
                }
                log::trace!("expiry driver stopped");
            })
            .expect("failed to spawn expiry driver");

        (
            ExpiryDriver {
                shutdown: shutdown_tx,
                job_thread,
            },
            rearm_tx,
        )
    }
}

impl Drop for ExpiryDriver {
    fn drop(&mut self) {
        let _ = self.shutdown.try_send(());
    }
}

fn next_deadline(tree: &Arc<Mutex<PropTree>>) -> Option<Duration> {
    let tree = tree.lock().unwrap();
    let (_, expires) = tree.heap_peek()?;
    let until = expires - OffsetDateTime::now_utc();
    if until.is_negative() {
        return Some(Duration::ZERO);
    }
    Some(Duration::try_from(until).unwrap_or(SWEEP_INTERVAL))
}

fn fire(
    tree: &Arc<Mutex<PropTree>>,
    dispatch: &Arc<Dispatch>,
    events: &Arc<MessageQueue<Event>>,
    persist: Option<&Sender<()>>,
) {
    let fired = {
        let mut tree = tree.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        if tree.heap_peek().map_or(true, |(_, expires)| expires > now) {
            return;
        }

        tree.changeset_init();
        while let Some(id) = tree.heap_pop_due(now) {
            let (path_str, expires) = {
                let node = tree.node(id);
                (node.path().to_owned(), node.expires())
            };

            if let Some(expires) = expires {
                let late = now - expires;
                if late > LATE_WARNING {
                    log::warn!("expiration of {path_str} fired {late} late");
                }
            }

            let Ok(path) = tree.parse(&path_str) else {
                continue;
            };
            match dispatch.expire_action(&tree, &path) {
                ExpireAction::Remove => {
                    tree.expire_remove(id);
                }
                ExpireAction::Reset(value) => {
                    log::debug!("expire hook resets {path_str} to '{value}'");
                    if let Err(err) = tree.add(&path, &value, None) {
                        log::error!("expire reset of {path_str} failed: {err}; removing");
                        tree.expire_remove(id);
                    }
                }
            }
        }
        tree.changeset_commit(OffsetDateTime::now_utc())
    };

    if !fired.is_empty() {
        events.push_messages(&fired);
        if let Some(persist) = persist {
            let _ = persist.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MAIN_ROOT;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn add_with_ttl(tree: &mut PropTree, path: &str, seconds: i64) -> NodeId {
        let parsed = tree.parse(path).unwrap();
        tree.add(&parsed, "v", Some(now() + time::Duration::seconds(seconds)))
            .unwrap();
        tree.lookup(&parsed).unwrap()
    }

    #[test]
    fn heap_orders_by_expiration() {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        add_with_ttl(&mut tree, "@/tmp/c", 30);
        add_with_ttl(&mut tree, "@/tmp/a", 10);
        add_with_ttl(&mut tree, "@/tmp/b", 20);
        tree.changeset_commit(now());

        assert_eq!(tree.heap_len(), 3);
        let (head, _) = tree.heap_peek().unwrap();
        assert_eq!(tree.node(head).path(), "@/tmp/a");

        let popped = tree.heap_pop_due(now() + time::Duration::seconds(60));
        assert_eq!(tree.node(popped.unwrap()).path(), "@/tmp/a");
        let popped = tree.heap_pop_due(now() + time::Duration::seconds(60));
        assert_eq!(tree.node(popped.unwrap()).path(), "@/tmp/b");
        let popped = tree.heap_pop_due(now() + time::Duration::seconds(60));
        assert_eq!(tree.node(popped.unwrap()).path(), "@/tmp/c");
        assert!(tree.heap_pop_due(now() + time::Duration::seconds(60)).is_none());
    }

    #[test]
    fn nothing_due_pops_nothing() {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        add_with_ttl(&mut tree, "@/tmp/a", 3600);
        tree.changeset_commit(now());

        assert!(tree.heap_pop_due(now()).is_none());
        assert_eq!(tree.heap_len(), 1);
    }

    #[test]
    fn rewrite_without_ttl_leaves_the_heap() {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        add_with_ttl(&mut tree, "@/tmp/a", 3600);
        tree.changeset_commit(now());
        assert_eq!(tree.heap_len(), 1);

        tree.changeset_init();
        let path = tree.parse("@/tmp/a").unwrap();
        tree.add(&path, "v2", None).unwrap();
        tree.changeset_commit(now());

        assert_eq!(tree.heap_len(), 0);
        let id = tree.lookup(&path).unwrap();
        assert!(tree.node(id).expires().is_none());
    }

    #[test]
    fn delete_removes_subtree_ttls_from_heap() {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        add_with_ttl(&mut tree, "@/tmp/a", 100);
        add_with_ttl(&mut tree, "@/tmp/b", 200);
        add_with_ttl(&mut tree, "@/keep", 300);
        tree.changeset_commit(now());
        assert_eq!(tree.heap_len(), 3);

        tree.changeset_init();
        tree.delete(&tree.parse("@/tmp").unwrap()).unwrap();
        tree.changeset_commit(now());
        assert_eq!(tree.heap_len(), 1);
    }

    #[test]
    fn revert_restores_heap_membership() {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        let id = add_with_ttl(&mut tree, "@/tmp/a", 100);
        tree.changeset_commit(now());
        assert_eq!(tree.heap_count(id), 1);

        tree.changeset_init();
        tree.delete(&tree.parse("@/tmp/a").unwrap()).unwrap();
        assert_eq!(tree.heap_count(id), 0);
        tree.changeset_revert();

        assert_eq!(tree.heap_count(id), 1);
        assert_eq!(tree.heap_len(), 1);
    }

    #[test]
    fn every_ttl_leaf_is_in_the_heap_once() {
        let mut tree = PropTree::new(MAIN_ROOT);
        tree.changeset_init();
        for i in 0..16 {
            add_with_ttl(&mut tree, &format!("@/tmp/n{i}"), 100 + i);
        }
        tree.changeset_commit(now());

        let mut ids = Vec::new();
        tree.walk_subtree(tree.root_id(), &mut |t, id| {
            if t.node(id).expires().is_some() {
                ids.push(id);
            }
        });
        assert_eq!(ids.len(), 16);
        for id in ids {
            assert_eq!(tree.heap_count(id), 1);
        }
    }
}
