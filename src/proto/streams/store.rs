use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::frame::{StreamId, DEFAULT_WEIGHT};
use crate::proto::peer::Peer;
use crate::proto::streams::stream::StreamInner;

/// Per-peer counters for streams in an active state, checked against
/// the negotiated concurrency limits. `usize::MAX` means no limit was
/// advertised.
#[derive(Debug)]
pub struct Counts {
    num_local: AtomicUsize,
    num_remote: AtomicUsize,
    max_local: AtomicUsize,
    max_remote: AtomicUsize,
}

impl Counts {
    pub fn new(max_remote: Option<u32>) -> Counts {
        Counts {
            num_local: AtomicUsize::new(0),
            num_remote: AtomicUsize::new(0),
            max_local: AtomicUsize::new(usize::MAX),
            max_remote: AtomicUsize::new(
                max_remote.map(|max| max as usize).unwrap_or(usize::MAX),
            ),
        }
    }

    /// The limit the peer advertised for streams we initiate.
    pub fn set_max_local(&self, max: Option<u32>) {
        self.max_local.store(
            max.map(|max| max as usize).unwrap_or(usize::MAX),
            Ordering::Release,
        );
    }

    /// The limit we advertised for streams the peer initiates.
    pub fn set_max_remote(&self, max: Option<u32>) {
        self.max_remote.store(
            max.map(|max| max as usize).unwrap_or(usize::MAX),
            Ordering::Release,
        );
    }

    fn try_inc(counter: &AtomicUsize, max: &AtomicUsize) -> bool {
        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= max.load(Ordering::Acquire) {
                return false;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn try_inc_local(&self) -> bool {
        Counts::try_inc(&self.num_local, &self.max_local)
    }

    pub fn try_inc_remote(&self) -> bool {
        Counts::try_inc(&self.num_remote, &self.max_remote)
    }

    pub fn dec(&self, local: bool) {
        let counter = if local { &self.num_local } else { &self.num_remote };
        let prev = counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "stream counter underflow");
    }

    pub fn num_active(&self) -> usize {
        self.num_local.load(Ordering::Acquire) + self.num_remote.load(Ordering::Acquire)
    }

    pub fn has_active(&self) -> bool {
        self.num_active() > 0
    }
}

#[derive(Debug)]
struct Node {
    parent: StreamId,
    weight: u8,
    children: HashSet<StreamId>,
}

#[derive(Debug)]
struct Retired {
    id: StreamId,
    at: Instant,
}

#[derive(Debug)]
struct Inner {
    streams: HashMap<StreamId, Arc<StreamInner>>,
    tree: HashMap<StreamId, Node>,
    retired: VecDeque<Retired>,
}

/// The stream registry: every live stream, the declared dependency
/// tree, and the recently-closed list awaiting recycling.
///
/// Readers (dispatch lookups, settings propagation) share the lock;
/// insertion and removal take it exclusively.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<Inner>,
    pub counts: Counts,
    peer: Peer,
}

impl Store {
    pub fn new(peer: Peer, max_remote: Option<u32>) -> Store {
        let mut tree = HashMap::new();
        tree.insert(
            StreamId::ZERO,
            Node {
                parent: StreamId::ZERO,
                weight: DEFAULT_WEIGHT,
                children: HashSet::new(),
            },
        );

        Store {
            inner: RwLock::new(Inner {
                streams: HashMap::new(),
                tree,
                retired: VecDeque::new(),
            }),
            counts: Counts::new(max_remote),
            peer,
        }
    }

    pub fn insert(&self, stream: Arc<StreamInner>) {
        let mut inner = self.inner.write().unwrap();
        let id = stream.id;
        inner.streams.insert(id, stream);
        inner.ensure_node(id);
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<StreamInner>> {
        self.inner.read().unwrap().streams.get(&id).cloned()
    }

    /// All live streams, for SETTINGS propagation. Handles are cloned
    /// out so the lock is not held while windows are adjusted.
    pub fn snapshot(&self) -> Vec<Arc<StreamInner>> {
        self.inner.read().unwrap().streams.values().cloned().collect()
    }

    /// Queues a closed stream for removal once the grace window passes.
    pub fn retire(&self, id: StreamId) {
        let mut inner = self.inner.write().unwrap();
        if inner.streams.contains_key(&id) {
            inner.retired.push_back(Retired {
                id,
                at: Instant::now(),
            });
        }
    }

    /// Drops retired streams whose grace window has elapsed.
    pub fn purge_expired(&self, grace: Duration) {
        let due = {
            let inner = self.inner.read().unwrap();
            match inner.retired.front() {
                Some(front) => front.at.elapsed() > grace,
                None => false,
            }
        };
        if !due {
            return;
        }

        let mut inner = self.inner.write().unwrap();
        while let Some(front) = inner.retired.front() {
            if front.at.elapsed() <= grace {
                break;
            }
            let id = front.id;
            inner.retired.pop_front();
            inner.streams.remove(&id);
            inner.remove_node(id);
            tracing::trace!("recycled closed stream; id={:?}", id);
        }
    }

    /// Drops every stream immediately; connection teardown.
    pub fn clear(&self) -> Vec<Arc<StreamInner>> {
        let mut inner = self.inner.write().unwrap();
        inner.retired.clear();
        inner.tree.clear();
        inner.streams.drain().map(|(_, stream)| stream).collect()
    }

    pub fn is_local_init(&self, id: StreamId) -> bool {
        self.peer.is_local_init(id)
    }

    /// Records a declared priority: `stream` depends on `parent` with
    /// the given weight. An exclusive dependency adopts the parent's
    /// other children. A dependency on one of the stream's own
    /// descendants is broken by first moving that descendant up to the
    /// stream's current parent.
    pub fn reparent(&self, id: StreamId, parent: StreamId, weight: u8, exclusive: bool) {
        let mut inner = self.inner.write().unwrap();

        inner.ensure_node(id);
        inner.ensure_node(parent);

        if inner.is_descendant(id, parent) {
            let current_parent = inner.tree[&id].parent;
            inner.move_node(parent, current_parent);
        }

        if exclusive {
            let siblings: Vec<StreamId> = inner.tree[&parent]
                .children
                .iter()
                .copied()
                .filter(|&child| child != id)
                .collect();
            for child in siblings {
                inner.move_node(child, id);
            }
        }

        inner.move_node(id, parent);
        if let Some(node) = inner.tree.get_mut(&id) {
            node.weight = weight;
        }
    }

    #[cfg(test)]
    pub fn parent_of(&self, id: StreamId) -> Option<StreamId> {
        self.inner.read().unwrap().tree.get(&id).map(|n| n.parent)
    }

    #[cfg(test)]
    pub fn children_of(&self, id: StreamId) -> Vec<StreamId> {
        let inner = self.inner.read().unwrap();
        let mut children: Vec<StreamId> = inner
            .tree
            .get(&id)
            .map(|n| n.children.iter().copied().collect())
            .unwrap_or_default();
        children.sort();
        children
    }

    #[cfg(test)]
    pub fn weight_of(&self, id: StreamId) -> Option<u8> {
        self.inner.read().unwrap().tree.get(&id).map(|n| n.weight)
    }
}

impl Inner {
    fn ensure_node(&mut self, id: StreamId) {
        if !self.tree.contains_key(&id) {
            self.tree.insert(
                id,
                Node {
                    parent: StreamId::ZERO,
                    weight: DEFAULT_WEIGHT,
                    children: HashSet::new(),
                },
            );
            self.tree
                .get_mut(&StreamId::ZERO)
                .expect("root node always present")
                .children
                .insert(id);
        }
    }

    fn is_descendant(&self, ancestor: StreamId, id: StreamId) -> bool {
        let mut current = id;
        while current != StreamId::ZERO {
            let parent = match self.tree.get(&current) {
                Some(node) => node.parent,
                None => return false,
            };
            if parent == ancestor {
                return true;
            }
            current = parent;
        }
        false
    }

    fn move_node(&mut self, id: StreamId, new_parent: StreamId) {
        let old_parent = match self.tree.get(&id) {
            Some(node) => node.parent,
            None => return,
        };
        if let Some(node) = self.tree.get_mut(&old_parent) {
            node.children.remove(&id);
        }
        if let Some(node) = self.tree.get_mut(&id) {
            node.parent = new_parent;
        }
        if let Some(node) = self.tree.get_mut(&new_parent) {
            node.children.insert(id);
        }
    }

    fn remove_node(&mut self, id: StreamId) {
        let node = match self.tree.remove(&id) {
            Some(node) => node,
            None => return,
        };
        if let Some(parent) = self.tree.get_mut(&node.parent) {
            parent.children.remove(&id);
        }
        // Orphaned children climb to their grandparent.
        for child in node.children {
            if let Some(child_node) = self.tree.get_mut(&child) {
                child_node.parent = node.parent;
            }
            if let Some(parent) = self.tree.get_mut(&node.parent) {
                parent.children.insert(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(Peer::Server, None)
    }

    fn id(n: u32) -> StreamId {
        n.into()
    }

    #[test]
    fn counts_enforce_limits() {
        let counts = Counts::new(Some(2));
        assert!(counts.try_inc_remote());
        assert!(counts.try_inc_remote());
        assert!(!counts.try_inc_remote());

        counts.dec(false);
        assert!(counts.try_inc_remote());

        // Local side is unlimited until the peer advertises a cap.
        assert!(counts.try_inc_local());
        counts.set_max_local(Some(1));
        assert!(!counts.try_inc_local());
    }

    #[test]
    fn reparent_records_weight_and_parent() {
        let store = store();
        store.reparent(id(3), id(1), 200, false);

        assert_eq!(store.parent_of(id(3)), Some(id(1)));
        assert_eq!(store.weight_of(id(3)), Some(200));
        assert_eq!(store.children_of(id(1)), vec![id(3)]);
    }

    #[test]
    fn exclusive_reparent_adopts_siblings() {
        let store = store();
        store.reparent(id(3), id(1), 10, false);
        store.reparent(id(5), id(1), 10, false);
        store.reparent(id(7), id(1), 10, true);

        assert_eq!(store.children_of(id(1)), vec![id(7)]);
        assert_eq!(store.children_of(id(7)), vec![id(3), id(5)]);
    }

    #[test]
    fn cycle_is_broken_by_detaching_first() {
        let store = store();
        // 1 <- 3 <- 5
        store.reparent(id(3), id(1), 10, false);
        store.reparent(id(5), id(3), 10, false);

        // Now declare 1 dependent on its descendant 5. 5 must first be
        // hoisted to 1's current parent (the root).
        store.reparent(id(1), id(5), 10, false);

        assert_eq!(store.parent_of(id(5)), Some(StreamId::ZERO));
        assert_eq!(store.parent_of(id(1)), Some(id(5)));
        assert_eq!(store.parent_of(id(3)), Some(id(1)));
    }

    #[test]
    fn purge_removes_only_expired_streams() {
        let store = store();
        let stream = Arc::new(StreamInner::new(id(2)));
        store.insert(stream);
        store.retire(id(2));

        store.purge_expired(Duration::from_secs(5));
        assert!(store.get(id(2)).is_some());

        store.purge_expired(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        store.purge_expired(Duration::from_millis(1));
        assert!(store.get(id(2)).is_none());
    }
}
