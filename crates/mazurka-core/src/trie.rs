//! Concurrent segment trie.
//!
//! Values are keyed by sequences of string segments. Lookups are lock-free
//! over the child maps; mutating walks reserve each visited node with a
//! shared lock so a concurrent prune pass cannot unlink the branch under
//! them. Pruning runs inline after removals, serialized, and deletes exactly
//! the nodes that hold no value and no children.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

/// Shared-lock reservation on one node. While held, the node cannot be
/// orphaned by the pruner.
type Reservation = ArcRwLockReadGuard<RawRwLock, bool>;

struct Node<V> {
    value: RwLock<Option<Arc<V>>>,
    children: DashMap<String, Arc<Node<V>>>,
    /// Orphan flag. Shared holders are walkers reserving the node, the
    /// exclusive holder is the pruner marking it unreachable.
    flag: Arc<RwLock<bool>>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Node {
            value: RwLock::new(None),
            children: DashMap::new(),
            flag: Arc::new(RwLock::new(false)),
        }
    }

    fn is_bare(&self) -> bool {
        self.value.read().is_none() && self.children.is_empty()
    }
}

pub struct Trie<V> {
    root: Arc<Node<V>>,
    prune_serial: Mutex<()>,
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Trie<V> {
    pub fn new() -> Self {
        Trie {
            root: Arc::new(Node::new()),
            prune_serial: Mutex::new(()),
        }
    }

    /// Run a mutating walk. The cursor starts at the root, which is reserved
    /// for the duration; reservations taken along the walk are released in
    /// reverse order when the cursor drops.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteCursor<V>) -> R) -> R {
        let root = self.root.clone();
        let first = root.flag.read_arc();
        let mut cursor = WriteCursor {
            path: vec![root],
            reservations: vec![first],
        };
        f(&mut cursor)
    }

    /// Walk/create the path and set the value if the addressed node has
    /// none. An existing value is handed to `otherwise` instead.
    pub fn set_if_absent<S: AsRef<str>>(
        &self,
        segments: &[S],
        value: V,
        otherwise: impl FnOnce(&Arc<V>),
    ) {
        self.write(|cursor| {
            for seg in segments {
                cursor.next_or_create(seg.as_ref());
            }
            if let Err(old) = cursor.set_if_absent(value) {
                otherwise(&old);
            }
        })
    }

    /// Clear the value at the addressed node, then prune.
    pub fn clear<S: AsRef<str>>(&self, segments: &[S]) -> Option<Arc<V>> {
        self.clear_if(segments, |_| true)
    }

    /// Clear the value at the addressed node if the predicate accepts it,
    /// then prune. Returns the cleared value.
    pub fn clear_if<S: AsRef<str>>(
        &self,
        segments: &[S],
        predicate: impl FnOnce(&V) -> bool,
    ) -> Option<Arc<V>> {
        let mut node = self.root.clone();
        for seg in segments {
            let child = node.children.get(seg.as_ref())?.value().clone();
            node = child;
        }
        let cleared = {
            let mut slot = node.value.write();
            match &*slot {
                Some(v) if predicate(v) => slot.take(),
                _ => None,
            }
        };
        if cleared.is_some() {
            self.prune();
        }
        cleared
    }

    /// Handle on the root for non-blocking traversal.
    pub fn read(&self) -> ReadCursor<V> {
        ReadCursor {
            node: self.root.clone(),
        }
    }

    /// One depth-first pruning pass. Nodes with no value and no children are
    /// orphaned and unlinked from their parent; a node whose lock is
    /// contended (reserved by a walker) is skipped this pass.
    pub fn prune(&self) {
        let _serial = self.prune_serial.lock();
        Self::prune_children(&self.root);
    }

    fn prune_children(node: &Arc<Node<V>>) {
        let keys: Vec<String> = node.children.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let child = match node.children.get(&key) {
                Some(c) => c.value().clone(),
                None => continue,
            };
            Self::prune_children(&child);
            if !child.is_bare() {
                continue;
            }
            if let Some(mut flag) = child.flag.try_write() {
                // re-check under the exclusive lock: a reserved walker may
                // have added a value or child since the first look
                if !*flag && child.is_bare() {
                    *flag = true;
                    node.children.remove_if(&key, |_, n| Arc::ptr_eq(n, &child));
                }
            }
        }
    }
}

/// Mutable cursor over a reserved path from the root.
pub struct WriteCursor<V> {
    path: Vec<Arc<Node<V>>>,
    reservations: Vec<Reservation>,
}

impl<V> WriteCursor<V> {
    fn current(&self) -> &Arc<Node<V>> {
        self.path.last().expect("cursor path never empty")
    }

    /// Descend into the child for `segment`, creating it if missing. If the
    /// child turns out to have been orphaned between lookup and reservation
    /// (a stale branch), it is unlinked and the step retries from the
    /// current node.
    pub fn next_or_create(&mut self, segment: &str) {
        loop {
            let current = self.current().clone();
            let child = current
                .children
                .entry(segment.to_string())
                .or_insert_with(|| Arc::new(Node::new()))
                .value()
                .clone();
            let reservation = child.flag.read_arc();
            if *reservation {
                drop(reservation);
                current
                    .children
                    .remove_if(segment, |_, n| Arc::ptr_eq(n, &child));
                continue;
            }
            self.path.push(child);
            self.reservations.push(reservation);
            return;
        }
    }

    /// Set the current node's value if it has none; otherwise hand back the
    /// existing value untouched.
    pub fn set_if_absent(&mut self, value: V) -> Result<Arc<V>, Arc<V>> {
        let mut slot = self.current().value.write();
        match &*slot {
            Some(existing) => Err(existing.clone()),
            None => {
                let v = Arc::new(value);
                *slot = Some(v.clone());
                Ok(v)
            }
        }
    }

    /// Set the current node's value if absent, computing it on demand, and
    /// return whichever value the node ends up holding.
    pub fn get_or_insert_with(&mut self, make: impl FnOnce() -> V) -> Arc<V> {
        let mut slot = self.current().value.write();
        match &*slot {
            Some(existing) => existing.clone(),
            None => {
                let v = Arc::new(make());
                *slot = Some(v.clone());
                v
            }
        }
    }

    pub fn value(&self) -> Option<Arc<V>> {
        self.current().value.read().clone()
    }

    pub fn has_child(&self, segment: &str) -> bool {
        self.current().children.contains_key(segment)
    }

    /// Whether any direct child key satisfies the predicate.
    pub fn has_child_matching(&self, mut pred: impl FnMut(&str) -> bool) -> bool {
        self.current().children.iter().any(|e| pred(e.key()))
    }

    /// Depth of the cursor below the root.
    pub fn depth(&self) -> usize {
        self.path.len() - 1
    }
}

impl<V> Drop for WriteCursor<V> {
    fn drop(&mut self) {
        // release in reverse walk order
        while self.reservations.pop().is_some() {}
        while self.path.pop().is_some() {}
    }
}

/// Read-only traversal handle. Never blocks; only touches the child maps
/// and the value slots.
#[derive(Clone)]
pub struct ReadCursor<V> {
    node: Arc<Node<V>>,
}

impl<V> ReadCursor<V> {
    pub fn next(&self, segment: &str) -> Option<ReadCursor<V>> {
        self.node.children.get(segment).map(|c| ReadCursor {
            node: c.value().clone(),
        })
    }

    /// Descend into the child for `segment`; when the child carries a value
    /// it is fed to `sink` on the way.
    pub fn next_if_present(
        &self,
        segment: &str,
        sink: impl FnOnce(&Arc<V>),
    ) -> Option<ReadCursor<V>> {
        let child = self.next(segment)?;
        if let Some(v) = child.value() {
            sink(&v);
        }
        Some(child)
    }

    pub fn value(&self) -> Option<Arc<V>> {
        self.node.value.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn trie() -> Trie<u32> {
        Trie::new()
    }

    #[test]
    fn set_and_read_back() {
        let t = trie();
        t.set_if_absent(&["a", "b", "c"], 7, |_| panic!("fresh path"));
        let v = t
            .read()
            .next("a")
            .and_then(|c| c.next("b"))
            .and_then(|c| c.next("c"))
            .and_then(|c| c.value());
        assert_eq!(v.as_deref(), Some(&7));
    }

    #[test]
    fn set_if_absent_hands_existing_to_otherwise() {
        let t = trie();
        t.set_if_absent(&["x"], 1, |_| panic!());
        let mut seen = None;
        t.set_if_absent(&["x"], 2, |old| seen = Some(**old));
        assert_eq!(seen, Some(1));
        assert_eq!(t.read().next("x").unwrap().value().as_deref(), Some(&1));
    }

    #[test]
    fn clear_prunes_empty_chain() {
        let t = trie();
        t.set_if_absent(&["a", "b", "c"], 1, |_| panic!());
        assert_eq!(t.clear(&["a", "b", "c"]).as_deref(), Some(&1));
        // the whole chain was value-less and childless, so it is gone
        assert!(t.read().next("a").is_none());
    }

    #[test]
    fn prune_keeps_nodes_with_descendants() {
        let t = trie();
        t.set_if_absent(&["a", "b"], 1, |_| panic!());
        t.set_if_absent(&["a", "b", "c"], 2, |_| panic!());
        t.clear(&["a", "b"]);
        // "a/b" keeps existing because "a/b/c" lives below it
        let c = t.read().next("a").unwrap().next("b").unwrap();
        assert!(c.value().is_none());
        assert_eq!(c.next("c").unwrap().value().as_deref(), Some(&2));
    }

    #[test]
    fn clear_if_respects_predicate() {
        let t = trie();
        t.set_if_absent(&["k"], 5, |_| panic!());
        assert!(t.clear_if(&["k"], |v| *v == 9).is_none());
        assert_eq!(t.clear_if(&["k"], |v| *v == 5).as_deref(), Some(&5));
    }

    #[test]
    fn read_through_missing_path_finds_nothing() {
        let t = trie();
        assert!(t.read().next("nope").is_none());
    }

    #[test]
    fn next_if_present_feeds_sink() {
        let t = trie();
        t.set_if_absent(&["s"], 3, |_| panic!());
        let mut fed = None;
        t.read().next_if_present("s", |v| fed = Some(**v));
        assert_eq!(fed, Some(3));
    }

    #[test]
    fn concurrent_add_remove_keeps_live_values_reachable() {
        let t = Arc::new(Trie::new());
        let mut handles = Vec::new();
        for i in 0u32..4 {
            let t = t.clone();
            handles.push(thread::spawn(move || {
                for round in 0..200u32 {
                    let key = format!("k{}", (i + round) % 8);
                    t.set_if_absent(&["p", key.as_str()], i, |_| {});
                    if round % 3 == 0 {
                        t.clear(&["p", key.as_str()]);
                    }
                    // reads must never panic or observe a broken branch
                    let _ = t.read().next("p").and_then(|c| c.next(&key));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // quiesced: every remaining value is reachable by its path
        t.prune();
        for k in 0..8 {
            let key = format!("k{k}");
            if let Some(c) = t.read().next("p").and_then(|c| c.next(&key)) {
                // key nodes never grow children, so survival implies a value
                assert!(c.value().is_some());
            }
        }
    }

    #[test]
    fn write_cursor_collision_probe() {
        let t = trie();
        t.set_if_absent(&["a", ":"], 1, |_| panic!());
        t.write(|c| {
            c.next_or_create("a");
            assert!(c.has_child(":"));
            assert!(c.has_child_matching(|k| k == ":"));
            assert!(!c.has_child_matching(|k| k == "*"));
            assert_eq!(c.depth(), 1);
        });
    }
}
