//! Tree vertices. A node is a directory (owning children) xor a file
//! (owning blocks). Parents own children by `Rc`; children hold a weak
//! back-reference, breaking the ownership cycle explicitly in
//! [`Node::discard`] rather than relying on borrow-checked lifetimes.

use crate::block::{Backing, Block, BlockFactory};
use crate::codec::NodeRecord;
use crate::error::{Error, Result};
use crate::refs::Ref;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Metadata block capacity, independent of any node's configured content
/// block size.
pub const METADATA_BLOCK_CAPACITY: usize = 1 << 20;

/// Directory mode bit, 9P-style.
pub const DMDIR: u32 = 0x8000_0000;

pub type NodeHandle = Rc<RefCell<Node>>;

/// Stable metadata carried by every node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Assigned once at creation, preserved across rewrites.
    pub id: u64,
    pub qid_type: u8,
    pub qid_version: u32,
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u32,
    pub uid: u32,
    pub gid: u32,
}

impl NodeInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

pub fn now_unix_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// A directory's children or a file's blocks; mutually exclusive.
pub enum Content {
    Directory(Vec<NodeHandle>),
    File(Vec<Block>),
}

pub struct Node {
    parent: Option<Weak<RefCell<Node>>>,
    content: Content,
    loaded: bool,
    dirty: bool,
    sealed: bool,
    unlinked: bool,
    /// Block capacity for new content blocks of this node.
    bsize: u32,
    info: NodeInfo,
    refs: u32,
    pointer: Option<Ref>,
    atime: Instant,
    backing: Backing,
}

impl Node {
    pub fn new_root(backing: Backing, bsize: u32, mode: u32, uid: u32, gid: u32) -> NodeHandle {
        let info = NodeInfo {
            id: now_nanos(),
            qid_type: 0,
            qid_version: 0,
            name: String::new(),
            size: 0,
            mode: mode | DMDIR,
            mtime: now_unix_secs(),
            uid,
            gid,
        };
        Rc::new(RefCell::new(Node {
            parent: None,
            content: Content::Directory(Vec::new()),
            loaded: true,
            dirty: true,
            sealed: false,
            unlinked: false,
            bsize,
            info,
            refs: 0,
            pointer: None,
            atime: Instant::now(),
            backing,
        }))
    }

    /// Creates a fresh, loaded, dirty child under `parent`.
    pub fn new_child(parent: &NodeHandle, name: &str, mode: u32, uid: u32, gid: u32) -> NodeHandle {
        let parent_ref = parent.borrow();
        let bsize = parent_ref.bsize;
        let backing = parent_ref.backing.clone();
        drop(parent_ref);

        let is_dir = mode & DMDIR != 0;
        let info = NodeInfo {
            id: now_nanos(),
            qid_type: if is_dir { 128 } else { 0 },
            qid_version: 0,
            name: name.to_string(),
            size: 0,
            mode,
            mtime: now_unix_secs(),
            uid,
            gid,
        };
        Rc::new(RefCell::new(Node {
            parent: Some(Rc::downgrade(parent)),
            content: if is_dir {
                Content::Directory(Vec::new())
            } else {
                Content::File(Vec::new())
            },
            loaded: true,
            dirty: true,
            sealed: false,
            unlinked: false,
            bsize,
            info,
            refs: 0,
            pointer: None,
            atime: Instant::now(),
            backing,
        }))
    }

    /// Creates an unloaded stub: pointer-only, materialized on demand by
    /// the store.
    pub fn new_stub(parent: &NodeHandle, pointer: Ref, backing: Backing, bsize: u32) -> NodeHandle {
        let info = NodeInfo {
            id: 0,
            qid_type: 0,
            qid_version: 0,
            name: String::new(),
            size: 0,
            mode: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
        };
        Rc::new(RefCell::new(Node {
            parent: Some(Rc::downgrade(parent)),
            content: Content::Directory(Vec::new()),
            loaded: false,
            dirty: false,
            sealed: false,
            unlinked: false,
            bsize,
            info,
            refs: 0,
            pointer: Some(pointer),
            atime: Instant::now(),
            backing,
        }))
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn is_dir(&self) -> bool {
        self.info.is_dir()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }

    pub fn bsize(&self) -> u32 {
        self.bsize
    }

    pub fn pointer(&self) -> Option<&Ref> {
        self.pointer.as_ref()
    }

    pub fn set_pointer(&mut self, r: Ref) {
        self.pointer = Some(r);
    }

    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    pub fn set_sealed(&mut self, sealed: bool) {
        self.sealed = sealed;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn touch(&mut self) {
        self.atime = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.atime.elapsed()
    }

    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Path-joins the parent chain; the root's path is its own name
    /// (typically empty).
    pub fn path(handle: &NodeHandle) -> String {
        let mut parts = Vec::new();
        let mut current = handle.clone();
        loop {
            let name = current.borrow().info.name.clone();
            let parent = current.borrow().parent();
            match parent {
                Some(p) => {
                    parts.push(name);
                    current = p;
                }
                None => {
                    if !name.is_empty() {
                        parts.push(name);
                    }
                    break;
                }
            }
        }
        parts.reverse();
        parts.join("/")
    }

    /// Increments `refs` on this node and every ancestor; touches access
    /// time.
    pub fn add_ref(handle: &NodeHandle) {
        let mut current = Some(handle.clone());
        while let Some(node) = current {
            let mut n = node.borrow_mut();
            n.refs += 1;
            n.touch();
            current = n.parent();
        }
    }

    /// Decrements `refs` on this node and every ancestor; touches access
    /// time. `reason` is logged by callers that need it; kept unused here
    /// to mirror the asymmetry of `add_ref`/`unref` without inventing
    /// telemetry the spec does not define.
    pub fn unref(handle: &NodeHandle, _reason: &str) {
        let mut current = Some(handle.clone());
        while let Some(node) = current {
            let mut n = node.borrow_mut();
            n.refs = n.refs.saturating_sub(1);
            n.touch();
            current = n.parent();
        }
    }

    /// Marks this node and every ancestor dirty; clears `sealed` along
    /// the way (`dirty ⇒ ¬sealed`).
    pub fn mark_dirty(handle: &NodeHandle) {
        let mut current = Some(handle.clone());
        while let Some(node) = current {
            let mut n = node.borrow_mut();
            n.dirty = true;
            n.sealed = false;
            current = n.parent();
        }
    }

    pub fn rename(handle: &NodeHandle, name: &str) {
        handle.borrow_mut().info.name = name.to_string();
        Node::mark_dirty(handle);
    }

    pub fn set_perm(handle: &NodeHandle, mode_bits: u32) {
        let mut n = handle.borrow_mut();
        let dir_bit = n.info.mode & DMDIR;
        n.info.mode = dir_bit | (mode_bits & 0o7777);
        drop(n);
        Node::mark_dirty(handle);
    }

    pub fn set_mtime(handle: &NodeHandle, mtime: u32) {
        handle.borrow_mut().info.mtime = mtime;
        Node::mark_dirty(handle);
    }

    pub fn set_mode(handle: &NodeHandle, mode: u32) {
        handle.borrow_mut().info.mode = mode;
        Node::mark_dirty(handle);
    }

    /// Returns the child with `name`, the parent for `".."`, or `None`.
    /// Panics on an empty `name`: this is a caller contract violation,
    /// not a recoverable runtime condition.
    pub fn follow_branch(handle: &NodeHandle, name: &str) -> Option<NodeHandle> {
        assert!(!name.is_empty(), "follow_branch called with empty name");
        if name == ".." {
            return handle.borrow().parent();
        }
        let n = handle.borrow();
        match &n.content {
            Content::Directory(children) => children
                .iter()
                .find(|c| c.borrow().info.name == name)
                .cloned(),
            Content::File(_) => None,
        }
    }

    /// Snapshot map name → child, for diff/merge.
    pub fn children_map(handle: &NodeHandle) -> HashMap<String, NodeHandle> {
        let n = handle.borrow();
        match &n.content {
            Content::Directory(children) => children
                .iter()
                .map(|c| (c.borrow().info.name.clone(), c.clone()))
                .collect(),
            Content::File(_) => HashMap::new(),
        }
    }

    pub fn children(handle: &NodeHandle) -> Vec<NodeHandle> {
        match &handle.borrow().content {
            Content::Directory(children) => children.clone(),
            Content::File(_) => Vec::new(),
        }
    }

    /// Appends `child` under `parent`, refusing a name collision against
    /// an already-loaded sibling. Unloaded stub siblings are resolved
    /// later by `make_child_names_unique`.
    pub fn add(parent: &NodeHandle, child: NodeHandle) -> bool {
        let name = child.borrow().info.name.clone();
        let mut p = parent.borrow_mut();
        match &mut p.content {
            Content::Directory(children) => {
                let collides = children
                    .iter()
                    .any(|c| c.borrow().loaded && c.borrow().info.name == name);
                if collides {
                    return false;
                }
                children.push(child);
                true
            }
            Content::File(_) => false,
        }
    }

    /// Reparents `handle` under `new_parent` without touching either
    /// node's child list; callers (`Tree::rename`, `Tree::graft`) manage
    /// the lists themselves.
    pub fn reparent(handle: &NodeHandle, new_parent: &NodeHandle) {
        handle.borrow_mut().parent = Some(Rc::downgrade(new_parent));
    }

    /// Unconditionally detaches `child` from `parent`'s child list.
    /// Returns the number of times `child`'s name was found (0, 1, or
    /// more than 1 on a corrupt tree).
    pub fn detach(parent: &NodeHandle, child: &NodeHandle) -> usize {
        let mut p = parent.borrow_mut();
        match &mut p.content {
            Content::Directory(children) => {
                let before = children.len();
                children.retain(|c| !Rc::ptr_eq(c, child));
                before - children.len()
            }
            Content::File(_) => 0,
        }
    }

    /// Marks this node and every loaded descendant `unlinked`.
    pub fn mark_unlinked_recursive(handle: &NodeHandle) {
        handle.borrow_mut().unlinked = true;
        if let Content::Directory(children) = &handle.borrow().content {
            for child in children {
                if child.borrow().loaded {
                    Node::mark_unlinked_recursive(child);
                }
            }
        }
    }

    fn content_factory(&self) -> BlockFactory {
        BlockFactory::from_backing(self.bsize as usize, &self.backing)
    }

    pub fn metadata_factory(&self) -> BlockFactory {
        BlockFactory::from_backing(METADATA_BLOCK_CAPACITY, &self.backing)
    }

    /// Builds (or reuses, if the node already has a pointer) the block
    /// used to persist this node's own serialized form.
    pub fn metadata_block(&self) -> Block {
        self.metadata_factory().make(self.pointer.clone())
    }

    /// Files only. Grows by appending zero-filled blocks of `bsize`;
    /// shrinks by truncating the last partial block and discarding the
    /// rest. Bumps `qid.version` and `mtime`.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let blocks = match &mut self.content {
            Content::Directory(_) => {
                return Err(Error::InvalidArgument(
                    "truncate on a directory".into(),
                ))
            }
            Content::File(blocks) => blocks,
        };
        let bsize = self.bsize as u64;
        let wanted_blocks = if size == 0 {
            0
        } else {
            ((size + bsize - 1) / bsize) as usize
        };

        if wanted_blocks < blocks.len() {
            for b in blocks.drain(wanted_blocks..) {
                let mut b = b;
                b.discard();
            }
        }

        let factory = BlockFactory::from_backing(bsize as usize, &self.backing);
        while blocks.len() < wanted_blocks {
            blocks.push(factory.make(None));
        }

        if let Some(last) = blocks.last_mut() {
            let last_len = size - (blocks.len() as u64 - 1) * bsize;
            last.truncate(last_len as usize)?;
        }

        self.info.size = size;
        self.info.mtime = now_unix_secs();
        self.info.qid_version += 1;
        self.dirty = true;
        self.sealed = false;
        Ok(())
    }

    /// Files only. Maps `off` to `(block_index, in_block_offset)` and
    /// writes across as many blocks as needed, growing the block list
    /// but never pre-zeroing new blocks beyond what `Block::write` does.
    pub fn write(&mut self, p: &[u8], off: u64) -> Result<(usize, i64)> {
        let bsize = self.bsize as u64;
        let blocks = match &mut self.content {
            Content::Directory(_) => {
                return Err(Error::InvalidArgument("write on a directory".into()))
            }
            Content::File(blocks) => blocks,
        };

        let factory = BlockFactory::from_backing(bsize as usize, &self.backing);
        let last_block_needed = ((off + p.len() as u64).saturating_sub(1)) / bsize;
        while (blocks.len() as u64) <= last_block_needed {
            blocks.push(factory.make(None));
        }

        let mut written = 0usize;
        let mut delta = 0i64;
        let mut remaining = p;
        let mut cursor = off;

        while !remaining.is_empty() {
            let block_index = (cursor / bsize) as usize;
            let in_block_off = (cursor % bsize) as usize;
            let space = bsize as usize - in_block_off;
            let chunk_len = remaining.len().min(space);

            let (n, d) = blocks[block_index].write(&remaining[..chunk_len], in_block_off)?;
            written += n;
            delta += d;
            cursor += n as u64;
            remaining = &remaining[n..];

            if n < chunk_len {
                break;
            }
        }

        self.info.size = (self.info.size as i64 + delta).max(0) as u64;
        self.info.mtime = now_unix_secs();
        self.info.qid_version += 1;
        self.dirty = true;
        self.sealed = false;
        Ok((written, delta))
    }

    /// Files only. Short reads occur only at end-of-file.
    pub fn read(&mut self, p: &mut [u8], off: u64) -> Result<usize> {
        let bsize = self.bsize as u64;
        let blocks = match &mut self.content {
            Content::Directory(_) => {
                return Err(Error::InvalidArgument("read on a directory".into()))
            }
            Content::File(blocks) => blocks,
        };

        let mut total = 0usize;
        let mut cursor = off;
        let mut out = p;

        while !out.is_empty() {
            let block_index = (cursor / bsize) as usize;
            if block_index >= blocks.len() {
                break;
            }
            let in_block_off = (cursor % bsize) as usize;
            let n = blocks[block_index].read(out, in_block_off)?;
            if n == 0 {
                break;
            }
            total += n;
            cursor += n as u64;
            out = &mut out[n..];
        }
        Ok(total)
    }

    pub fn blocks_mut(&mut self) -> Option<&mut Vec<Block>> {
        match &mut self.content {
            Content::File(blocks) => Some(blocks),
            Content::Directory(_) => None,
        }
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Discards all owned blocks and the metadata block; clears the
    /// block list and the pointer.
    pub fn discard(&mut self) {
        if let Content::File(blocks) = &mut self.content {
            for b in blocks.iter_mut() {
                b.discard();
            }
            blocks.clear();
        }
        if let Some(pointer) = self.pointer.take() {
            if pointer.is_index() {
                let mut meta = self.metadata_factory().make(Some(pointer));
                meta.discard();
            }
        }
    }

    /// Recurses into loaded children; un-loads (clears `loaded`, drops
    /// children/blocks/name) nodes that are not root, not dirty, have
    /// `refs == 0`, and have been idle at least `idle_threshold`.
    pub fn trim(handle: &NodeHandle, idle_threshold: std::time::Duration) {
        let children = Node::children(handle);
        for child in &children {
            if child.borrow().loaded {
                Node::trim(child, idle_threshold);
            }
        }

        let is_root = handle.borrow().parent.is_none();
        if is_root {
            return;
        }

        let mut n = handle.borrow_mut();
        if n.dirty || n.refs != 0 || n.atime.elapsed() < idle_threshold {
            return;
        }
        n.content = Content::Directory(Vec::new());
        n.info.name.clear();
        n.loaded = false;
    }

    pub fn to_record(&self) -> NodeRecord {
        let (children, blocks) = match &self.content {
            Content::Directory(children) => (
                children
                    .iter()
                    .map(|c| c.borrow().pointer.clone().expect("child stored before parent"))
                    .collect(),
                Vec::new(),
            ),
            Content::File(blocks) => (
                Vec::new(),
                blocks.iter().map(|b| b.current_ref().clone()).collect(),
            ),
        };
        NodeRecord {
            qid_type: self.info.qid_type,
            qid_path: self.info.id,
            qid_version: self.info.qid_version,
            name: self.info.name.clone(),
            sealed: self.sealed,
            block_capacity: self.bsize,
            mode: self.info.mode,
            length: self.info.size,
            mtime: self.info.mtime,
            children,
            blocks,
        }
    }

    /// Unconditionally appends `child` to a directory's child list,
    /// bypassing the name-collision check in [`Node::add`]. Used only by
    /// [`materialize`] to attach freshly decoded stub children, whose
    /// name is empty until they are themselves loaded.
    fn attach_stub(parent: &NodeHandle, child: NodeHandle) {
        if let Content::Directory(children) = &mut parent.borrow_mut().content {
            children.push(child);
        }
    }

    /// Applies a decoded record to this (stub) node, finishing
    /// materialization. Children are left as stub nodes for the caller
    /// (the store) to attach; file blocks are fully primed here.
    pub fn apply_record(&mut self, record: NodeRecord, uid: u32, gid: u32) {
        self.info = NodeInfo {
            id: record.qid_path,
            qid_type: record.qid_type,
            qid_version: record.qid_version,
            name: record.name,
            size: record.length,
            mode: record.mode,
            mtime: record.mtime,
            uid,
            gid,
        };
        self.bsize = record.block_capacity;
        self.sealed = record.sealed;
        self.dirty = false;

        if record.mode & DMDIR != 0 {
            self.content = Content::Directory(Vec::new());
        } else {
            let factory = self.content_factory();
            self.content = Content::File(
                record
                    .blocks
                    .into_iter()
                    .map(|r| factory.make(Some(r)))
                    .collect(),
            );
        }
        self.loaded = true;
    }
}

/// Finishes materializing a stub node from a decoded record: applies the
/// record's metadata/blocks, then (for directories) attaches a fresh stub
/// child for every child ref, ready to be grown in turn. Needs the handle
/// itself (not just `&mut Node`) to mint the children's weak parent links.
pub fn materialize(handle: &NodeHandle, record: NodeRecord, uid: u32, gid: u32) {
    let is_dir = record.mode & DMDIR != 0;
    let children_refs = record.children.clone();
    handle.borrow_mut().apply_record(record, uid, gid);

    if is_dir {
        let backing = handle.borrow().backing.clone();
        let bsize = handle.borrow().bsize;
        for r in children_refs {
            let stub = Node::new_stub(handle, r, backing.clone(), bsize);
            Node::attach_stub(handle, stub);
        }
    }
}

/// For each group of children sharing a name, the earliest-loaded (or
/// earliest-listed when tied) keeps the name; later loaded children are
/// renamed `name.dupeN` for the smallest nonnegative `N` not already used
/// by a sibling. Never-loaded children are skipped. Renamed children and
/// the parent are marked dirty.
pub fn make_child_names_unique(parent: &NodeHandle) {
    let children = Node::children(parent);

    let mut by_name: HashMap<String, Vec<NodeHandle>> = HashMap::new();
    for child in &children {
        if !child.borrow().loaded {
            continue;
        }
        by_name
            .entry(child.borrow().info.name.clone())
            .or_default()
            .push(child.clone());
    }

    let mut any_renamed = false;
    for (name, group) in by_name {
        if group.len() <= 1 {
            continue;
        }
        let mut used: std::collections::HashSet<String> =
            children.iter().map(|c| c.borrow().info.name.clone()).collect();

        for child in group.into_iter().skip(1) {
            let mut n = 0u32;
            let mut candidate = format!("{name}.dupe{n}");
            while used.contains(&candidate) {
                n += 1;
                candidate = format!("{name}.dupe{n}");
            }
            used.insert(candidate.clone());
            child.borrow_mut().info.name = candidate;
            child.borrow_mut().dirty = true;
            child.borrow_mut().sealed = false;
            any_renamed = true;
        }
    }

    if any_renamed {
        parent.borrow_mut().dirty = true;
        parent.borrow_mut().sealed = false;
    }
}
