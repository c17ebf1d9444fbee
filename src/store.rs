//! Codec-versioned persistence for [`Node`]s and [`Revision`]s, plus the
//! local and remote head pointers that name an instance's current
//! revision. Depth-first save order (children before parents) is the
//! caller's responsibility ([`crate::tree::Tree`]); the store only
//! encodes, writes, and reads back individual records.

use crate::block::{Backing, BlockFactory};
use crate::codec::{NodeCodecRegistry, NodeRecord, RevisionCodecRegistry};
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::node::{self, NodeHandle, METADATA_BLOCK_CAPACITY};
use crate::refs::Ref;
use crate::revision::Revision;
use log::{debug, warn};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const REMOTE_HEAD_PREFIX: &str = "remote.root.";

/// Persistence for nodes and revisions: codec registries, the shared
/// block backing, the pointers store that carries remote head pointers,
/// and the local head pointer file.
pub struct Store {
    node_codec: NodeCodecRegistry,
    revision_codec: RevisionCodecRegistry,
    backing: Backing,
    pointers: Arc<dyn KvStore>,
    local_head_path: PathBuf,
    uid: u32,
    gid: u32,
}

impl Store {
    pub fn new(
        backing: Backing,
        pointers: Arc<dyn KvStore>,
        local_head_path: impl Into<PathBuf>,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            node_codec: NodeCodecRegistry::standard(),
            revision_codec: RevisionCodecRegistry::standard(),
            backing,
            pointers,
            local_head_path: local_head_path.into(),
            uid,
            gid,
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    fn metadata_factory(&self) -> BlockFactory {
        BlockFactory::from_backing(METADATA_BLOCK_CAPACITY, &self.backing)
    }

    /// Loads and decodes the node record for a raw ref, without touching
    /// any [`NodeHandle`]. Pure with respect to the tree (only the ref and
    /// the backing stores are read), which makes it safe to call from a
    /// bounded-parallel fan-out: [`crate::tree::Tree::grow`] uses this to
    /// fetch many children's records concurrently before reattaching them
    /// to the (non-`Send`) in-memory tree on the calling thread.
    pub fn fetch_node_record(&self, r: &Ref) -> Result<NodeRecord> {
        let mut block = self.metadata_factory().make(Some(r.clone()));
        let payload = block.read_all()?;
        self.node_codec.decode(&payload)
    }

    /// Materializes a stub node from its own `pointer`.
    pub fn load_node(&self, dst: &NodeHandle) -> Result<()> {
        let pointer = dst
            .borrow()
            .pointer()
            .cloned()
            .ok_or_else(|| Error::Internal("load_node: stub has no pointer".into()))?;
        let record = self.fetch_node_record(&pointer)?;
        node::materialize(dst, record, self.uid, self.gid);
        Ok(())
    }

    /// Encodes `node`, writing its metadata block to the index. Reuses the
    /// node's existing metadata block in place when it already has a
    /// pointer; otherwise mints a fresh one.
    pub fn store_node(&self, handle: &NodeHandle) -> Result<()> {
        let record = handle.borrow().to_record();
        let payload = self.node_codec.encode(&record);

        let mut block = handle.borrow().metadata_block();
        block.truncate(0)?;
        block.write(&payload, 0)?;
        block.flush()?;

        let mut n = handle.borrow_mut();
        n.set_pointer(block.current_ref().clone());
        n.clear_dirty();
        debug!("store_node: path written, ref={}", block.current_ref().key());
        Ok(())
    }

    /// Sets `sealed`, re-encodes (the flag is part of the hash input), and
    /// seals the metadata block into the repository. On failure the
    /// `sealed` flag is reverted, since the node's content-addressed
    /// pointer depends on it being set at hash time.
    pub fn seal_node(&self, handle: &NodeHandle) -> Result<()> {
        handle.borrow_mut().set_sealed(true);
        let record = handle.borrow().to_record();
        let payload = self.node_codec.encode(&record);

        let mut block = handle.borrow().metadata_block();
        block.truncate(0)?;
        block.write(&payload, 0)?;

        match block.seal() {
            Ok(_) => {
                let mut n = handle.borrow_mut();
                n.set_pointer(block.current_ref().clone());
                n.clear_dirty();
                Ok(())
            }
            Err(e) => {
                handle.borrow_mut().set_sealed(false);
                Err(e)
            }
        }
    }

    /// Encodes and seals `rev`, setting its `key` to the resulting ref.
    pub fn store_revision(&self, rev: &mut Revision) -> Result<()> {
        let record = rev.to_record();
        let payload = self.revision_codec.encode(&record);

        let mut block = self.metadata_factory().make(None);
        block.truncate(0)?;
        block.write(&payload, 0)?;
        block.seal()?;

        rev.key = Some(block.current_ref().clone());
        Ok(())
    }

    pub fn load_revision_by_key(&self, key: &Ref) -> Result<Revision> {
        let mut block = self.metadata_factory().make(Some(key.clone()));
        let payload = block.read_all()?;
        let record = self.revision_codec.decode(&payload)?;
        Ok(Revision::from_record(key.clone(), record))
    }

    /// Reads the local head pointer file: a single line of 64 lowercase
    /// hex characters, no trailing newline required.
    pub fn read_local_head(&self) -> Result<Option<Ref>> {
        match fs::read_to_string(&self.local_head_path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                Ref::from_hex(trimmed)
                    .map(Some)
                    .ok_or_else(|| Error::Internal(format!("malformed local head: {trimmed}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the local head pointer via write-temp-then-rename, so a
    /// concurrent reader never observes a partial write.
    pub fn write_local_head(&self, r: &Ref) -> Result<()> {
        let tmp = tmp_path(&self.local_head_path);
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(r.key().as_bytes())?;
        }
        fs::rename(&tmp, &self.local_head_path)?;
        Ok(())
    }

    fn remote_head_key(instance: &str) -> String {
        format!("{REMOTE_HEAD_PREFIX}{instance}")
    }

    pub fn read_remote_head(&self, instance: &str) -> Result<Option<Ref>> {
        match self.pointers.get(&Self::remote_head_key(instance)) {
            Ok(bytes) => {
                let hex = String::from_utf8_lossy(&bytes);
                Ref::from_hex(hex.trim())
                    .map(Some)
                    .ok_or_else(|| Error::Internal(format!("malformed remote head: {hex}")))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_remote_head(&self, instance: &str, r: &Ref) -> Result<()> {
        self.pointers
            .put(&Self::remote_head_key(instance), r.key().as_bytes())
    }

    /// Walks the parent chain from `head`, following the legacy
    /// "last parent is the local-instance parent" convention, up to `max`
    /// revisions.
    pub fn history(&self, max: usize, head: &Ref) -> Result<Vec<Revision>> {
        let mut out = Vec::new();
        let mut current = Some(head.clone());
        while let Some(key) = current {
            if out.len() >= max {
                break;
            }
            let rev = self.load_revision_by_key(&key)?;
            let next = rev.local_parent().cloned();
            out.push(rev);
            current = next;
        }
        Ok(out)
    }

    /// Reads `source`'s remote head revision and mints a new revision for
    /// `target` with the same root and a parent link back to it,
    /// recording the fork point without changing any tree content. Writes
    /// `target`'s remote head only if it is not already set.
    pub fn fork(
        &self,
        source_instance: &str,
        target_instance: &str,
        host: &str,
        timestamp: u64,
    ) -> Result<Ref> {
        let source_head = self
            .read_remote_head(source_instance)?
            .ok_or_else(|| Error::NotFound(Self::remote_head_key(source_instance)))?;
        let source_rev = self.load_revision_by_key(&source_head)?;

        let mut new_rev = Revision::new(
            source_rev.root.clone(),
            vec![source_head],
            timestamp,
            host.to_string(),
            target_instance.to_string(),
        );
        self.store_revision(&mut new_rev)?;
        let key = new_rev.key.clone().expect("store_revision sets key");

        if self.read_remote_head(target_instance)?.is_none() {
            self.write_remote_head(target_instance, &key)?;
        } else {
            warn!("fork: target instance {target_instance} already has a remote head, not overwriting");
        }
        Ok(key)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Raw block reference, unconcerned with the [`Ref`] type: used by `Seal`
/// to compute the closure of reachable content-addressed keys.
pub fn reachable_from_node(store: &Store, root: &Ref, out: &mut std::collections::HashSet<String>) -> Result<()> {
    if !out.insert(root.key()) {
        return Ok(());
    }
    let record = store.fetch_node_record(root)?;
    for r in &record.blocks {
        out.insert(r.key());
    }
    for child in &record.children {
        reachable_from_node(store, child, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, DMDIR};
    use crate::testkv::fixture_backing;
    use tempfile::tempdir;

    fn fixture_store(dir: &Path) -> Store {
        let backing = fixture_backing();
        let pointers: Arc<dyn KvStore> = Arc::new(crate::kv::memory::MemoryStore::new());
        Store::new(backing, pointers, dir.join("head"), 1000, 1000)
    }

    #[test]
    fn store_then_load_round_trips_a_file_node() {
        let dir = tempdir().unwrap();
        let store = fixture_store(dir.path());

        let root = Node::new_root(store.backing().clone(), 6, 0o755, 1000, 1000);
        let f = Node::new_child(&root, "f", 0o644, 1000, 1000);
        Node::add(&root, f.clone());
        f.borrow_mut().write(b"hello world!", 0).unwrap();

        for b in f.borrow_mut().blocks_mut().unwrap().iter_mut() {
            b.flush().unwrap();
        }
        store.store_node(&f).unwrap();
        let pointer = f.borrow().pointer().unwrap().clone();

        let stub = Node::new_stub(&root, pointer, store.backing().clone(), 6);
        store.load_node(&stub).unwrap();

        assert_eq!(stub.borrow().info().name, "f");
        let mut buf = [0u8; 12];
        stub.borrow_mut().read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello world!");
    }

    #[test]
    fn seal_node_sets_sealed_flag_and_pointer() {
        let dir = tempdir().unwrap();
        let store = fixture_store(dir.path());
        let root = Node::new_root(store.backing().clone(), 6, 0o755 | DMDIR, 1000, 1000);
        store.seal_node(&root).unwrap();
        assert!(root.borrow().is_sealed());
        assert!(root.borrow().pointer().unwrap().is_repository());
    }

    #[test]
    fn local_head_round_trips_via_temp_rename() {
        let dir = tempdir().unwrap();
        let store = fixture_store(dir.path());
        assert!(store.read_local_head().unwrap().is_none());

        let r = Ref::repository_of(b"revision bytes");
        store.write_local_head(&r).unwrap();
        assert_eq!(store.read_local_head().unwrap(), Some(r));
    }

    #[test]
    fn remote_head_key_format() {
        assert_eq!(Store::remote_head_key("alpha"), "remote.root.alpha");
    }

    #[test]
    fn fork_copies_root_and_chains_parent() {
        let dir = tempdir().unwrap();
        let store = fixture_store(dir.path());

        let root_ref = Ref::repository_of(b"root contents");
        let mut rev = Revision::new(Some(root_ref.clone()), vec![], 1_000, "alpha".into(), "alpha-laptop".into());
        store.store_revision(&mut rev).unwrap();
        store
            .write_remote_head("alpha-laptop", rev.key.as_ref().unwrap())
            .unwrap();

        let forked = store
            .fork("alpha-laptop", "beta-phone", "beta", 2_000)
            .unwrap();
        let forked_rev = store.load_revision_by_key(&forked).unwrap();
        assert_eq!(forked_rev.root, Some(root_ref));
        assert_eq!(forked_rev.parents, vec![rev.key.clone().unwrap()]);
        assert_eq!(
            store.read_remote_head("beta-phone").unwrap(),
            Some(forked)
        );
    }
}
