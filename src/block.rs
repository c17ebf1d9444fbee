//! Encrypted, capacity-bounded blocks with an explicit `{primed, clean,
//! dirty}` state machine. The current [`Ref`]'s variant doubles as the
//! block's location tag (`Ref::Index` ⇒ staged in the index, `Ref::Repository`
//! ⇒ sealed into the repository), which makes `dirty ⇒ location=index`
//! true by construction rather than by a separately tracked flag.

use crate::cipher::BlockCipher;
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::refs::Ref;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FORGET_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No buffered plaintext; recoverable via `(location, ref)`.
    Primed,
    /// Buffered plaintext matches the stored ciphertext at `(location, ref)`.
    Clean,
    /// Buffered plaintext has not been persisted. Always index-located.
    Dirty,
}

/// A single encrypted, size-bounded byte buffer backed by the index and
/// repository key/value stores.
pub struct Block {
    capacity: usize,
    cipher: Arc<BlockCipher>,
    index: Arc<dyn KvStore>,
    repository: Arc<dyn KvStore>,
    state: State,
    r: Ref,
    value: Option<Vec<u8>>,
    atime: Instant,
}

impl Block {
    pub(crate) fn new_dirty(
        capacity: usize,
        cipher: Arc<BlockCipher>,
        index: Arc<dyn KvStore>,
        repository: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            capacity,
            cipher,
            index,
            repository,
            state: State::Dirty,
            r: Ref::new_index(),
            value: Some(Vec::new()),
            atime: Instant::now(),
        }
    }

    pub(crate) fn new_primed(
        capacity: usize,
        cipher: Arc<BlockCipher>,
        index: Arc<dyn KvStore>,
        repository: Arc<dyn KvStore>,
        r: Ref,
    ) -> Self {
        Self {
            capacity,
            cipher,
            index,
            repository,
            state: State::Primed,
            r,
            value: None,
            atime: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn current_ref(&self) -> &Ref {
        &self.r
    }

    pub fn is_dirty(&self) -> bool {
        self.state == State::Dirty
    }

    pub fn in_index(&self) -> bool {
        self.r.is_index()
    }

    fn store_for(&self) -> &Arc<dyn KvStore> {
        if self.r.is_index() {
            &self.index
        } else {
            &self.repository
        }
    }

    fn touch(&mut self) {
        self.atime = Instant::now();
    }

    /// Loads primed → clean, decrypting the stored ciphertext.
    fn ensure_readable(&mut self) -> Result<()> {
        self.touch();
        if self.value.is_some() {
            return Ok(());
        }
        let ciphertext = self.store_for().get(&self.r.key())?;
        let plaintext = self.cipher.decrypt(&ciphertext)?;
        self.value = Some(plaintext);
        self.state = State::Clean;
        Ok(())
    }

    /// Loads if necessary, then converts clean-repository → dirty-index
    /// by minting a new index ref. Clean-index blocks become dirty in
    /// place.
    fn ensure_writable(&mut self) -> Result<()> {
        self.ensure_readable()?;
        if self.state == State::Dirty {
            return Ok(());
        }
        if self.r.is_repository() {
            self.r = Ref::new_index();
        }
        self.state = State::Dirty;
        Ok(())
    }

    pub fn size(&mut self) -> Result<usize> {
        self.ensure_readable()?;
        Ok(self.value.as_ref().unwrap().len())
    }

    /// Copies bytes at `off` into `p`, returning the number copied. Short
    /// only at end-of-buffer; `off >= len` yields a zero-length read.
    pub fn read(&mut self, p: &mut [u8], off: usize) -> Result<usize> {
        self.ensure_readable()?;
        let value = self.value.as_ref().unwrap();
        if off >= value.len() {
            return Ok(0);
        }
        let n = p.len().min(value.len() - off);
        p[..n].copy_from_slice(&value[off..off + n]);
        Ok(n)
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        Ok(self.value.as_ref().unwrap().clone())
    }

    /// Shrinks by slicing, grows by appending zero bytes, up to capacity.
    pub fn truncate(&mut self, n: usize) -> Result<()> {
        if n > self.capacity {
            return Err(Error::Overflow {
                capacity: self.capacity,
                requested: n,
            });
        }
        self.ensure_readable()?;
        let value = self.value.as_mut().unwrap();
        if n <= value.len() {
            value.truncate(n);
        } else {
            value.resize(n, 0);
        }
        self.state = State::Dirty;
        if self.r.is_repository() {
            self.r = Ref::new_index();
        }
        Ok(())
    }

    /// Writes `p` at `off`, clipping to capacity and zero-padding any gap
    /// before `off`. Returns `(written, delta_size)`.
    pub fn write(&mut self, p: &[u8], off: usize) -> Result<(usize, i64)> {
        self.ensure_writable()?;
        let value = self.value.as_mut().unwrap();
        let original_len = value.len();

        let end = (off + p.len()).min(self.capacity);
        let written = end.saturating_sub(off);
        if written == 0 {
            return Ok((0, 0));
        }

        if value.len() < off {
            value.resize(off, 0);
        }
        if value.len() < end {
            value.resize(end, 0);
        }
        value[off..end].copy_from_slice(&p[..written]);

        let delta = value.len() as i64 - original_len as i64;
        Ok((written, delta))
    }

    /// Encrypts and writes the dirty buffer to the index; no-op unless
    /// dirty. Panics if dirty but not index-located (an impossible state
    /// by construction, guarded here as a debug assertion).
    pub fn flush(&mut self) -> Result<bool> {
        if self.state != State::Dirty {
            return Ok(false);
        }
        debug_assert!(self.r.is_index(), "dirty block must be index-located");

        let plaintext = self.value.as_ref().unwrap();
        let ciphertext = self.cipher.encrypt(plaintext)?;
        self.index.put(&self.r.key(), &ciphertext)?;
        self.state = State::Clean;
        debug!("block flush: ref={}", self.r.key());
        Ok(true)
    }

    /// Seals a clean-or-dirty index block into the repository under its
    /// content-addressed ref. No-op if already clean-in-repository.
    /// Idempotent: sealing the same plaintext twice writes no new
    /// repository object and yields the same ref.
    pub fn seal(&mut self) -> Result<bool> {
        if self.state != State::Dirty && self.r.is_repository() {
            return Ok(false);
        }
        self.ensure_readable()?;

        let plaintext = self.value.as_ref().unwrap().clone();
        let new_ref = Ref::repository_of(&plaintext);

        let old_index_key = if self.r.is_index() {
            Some(self.r.key())
        } else {
            None
        };

        if !self.repository.contains_key_best_effort(&new_ref.key()) {
            let ciphertext = self.cipher.encrypt(&plaintext)?;
            self.repository.put(&new_ref.key(), &ciphertext)?;
        }

        self.r = new_ref;
        self.state = State::Clean;

        if let Some(key) = old_index_key {
            if let Err(e) = self.index.delete(&key) {
                warn!("seal: best-effort delete of index key {key} failed: {e}");
            }
        }

        debug!("block seal: ref={}", self.r.key());
        Ok(true)
    }

    /// Drops the buffer if clean and idle for at least 60 seconds.
    pub fn forget(&mut self) -> bool {
        if self.state == State::Clean && self.atime.elapsed() >= FORGET_IDLE {
            self.value = None;
            self.state = State::Primed;
            true
        } else {
            false
        }
    }

    /// Drops the buffer and best-effort deletes the index entry,
    /// regardless of state.
    pub fn discard(&mut self) {
        self.value = None;
        self.state = State::Primed;
        if self.r.is_index() {
            if let Err(e) = self.index.delete(&self.r.key()) {
                warn!("discard: best-effort delete of index key {} failed: {e}", self.r.key());
            }
        }
    }

    /// Compares two blocks by repository-ref equality, sealing neither
    /// but loading as needed to compute a repository ref for comparison.
    pub fn same_value(&mut self, other: &mut Block) -> Result<bool> {
        if self.r.is_repository() && other.r.is_repository() {
            return Ok(self.r == other.r);
        }
        let a = self.read_all()?;
        let b = other.read_all()?;
        Ok(a == b)
    }
}

/// Extension used only by [`Block::seal`] to avoid writing duplicate
/// repository objects; falls back to "not present" when the store can't
/// answer cheaply.
trait BestEffortContains {
    fn contains_key_best_effort(&self, key: &str) -> bool;
}

impl BestEffortContains for dyn KvStore {
    fn contains_key_best_effort(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }
}

/// The cipher and stores shared by every block in a tree, independent of
/// any one block's capacity. [`Node`](crate::node::Node) keeps one of
/// these rather than a [`BlockFactory`] because it needs factories at two
/// different capacities: `bsize` for content blocks, and a fixed 1 MiB for
/// its own metadata block.
#[derive(Clone)]
pub struct Backing {
    pub cipher: Arc<BlockCipher>,
    pub index: Arc<dyn KvStore>,
    pub repository: Arc<dyn KvStore>,
}

impl Backing {
    pub fn new(cipher: Arc<BlockCipher>, index: Arc<dyn KvStore>, repository: Arc<dyn KvStore>) -> Self {
        Self {
            cipher,
            index,
            repository,
        }
    }
}

/// Constructs blocks sharing a cipher, index/repository stores, and
/// capacity.
pub struct BlockFactory {
    capacity: usize,
    cipher: Arc<BlockCipher>,
    index: Arc<dyn KvStore>,
    repository: Arc<dyn KvStore>,
}

impl BlockFactory {
    pub fn new(
        capacity: usize,
        cipher: Arc<BlockCipher>,
        index: Arc<dyn KvStore>,
        repository: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            capacity,
            cipher,
            index,
            repository,
        }
    }

    pub fn builder() -> BlockFactoryBuilder {
        BlockFactoryBuilder::default()
    }

    pub fn from_backing(capacity: usize, backing: &Backing) -> Self {
        Self {
            capacity,
            cipher: backing.cipher.clone(),
            index: backing.index.clone(),
            repository: backing.repository.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Dispatches on ref presence: `None` yields a brand-new dirty-index
    /// block; `Some(r)` yields a primed block at `r`'s location.
    pub fn make(&self, r: Option<Ref>) -> Block {
        match r {
            None => {
                Block::new_dirty(self.capacity, self.cipher.clone(), self.index.clone(), self.repository.clone())
            }
            Some(r) => Block::new_primed(
                self.capacity,
                self.cipher.clone(),
                self.index.clone(),
                self.repository.clone(),
                r,
            ),
        }
    }
}

#[derive(Default)]
pub struct BlockFactoryBuilder {
    capacity: Option<usize>,
    cipher: Option<Arc<BlockCipher>>,
    index: Option<Arc<dyn KvStore>>,
    repository: Option<Arc<dyn KvStore>>,
}

impl BlockFactoryBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn cipher(mut self, cipher: Arc<BlockCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn index(mut self, index: Arc<dyn KvStore>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn KvStore>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn build(self) -> Result<BlockFactory> {
        Ok(BlockFactory {
            capacity: self
                .capacity
                .ok_or_else(|| Error::OptionClash("missing block capacity".into()))?,
            cipher: self
                .cipher
                .ok_or_else(|| Error::OptionClash("missing cipher".into()))?,
            index: self
                .index
                .ok_or_else(|| Error::OptionClash("missing index store".into()))?,
            repository: self
                .repository
                .ok_or_else(|| Error::OptionClash("missing repository store".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkv::fixture_factory;

    #[test]
    fn truncate_law() {
        let factory = fixture_factory(64);
        let mut block = factory.make(None);
        block.write(b"0123456789", 0).unwrap();

        block.truncate(6).unwrap();
        assert_eq!(block.size().unwrap(), 6);
        assert_eq!(block.read_all().unwrap(), b"012345");

        block.truncate(9).unwrap();
        assert_eq!(block.size().unwrap(), 9);
        assert_eq!(block.read_all().unwrap(), b"012345\0\0\0");

        assert!(matches!(
            block.truncate(1000),
            Err(Error::Overflow { .. })
        ));
        assert_eq!(block.size().unwrap(), 9);
    }

    #[test]
    fn write_law() {
        let factory = fixture_factory(64);
        let mut block = factory.make(None);

        let (written, delta) = block.write(b"hello", 3).unwrap();
        assert_eq!(written, 5);
        assert_eq!(delta, 8);
        assert_eq!(block.read_all().unwrap(), b"\0\0\0hello");

        let mut buf = [0u8; 5];
        let n = block.read(&mut buf, 3).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn flush_then_seal_is_content_addressed() {
        let factory = fixture_factory(64);
        let mut block = factory.make(None);
        block.write(b"whiteboard", 0).unwrap();

        assert!(block.flush().unwrap());
        assert!(!block.flush().unwrap());

        assert!(block.seal().unwrap());
        assert!(block.current_ref().is_repository());
        assert_eq!(block.current_ref(), &Ref::repository_of(b"whiteboard"));

        // Sealing twice is a no-op after the first call returns true.
        assert!(!block.seal().unwrap());
    }

    #[test]
    fn seal_is_idempotent_across_blocks() {
        let factory = fixture_factory(64);

        let mut a = factory.make(None);
        a.write(b"same content", 0).unwrap();
        a.seal().unwrap();

        let mut b = factory.make(None);
        b.write(b"same content", 0).unwrap();
        b.seal().unwrap();

        assert_eq!(a.current_ref(), b.current_ref());
    }

    #[test]
    fn forget_requires_idle_clean() {
        let factory = fixture_factory(64);
        let mut block = factory.make(None);
        block.write(b"data", 0).unwrap();
        // still dirty: forget must refuse.
        assert!(!block.forget());
        block.flush().unwrap();
        // clean but not idle yet.
        assert!(!block.forget());
    }

    #[test]
    fn write_clips_to_capacity() {
        let factory = fixture_factory(4);
        let mut block = factory.make(None);
        let (written, _) = block.write(b"abcdef", 0).unwrap();
        assert_eq!(written, 4);
        assert_eq!(block.read_all().unwrap(), b"abcd");
    }
}
