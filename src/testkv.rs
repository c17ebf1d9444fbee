//! In-memory fixtures shared by unit tests across the block, tree, store,
//! and merge layers. Not part of the public API: production callers
//! supply their own index/repository stores (disk, S3, paired
//! write-back).

use crate::block::{Backing, BlockFactory};
use crate::cipher::BlockCipher;
use crate::kv::memory::MemoryStore;
use crate::kv::KvStore;
use std::sync::Arc;

pub const TEST_KEY: [u8; 32] = [7u8; 32];

pub fn fixture_stores() -> (Arc<dyn KvStore>, Arc<dyn KvStore>) {
    (
        Arc::new(MemoryStore::new()) as Arc<dyn KvStore>,
        Arc::new(MemoryStore::new()) as Arc<dyn KvStore>,
    )
}

pub fn fixture_factory(capacity: usize) -> BlockFactory {
    let (index, repository) = fixture_stores();
    let cipher = Arc::new(BlockCipher::new(&TEST_KEY).unwrap());
    BlockFactory::new(capacity, cipher, index, repository)
}

pub fn fixture_backing() -> Backing {
    let (index, repository) = fixture_stores();
    let cipher = Arc::new(BlockCipher::new(&TEST_KEY).unwrap());
    Backing::new(cipher, index, repository)
}

pub fn fixture_factory_with_stores(
    capacity: usize,
    index: Arc<dyn KvStore>,
    repository: Arc<dyn KvStore>,
) -> BlockFactory {
    let cipher = Arc::new(BlockCipher::new(&TEST_KEY).unwrap());
    BlockFactory::new(capacity, cipher, index, repository)
}
