//! Abstract key/value storage contract shared by the index and repository
//! tiers. Concrete backends (on-disk, S3, paired write-back) are external
//! collaborators; only the contract and a couple of thin reference
//! implementations used by the CLI live here.

use crate::error::{Error, Result};

/// Minimal mapping from opaque string keys to byte-string values.
///
/// `get` fails with [`Error::NotFound`] when the key is absent. Callers
/// should assume any other error is retriable: implementations may be
/// remote and latent.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Optional extension for stores that can answer membership and
/// enumeration queries without transferring values.
pub trait Enumerable: KvStore {
    fn contains(&self, key: &str) -> Result<bool>;

    /// Invoke `callback` once per stored key. Iteration order is
    /// unspecified.
    fn for_each(&self, callback: &mut dyn FnMut(&str) -> Result<()>) -> Result<()>;
}

/// Optional extension for stores that can stream their key space.
pub trait Lister: KvStore {
    fn keys(&self) -> Result<Vec<String>>;
}

/// A disk-backed store sharded by the first two hex characters of each
/// key, as described by the on-disk block layout: `<root>/<xx>/<key>`,
/// files mode 0600, shard directories mode 0700.
pub mod disk {
    use super::*;
    use std::fs;
    use std::io::ErrorKind;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    pub struct DiskStore {
        root: PathBuf,
    }

    impl DiskStore {
        pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
            let root = root.into();
            fs::create_dir_all(&root)?;
            Ok(Self { root })
        }

        fn shard_dir(&self, key: &str) -> Result<PathBuf> {
            if key.len() < 2 {
                return Err(Error::Internal(format!("key too short to shard: {key}")));
            }
            Ok(self.root.join(&key[..2]))
        }

        fn path_for(&self, key: &str) -> Result<PathBuf> {
            Ok(self.shard_dir(key)?.join(key))
        }

        fn ensure_shard(&self, dir: &Path) -> Result<()> {
            fs::create_dir_all(dir)?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            Ok(())
        }
    }

    impl KvStore for DiskStore {
        fn get(&self, key: &str) -> Result<Vec<u8>> {
            let path = self.path_for(key)?;
            match fs::read(&path) {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(key.to_string())),
                Err(e) => Err(e.into()),
            }
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            let dir = self.shard_dir(key)?;
            self.ensure_shard(&dir)?;
            let path = self.path_for(key)?;
            fs::write(&path, value)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            let path = self.path_for(key)?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    impl Enumerable for DiskStore {
        fn contains(&self, key: &str) -> Result<bool> {
            Ok(self.path_for(key)?.exists())
        }

        fn for_each(&self, callback: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
            for shard in fs::read_dir(&self.root)? {
                let shard = shard?;
                if !shard.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(shard.path())? {
                    let entry = entry?;
                    if let Some(name) = entry.file_name().to_str() {
                        callback(name)?;
                    }
                }
            }
            Ok(())
        }
    }
}

/// A process-local in-memory store. Useful for the CLI's ephemeral
/// scenarios and for tests; not a substitute for the paired write-back
/// store used in production deployments.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryStore {
        data: RwLock<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl KvStore for MemoryStore {
        fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.data
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            self.data
                .write()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.data.write().unwrap().remove(key);
            Ok(())
        }
    }

    impl Enumerable for MemoryStore {
        fn contains(&self, key: &str) -> Result<bool> {
            Ok(self.data.read().unwrap().contains_key(key))
        }

        fn for_each(&self, callback: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
            let keys: Vec<String> = self.data.read().unwrap().keys().cloned().collect();
            for key in keys {
                callback(&key)?;
            }
            Ok(())
        }
    }

    impl Lister for MemoryStore {
        fn keys(&self) -> Result<Vec<String>> {
            Ok(self.data.read().unwrap().keys().cloned().collect())
        }
    }
}
