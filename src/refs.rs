//! Tagged block identifiers: a 16-byte random index ref for mutable
//! blocks staged in the index, or a 32-byte SHA-256 repository ref for
//! immutable blocks sealed into the repository.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

const INDEX_REF_LEN: usize = 16;
const REPOSITORY_REF_LEN: usize = 32;

/// Opaque identifier for a block. Never reinterpret the raw bytes of one
/// variant as the other: the length alone distinguishes them, but their
/// provenance (random vs. content hash) does not.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Ref {
    Index([u8; INDEX_REF_LEN]),
    Repository([u8; REPOSITORY_REF_LEN]),
}

impl Ref {
    /// Mints a fresh random index ref.
    pub fn new_index() -> Self {
        let mut bytes = [0u8; INDEX_REF_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ref::Index(bytes)
    }

    /// Computes the repository ref (SHA-256) of `plaintext`.
    pub fn repository_of(plaintext: &[u8]) -> Self {
        let digest = Sha256::digest(plaintext);
        let mut bytes = [0u8; REPOSITORY_REF_LEN];
        bytes.copy_from_slice(&digest);
        Ref::Repository(bytes)
    }

    pub fn len(&self) -> usize {
        match self {
            Ref::Index(b) => b.len(),
            Ref::Repository(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Ref::Index(_))
    }

    pub fn is_repository(&self) -> bool {
        matches!(self, Ref::Repository(_))
    }

    /// A defensive copy of the raw bytes.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Ref::Index(b) => b.to_vec(),
            Ref::Repository(b) => b.to_vec(),
        }
    }

    /// Lowercase hex encoding, used verbatim as the KV storage key.
    pub fn key(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|b| Ref::from_bytes(&b))
    }

    /// Reconstructs a ref from raw bytes, dispatching on length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            INDEX_REF_LEN => {
                let mut b = [0u8; INDEX_REF_LEN];
                b.copy_from_slice(bytes);
                Some(Ref::Index(b))
            }
            REPOSITORY_REF_LEN => {
                let mut b = [0u8; REPOSITORY_REF_LEN];
                b.copy_from_slice(bytes);
                Some(Ref::Repository(b))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Index(_) => write!(f, "Ref::Index({})", self.key()),
            Ref::Repository(_) => write!(f, "Ref::Repository({})", self.key()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_ref_is_16_bytes_and_random() {
        let a = Ref::new_index();
        let b = Ref::new_index();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn repository_ref_is_sha256() {
        let r = Ref::repository_of(b"whiteboard");
        assert_eq!(r.len(), 32);
        assert!(r.is_repository());

        let digest = Sha256::digest(b"whiteboard");
        assert_eq!(r.bytes(), digest.to_vec());
    }

    #[test]
    fn repository_ref_is_deterministic() {
        assert_eq!(
            Ref::repository_of(b"same"),
            Ref::repository_of(b"same")
        );
    }

    #[test]
    fn hex_round_trip() {
        let r = Ref::new_index();
        let key = r.key();
        assert_eq!(key.len(), 32);
        assert_eq!(Ref::from_hex(&key).unwrap(), r);
    }
}
