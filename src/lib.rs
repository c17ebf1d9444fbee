//! A versioned, content-addressed, end-to-end-encrypted file system
//! storage engine. Users mutate an in-memory Merkle [`tree`] of [`node`]s;
//! dirty subtrees are periodically flushed to a mutable local index and
//! later sealed into an immutable, content-addressed repository, forming
//! new [`revision`]s chained into a history DAG. [`mergebase`] and
//! [`merge`] reconcile divergent revisions between instances.
//!
//! Out of scope: the 9P-style file-server front end, the CLI front end
//! beyond the maintenance binary, concrete backing stores beyond the
//! disk/memory reference implementations in [`kv`], the text-diff
//! presentation subsystem, and any GUI/plumbing integration.

pub mod block;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod kv;
pub mod merge;
pub mod mergebase;
pub mod node;
pub mod paired;
pub mod refs;
pub mod revision;
pub mod store;
#[cfg(test)]
pub mod testkv;
pub mod tree;

pub use error::{Error, Result};
