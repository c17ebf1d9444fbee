//! Commit-like records chaining the tree's history into a DAG.

use crate::codec::RevisionRecord;
use crate::refs::Ref;

/// A revision: the ref of its own serialized encoding, the root node's
/// pointer, zero or more parent refs, a timestamp, and a host/instance
/// tag. `key` is only set once the revision has been stored.
#[derive(Debug, Clone)]
pub struct Revision {
    pub key: Option<Ref>,
    pub root: Option<Ref>,
    pub parents: Vec<Ref>,
    pub timestamp: u64,
    pub host: String,
    pub instance: String,
}

impl Revision {
    pub fn new(root: Option<Ref>, parents: Vec<Ref>, timestamp: u64, host: String, instance: String) -> Self {
        Self {
            key: None,
            root,
            parents,
            timestamp,
            host,
            instance,
        }
    }

    /// The parent treated as this revision's local-instance predecessor,
    /// by the legacy "last parent" convention: preserved here for
    /// compatibility, flagged in DESIGN.md as a convention rather than a
    /// guarantee.
    pub fn local_parent(&self) -> Option<&Ref> {
        self.parents.last()
    }

    pub(crate) fn to_record(&self) -> RevisionRecord {
        RevisionRecord {
            root: self.root.clone(),
            parents: self.parents.clone(),
            timestamp: self.timestamp,
            host: self.host.clone(),
            instance: self.instance.clone(),
        }
    }

    pub(crate) fn from_record(key: Ref, record: RevisionRecord) -> Self {
        Self {
            key: Some(key),
            root: record.root,
            parents: record.parents,
            timestamp: record.timestamp,
            host: record.host,
            instance: record.instance,
        }
    }
}
