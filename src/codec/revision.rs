//! Revision wire encoding (version 15, the only version ever produced or
//! consumed).

use super::{push_len_prefixed_u16, push_len_prefixed_u8, push_u64, Reader};
use crate::error::Result;
use crate::refs::Ref;

/// The plain-data projection of a [`crate::revision::Revision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub root: Option<Ref>,
    pub parents: Vec<Ref>,
    pub timestamp: u64,
    pub host: String,
    pub instance: String,
}

pub trait RevisionCodecImpl: Send + Sync {
    fn version(&self) -> u8;
    fn encode(&self, record: &RevisionRecord) -> Vec<u8>;
    fn decode(&self, body: &[u8]) -> Result<RevisionRecord>;
}

pub struct RevisionCodecV15;

impl RevisionCodecImpl for RevisionCodecV15 {
    fn version(&self) -> u8 {
        15
    }

    fn encode(&self, record: &RevisionRecord) -> Vec<u8> {
        let mut out = vec![self.version()];
        match &record.root {
            Some(r) => push_len_prefixed_u8(&mut out, &r.bytes()),
            None => out.push(0),
        }
        out.push(record.parents.len() as u8);
        for p in &record.parents {
            push_len_prefixed_u8(&mut out, &p.bytes());
        }
        push_u64(&mut out, record.timestamp);
        push_len_prefixed_u16(&mut out, record.host.as_bytes());
        push_len_prefixed_u16(&mut out, record.instance.as_bytes());
        out
    }

    fn decode(&self, body: &[u8]) -> Result<RevisionRecord> {
        let mut r = Reader::new(body);

        let root_bytes = r.len_prefixed_u8()?;
        let root = if root_bytes.is_empty() {
            None
        } else {
            Some(Ref::from_bytes(root_bytes).ok_or_else(|| {
                crate::error::Error::Internal("codec: malformed root ref".into())
            })?)
        };

        let parent_count = r.u8()? as usize;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            let bytes = r.len_prefixed_u8()?;
            parents.push(Ref::from_bytes(bytes).ok_or_else(|| {
                crate::error::Error::Internal("codec: malformed parent ref".into())
            })?);
        }

        let timestamp = r.u64()?;
        let host = String::from_utf8_lossy(r.len_prefixed_u16()?).into_owned();
        let instance = String::from_utf8_lossy(r.len_prefixed_u16()?).into_owned();
        r.finish()?;

        Ok(RevisionRecord {
            root,
            parents,
            timestamp,
            host,
            instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RevisionCodecRegistry;

    #[test]
    fn round_trip_with_root_and_parents() {
        let registry = RevisionCodecRegistry::standard();
        let record = RevisionRecord {
            root: Some(Ref::repository_of(b"root")),
            parents: vec![Ref::repository_of(b"p1"), Ref::repository_of(b"p2")],
            timestamp: 1_700_000_123,
            host: "alpha".into(),
            instance: "alpha-laptop".into(),
        };
        let encoded = registry.encode(&record);
        assert_eq!(registry.decode(&encoded).unwrap(), record);
    }

    #[test]
    fn round_trip_with_null_root_no_parents() {
        let registry = RevisionCodecRegistry::standard();
        let record = RevisionRecord {
            root: None,
            parents: vec![],
            timestamp: 0,
            host: "".into(),
            instance: "".into(),
        };
        let encoded = registry.encode(&record);
        assert_eq!(registry.decode(&encoded).unwrap(), record);
    }
}
