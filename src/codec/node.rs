//! Node wire encoding. Version 15 is the only version ever produced by
//! [`crate::codec::NodeCodecRegistry::encode`]; versions 13 and 14 are
//! decode-only, kept for reading nodes sealed by older instances.

use super::{
    push_len_prefixed_u8, push_len_prefixed_u16, push_u32, push_u64, Reader,
};
use crate::error::Result;
use crate::refs::Ref;

/// Persisted flag bits. Only `sealed` is ever written; `loaded`/`dirty`
/// are runtime-only and always zeroed on encode.
pub const FLAG_SEALED: u8 = 1 << 0;

const DEFAULT_BLOCK_CAPACITY: u32 = 1 << 20;

/// The plain-data projection of a [`crate::node::Node`] used for
/// serialization. Carries no parent pointer, refs count, or in-memory-only
/// flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub qid_type: u8,
    pub qid_path: u64,
    pub qid_version: u32,
    pub name: String,
    pub sealed: bool,
    /// Block capacity for new child blocks (`bsize`). Zero decodes to
    /// [`DEFAULT_BLOCK_CAPACITY`].
    pub block_capacity: u32,
    pub mode: u32,
    pub length: u64,
    pub mtime: u32,
    pub children: Vec<Ref>,
    pub blocks: Vec<Ref>,
}

pub trait NodeCodecImpl: Send + Sync {
    fn version(&self) -> u8;
    fn encode(&self, record: &NodeRecord) -> Vec<u8>;
    fn decode(&self, body: &[u8]) -> Result<NodeRecord>;
}

fn encode_refs(out: &mut Vec<u8>, refs: &[Ref]) {
    push_u32(out, refs.len() as u32);
    for r in refs {
        push_len_prefixed_u8(out, &r.bytes());
    }
}

fn decode_refs(r: &mut Reader) -> Result<Vec<Ref>> {
    let count = r.u32()? as usize;
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        let bytes = r.len_prefixed_u8()?;
        refs.push(Ref::from_bytes(bytes).ok_or_else(|| {
            crate::error::Error::Internal(format!("codec: malformed ref ({} bytes)", bytes.len()))
        })?);
    }
    Ok(refs)
}

fn resolved_capacity(raw: u32) -> u32 {
    if raw == 0 {
        DEFAULT_BLOCK_CAPACITY
    } else {
        raw
    }
}

/// Version 15 (latest): adds the reserved 4-byte skip area after mtime.
pub struct NodeCodecV15;

impl NodeCodecImpl for NodeCodecV15 {
    fn version(&self) -> u8 {
        15
    }

    fn encode(&self, record: &NodeRecord) -> Vec<u8> {
        let mut out = vec![self.version()];
        out.push(record.qid_type);
        push_u64(&mut out, record.qid_path);
        push_u32(&mut out, record.qid_version);
        push_len_prefixed_u16(&mut out, record.name.as_bytes());
        out.push(if record.sealed { FLAG_SEALED } else { 0 });
        push_u32(&mut out, record.block_capacity);
        push_u32(&mut out, record.mode);
        push_u64(&mut out, record.length);
        push_u32(&mut out, record.mtime);
        push_u32(&mut out, 0); // reserved
        encode_refs(&mut out, &record.children);
        encode_refs(&mut out, &record.blocks);
        out
    }

    fn decode(&self, body: &[u8]) -> Result<NodeRecord> {
        let mut r = Reader::new(body);
        let qid_type = r.u8()?;
        let qid_path = r.u64()?;
        let qid_version = r.u32()?;
        let name = String::from_utf8_lossy(r.len_prefixed_u16()?).into_owned();
        let flags = r.u8()?;
        let block_capacity = resolved_capacity(r.u32()?);
        let mode = r.u32()?;
        let length = r.u64()?;
        let mtime = r.u32()?;
        let _reserved = r.u32()?; // legacy pack area; never interpreted
        let children = decode_refs(&mut r)?;
        let blocks = decode_refs(&mut r)?;
        r.finish()?;

        Ok(NodeRecord {
            qid_type,
            qid_path,
            qid_version,
            name,
            sealed: flags & FLAG_SEALED != 0,
            block_capacity,
            mode,
            length,
            mtime,
            children,
            blocks,
        })
    }
}

/// Version 14: same as 15 but without the reserved skip area.
pub struct NodeCodecV14;

impl NodeCodecImpl for NodeCodecV14 {
    fn version(&self) -> u8 {
        14
    }

    fn encode(&self, record: &NodeRecord) -> Vec<u8> {
        let mut out = vec![self.version()];
        out.push(record.qid_type);
        push_u64(&mut out, record.qid_path);
        push_u32(&mut out, record.qid_version);
        push_len_prefixed_u16(&mut out, record.name.as_bytes());
        out.push(if record.sealed { FLAG_SEALED } else { 0 });
        push_u32(&mut out, record.block_capacity);
        push_u32(&mut out, record.mode);
        push_u64(&mut out, record.length);
        push_u32(&mut out, record.mtime);
        encode_refs(&mut out, &record.children);
        encode_refs(&mut out, &record.blocks);
        out
    }

    fn decode(&self, body: &[u8]) -> Result<NodeRecord> {
        let mut r = Reader::new(body);
        let qid_type = r.u8()?;
        let qid_path = r.u64()?;
        let qid_version = r.u32()?;
        let name = String::from_utf8_lossy(r.len_prefixed_u16()?).into_owned();
        let flags = r.u8()?;
        let block_capacity = resolved_capacity(r.u32()?);
        let mode = r.u32()?;
        let length = r.u64()?;
        let mtime = r.u32()?;
        let children = decode_refs(&mut r)?;
        let blocks = decode_refs(&mut r)?;
        r.finish()?;

        Ok(NodeRecord {
            qid_type,
            qid_path,
            qid_version,
            name,
            sealed: flags & FLAG_SEALED != 0,
            block_capacity,
            mode,
            length,
            mtime,
            children,
            blocks,
        })
    }
}

/// Version 13: predates per-node block capacity and the sealed flag.
pub struct NodeCodecV13;

impl NodeCodecImpl for NodeCodecV13 {
    fn version(&self) -> u8 {
        13
    }

    fn encode(&self, record: &NodeRecord) -> Vec<u8> {
        let mut out = vec![self.version()];
        out.push(record.qid_type);
        push_u64(&mut out, record.qid_path);
        push_u32(&mut out, record.qid_version);
        push_len_prefixed_u16(&mut out, record.name.as_bytes());
        push_u32(&mut out, record.mode);
        push_u64(&mut out, record.length);
        push_u32(&mut out, record.mtime);
        encode_refs(&mut out, &record.children);
        encode_refs(&mut out, &record.blocks);
        out
    }

    fn decode(&self, body: &[u8]) -> Result<NodeRecord> {
        let mut r = Reader::new(body);
        let qid_type = r.u8()?;
        let qid_path = r.u64()?;
        let qid_version = r.u32()?;
        let name = String::from_utf8_lossy(r.len_prefixed_u16()?).into_owned();
        let mode = r.u32()?;
        let length = r.u64()?;
        let mtime = r.u32()?;
        let children = decode_refs(&mut r)?;
        let blocks = decode_refs(&mut r)?;
        r.finish()?;

        Ok(NodeRecord {
            qid_type,
            qid_path,
            qid_version,
            name,
            sealed: false,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            mode,
            length,
            mtime,
            children,
            blocks,
        })
    }
}
