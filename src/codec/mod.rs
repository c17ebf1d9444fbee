//! Versioned serializers for [`NodeRecord`] and [`RevisionRecord`].
//! Encoding always prepends the latest-known version byte; decoding
//! dispatches on the leading byte and fails with [`Error::NoCodec`] for an
//! unregistered version.

pub mod node;
pub mod revision;

use crate::error::{Error, Result};
pub use node::{NodeCodecImpl, NodeRecord};
pub use revision::{RevisionCodecImpl, RevisionRecord};
use std::collections::HashMap;

/// A small length-prefixed-byte-string cursor shared by both codec
/// families, matching the wire layouts in the external interfaces
/// section: multi-byte integers are big-endian.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Internal("codec: unexpected end of buffer".into()))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| Error::Internal("codec: unexpected end of buffer".into()))?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub(crate) fn len_prefixed_u8(&mut self) -> Result<&'a [u8]> {
        let n = self.u8()? as usize;
        self.bytes(n)
    }

    pub(crate) fn len_prefixed_u16(&mut self) -> Result<&'a [u8]> {
        let n = self.u16()? as usize;
        self.bytes(n)
    }

    /// Fails if any bytes remain: detects drift between encoder and
    /// decoder versions.
    pub(crate) fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::Internal(format!(
                "codec: {} trailing byte(s) after decode",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub(crate) fn push_u16(out: &mut Vec<u8>, n: u16) {
    out.extend_from_slice(&n.to_be_bytes());
}

pub(crate) fn push_u32(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_be_bytes());
}

pub(crate) fn push_u64(out: &mut Vec<u8>, n: u64) {
    out.extend_from_slice(&n.to_be_bytes());
}

pub(crate) fn push_len_prefixed_u8(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

pub(crate) fn push_len_prefixed_u16(out: &mut Vec<u8>, bytes: &[u8]) {
    push_u16(out, bytes.len() as u16);
    out.extend_from_slice(bytes);
}

/// Dispatches Node encode/decode calls to the registered version codecs.
pub struct NodeCodecRegistry {
    codecs: HashMap<u8, Box<dyn NodeCodecImpl>>,
    latest: u8,
}

impl NodeCodecRegistry {
    /// The registry carrying the current codec plus the back-compat
    /// decoders for versions 13 and 14.
    pub fn standard() -> Self {
        let mut codecs: HashMap<u8, Box<dyn NodeCodecImpl>> = HashMap::new();
        codecs.insert(13, Box::new(node::NodeCodecV13));
        codecs.insert(14, Box::new(node::NodeCodecV14));
        codecs.insert(15, Box::new(node::NodeCodecV15));
        Self { codecs, latest: 15 }
    }

    pub fn encode(&self, record: &NodeRecord) -> Vec<u8> {
        self.codecs[&self.latest].encode(record)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<NodeRecord> {
        let version = *bytes
            .first()
            .ok_or_else(|| Error::Internal("codec: empty node payload".into()))?;
        let codec = self.codecs.get(&version).ok_or(Error::NoCodec {
            version,
            key: None,
        })?;
        codec.decode(&bytes[1..])
    }
}

/// Dispatches Revision encode/decode calls to the registered version
/// codecs.
pub struct RevisionCodecRegistry {
    codecs: HashMap<u8, Box<dyn RevisionCodecImpl>>,
    latest: u8,
}

impl RevisionCodecRegistry {
    pub fn standard() -> Self {
        let mut codecs: HashMap<u8, Box<dyn RevisionCodecImpl>> = HashMap::new();
        codecs.insert(15, Box::new(revision::RevisionCodecV15));
        Self { codecs, latest: 15 }
    }

    pub fn encode(&self, record: &RevisionRecord) -> Vec<u8> {
        self.codecs[&self.latest].encode(record)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<RevisionRecord> {
        let version = *bytes
            .first()
            .ok_or_else(|| Error::Internal("codec: empty revision payload".into()))?;
        let codec = self.codecs.get(&version).ok_or(Error::NoCodec {
            version,
            key: None,
        })?;
        codec.decode(&bytes[1..])
    }
}
