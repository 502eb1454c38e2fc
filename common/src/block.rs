//! Blocks and headers.
//!
//! A block is a header plus an opaque body. The on-disk encoding is the
//! CBOR header followed by the raw body bytes; the content hash is a
//! Blake2b-256 over the header's hashed fields, which pin the body via
//! its own digest and size.

use crate::hash::BlockHash;
use crate::point::Point;
use cryptoxide::hashing::blake2b::Blake2b;
use minicbor::data::Type;
use minicbor::{Decode, Decoder, Encode, Encoder};

/// Block header: the prefix of a block that identifies it and links it
/// to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Content hash; derived from the remaining fields.
    pub hash: BlockHash,
    /// Logical time. Strictly monotonic along a chain, except that an
    /// epoch boundary block shares its slot with its successor.
    pub slot: u64,
    /// Dense height counter, consecutive across parent and child.
    pub number: u64,
    /// Parent hash; `None` means the parent is genesis.
    pub prev_hash: Option<BlockHash>,
    /// Epoch boundary block marker.
    pub is_ebb: bool,
    /// Blake2b-256 of the body bytes.
    pub body_hash: BlockHash,
    /// Body length hint, so consumers can size fetches without the body.
    pub body_size: u32,
}

impl Header {
    /// The point identifying this header.
    pub fn point(&self) -> Point {
        Point::Specific(self.slot, self.hash)
    }

    /// The point of the parent: the previous block, or origin.
    ///
    /// The parent's slot is unknown from a header alone, so this is only
    /// meaningful as `Origin` vs not; use fragment lookups for full
    /// parent points.
    pub fn parent_is_genesis(&self) -> bool {
        self.prev_hash.is_none()
    }

    /// Recompute the content hash from the hashed fields.
    pub fn computed_hash(&self) -> BlockHash {
        let mut e = Encoder::new(Vec::new());
        // Infallible: writing to a Vec cannot fail
        let _ = e
            .array(6)
            .and_then(|e| e.u64(self.slot))
            .and_then(|e| e.u64(self.number))
            .and_then(|e| match &self.prev_hash {
                Some(h) => e.bytes(h.as_ref()),
                None => e.null(),
            })
            .and_then(|e| e.bool(self.is_ebb))
            .and_then(|e| e.bytes(self.body_hash.as_ref()))
            .and_then(|e| e.u32(self.body_size));
        hash_bytes(e.writer())
    }
}

impl<C> Encode<C> for Header {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(7)?;
        self.hash.encode(e, ctx)?;
        e.u64(self.slot)?;
        e.u64(self.number)?;
        match &self.prev_hash {
            Some(h) => {
                h.encode(e, ctx)?;
            }
            None => {
                e.null()?;
            }
        }
        e.bool(self.is_ebb)?;
        self.body_hash.encode(e, ctx)?;
        e.u32(self.body_size)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Header {
    fn decode(d: &mut Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        if d.array()? != Some(7) {
            return Err(minicbor::decode::Error::message("invalid header length"));
        }
        let hash = BlockHash::decode(d, ctx)?;
        let slot = d.u64()?;
        let number = d.u64()?;
        let prev_hash = if d.datatype()? == Type::Null {
            d.null()?;
            None
        } else {
            Some(BlockHash::decode(d, ctx)?)
        };
        let is_ebb = d.bool()?;
        let body_hash = BlockHash::decode(d, ctx)?;
        let body_size = d.u32()?;
        Ok(Header {
            hash,
            slot,
            number,
            prev_hash,
            is_ebb,
            body_hash,
            body_size,
        })
    }
}

/// A full block: header plus opaque body payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Block {
    /// Build a block, deriving the body digest and content hash.
    pub fn new(
        slot: u64,
        number: u64,
        prev_hash: Option<BlockHash>,
        is_ebb: bool,
        body: Vec<u8>,
    ) -> Self {
        let mut header = Header {
            hash: BlockHash::default(),
            slot,
            number,
            prev_hash,
            is_ebb,
            body_hash: hash_bytes(&body),
            body_size: body.len() as u32,
        };
        header.hash = header.computed_hash();
        Block { header, body }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    pub fn point(&self) -> Point {
        self.header.point()
    }

    /// Serialize to the raw on-disk encoding: CBOR header, then body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = minicbor::to_vec(&self.header).expect("header encoding is infallible");
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Length in bytes of the encoded header within [`Block::to_bytes`].
    pub fn header_size(&self) -> usize {
        minicbor::to_vec(&self.header).expect("header encoding is infallible").len()
    }

    /// Parse the raw encoding back into a block.
    ///
    /// Checks the framing (body length must match the header's size
    /// hint) but not the hashes; call [`Block::verify_integrity`] for
    /// that.
    pub fn from_bytes(bytes: &[u8]) -> Result<Block, minicbor::decode::Error> {
        let mut d = Decoder::new(bytes);
        let header: Header = d.decode()?;
        let body = bytes[d.position()..].to_vec();
        if body.len() != header.body_size as usize {
            return Err(minicbor::decode::Error::message("body length mismatch"));
        }
        Ok(Block { header, body })
    }

    /// True iff the body digest and content hash match the payload.
    pub fn verify_integrity(&self) -> bool {
        hash_bytes(&self.body) == self.header.body_hash
            && self.header.computed_hash() == self.header.hash
    }
}

/// Blake2b-256 of arbitrary bytes.
pub fn hash_bytes(bytes: &[u8]) -> BlockHash {
    let mut context = Blake2b::<256>::new();
    context.update_mut(bytes);
    BlockHash::new(context.finalize())
}
