//! Block component selection for streams and lookups.

use naos_common::{Block, Header};

/// Which part of a stored block a consumer wants.
///
/// Streaming headers avoids reading bodies from disk; `Size` reads
/// nothing but the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockComponent {
    Block,
    Header,
    RawBytes,
    Size,
}

/// A materialized component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentValue {
    Block(Block),
    Header(Header),
    RawBytes(Vec<u8>),
    Size(u32),
}

/// Project a full block onto the requested component.
pub fn from_block(block: Block, component: BlockComponent) -> ComponentValue {
    match component {
        BlockComponent::Block => ComponentValue::Block(block),
        BlockComponent::Header => ComponentValue::Header(block.header),
        BlockComponent::RawBytes => ComponentValue::RawBytes(block.to_bytes()),
        BlockComponent::Size => ComponentValue::Size(block.to_bytes().len() as u32),
    }
}

impl ComponentValue {
    pub fn into_block(self) -> Option<Block> {
        match self {
            ComponentValue::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn into_header(self) -> Option<Header> {
        match self {
            ComponentValue::Header(header) => Some(header),
            _ => None,
        }
    }
}
