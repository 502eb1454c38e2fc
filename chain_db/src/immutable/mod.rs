//! The immutable store: an append-only log of the chain up to the
//! immutable tip, partitioned into fixed-schedule chunks.
//!
//! Every stored block links to the previous one, so the store holds a
//! single chain by construction. Recovery re-validates chunk contents
//! according to the configured policy and truncates to the last
//! consistent entry.

pub mod iterator;
pub mod layout;

pub use iterator::{ImmutableIterator, IterStart};
pub use layout::ChunkInfo;

use crate::component::{BlockComponent, ComponentValue};
use crate::config::ValidationPolicy;
use crate::files::{self, FrameRead, FRAME_HEADER_SIZE};
use layout::{PrimaryEntry, SecondaryEntry, PRIMARY_ENTRY_SIZE, SECONDARY_ENTRY_SIZE};
use naos_common::{Block, BlockHash, Header, Point};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors raised by the immutable store.
#[derive(Debug, thiserror::Error)]
pub enum ImmutableDbError {
    /// The appended block does not link to the current tip.
    #[error("append does not link to tip {tip}")]
    AppendLinkage { tip: Point },

    /// The appended block's slot does not advance past the tip's.
    #[error("append slot {slot} not after tip slot {tip_slot}")]
    AppendSlot { tip_slot: u64, slot: u64 },

    /// A requested block is not in the store.
    #[error("missing block {0}")]
    MissingBlock(Point),

    /// The requested range starts before the oldest stored block.
    #[error("fork too old: {0} predates the immutable store")]
    ForkTooOld(Point),

    /// The requested range is inverted or empty.
    #[error("invalid range: {from} to {to}")]
    InvalidRange { from: Point, to: Point },

    /// A known-present block could not be read back.
    #[error("immutable store corruption: {0}")]
    Corruption(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The tip of the immutable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tip {
    pub point: Point,
    pub block_number: u64,
    pub is_ebb: bool,
}

/// An index entry together with the absolute slot it occupies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexedEntry {
    pub slot: u64,
    pub entry: SecondaryEntry,
}

struct ChunkIndex {
    entries: Vec<IndexedEntry>,
}

struct CurrentChunk {
    chunk: u64,
    blobs: File,
    primary: File,
    secondary: File,
}

struct Inner {
    chunks: BTreeMap<u64, ChunkIndex>,
    by_hash: HashMap<BlockHash, (u64, u32)>,
    tip: Option<Tip>,
    tip_header: Option<Header>,
    current: Option<CurrentChunk>,
}

/// Append-only chunked block log.
pub struct ImmutableDb {
    dir: PathBuf,
    chunk_info: ChunkInfo,
    inner: Mutex<Inner>,
}

impl ImmutableDb {
    /// Open the store, validating chunks per the policy and truncating
    /// any inconsistent tail.
    pub fn open(
        dir: impl Into<PathBuf>,
        chunk_info: ChunkInfo,
        policy: ValidationPolicy,
    ) -> Result<Self, ImmutableDbError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut chunk_numbers: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| layout::parse_chunk_file(&entry.file_name().to_string_lossy()))
            .collect();
        chunk_numbers.sort_unstable();

        let mut inner = Inner {
            chunks: BTreeMap::new(),
            by_hash: HashMap::new(),
            tip: None,
            tip_header: None,
            current: None,
        };

        let mut truncated = false;
        for (index, &chunk) in chunk_numbers.iter().enumerate() {
            if truncated {
                // Everything after a truncation point is unreachable
                warn!(chunk, "deleting chunk past truncation point");
                delete_chunk_files(&dir, chunk)?;
                continue;
            }

            let is_last = index == chunk_numbers.len() - 1;
            let full = policy == ValidationPolicy::ValidateAll || is_last;
            let outcome = if full {
                validate_chunk(&dir, &chunk_info, chunk, &mut inner.tip_header)?
            } else {
                match load_trusted_chunk(&dir, &chunk_info, chunk)? {
                    Some(outcome) => {
                        if let Some(last) = outcome.entries.last() {
                            inner.tip_header =
                                Some(read_header_for(&dir, chunk, &last.entry)?);
                        }
                        outcome
                    }
                    None => {
                        debug!(chunk, "index unusable, falling back to full validation");
                        validate_chunk(&dir, &chunk_info, chunk, &mut inner.tip_header)?
                    }
                }
            };

            truncated = outcome.truncated;
            if outcome.entries.is_empty() {
                delete_chunk_files(&dir, chunk)?;
                continue;
            }

            for (pos, indexed) in outcome.entries.iter().enumerate() {
                inner.by_hash.insert(indexed.entry.hash, (chunk, pos as u32));
            }
            inner.chunks.insert(
                chunk,
                ChunkIndex {
                    entries: outcome.entries,
                },
            );
        }

        inner.tip = inner.tip_header.as_ref().map(|header| Tip {
            point: header.point(),
            block_number: header.number,
            is_ebb: header.is_ebb,
        });

        if let Some(tip) = &inner.tip {
            info!(tip = %tip.point, number = tip.block_number, "immutable store open");
        } else {
            info!("immutable store open (empty)");
        }

        Ok(ImmutableDb {
            dir,
            chunk_info,
            inner: Mutex::new(inner),
        })
    }

    /// Append a block at the tip and fsync it.
    pub fn append(&self, block: &Block) -> Result<(), ImmutableDbError> {
        let mut inner = self.inner.lock().unwrap();

        match &inner.tip {
            Some(tip) => {
                let tip_hash = tip.point.hash();
                if block.header.prev_hash != tip_hash {
                    return Err(ImmutableDbError::AppendLinkage { tip: tip.point });
                }
                let tip_slot = tip.point.slot().unwrap_or(0);
                // An EBB's successor shares the boundary slot
                let slot_ok = if tip.is_ebb {
                    block.header.slot >= tip_slot
                } else {
                    block.header.slot > tip_slot
                };
                if !slot_ok {
                    return Err(ImmutableDbError::AppendSlot {
                        tip_slot,
                        slot: block.header.slot,
                    });
                }
            }
            None => {
                if block.header.prev_hash.is_some() {
                    return Err(ImmutableDbError::AppendLinkage { tip: Point::Origin });
                }
            }
        }

        let chunk = self.chunk_info.chunk_of(block.header.slot);
        self.roll_to_chunk(&mut inner, chunk)?;

        let raw = block.to_bytes();
        let header_size = block.header_size() as u16;
        let position = inner
            .chunks
            .get(&chunk)
            .map(|index| index.entries.len() as u32)
            .unwrap_or(0);

        let current = inner.current.as_mut().expect("chunk handles just opened");
        let offset = files::append_frame(&mut current.blobs, &raw)?;

        let entry = SecondaryEntry {
            offset,
            header_offset: FRAME_HEADER_SIZE as u16,
            header_size,
            hash: block.hash(),
            is_ebb: block.header.is_ebb,
        };
        current.secondary.write_all(&entry.to_bytes())?;

        let primary = PrimaryEntry {
            relative_slot: self.chunk_info.relative_slot(block.header.slot),
            secondary_index: position,
        };
        current.primary.write_all(&primary.to_bytes())?;

        current.blobs.sync_data()?;
        current.secondary.sync_data()?;
        current.primary.sync_data()?;

        inner
            .chunks
            .entry(chunk)
            .or_insert_with(|| ChunkIndex {
                entries: Vec::new(),
            })
            .entries
            .push(IndexedEntry {
                slot: block.header.slot,
                entry,
            });
        inner.by_hash.insert(block.hash(), (chunk, position));
        inner.tip = Some(Tip {
            point: block.point(),
            block_number: block.header.number,
            is_ebb: block.header.is_ebb,
        });
        inner.tip_header = Some(block.header.clone());

        Ok(())
    }

    fn roll_to_chunk(&self, inner: &mut Inner, chunk: u64) -> Result<(), ImmutableDbError> {
        let needs_roll = match &inner.current {
            Some(current) => current.chunk != chunk,
            None => true,
        };
        if !needs_roll {
            return Ok(());
        }
        if let Some(previous) = inner.current.take() {
            previous.blobs.sync_all()?;
            previous.secondary.sync_all()?;
            previous.primary.sync_all()?;
        }
        let open = |path: &Path| -> std::io::Result<File> {
            OpenOptions::new().create(true).append(true).read(true).open(path)
        };
        inner.current = Some(CurrentChunk {
            chunk,
            blobs: open(&layout::chunk_file(&self.dir, chunk))?,
            primary: open(&layout::primary_file(&self.dir, chunk))?,
            secondary: open(&layout::secondary_file(&self.dir, chunk))?,
        });
        Ok(())
    }

    /// The tip, `None` while the store is empty.
    pub fn tip(&self) -> Option<Tip> {
        self.inner.lock().unwrap().tip
    }

    pub fn tip_header(&self) -> Option<Header> {
        self.inner.lock().unwrap().tip_header.clone()
    }

    /// The point of the oldest stored block.
    pub fn first_point(&self) -> Option<Point> {
        let inner = self.inner.lock().unwrap();
        let (_, index) = inner.chunks.iter().next()?;
        let first = index.entries.first()?;
        Some(Point::Specific(first.slot, first.entry.hash))
    }

    pub fn contains(&self, point: &Point) -> bool {
        self.lookup(point).is_some()
    }

    pub(crate) fn lookup(&self, point: &Point) -> Option<(u64, u32, IndexedEntry)> {
        let hash = point.hash()?;
        let inner = self.inner.lock().unwrap();
        let (chunk, pos) = *inner.by_hash.get(&hash)?;
        let indexed = inner.chunks.get(&chunk)?.entries.get(pos as usize).copied()?;
        if point.slot() != Some(indexed.slot) {
            return None;
        }
        Some((chunk, pos, indexed))
    }

    /// The point a stored hash occupies, if any.
    pub fn point_of_hash(&self, hash: &BlockHash) -> Option<Point> {
        let inner = self.inner.lock().unwrap();
        let (chunk, pos) = *inner.by_hash.get(hash)?;
        let indexed = inner.chunks.get(&chunk)?.entries.get(pos as usize)?;
        Some(Point::Specific(indexed.slot, indexed.entry.hash))
    }

    pub(crate) fn indexed_entry(&self, chunk: u64, pos: u32) -> Option<IndexedEntry> {
        let inner = self.inner.lock().unwrap();
        inner.chunks.get(&chunk)?.entries.get(pos as usize).copied()
    }

    /// The position after `(chunk, pos)`, crossing chunk boundaries.
    /// `None` when it does not exist (yet).
    pub(crate) fn position_after(&self, chunk: u64, pos: u32) -> Option<(u64, u32)> {
        let inner = self.inner.lock().unwrap();
        let index = inner.chunks.get(&chunk)?;
        if (pos as usize + 1) < index.entries.len() {
            return Some((chunk, pos + 1));
        }
        inner
            .chunks
            .range((Bound::Excluded(chunk), Bound::Unbounded))
            .find(|(_, index)| !index.entries.is_empty())
            .map(|(&next_chunk, _)| (next_chunk, 0))
    }

    pub(crate) fn first_position(&self) -> Option<(u64, u32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .iter()
            .find(|(_, index)| !index.entries.is_empty())
            .map(|(&chunk, _)| (chunk, 0))
    }

    /// Read one component of the block at a known index position.
    pub(crate) fn read_component(
        &self,
        chunk: u64,
        indexed: &IndexedEntry,
        component: BlockComponent,
    ) -> Result<ComponentValue, ImmutableDbError> {
        let mut file = File::open(layout::chunk_file(&self.dir, chunk))?;
        let entry = &indexed.entry;
        match component {
            BlockComponent::Header => {
                let bytes = files::read_range(
                    &mut file,
                    entry.offset + entry.header_offset as u64,
                    entry.header_size as usize,
                )?;
                let header: Header = minicbor::decode(&bytes).map_err(|e| {
                    ImmutableDbError::Corruption(format!("header at {}: {e}", entry.offset))
                })?;
                Ok(ComponentValue::Header(header))
            }
            BlockComponent::Size => {
                let bytes = files::read_range(&mut file, entry.offset, 4)?;
                let size = u32::from_be_bytes(bytes.try_into().expect("read 4 bytes"));
                Ok(ComponentValue::Size(size))
            }
            BlockComponent::Block | BlockComponent::RawBytes => {
                let payload = match files::read_frame_at(&mut file, entry.offset)? {
                    FrameRead::Frame(payload) => payload,
                    _ => {
                        return Err(ImmutableDbError::Corruption(format!(
                            "unreadable frame at {} in chunk {chunk}",
                            entry.offset
                        )))
                    }
                };
                if component == BlockComponent::RawBytes {
                    Ok(ComponentValue::RawBytes(payload))
                } else {
                    let block = Block::from_bytes(&payload).map_err(|e| {
                        ImmutableDbError::Corruption(format!(
                            "block at {} in chunk {chunk}: {e}",
                            entry.offset
                        ))
                    })?;
                    Ok(ComponentValue::Block(block))
                }
            }
        }
    }

    /// Look up one component of the block at `point`.
    pub fn get_component(
        &self,
        point: &Point,
        component: BlockComponent,
    ) -> Result<Option<ComponentValue>, ImmutableDbError> {
        match self.lookup(point) {
            Some((chunk, _, indexed)) => {
                Ok(Some(self.read_component(chunk, &indexed, component)?))
            }
            None => Ok(None),
        }
    }

    pub fn get_block(&self, point: &Point) -> Result<Option<Block>, ImmutableDbError> {
        Ok(self
            .get_component(point, BlockComponent::Block)?
            .and_then(ComponentValue::into_block))
    }

    pub fn get_header(&self, point: &Point) -> Result<Option<Header>, ImmutableDbError> {
        Ok(self
            .get_component(point, BlockComponent::Header)?
            .and_then(ComponentValue::into_header))
    }

    /// The stored points occupying `slot`, the ordinary block preferred
    /// over an epoch boundary block.
    pub fn point_at_slot(&self, slot: u64) -> Option<Point> {
        let chunk = self.chunk_info.chunk_of(slot);
        let inner = self.inner.lock().unwrap();
        let index = inner.chunks.get(&chunk)?;
        let mut found = None;
        for indexed in &index.entries {
            if indexed.slot == slot {
                found = Some((indexed.entry.hash, indexed.entry.is_ebb));
                if !indexed.entry.is_ebb {
                    break;
                }
            }
        }
        found.map(|(hash, _)| Point::Specific(slot, hash))
    }

    /// Flush and close the append handles.
    pub fn close(&self) -> Result<(), ImmutableDbError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.current.take() {
            current.blobs.sync_all()?;
            current.secondary.sync_all()?;
            current.primary.sync_all()?;
        }
        Ok(())
    }
}

struct ChunkOutcome {
    entries: Vec<IndexedEntry>,
    truncated: bool,
}

/// Fully validate one chunk: parse every frame, re-hash, check linkage
/// against the running tip. Truncates the blobs file at the first
/// inconsistency and rewrites both index files.
fn validate_chunk(
    dir: &Path,
    chunk_info: &ChunkInfo,
    chunk: u64,
    tip_header: &mut Option<Header>,
) -> Result<ChunkOutcome, ImmutableDbError> {
    let path = layout::chunk_file(dir, chunk);
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

    let mut entries = Vec::new();
    let mut offset = 0u64;
    let mut truncate_at = None;

    loop {
        match files::read_next_frame(&mut file, offset)? {
            FrameRead::Eof => break,
            FrameRead::Torn { offset } => {
                truncate_at = Some(offset);
                break;
            }
            FrameRead::Frame(payload) => {
                let block = match Block::from_bytes(&payload) {
                    Ok(block) => block,
                    Err(err) => {
                        warn!(chunk, offset, "unparseable block: {err}");
                        truncate_at = Some(offset);
                        break;
                    }
                };
                if !block.verify_integrity() {
                    warn!(chunk, offset, "block hash mismatch");
                    truncate_at = Some(offset);
                    break;
                }
                if !links_to(tip_header.as_ref(), &block.header)
                    || chunk_info.chunk_of(block.header.slot) != chunk
                {
                    warn!(chunk, offset, "block does not continue the chain");
                    truncate_at = Some(offset);
                    break;
                }

                entries.push(IndexedEntry {
                    slot: block.header.slot,
                    entry: SecondaryEntry {
                        offset,
                        header_offset: FRAME_HEADER_SIZE as u16,
                        header_size: block.header_size() as u16,
                        hash: block.hash(),
                        is_ebb: block.header.is_ebb,
                    },
                });
                offset += FRAME_HEADER_SIZE + payload.len() as u64;
                *tip_header = Some(block.header);
            }
        }
    }

    let truncated = truncate_at.is_some();
    if let Some(at) = truncate_at {
        warn!(chunk, at, "truncating chunk to last consistent entry");
        file.set_len(at)?;
        file.sync_all()?;
    }

    rewrite_indices(dir, chunk_info, chunk, &entries)?;

    Ok(ChunkOutcome { entries, truncated })
}

/// Load a chunk through its index files without parsing the blobs.
/// Returns `None` when the indices are unusable and a full validation
/// is required instead.
fn load_trusted_chunk(
    dir: &Path,
    chunk_info: &ChunkInfo,
    chunk: u64,
) -> Result<Option<ChunkOutcome>, ImmutableDbError> {
    let secondary_path = layout::secondary_file(dir, chunk);
    let primary_path = layout::primary_file(dir, chunk);
    if !secondary_path.exists() || !primary_path.exists() {
        return Ok(None);
    }

    let secondary = fs::read(&secondary_path)?;
    let primary = fs::read(&primary_path)?;
    if secondary.len() % SECONDARY_ENTRY_SIZE != 0 || primary.len() % PRIMARY_ENTRY_SIZE != 0 {
        return Ok(None);
    }
    let count = secondary.len() / SECONDARY_ENTRY_SIZE;
    if primary.len() / PRIMARY_ENTRY_SIZE != count {
        return Ok(None);
    }

    let blob_len = fs::metadata(layout::chunk_file(dir, chunk))?.len();
    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let entry = SecondaryEntry::from_bytes(
            &secondary[index * SECONDARY_ENTRY_SIZE..(index + 1) * SECONDARY_ENTRY_SIZE],
        )
        .expect("slice has entry size");
        let primary_entry = PrimaryEntry::from_bytes(
            &primary[index * PRIMARY_ENTRY_SIZE..(index + 1) * PRIMARY_ENTRY_SIZE],
        )
        .expect("slice has entry size");
        if entry.offset >= blob_len || primary_entry.secondary_index as usize != index {
            return Ok(None);
        }
        entries.push(IndexedEntry {
            slot: chunk_info.first_slot(chunk) + primary_entry.relative_slot as u64,
            entry,
        });
    }

    Ok(Some(ChunkOutcome {
        entries,
        truncated: false,
    }))
}

fn read_header_for(
    dir: &Path,
    chunk: u64,
    entry: &SecondaryEntry,
) -> Result<Header, ImmutableDbError> {
    let mut file = File::open(layout::chunk_file(dir, chunk))?;
    let bytes = files::read_range(
        &mut file,
        entry.offset + entry.header_offset as u64,
        entry.header_size as usize,
    )?;
    minicbor::decode(&bytes)
        .map_err(|e| ImmutableDbError::Corruption(format!("header in chunk {chunk}: {e}")))
}

fn rewrite_indices(
    dir: &Path,
    chunk_info: &ChunkInfo,
    chunk: u64,
    entries: &[IndexedEntry],
) -> Result<(), ImmutableDbError> {
    let mut secondary = Vec::with_capacity(entries.len() * SECONDARY_ENTRY_SIZE);
    let mut primary = Vec::with_capacity(entries.len() * PRIMARY_ENTRY_SIZE);
    for (index, indexed) in entries.iter().enumerate() {
        secondary.extend_from_slice(&indexed.entry.to_bytes());
        primary.extend_from_slice(
            &PrimaryEntry {
                relative_slot: chunk_info.relative_slot(indexed.slot),
                secondary_index: index as u32,
            }
            .to_bytes(),
        );
    }
    fs::write(layout::secondary_file(dir, chunk), secondary)?;
    fs::write(layout::primary_file(dir, chunk), primary)?;
    Ok(())
}

fn delete_chunk_files(dir: &Path, chunk: u64) -> Result<(), ImmutableDbError> {
    for path in [
        layout::chunk_file(dir, chunk),
        layout::primary_file(dir, chunk),
        layout::secondary_file(dir, chunk),
    ] {
        if path.exists() {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn links_to(tip: Option<&Header>, header: &Header) -> bool {
    match tip {
        None => header.prev_hash.is_none() && header.number == 0,
        Some(tip) => {
            let slot_ok = if tip.is_ebb {
                header.slot >= tip.slot
            } else {
                header.slot > tip.slot
            };
            header.prev_hash == Some(tip.hash) && header.number == tip.number + 1 && slot_ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_chain(count: u64) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut prev = None;
        for number in 0..count {
            let block = Block::new(number * 3, number, prev, false, vec![number as u8; 8]);
            prev = Some(block.hash());
            blocks.push(block);
        }
        blocks
    }

    fn open_db(dir: &Path, policy: ValidationPolicy) -> ImmutableDb {
        ImmutableDb::open(dir, ChunkInfo::new(10), policy).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);

        let blocks = make_chain(5);
        for block in &blocks {
            db.append(block).unwrap();
        }

        let tip = db.tip().unwrap();
        assert_eq!(tip.point, blocks[4].point());
        assert_eq!(tip.block_number, 4);

        for block in &blocks {
            let read = db.get_block(&block.point()).unwrap().unwrap();
            assert_eq!(&read, block);
            let header = db.get_header(&block.point()).unwrap().unwrap();
            assert_eq!(header, block.header);
        }
        assert_eq!(db.first_point(), Some(blocks[0].point()));
    }

    #[test]
    fn append_rejects_bad_linkage() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);

        let blocks = make_chain(2);
        db.append(&blocks[0]).unwrap();

        let stranger = Block::new(9, 1, Some(BlockHash::new([9; 32])), false, vec![]);
        assert!(matches!(
            db.append(&stranger),
            Err(ImmutableDbError::AppendLinkage { .. })
        ));

        // Same slot as the tip, not an EBB successor
        let tip_hash = blocks[0].hash();
        let stale = Block::new(0, 1, Some(tip_hash), false, vec![]);
        assert!(matches!(db.append(&stale), Err(ImmutableDbError::AppendSlot { .. })));
    }

    #[test]
    fn ebb_successor_shares_slot() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);

        let ebb = Block::new(10, 0, None, true, vec![]);
        db.append(&ebb).unwrap();
        let ordinary = Block::new(10, 1, Some(ebb.hash()), false, vec![1]);
        db.append(&ordinary).unwrap();

        // Slot lookup prefers the ordinary block
        assert_eq!(db.point_at_slot(10), Some(ordinary.point()));
    }

    #[test]
    fn reopen_with_full_validation_preserves_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = make_chain(25);
        {
            let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.close().unwrap();
        }

        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
        assert_eq!(db.tip().unwrap().point, blocks[24].point());
        for block in &blocks {
            assert_eq!(db.get_block(&block.point()).unwrap().unwrap(), *block);
        }
    }

    #[test]
    fn reopen_trusting_older_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = make_chain(25);
        {
            let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.close().unwrap();
        }

        let db = open_db(dir.path(), ValidationPolicy::ValidateMostRecent);
        assert_eq!(db.tip().unwrap().point, blocks[24].point());
        assert_eq!(
            db.get_block(&blocks[3].point()).unwrap().unwrap(),
            blocks[3]
        );
    }

    #[test]
    fn torn_tail_is_truncated_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = make_chain(4);
        {
            let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.close().unwrap();
        }

        // Chop the last frame mid-way
        let chunk_path = layout::chunk_file(dir.path(), 0);
        let len = fs::metadata(&chunk_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&chunk_path).unwrap();
        file.set_len(len - 3).unwrap();

        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
        assert_eq!(db.tip().unwrap().point, blocks[2].point());
        assert!(db.get_block(&blocks[3].point()).unwrap().is_none());

        // The store accepts the truncated block again
        db.append(&blocks[3]).unwrap();
        assert_eq!(db.tip().unwrap().point, blocks[3].point());
    }

    #[test]
    fn corrupted_early_chunk_drops_later_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = make_chain(25);
        {
            let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.close().unwrap();
        }

        // Flip a byte in the middle of chunk 1 (slots 12..18, blocks 4..6)
        let chunk_path = layout::chunk_file(dir.path(), 1);
        let mut bytes = fs::read(&chunk_path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&chunk_path, bytes).unwrap();

        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
        let tip = db.tip().unwrap();
        assert!(tip.block_number < 7);
        assert!(!layout::chunk_file(dir.path(), 2).exists());
        // Everything up to the tip is intact
        assert_eq!(db.get_block(&blocks[0].point()).unwrap().unwrap(), blocks[0]);
    }

    #[test]
    fn unknown_points_are_none_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path(), ValidationPolicy::ValidateAll);
        let ghost = Point::Specific(1, BlockHash::new([1; 32]));
        assert!(db.get_block(&ghost).unwrap().is_none());
        assert!(!db.contains(&ghost));
    }
}
