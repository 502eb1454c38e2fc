//! The volatile store: the cloud of recently received blocks that are
//! not yet known to be immutable or garbage.
//!
//! Bodies live in bounded segment files on disk; headers and the
//! successor index stay in memory, since chain selection needs
//! O(degree) child lookups. A segment file is deleted once every block
//! in it has been garbage-collected.

use crate::config::ValidationPolicy;
use crate::files::{self, FrameRead};
use naos_common::{Block, BlockHash, Header, Point};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors raised by the volatile store.
#[derive(Debug, thiserror::Error)]
pub enum VolatileDbError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A known-present block could not be read back.
    #[error("volatile store corruption: {0}")]
    Corruption(String),
}

fn segment_file(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("blocks-{segment:06}.dat"))
}

fn parse_segment_file(name: &str) -> Option<u64> {
    name.strip_prefix("blocks-")?.strip_suffix(".dat")?.parse().ok()
}

#[derive(Debug, Clone)]
struct BlockEntry {
    header: Header,
    segment: u64,
    offset: u64,
}

#[derive(Debug, Default)]
struct SegmentMeta {
    /// Frames written to the file, dead ones included.
    count: u32,
    /// Blocks not yet garbage-collected.
    live: u32,
}

struct VolInner {
    index: HashMap<BlockHash, BlockEntry>,
    /// Children by parent; `None` keys blocks whose parent is genesis.
    by_predecessor: HashMap<Option<BlockHash>, BTreeSet<BlockHash>>,
    by_slot: BTreeMap<u64, BTreeSet<BlockHash>>,
    segments: BTreeMap<u64, SegmentMeta>,
    current: Option<(u64, File)>,
    current_count: u32,
}

/// Recent-block pool backed by segment files.
pub struct VolatileDb {
    dir: PathBuf,
    blocks_per_segment: u32,
    inner: Mutex<VolInner>,
}

impl VolatileDb {
    /// Open the store, scanning every segment file and truncating torn
    /// trailing writes.
    pub fn open(
        dir: impl Into<PathBuf>,
        blocks_per_segment: u32,
        policy: ValidationPolicy,
    ) -> Result<Self, VolatileDbError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut segment_numbers: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_segment_file(&entry.file_name().to_string_lossy()))
            .collect();
        segment_numbers.sort_unstable();

        let mut inner = VolInner {
            index: HashMap::new(),
            by_predecessor: HashMap::new(),
            by_slot: BTreeMap::new(),
            segments: BTreeMap::new(),
            current: None,
            current_count: 0,
        };

        for &segment in &segment_numbers {
            let path = segment_file(&dir, segment);
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut meta = SegmentMeta::default();
            let mut offset = 0u64;
            loop {
                match files::read_next_frame(&mut file, offset)? {
                    FrameRead::Eof => break,
                    FrameRead::Torn { offset } => {
                        warn!(segment, offset, "truncating torn block write");
                        file.set_len(offset)?;
                        file.sync_all()?;
                        break;
                    }
                    FrameRead::Frame(payload) => {
                        let frame_len = files::FRAME_HEADER_SIZE + payload.len() as u64;
                        let block = match Block::from_bytes(&payload) {
                            Ok(block) => block,
                            Err(err) => {
                                warn!(segment, offset, "unparseable block, truncating: {err}");
                                file.set_len(offset)?;
                                file.sync_all()?;
                                break;
                            }
                        };
                        if policy == ValidationPolicy::ValidateAll && !block.verify_integrity() {
                            warn!(segment, offset, "block hash mismatch, truncating");
                            file.set_len(offset)?;
                            file.sync_all()?;
                            break;
                        }
                        meta.count += 1;
                        if !inner.index.contains_key(&block.hash()) {
                            meta.live += 1;
                            index_block(&mut inner, block.header, segment, offset);
                        }
                        offset += frame_len;
                    }
                }
            }
            inner.segments.insert(segment, meta);
        }

        // Keep filling the last segment if it still has room
        if let Some((&segment, meta)) = inner.segments.iter().next_back() {
            if meta.count < blocks_per_segment {
                let file = OpenOptions::new()
                    .append(true)
                    .read(true)
                    .open(segment_file(&dir, segment))?;
                inner.current_count = meta.count;
                inner.current = Some((segment, file));
            }
        }

        info!(
            blocks = inner.index.len(),
            segments = inner.segments.len(),
            "volatile store open"
        );

        Ok(VolatileDb {
            dir,
            blocks_per_segment,
            inner: Mutex::new(inner),
        })
    }

    /// Store a block. Returns `false` when the hash was already
    /// present, which callers treat as success.
    pub fn put(&self, block: &Block) -> Result<bool, VolatileDbError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains_key(&block.hash()) {
            return Ok(false);
        }

        self.roll_segment_if_needed(&mut inner)?;
        let (segment, offset) = {
            let (segment, file) = inner.current.as_mut().expect("segment just opened");
            let segment = *segment;
            let offset = files::append_frame(file, &block.to_bytes())?;
            file.sync_data()?;
            (segment, offset)
        };

        index_block(&mut inner, block.header.clone(), segment, offset);
        inner.current_count += 1;
        let meta = inner.segments.entry(segment).or_default();
        meta.count += 1;
        meta.live += 1;
        Ok(true)
    }

    fn roll_segment_if_needed(&self, inner: &mut VolInner) -> Result<(), VolatileDbError> {
        let roll = match &inner.current {
            Some(_) => inner.current_count >= self.blocks_per_segment,
            None => true,
        };
        if !roll {
            return Ok(());
        }

        if let Some((previous, file)) = inner.current.take() {
            file.sync_all()?;
            // A fully collected segment only kept alive by the appender
            if inner.segments.get(&previous).is_some_and(|meta| meta.live == 0) {
                self.collect_dead_segment(inner, previous)?;
            }
        }

        let segment = inner.segments.keys().next_back().map(|s| s + 1).unwrap_or(0);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .read(true)
            .open(segment_file(&self.dir, segment))?;
        inner.segments.insert(segment, SegmentMeta::default());
        inner.current = Some((segment, file));
        inner.current_count = 0;
        Ok(())
    }

    pub fn member(&self, hash: &BlockHash) -> bool {
        self.inner.lock().unwrap().index.contains_key(hash)
    }

    /// The stored header for a hash, if present.
    pub fn block_info(&self, hash: &BlockHash) -> Option<Header> {
        self.inner.lock().unwrap().index.get(hash).map(|entry| entry.header.clone())
    }

    /// Read a block body back from its segment file.
    pub fn get(&self, hash: &BlockHash) -> Result<Option<Block>, VolatileDbError> {
        let entry = {
            let inner = self.inner.lock().unwrap();
            match inner.index.get(hash) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        let mut file = File::open(segment_file(&self.dir, entry.segment))?;
        let payload = match files::read_frame_at(&mut file, entry.offset)? {
            FrameRead::Frame(payload) => payload,
            _ => {
                return Err(VolatileDbError::Corruption(format!(
                    "unreadable frame for {hash} in segment {}",
                    entry.segment
                )))
            }
        };
        let block = Block::from_bytes(&payload).map_err(|e| {
            VolatileDbError::Corruption(format!("block {hash}: {e}"))
        })?;
        if block.hash() != *hash {
            return Err(VolatileDbError::Corruption(format!(
                "segment {} frame at {} holds {} instead of {hash}",
                entry.segment,
                entry.offset,
                block.hash()
            )));
        }
        Ok(Some(block))
    }

    /// Headers of the stored blocks whose parent is `parent`, ordered
    /// by hash.
    pub fn successors(&self, parent: &Point) -> Vec<Header> {
        let key = parent.hash();
        let inner = self.inner.lock().unwrap();
        let Some(children) = inner.by_predecessor.get(&key) else {
            return Vec::new();
        };
        children
            .iter()
            .filter_map(|hash| inner.index.get(hash).map(|entry| entry.header.clone()))
            .collect()
    }

    /// The successor map restricted to the given parents: the critical
    /// query of chain selection.
    pub fn filter_by_predecessor<'a>(
        &self,
        parents: impl IntoIterator<Item = &'a Point>,
    ) -> HashMap<Point, Vec<Header>> {
        let mut result = HashMap::new();
        for parent in parents {
            let children = self.successors(parent);
            if !children.is_empty() {
                result.insert(*parent, children);
            }
        }
        result
    }

    /// Remove a single block, e.g. one that failed validation.
    pub fn delete(&self, hash: &BlockHash) -> Result<bool, VolatileDbError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.index.remove(hash) else {
            return Ok(false);
        };
        unindex_block(&mut inner, hash, &entry);
        self.collect_dead_segment(&mut inner, entry.segment)?;
        Ok(true)
    }

    /// Remove every block with `slot <= upto`. Idempotent.
    pub fn garbage_collect(&self, upto: u64) -> Result<Vec<BlockHash>, VolatileDbError> {
        let mut inner = self.inner.lock().unwrap();

        let doomed: Vec<BlockHash> = inner
            .by_slot
            .range(..=upto)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect();

        let mut touched_segments = BTreeSet::new();
        for hash in &doomed {
            if let Some(entry) = inner.index.remove(hash) {
                touched_segments.insert(entry.segment);
                unindex_block(&mut inner, hash, &entry);
            }
        }
        for segment in touched_segments {
            self.collect_dead_segment(&mut inner, segment)?;
        }

        if !doomed.is_empty() {
            debug!(upto, removed = doomed.len(), "volatile garbage collection");
        }
        Ok(doomed)
    }

    fn collect_dead_segment(
        &self,
        inner: &mut VolInner,
        segment: u64,
    ) -> Result<(), VolatileDbError> {
        let dead = inner.segments.get(&segment).is_some_and(|meta| meta.live == 0);
        let is_current = inner.current.as_ref().is_some_and(|(s, _)| *s == segment);
        if dead && !is_current {
            inner.segments.remove(&segment);
            let path = segment_file(&self.dir, segment);
            if path.exists() {
                fs::remove_file(&path)?;
            }
            debug!(segment, "deleted fully collected segment");
        }
        Ok(())
    }

    /// Highest slot currently stored.
    pub fn max_slot(&self) -> Option<u64> {
        self.inner.lock().unwrap().by_slot.keys().next_back().copied()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Flush the append handle.
    pub fn close(&self) -> Result<(), VolatileDbError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, file)) = inner.current.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn index_block(inner: &mut VolInner, header: Header, segment: u64, offset: u64) {
    let hash = header.hash;
    inner.by_predecessor.entry(header.prev_hash).or_default().insert(hash);
    inner.by_slot.entry(header.slot).or_default().insert(hash);
    inner.index.insert(
        hash,
        BlockEntry {
            header,
            segment,
            offset,
        },
    );
}

fn unindex_block(inner: &mut VolInner, hash: &BlockHash, entry: &BlockEntry) {
    if let Some(children) = inner.by_predecessor.get_mut(&entry.header.prev_hash) {
        children.remove(hash);
        if children.is_empty() {
            inner.by_predecessor.remove(&entry.header.prev_hash);
        }
    }
    if let Some(hashes) = inner.by_slot.get_mut(&entry.header.slot) {
        hashes.remove(hash);
        if hashes.is_empty() {
            inner.by_slot.remove(&entry.header.slot);
        }
    }
    if let Some(meta) = inner.segments.get_mut(&entry.segment) {
        meta.live = meta.live.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, per_segment: u32) -> VolatileDb {
        VolatileDb::open(dir, per_segment, ValidationPolicy::ValidateMostRecent).unwrap()
    }

    fn block(slot: u64, number: u64, prev: Option<BlockHash>, tag: u8) -> Block {
        Block::new(slot, number, prev, false, vec![tag; 16])
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);

        let b = block(5, 1, None, 7);
        assert!(db.put(&b).unwrap());
        assert!(db.member(&b.hash()));
        assert_eq!(db.get(&b.hash()).unwrap().unwrap(), b);
        assert_eq!(db.block_info(&b.hash()).unwrap(), b.header);
        assert_eq!(db.max_slot(), Some(5));
    }

    #[test]
    fn duplicate_put_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);

        let b = block(5, 1, None, 7);
        assert!(db.put(&b).unwrap());
        assert!(!db.put(&b).unwrap());
        assert_eq!(db.block_count(), 1);
    }

    #[test]
    fn successors_by_parent() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);

        let parent = block(1, 0, None, 1);
        let child_a = block(2, 1, Some(parent.hash()), 2);
        let child_b = block(3, 1, Some(parent.hash()), 3);
        let grandchild = block(4, 2, Some(child_a.hash()), 4);
        for b in [&parent, &child_a, &child_b, &grandchild] {
            db.put(b).unwrap();
        }

        let children = db.successors(&parent.point());
        assert_eq!(children.len(), 2);
        assert!(children.iter().any(|h| h.hash == child_a.hash()));
        assert!(children.iter().any(|h| h.hash == child_b.hash()));

        let genesis_children = db.successors(&Point::Origin);
        assert_eq!(genesis_children.len(), 1);
        assert_eq!(genesis_children[0].hash, parent.hash());

        let map = db.filter_by_predecessor([parent.point(), child_a.point()].iter());
        assert_eq!(map[&parent.point()].len(), 2);
        assert_eq!(map[&child_a.point()].len(), 1);
    }

    #[test]
    fn garbage_collection_deletes_dead_segments() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 2);

        let mut prev = None;
        let mut blocks = Vec::new();
        for n in 0..6u64 {
            let b = block(n + 1, n, prev, n as u8);
            prev = Some(b.hash());
            db.put(&b).unwrap();
            blocks.push(b);
        }
        // Segments 0..2 hold two blocks each; segment 2 is current
        assert!(segment_file(dir.path(), 0).exists());

        let removed = db.garbage_collect(4).unwrap();
        assert_eq!(removed.len(), 4);
        assert!(!segment_file(dir.path(), 0).exists());
        assert!(!segment_file(dir.path(), 1).exists());
        assert!(segment_file(dir.path(), 2).exists());
        assert!(!db.member(&blocks[0].hash()));
        assert!(db.member(&blocks[5].hash()));

        // Idempotent
        assert!(db.garbage_collect(4).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);

        let b = block(5, 1, None, 7);
        db.put(&b).unwrap();
        assert!(db.delete(&b.hash()).unwrap());
        assert!(!db.member(&b.hash()));
        assert!(!db.delete(&b.hash()).unwrap());
    }

    #[test]
    fn recovery_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        let blocks: Vec<Block> = (0..5u64)
            .scan(None, |prev, n| {
                let b = block(n + 1, n, *prev, n as u8);
                *prev = Some(b.hash());
                Some(b)
            })
            .collect();
        {
            let db = open(dir.path(), 2);
            for b in &blocks {
                db.put(b).unwrap();
            }
            db.close().unwrap();
        }

        let db = VolatileDb::open(dir.path(), 2, ValidationPolicy::ValidateAll).unwrap();
        assert_eq!(db.block_count(), 5);
        for b in &blocks {
            assert_eq!(db.get(&b.hash()).unwrap().unwrap(), *b);
        }

        // The half-full segment keeps filling rather than rolling
        let extra = block(9, 5, Some(blocks[4].hash()), 9);
        db.put(&extra).unwrap();
        assert!(!segment_file(dir.path(), 3).exists());
    }

    #[test]
    fn recovery_truncates_torn_write() {
        let dir = tempfile::tempdir().unwrap();
        let blocks: Vec<Block> = (0..3u64)
            .scan(None, |prev, n| {
                let b = block(n + 1, n, *prev, n as u8);
                *prev = Some(b.hash());
                Some(b)
            })
            .collect();
        {
            let db = open(dir.path(), 10);
            for b in &blocks {
                db.put(b).unwrap();
            }
            db.close().unwrap();
        }

        let path = segment_file(dir.path(), 0);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 5).unwrap();

        let db = open(dir.path(), 10);
        assert_eq!(db.block_count(), 2);
        assert!(db.member(&blocks[1].hash()));
        assert!(!db.member(&blocks[2].hash()));
    }
}
