//! Durable, log-structured storage for article embeddings.
//!
//! Every mutation is appended to a single log file; opening the store
//! replays the log (through a memory map) into an in-memory table of
//! immutable, shared embeddings. The log is the source of truth for
//! rebuilding the similarity index after a restart.
//!
//! # Storage Format
//!
//! - Header (24 bytes): magic, format version, dimension at creation,
//!   reserved, then the lowest version the next write may use (so versions
//!   of compacted-away records are never handed out again)
//! - Records: op (u8), article id (u64), version (u64), category (u64),
//!   recorded dimension (u32), then `dimension` little-endian f32 values
//!   (none for deletes)
//!
//! A record cut short by a crash is dropped on replay and the file is
//! truncated back to the last complete record.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::vector::types::{ArticleId, CategoryId, VectorDimension, VectorError};

/// Current storage format version.
const STORAGE_VERSION: u32 = 1;

/// Size of the storage header in bytes.
const HEADER_SIZE: usize = 24;

/// Magic bytes to identify vector log files.
const MAGIC_BYTES: &[u8; 4] = b"KBVL";

/// Fixed part of every record: op + id + version + category + dimension.
const RECORD_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 4;

/// Number of bytes per f32 value.
const BYTES_PER_F32: usize = 4;

/// Superseded records tolerated before automatic compaction kicks in,
/// regardless of the configured ratio.
const MIN_COMPACTION_GARBAGE: usize = 1024;

/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "vectors.log";

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Errors specific to vector storage operations.
#[derive(Error, Debug)]
pub enum VectorStorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("No embedding stored for article {0}")]
    NotFound(ArticleId),
}

/// One stored embedding together with its bookkeeping.
///
/// The embedding buffer is immutable and shared, so readers holding a
/// clone can never observe a partially overwritten vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub embedding: Arc<[f32]>,
    /// Dimension recorded when the entry was written.
    pub dimension: usize,
    /// Store-wide monotonic version of the last write.
    pub version: u64,
    pub category: Option<CategoryId>,
}

/// Tuning knobs for the log store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// `fsync` after every append.
    pub sync_writes: bool,
    /// Compact once superseded records exceed `ratio * live entries`.
    pub compaction_ratio: f32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_writes: false,
            compaction_ratio: 1.0,
        }
    }
}

type EntryTable = HashMap<ArticleId, StoredVector>;

/// Append handle plus the counters that must change together with it.
#[derive(Debug)]
struct LogWriter {
    file: File,
    /// Length of the file up to the last complete record.
    len: u64,
    next_version: u64,
    /// Records in the log that no longer describe a live entry.
    garbage: usize,
}

/// Keyed, durable storage of `ArticleId -> embedding`.
///
/// Reads go through a `RwLock` over the live table; writes serialize on the
/// log mutex so the order of records on disk matches the in-memory order.
#[derive(Debug)]
pub struct VectorStore {
    path: PathBuf,
    dimension: VectorDimension,
    options: StoreOptions,
    entries: Arc<RwLock<EntryTable>>,
    /// Entries written with a different dimension (older embedding model).
    stale: RwLock<EntryTable>,
    log: Mutex<LogWriter>,
}

impl VectorStore {
    /// Opens the store in `dir`, creating it if necessary, and replays the log.
    pub fn open(
        dir: impl AsRef<Path>,
        dimension: VectorDimension,
        options: StoreOptions,
    ) -> Result<Self, VectorStorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let mut entries = EntryTable::new();
        let mut stale = EntryTable::new();
        let mut max_version = 0;
        let mut garbage = 0;

        let valid_len = if file_len == 0 {
            write_header(&mut file, dimension, 1)?;
            HEADER_SIZE as u64
        } else {
            // SAFETY: the file is only appended to by this process while the
            // store is open, and the map is dropped before any truncation.
            let mmap = unsafe { Mmap::map(&file)? };
            let (header_dimension, version_floor) = read_header(&mmap)?;
            if header_dimension != dimension.get() {
                tracing::info!(
                    "Vector log was created with dimension {header_dimension}, now {dimension}; older entries are stale"
                );
            }
            let replay = replay_records(&mmap, dimension, &mut entries, &mut stale)?;
            max_version = replay.max_version.max(version_floor.saturating_sub(1));
            garbage = replay.garbage;
            replay.valid_len
        };

        if valid_len < file_len {
            tracing::warn!(
                "Discarding {} trailing bytes of incomplete record in {}",
                file_len - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
        }

        if !stale.is_empty() {
            tracing::warn!(
                "{} stored embeddings have a dimension other than {dimension} and need re-embedding",
                stale.len()
            );
        }

        Ok(Self {
            path,
            dimension,
            options,
            entries: Arc::new(RwLock::new(entries)),
            stale: RwLock::new(stale),
            log: Mutex::new(LogWriter {
                file,
                len: valid_len,
                next_version: max_version + 1,
                garbage,
            }),
        })
    }

    /// Inserts or overwrites the embedding for `id`.
    ///
    /// Returns the new version. Fails with `DimensionMismatch` (store
    /// unchanged) when the length differs from the configured dimension.
    pub fn put(&self, id: ArticleId, embedding: &[f32]) -> Result<u64, VectorStorageError> {
        self.put_tagged(id, embedding, None)
    }

    /// Like [`put`](Self::put) but also records the article's category.
    pub fn put_tagged(
        &self,
        id: ArticleId,
        embedding: &[f32],
        category: Option<CategoryId>,
    ) -> Result<u64, VectorStorageError> {
        self.dimension.validate_embedding(embedding)?;

        let mut log = self.log.lock();
        let version = log.next_version;
        let record = encode_record(OP_PUT, id, version, category, embedding);
        self.append(&mut log, &record)?;
        log.next_version += 1;

        let stored = StoredVector {
            embedding: Arc::from(embedding),
            dimension: embedding.len(),
            version,
            category,
        };
        let replaced = self.entries.write().insert(id, stored).is_some();
        let was_stale = self.stale.write().remove(&id).is_some();
        if replaced || was_stale {
            log.garbage += 1;
        }
        self.maybe_compact(&mut log);

        Ok(version)
    }

    /// Removes the entry for `id`. Returns whether anything was removed;
    /// deleting an absent id is not an error and writes nothing.
    pub fn delete(&self, id: ArticleId) -> Result<bool, VectorStorageError> {
        let mut log = self.log.lock();
        let present = self.entries.read().contains_key(&id) || self.stale.read().contains_key(&id);
        if !present {
            return Ok(false);
        }

        let version = log.next_version;
        let record = encode_record(OP_DELETE, id, version, None, &[]);
        self.append(&mut log, &record)?;
        log.next_version += 1;

        self.entries.write().remove(&id);
        self.stale.write().remove(&id);
        // The put record and the delete record are both dead weight now
        log.garbage += 2;
        self.maybe_compact(&mut log);

        Ok(true)
    }

    /// Returns the current embedding for `id`.
    pub fn get(&self, id: ArticleId) -> Result<Arc<[f32]>, VectorStorageError> {
        self.entries
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.embedding))
            .ok_or(VectorStorageError::NotFound(id))
    }

    /// Returns the full stored entry for `id`, if any.
    #[must_use]
    pub fn entry(&self, id: ArticleId) -> Option<StoredVector> {
        self.entries.read().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: ArticleId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Lazy iterator over every live entry.
    ///
    /// The set of ids is captured when iteration starts; each entry is read
    /// when yielded, so entries deleted mid-iteration are skipped and
    /// overwritten entries show their newest value. Call again to restart.
    #[must_use]
    pub fn iter_all(&self) -> StoreIter {
        StoreIter {
            entries: Arc::clone(&self.entries),
            ids: None,
            position: 0,
        }
    }

    /// Ids of entries written with another dimension than the configured one.
    #[must_use]
    pub fn stale_entries(&self) -> Vec<ArticleId> {
        let mut ids: Vec<ArticleId> = self.stale.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the size of the log file in bytes.
    pub fn file_size(&self) -> Result<u64, io::Error> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Forces all appended records to stable storage.
    pub fn flush(&self) -> Result<(), VectorStorageError> {
        let log = self.log.lock();
        log.file.sync_all()?;
        Ok(())
    }

    /// Rewrites the log with one record per live entry.
    ///
    /// Stale entries are dropped here for good.
    pub fn compact(&self) -> Result<(), VectorStorageError> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    /// Drops every entry, live and stale, and truncates the log to its header.
    ///
    /// Versions keep counting from where they were.
    pub fn clear(&self) -> Result<usize, VectorStorageError> {
        let mut log = self.log.lock();
        let removed = {
            let mut entries = self.entries.write();
            let removed = entries.len();
            entries.clear();
            removed + self.stale.read().len()
        };
        self.compact_locked(&mut log)?;
        Ok(removed)
    }

    fn append(&self, log: &mut LogWriter, record: &[u8]) -> Result<(), VectorStorageError> {
        if let Err(e) = log.file.write_all(record) {
            // Never leave half a record in front of the next append
            let _ = log.file.set_len(log.len);
            return Err(e.into());
        }
        if self.options.sync_writes {
            log.file.sync_data()?;
        }
        log.len += record.len() as u64;
        Ok(())
    }

    /// Automatic compaction after a write. The record is already durable at
    /// this point, so a failure is logged and the write still succeeds.
    fn maybe_compact(&self, log: &mut LogWriter) {
        let live = self.entries.read().len();
        let threshold =
            MIN_COMPACTION_GARBAGE.max((live as f32 * self.options.compaction_ratio) as usize);
        if log.garbage > threshold {
            tracing::debug!(
                "Compacting vector log: {} superseded records, {live} live",
                log.garbage
            );
            if let Err(e) = self.compact_locked(log) {
                tracing::warn!("Automatic compaction of {} failed: {e}", self.path.display());
            }
        }
    }

    fn compact_locked(&self, log: &mut LogWriter) -> Result<(), VectorStorageError> {
        let tmp_path = self.path.with_extension("log.compact");
        let mut tmp = File::create(&tmp_path)?;
        write_header(&mut tmp, self.dimension, log.next_version)?;

        let mut buffer = Vec::new();
        {
            let entries = self.entries.read();
            let mut ids: Vec<&ArticleId> = entries.keys().collect();
            ids.sort_unstable();
            for id in ids {
                let entry = &entries[id];
                buffer.extend_from_slice(&encode_record(
                    OP_PUT,
                    *id,
                    entry.version,
                    entry.category,
                    &entry.embedding,
                ));
            }
        }
        tmp.write_all(&buffer)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        log.len = file.metadata()?.len();
        log.file = file;
        log.garbage = 0;

        let dropped = std::mem::take(&mut *self.stale.write()).len();
        if dropped > 0 {
            tracing::info!("Dropped {dropped} stale embeddings during compaction");
        }
        Ok(())
    }
}

/// Iterator returned by [`VectorStore::iter_all`].
pub struct StoreIter {
    entries: Arc<RwLock<EntryTable>>,
    ids: Option<Vec<ArticleId>>,
    position: usize,
}

impl Iterator for StoreIter {
    type Item = (ArticleId, StoredVector);

    fn next(&mut self) -> Option<Self::Item> {
        let ids = self.ids.get_or_insert_with(|| {
            let mut ids: Vec<ArticleId> = self.entries.read().keys().copied().collect();
            ids.sort_unstable();
            ids
        });

        while self.position < ids.len() {
            let id = ids[self.position];
            self.position += 1;
            if let Some(entry) = self.entries.read().get(&id) {
                return Some((id, entry.clone()));
            }
        }
        None
    }
}

impl std::fmt::Debug for StoreIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreIter")
            .field("position", &self.position)
            .finish()
    }
}

struct ReplayOutcome {
    valid_len: u64,
    max_version: u64,
    garbage: usize,
}

fn write_header(
    file: &mut File,
    dimension: VectorDimension,
    version_floor: u64,
) -> Result<(), io::Error> {
    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(MAGIC_BYTES);
    header.extend_from_slice(&STORAGE_VERSION.to_le_bytes());
    header.extend_from_slice(&(dimension.get() as u32).to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&version_floor.to_le_bytes());
    file.write_all(&header)?;
    file.flush()
}

fn read_header(bytes: &[u8]) -> Result<(usize, u64), VectorStorageError> {
    if bytes.len() < HEADER_SIZE {
        return Err(VectorStorageError::InvalidFormat(
            "File too small to contain header".to_string(),
        ));
    }

    if &bytes[0..4] != MAGIC_BYTES {
        return Err(VectorStorageError::InvalidFormat(
            "Invalid magic bytes".to_string(),
        ));
    }

    let version = read_u32(bytes, 4);
    if version != STORAGE_VERSION {
        return Err(VectorError::VersionMismatch {
            expected: STORAGE_VERSION,
            actual: version,
        }
        .into());
    }

    Ok((read_u32(bytes, 8) as usize, read_u64(bytes, 16)))
}

fn replay_records(
    bytes: &[u8],
    dimension: VectorDimension,
    entries: &mut EntryTable,
    stale: &mut EntryTable,
) -> Result<ReplayOutcome, VectorStorageError> {
    let mut offset = HEADER_SIZE;
    let mut max_version = 0;
    let mut garbage = 0;

    while offset + RECORD_HEADER_SIZE <= bytes.len() {
        let op = bytes[offset];
        let raw_id = read_u64(bytes, offset + 1);
        let version = read_u64(bytes, offset + 9);
        let category = CategoryId::decode(read_u64(bytes, offset + 17));
        let record_dim = read_u32(bytes, offset + 25) as usize;
        let data_start = offset + RECORD_HEADER_SIZE;
        let data_end = data_start + record_dim * BYTES_PER_F32;

        if data_end > bytes.len() {
            break;
        }

        let id = ArticleId::new(raw_id).ok_or_else(|| {
            VectorStorageError::InvalidFormat(format!("Zero article id at offset {offset}"))
        })?;

        match op {
            OP_PUT => {
                let embedding: Arc<[f32]> = bytes[data_start..data_end]
                    .chunks_exact(BYTES_PER_F32)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                let stored = StoredVector {
                    embedding,
                    dimension: record_dim,
                    version,
                    category,
                };
                let (live, other) = if record_dim == dimension.get() {
                    (&mut *entries, &mut *stale)
                } else {
                    (&mut *stale, &mut *entries)
                };
                let superseded_other = other.remove(&id).is_some();
                let superseded_live = live.insert(id, stored).is_some();
                if superseded_other || superseded_live {
                    garbage += 1;
                }
            }
            OP_DELETE => {
                entries.remove(&id);
                stale.remove(&id);
                garbage += 2;
            }
            other => {
                return Err(VectorStorageError::InvalidFormat(format!(
                    "Unknown record type {other} at offset {offset}"
                )));
            }
        }

        max_version = max_version.max(version);
        offset = data_end;
    }

    Ok(ReplayOutcome {
        valid_len: offset as u64,
        max_version,
        garbage,
    })
}

fn encode_record(
    op: u8,
    id: ArticleId,
    version: u64,
    category: Option<CategoryId>,
    embedding: &[f32],
) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + embedding.len() * BYTES_PER_F32);
    record.push(op);
    record.extend_from_slice(&id.to_bytes());
    record.extend_from_slice(&version.to_le_bytes());
    record.extend_from_slice(&CategoryId::encode(category).to_le_bytes());
    record.extend_from_slice(&(embedding.len() as u32).to_le_bytes());
    for value in embedding {
        record.extend_from_slice(&value.to_le_bytes());
    }
    record
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
