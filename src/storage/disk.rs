//! On-disk chunk group
//!
//! Every persisting series owns one directory holding five append-only files:
//!
//! ```text
//! chunks.hdr     FST records: per-chunk header (frame layout, column sizes, data crc)
//! chunks.dat     compressed sample columns, one block per (frame, channel)
//! registry.hdr   REG records: per-chunk registration header (catalog size and crc)
//! registry.dat   bincode-encoded catalog of each chunk
//! chunks.idx     fixed 41-byte big-endian index records:
//!                  u8 flag (=1), i64 index, i64 header offset, i64 data offset,
//!                  i64 registration header offset, i64 registration data offset
//! ```
//!
//! Tagged records are framed as `marker[3] | body_len: u32 LE | body | crc32(body): u32 LE`.
//!
//! A chunk is written data first, then header, registration data, registration
//! header and finally its index record, each flushed before the next begins. A
//! crash therefore leaves at worst an orphaned region nothing points at. Records
//! are never rewritten in place.
//!
//! Lock order for any chunk I/O: chunk door, then [`DiskChunkGroup::access`], then
//! the group's file door. [`DiskChunkGroup::with_files`] is the only way to reach
//! the file handles and it takes the last two in that order, given proof of the first.

use crate::storage::catalog::TimeRangeCatalog;
use crate::storage::compression::{compress_samples, decompress_samples};
use crate::storage::door::{DoorHeld, FileDoor};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Frame, FrameRange, SampleKind, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const HEADER_FILE: &str = "chunks.hdr";
pub const DATA_FILE: &str = "chunks.dat";
pub const REG_HEADER_FILE: &str = "registry.hdr";
pub const REG_DATA_FILE: &str = "registry.dat";
pub const INDEX_FILE: &str = "chunks.idx";

/// Size of one index record in bytes
pub const INDEX_RECORD_SIZE: usize = 41;

/// Flag of a chunk index record; other values are reserved.
pub const INDEX_FLAG_CHUNK: u8 = 1;

const MARKER_LEN: usize = 3;

/// Kinds of tagged records and their markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    ChunkHeader,
    Registration,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::ChunkHeader, RecordKind::Registration];

    pub fn marker(&self) -> &'static [u8; MARKER_LEN] {
        match self {
            RecordKind::ChunkHeader => b"FST",
            RecordKind::Registration => b"REG",
        }
    }

    pub fn from_marker(marker: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.marker() == marker)
    }
}

/// Whether each written section is fsynced after being flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `sync_data` after every section
    EveryWrite,
    /// Flush to the OS only
    #[default]
    Flush,
}

/// File positions of one chunk's four sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOffsets {
    pub header: u64,
    pub data: u64,
    pub reg_header: u64,
    pub reg_data: u64,
}

/// One record of the index file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub flag: u8,
    pub index: u64,
    pub offsets: DiskOffsets,
}

impl IndexRecord {
    pub fn new(index: u64, offsets: DiskOffsets) -> Self {
        Self {
            flag: INDEX_FLAG_CHUNK,
            index,
            offsets,
        }
    }

    pub fn to_bytes(&self) -> [u8; INDEX_RECORD_SIZE] {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        buf[0] = self.flag;
        let fields = [
            self.index as i64,
            self.offsets.header as i64,
            self.offsets.data as i64,
            self.offsets.reg_header as i64,
            self.offsets.reg_data as i64,
        ];
        for (i, value) in fields.iter().enumerate() {
            let at = 1 + i * 8;
            buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8; INDEX_RECORD_SIZE]) -> Self {
        let field = |i: usize| -> u64 {
            let at = 1 + i * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            i64::from_be_bytes(bytes) as u64
        };
        Self {
            flag: buf[0],
            index: field(0),
            offsets: DiskOffsets {
                header: field(1),
                data: field(2),
                reg_header: field(3),
                reg_data: field(4),
            },
        }
    }
}

/// How much of a chunk to read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Header, sample data and registration
    Full,
    /// Header and registration only; sample data is skipped
    SkeletonOnly,
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnHeader {
    name: String,
    kind: SampleKind,
    count: u64,
    block_len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    time: TimeRange,
    frames: Option<FrameRange>,
    columns: Vec<ColumnHeader>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkHeader {
    index: u64,
    frame_range: Option<FrameRange>,
    frames: Vec<FrameHeader>,
    data_len: u64,
    data_crc: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationHeader {
    index: u64,
    catalog_len: u64,
    catalog_crc: u32,
}

/// A chunk's content as read back from disk
#[derive(Debug, Clone)]
pub struct LoadedChunk {
    pub index: u64,
    /// Empty for [`LoadMode::SkeletonOnly`] reads
    pub frames: Vec<Frame>,
    pub frame_range: Option<FrameRange>,
    pub catalog: TimeRangeCatalog,
    pub mode: LoadMode,
}

/// Open handles of the five files
pub(crate) struct GroupFiles {
    header: File,
    data: File,
    reg_header: File,
    reg_data: File,
    index: File,
}

impl GroupFiles {
    fn open(dir: &Path) -> StorageResult<Self> {
        let open = |name: &str| -> StorageResult<File> {
            Ok(OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(dir.join(name))?)
        };
        Ok(Self {
            header: open(HEADER_FILE)?,
            data: open(DATA_FILE)?,
            reg_header: open(REG_HEADER_FILE)?,
            reg_data: open(REG_DATA_FILE)?,
            index: open(INDEX_FILE)?,
        })
    }
}

/// Released on drop; see [`DiskChunkGroup::access`].
pub struct AccessGuard<'a> {
    group: &'a DiskChunkGroup,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.group.release() {
            tracing::error!("Failed to release files of {:?}: {}", self.group.dir, e);
        }
    }
}

/// The on-disk file set backing the chunks of one series
pub struct DiskChunkGroup {
    dir: PathBuf,
    sync_mode: SyncMode,
    access_count: Mutex<usize>,
    files: FileDoor<Option<GroupFiles>>,
    last_loaded: Mutex<Option<Arc<LoadedChunk>>>,
    deleted: AtomicBool,
}

impl DiskChunkGroup {
    /// Open (creating if needed) the group in `dir`.
    pub fn open(dir: impl AsRef<Path>, sync_mode: SyncMode) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            files: FileDoor::new(format!("files:{}", dir.display()), None),
            dir,
            sync_mode,
            access_count: Mutex::new(0),
            last_loaded: Mutex::new(None),
            deleted: AtomicBool::new(false),
        })
    }

    /// True when `dir` already holds an index file.
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        dir.as_ref().join(INDEX_FILE).exists()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Open the files if nobody has them open and count one more user.
    pub fn access(&self) -> StorageResult<AccessGuard<'_>> {
        if self.is_deleted() {
            return Err(StorageError::InvalidState(format!(
                "chunk group {:?} was removed",
                self.dir
            )));
        }
        let mut count = self
            .access_count
            .lock()
            .map_err(|_| StorageError::Lock("access count poisoned".to_string()))?;
        if *count == 0 {
            let mut files = self.files.lock("access")?;
            if files.is_none() {
                *files = Some(GroupFiles::open(&self.dir)?);
            }
        }
        *count += 1;
        Ok(AccessGuard { group: self })
    }

    /// Count one user less and close the files when the last one leaves.
    fn release(&self) -> StorageResult<()> {
        let mut count = self
            .access_count
            .lock()
            .map_err(|_| StorageError::Lock("access count poisoned".to_string()))?;
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.files.lock("release")?.take();
        }
        Ok(())
    }

    /// Number of outstanding [`access`](Self::access) guards.
    pub fn access_count(&self) -> usize {
        self.access_count.lock().map(|c| *c).unwrap_or(0)
    }

    /// Run `f` against the open files. `held` is the guard of the door that must
    /// already be locked (the chunk's, or the series' during recovery).
    pub(crate) fn with_files<R>(
        &self,
        held: &dyn DoorHeld,
        label: &'static str,
        f: impl FnOnce(&mut GroupFiles) -> StorageResult<R>,
    ) -> StorageResult<R> {
        tracing::trace!(door = held.door_name(), label, "disk access");
        let access = self.access()?;
        let result = {
            let mut files = self.files.lock(label)?;
            match files.as_mut() {
                Some(open) => f(open),
                None => Err(StorageError::InvalidState(
                    "chunk group files are not open".to_string(),
                )),
            }
        };
        drop(access);
        result
    }

    /// Append one chunk and return where its sections landed.
    pub(crate) fn write_chunk(
        &self,
        held: &dyn DoorHeld,
        index: u64,
        frames: &[Frame],
        frame_range: Option<FrameRange>,
        catalog: &TimeRangeCatalog,
    ) -> StorageResult<DiskOffsets> {
        // Encode outside the file door; only the appends run under it.
        let mut data = Vec::new();
        let mut frame_headers = Vec::with_capacity(frames.len());
        for frame in frames {
            let mut columns = Vec::with_capacity(frame.channels.len());
            for (name, samples) in &frame.channels {
                let block = compress_samples(samples)?;
                columns.push(ColumnHeader {
                    name: name.clone(),
                    kind: samples.kind(),
                    count: samples.len() as u64,
                    block_len: block.len() as u64,
                });
                data.extend_from_slice(&block);
            }
            frame_headers.push(FrameHeader {
                time: frame.time.clone(),
                frames: frame.frames,
                columns,
            });
        }
        let header = bincode::serialize(&ChunkHeader {
            index,
            frame_range,
            frames: frame_headers,
            data_len: data.len() as u64,
            data_crc: crc32fast::hash(&data),
        })?;
        let reg_data = bincode::serialize(catalog)?;
        let reg_header = bincode::serialize(&RegistrationHeader {
            index,
            catalog_len: reg_data.len() as u64,
            catalog_crc: crc32fast::hash(&reg_data),
        })?;

        let sync = self.sync_mode;
        self.with_files(held, "write_chunk", |files| {
            let data_offset = append(&mut files.data, &[data.as_slice()], sync)?;
            let header_offset = append_record(&mut files.header, RecordKind::ChunkHeader, &header, sync)?;
            let reg_data_offset = append(&mut files.reg_data, &[reg_data.as_slice()], sync)?;
            let reg_header_offset =
                append_record(&mut files.reg_header, RecordKind::Registration, &reg_header, sync)?;
            let offsets = DiskOffsets {
                header: header_offset,
                data: data_offset,
                reg_header: reg_header_offset,
                reg_data: reg_data_offset,
            };
            let record = IndexRecord::new(index, offsets).to_bytes();
            append(&mut files.index, &[&record[..]], sync)?;
            Ok(offsets)
        })
    }

    /// Read one chunk back, validating markers, lengths and checksums.
    pub(crate) fn read_chunk(
        &self,
        held: &dyn DoorHeld,
        index: u64,
        offsets: DiskOffsets,
        mode: LoadMode,
    ) -> StorageResult<LoadedChunk> {
        let corrupt = |reason: String| StorageError::Format {
            index,
            header_offset: offsets.header,
            data_offset: offsets.data,
            reason,
        };

        let (header, data, reg, reg_data) =
            self.with_files(held, "read_chunk", |files| {
                let header_body = read_record(&mut files.header, offsets.header, RecordKind::ChunkHeader)
                    .map_err(&corrupt)?;
                let header: ChunkHeader = bincode::deserialize(&header_body)
                    .map_err(|e| corrupt(format!("undecodable chunk header: {}", e)))?;
                let data = match mode {
                    LoadMode::Full => read_exact_at(&mut files.data, offsets.data, header.data_len)
                        .map_err(|reason| corrupt(format!("data section: {}", reason)))?,
                    LoadMode::SkeletonOnly => Vec::new(),
                };
                let reg_header_body =
                    read_record(&mut files.reg_header, offsets.reg_header, RecordKind::Registration)
                        .map_err(&corrupt)?;
                let reg: RegistrationHeader = bincode::deserialize(&reg_header_body)
                    .map_err(|e| corrupt(format!("undecodable registration header: {}", e)))?;
                let reg_data = read_exact_at(&mut files.reg_data, offsets.reg_data, reg.catalog_len)
                    .map_err(|reason| corrupt(format!("registration section: {}", reason)))?;
                Ok((header, data, reg, reg_data))
            })?;

        if header.index != index || reg.index != index {
            return Err(corrupt(format!(
                "record belongs to chunk {} (registration {})",
                header.index, reg.index
            )));
        }
        if crc32fast::hash(&reg_data) != reg.catalog_crc {
            return Err(corrupt("registration checksum mismatch".to_string()));
        }
        let catalog: TimeRangeCatalog = bincode::deserialize(&reg_data)
            .map_err(|e| corrupt(format!("undecodable registration: {}", e)))?;

        let frames = match mode {
            LoadMode::SkeletonOnly => Vec::new(),
            LoadMode::Full => {
                if crc32fast::hash(&data) != header.data_crc {
                    return Err(corrupt("data checksum mismatch".to_string()));
                }
                decode_frames(header.frames, &data).map_err(|e| corrupt(e.to_string()))?
            }
        };

        Ok(LoadedChunk {
            index,
            frames,
            frame_range: header.frame_range,
            catalog,
            mode,
        })
    }

    /// Read every chunk record of the index file.
    ///
    /// A truncated trailing record (crash during the final append) is ignored, as
    /// are records with flags this version does not know.
    pub fn scan(&self, held: &dyn DoorHeld) -> StorageResult<Vec<IndexRecord>> {
        let bytes = self.with_files(held, "scan", |files| {
            let mut bytes = Vec::new();
            files.index.seek(SeekFrom::Start(0))?;
            files.index.read_to_end(&mut bytes)?;
            Ok(bytes)
        })?;

        let mut records = Vec::with_capacity(bytes.len() / INDEX_RECORD_SIZE);
        let mut chunks = bytes.chunks_exact(INDEX_RECORD_SIZE);
        for raw in &mut chunks {
            let mut buf = [0u8; INDEX_RECORD_SIZE];
            buf.copy_from_slice(raw);
            let record = IndexRecord::from_bytes(&buf);
            if record.flag != INDEX_FLAG_CHUNK {
                tracing::warn!(
                    "Skipping index record with unknown flag {} in {:?}",
                    record.flag,
                    self.dir
                );
                continue;
            }
            records.push(record);
        }
        if !chunks.remainder().is_empty() {
            tracing::warn!(
                "Ignoring truncated index record ({} bytes) in {:?}",
                chunks.remainder().len(),
                self.dir
            );
        }
        Ok(records)
    }

    /// Cached content of chunk `index`, if it was the last one loaded.
    pub fn cached(&self, index: u64) -> Option<Arc<LoadedChunk>> {
        let slot = self.last_loaded.lock().ok()?;
        slot.as_ref()
            .filter(|loaded| loaded.index == index && loaded.mode == LoadMode::Full)
            .cloned()
    }

    /// Replace the cached chunk.
    pub(crate) fn remember(&self, loaded: Arc<LoadedChunk>) {
        if let Ok(mut slot) = self.last_loaded.lock() {
            *slot = Some(loaded);
        }
    }

    /// Drop the cached copy of chunk `index`.
    pub fn invalidate(&self, index: u64) {
        if let Ok(mut slot) = self.last_loaded.lock() {
            if slot.as_ref().map_or(false, |loaded| loaded.index == index) {
                *slot = None;
            }
        }
    }

    /// Delete the directory. The group refuses further access afterwards.
    pub fn remove(&self) -> StorageResult<()> {
        self.deleted.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.last_loaded.lock() {
            *slot = None;
        }
        self.files.lock("remove")?.take();
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        tracing::info!("Removed chunk group {:?}", self.dir);
        Ok(())
    }
}

impl std::fmt::Debug for DiskChunkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskChunkGroup")
            .field("dir", &self.dir)
            .field("sync_mode", &self.sync_mode)
            .field("access_count", &self.access_count())
            .finish()
    }
}

/// Append `parts` at the end of `file`; returns the starting offset.
fn append(file: &mut File, parts: &[&[u8]], sync: SyncMode) -> StorageResult<u64> {
    let offset = file.seek(SeekFrom::End(0))?;
    {
        let mut writer = BufWriter::new(&mut *file);
        for part in parts {
            writer.write_all(part)?;
        }
        writer.flush()?;
    }
    if sync == SyncMode::EveryWrite {
        file.sync_data()?;
    }
    Ok(offset)
}

fn append_record(file: &mut File, kind: RecordKind, body: &[u8], sync: SyncMode) -> StorageResult<u64> {
    let len = (body.len() as u32).to_le_bytes();
    let crc = crc32fast::hash(body).to_le_bytes();
    append(file, &[&kind.marker()[..], &len[..], body, &crc[..]], sync)
}

/// Read `len` bytes at `offset`. Errors are returned as text for the caller to wrap.
fn read_exact_at(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>, String> {
    let io = |e: std::io::Error| {
        if e.kind() == ErrorKind::UnexpectedEof {
            format!("unexpected end of file reading {} bytes at {}", len, offset)
        } else {
            e.to_string()
        }
    };
    let file_len = file.metadata().map_err(io)?.len();
    if offset.checked_add(len).map_or(true, |end| end > file_len) {
        return Err(format!(
            "unexpected end of file reading {} bytes at {}",
            len, offset
        ));
    }
    file.seek(SeekFrom::Start(offset)).map_err(io)?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).map_err(io)?;
    Ok(buf)
}

/// Read a tagged record at `offset` and return its verified body.
fn read_record(file: &mut File, offset: u64, expected: RecordKind) -> Result<Vec<u8>, String> {
    let prefix = read_exact_at(file, offset, (MARKER_LEN + 4) as u64)?;
    let marker = &prefix[..MARKER_LEN];
    if marker != expected.marker() {
        return Err(format!(
            "expected marker {} but found {:?}",
            String::from_utf8_lossy(expected.marker()),
            String::from_utf8_lossy(marker)
        ));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&prefix[MARKER_LEN..]);
    let len = u32::from_le_bytes(len_bytes) as u64;

    let body_offset = offset + prefix.len() as u64;
    let rest = read_exact_at(file, body_offset, len + 4)?;
    let (body, crc_bytes) = rest.split_at(len as usize);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(crc_bytes);
    if crc32fast::hash(body) != u32::from_le_bytes(crc) {
        return Err(format!(
            "{} record checksum mismatch",
            String::from_utf8_lossy(expected.marker())
        ));
    }
    Ok(body.to_vec())
}

fn decode_frames(headers: Vec<FrameHeader>, data: &[u8]) -> StorageResult<Vec<Frame>> {
    let mut cursor = 0usize;
    let mut frames = Vec::with_capacity(headers.len());
    for header in headers {
        let mut channels = BTreeMap::new();
        for column in header.columns {
            let end = cursor
                .checked_add(column.block_len as usize)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| {
                    StorageError::Compression(format!(
                        "column {} runs past the data section",
                        column.name
                    ))
                })?;
            let samples = decompress_samples(&data[cursor..end], column.count as usize)?;
            if samples.kind() != column.kind {
                return Err(StorageError::Compression(format!(
                    "column {} decoded as {} but was written as {}",
                    column.name,
                    samples.kind(),
                    column.kind
                )));
            }
            channels.insert(column.name, samples);
            cursor = end;
        }
        frames.push(Frame {
            time: header.time,
            frames: header.frames,
            channels,
        });
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::door::Door;
    use crate::storage::types::Samples;
    use tempfile::tempdir;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(TimeRange::new(0.0, 4.0))
                .channel("temp", Samples::Float64(vec![1.0, 2.0, 3.0, 4.0]))
                .channel("count", Samples::Int64(vec![10, 11, 12, 13])),
            Frame::new(TimeRange::points(vec![4.0, 5.5], 0.0).unwrap())
                .channel("temp", Samples::Float64(vec![5.0, 6.0]))
                .frame_range(FrameRange::new(4, 2)),
        ]
    }

    fn catalog_of(frames: &[Frame]) -> TimeRangeCatalog {
        let mut catalog = TimeRangeCatalog::new();
        for frame in frames {
            catalog.update_registration(frame, false, false);
        }
        catalog
    }

    #[test]
    fn test_index_record_layout() {
        let record = IndexRecord::new(
            3,
            DiskOffsets {
                header: 1,
                data: 2,
                reg_header: 3,
                reg_data: 0x0102_0304,
            },
        );
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 41);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..9], &3i64.to_be_bytes());
        assert_eq!(&bytes[33..41], &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(IndexRecord::from_bytes(&bytes), record);
    }

    #[test]
    fn test_marker_table() {
        assert_eq!(RecordKind::from_marker(b"FST"), Some(RecordKind::ChunkHeader));
        assert_eq!(RecordKind::from_marker(b"REG"), Some(RecordKind::Registration));
        assert_eq!(RecordKind::from_marker(b"XYZ"), None);
    }

    #[tokio::test]
    async fn test_write_then_read_chunk() {
        let dir = tempdir().unwrap();
        let group = DiskChunkGroup::open(dir.path(), SyncMode::EveryWrite).unwrap();
        let door = Door::new("chunk", ());
        let held = door.write("test").await;

        let frames = sample_frames();
        let catalog = catalog_of(&frames);
        let offsets = group
            .write_chunk(&held, 0, &frames, Some(FrameRange::new(0, 6)), &catalog)
            .unwrap();
        assert_eq!(offsets.data, 0);
        assert_eq!(group.access_count(), 0);

        let loaded = group.read_chunk(&held, 0, offsets, LoadMode::Full).unwrap();
        assert_eq!(loaded.frames, frames);
        assert_eq!(loaded.catalog, catalog);
        assert_eq!(loaded.frame_range, Some(FrameRange::new(0, 6)));

        let skeleton = group
            .read_chunk(&held, 0, offsets, LoadMode::SkeletonOnly)
            .unwrap();
        assert!(skeleton.frames.is_empty());
        assert_eq!(skeleton.catalog, catalog);

        let records = group.scan(&held).unwrap();
        assert_eq!(records, vec![IndexRecord::new(0, offsets)]);
    }

    #[tokio::test]
    async fn test_marker_mismatch_is_format_error() {
        let dir = tempdir().unwrap();
        let group = DiskChunkGroup::open(dir.path(), SyncMode::Flush).unwrap();
        let door = Door::new("chunk", ());
        let held = door.write("test").await;

        let frames = sample_frames();
        let catalog = catalog_of(&frames);
        group.write_chunk(&held, 0, &frames, None, &catalog).unwrap();
        let second = group.write_chunk(&held, 1, &frames, None, &catalog).unwrap();

        // point the header offset into the middle of a record
        let bad = DiskOffsets {
            header: second.header + 1,
            ..second
        };
        let err = group.read_chunk(&held, 1, bad, LoadMode::Full).unwrap_err();
        match err {
            StorageError::Format {
                index,
                header_offset,
                data_offset,
                ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(header_offset, second.header + 1);
                assert_eq!(data_offset, second.data);
            }
            other => panic!("unexpected error: {}", other),
        }

        // wrong chunk index for a valid record
        let err = group.read_chunk(&held, 5, second, LoadMode::Full).unwrap_err();
        assert!(err.is_format());
    }

    #[tokio::test]
    async fn test_truncated_data_is_format_error() {
        let dir = tempdir().unwrap();
        let group = DiskChunkGroup::open(dir.path(), SyncMode::Flush).unwrap();
        let door = Door::new("chunk", ());
        let held = door.write("test").await;

        let frames = sample_frames();
        let offsets = group
            .write_chunk(&held, 0, &frames, None, &catalog_of(&frames))
            .unwrap();

        let data_path = dir.path().join(DATA_FILE);
        let len = std::fs::metadata(&data_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&data_path).unwrap();
        file.set_len(len / 2).unwrap();

        let err = group.read_chunk(&held, 0, offsets, LoadMode::Full).unwrap_err();
        assert!(err.is_format());
        // skeleton reads never touch the data file
        assert!(group
            .read_chunk(&held, 0, offsets, LoadMode::SkeletonOnly)
            .is_ok());
    }

    #[tokio::test]
    async fn test_scan_ignores_truncated_tail_and_unknown_flags() {
        let dir = tempdir().unwrap();
        let group = DiskChunkGroup::open(dir.path(), SyncMode::Flush).unwrap();
        let door = Door::new("series", ());
        let held = door.write("test").await;

        let frames = sample_frames();
        let offsets = group
            .write_chunk(&held, 0, &frames, None, &catalog_of(&frames))
            .unwrap();

        let mut unknown = IndexRecord::new(9, offsets);
        unknown.flag = 7;
        let mut index = OpenOptions::new()
            .append(true)
            .open(dir.path().join(INDEX_FILE))
            .unwrap();
        index.write_all(&unknown.to_bytes()).unwrap();
        index.write_all(&[1, 0, 0]).unwrap();
        drop(index);

        let records = group.scan(&held).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, 0);
    }

    #[tokio::test]
    async fn test_access_is_reference_counted() {
        let dir = tempdir().unwrap();
        let group = DiskChunkGroup::open(dir.path(), SyncMode::Flush).unwrap();

        let a = group.access().unwrap();
        let b = group.access().unwrap();
        assert_eq!(group.access_count(), 2);
        drop(a);
        assert!(group.files.lock("test").unwrap().is_some());
        drop(b);
        assert_eq!(group.access_count(), 0);
        assert!(group.files.lock("test").unwrap().is_none());
    }

    #[test]
    fn test_cache_invalidation() {
        let dir = tempdir().unwrap();
        let group = DiskChunkGroup::open(dir.path(), SyncMode::Flush).unwrap();
        let loaded = Arc::new(LoadedChunk {
            index: 4,
            frames: Vec::new(),
            frame_range: None,
            catalog: TimeRangeCatalog::new(),
            mode: LoadMode::Full,
        });
        group.remember(Arc::clone(&loaded));
        assert!(group.cached(4).is_some());
        assert!(group.cached(5).is_none());

        group.invalidate(5);
        assert!(group.cached(4).is_some());
        group.invalidate(4);
        assert!(group.cached(4).is_none());
    }

    #[test]
    fn test_remove_refuses_access() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("series");
        let group = DiskChunkGroup::open(&path, SyncMode::Flush).unwrap();
        drop(group.access().unwrap());
        group.remove().unwrap();
        assert!(!path.exists());
        assert!(group.access().is_err());
    }
}
