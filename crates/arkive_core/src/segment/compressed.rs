//! Segments stored as lz4-compressed blocks.
//!
//! ```text
//! 07-08.vm2.lz4      # blocks, each lz4 with its uncompressed size prepended
//! 07-08.vm2.lz4.idx  # 16-byte LE entries (uncompressed offset, compressed offset)
//! ```
//!
//! Offsets in sources refer to the uncompressed stream, which is laid out
//! exactly like a concatenated segment. The block index is only written
//! once the file holds more than one block; a lone block spans the file.

use super::check::check_stream;
use super::{len_of, mischief, Appended, Segment, SegmentBase, SegmentCheck, SegmentState};
use crate::dir::{self, remove_if_exists, rename_if_exists, with_suffix, SavedTimes};
use crate::error::{CoreError, CoreResult};
use crate::format::Format;
use crate::record::Record;
use crate::transaction::{Pending, Transaction};
use arkive_storage::{FileBackend, InMemoryBackend, StorageBackend, StorageError};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const INDEX_ENTRY: usize = 16;

/// Position of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockEntry {
    uncompressed: u64,
    compressed: u64,
}

/// A segment of lz4 blocks.
#[derive(Debug)]
pub struct CompressedSegment {
    base: SegmentBase,
    data_path: PathBuf,
    index_path: PathBuf,
    group_size: usize,
}

fn encode_index(entries: &[BlockEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * INDEX_ENTRY);
    for entry in entries {
        out.extend_from_slice(&entry.uncompressed.to_le_bytes());
        out.extend_from_slice(&entry.compressed.to_le_bytes());
    }
    out
}

fn decode_index(buf: &[u8]) -> CoreResult<Vec<BlockEntry>> {
    if buf.len() % INDEX_ENTRY != 0 {
        return Err(CoreError::corrupted(format!(
            "block index size {} is not a multiple of {INDEX_ENTRY}",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(INDEX_ENTRY)
        .map(|chunk| {
            let mut u = [0u8; 8];
            let mut c = [0u8; 8];
            u.copy_from_slice(&chunk[..8]);
            c.copy_from_slice(&chunk[8..]);
            BlockEntry {
                uncompressed: u64::from_le_bytes(u),
                compressed: u64::from_le_bytes(c),
            }
        })
        .collect())
}

fn decompress(block: &[u8]) -> CoreResult<Vec<u8>> {
    lz4_flex::decompress_size_prepended(block)
        .map_err(|e| CoreError::corrupted(format!("cannot decompress block: {e}")))
}

/// Compressed file contents and block index for `chunks`, one block each.
fn encode_blocks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> (Vec<u8>, Vec<BlockEntry>) {
    let mut data = Vec::new();
    let mut entries = Vec::new();
    let mut uncompressed = 0u64;
    for chunk in chunks {
        entries.push(BlockEntry {
            uncompressed,
            compressed: data.len() as u64,
        });
        data.extend_from_slice(&lz4_flex::compress_prepend_size(chunk));
        uncompressed += chunk.len() as u64;
    }
    (data, entries)
}

impl CompressedSegment {
    /// Creates a handle; nothing is touched on disk.
    ///
    /// Repacking puts `group_size` records in each block.
    #[must_use]
    pub fn new(root: &Path, relpath: &str, format: Arc<dyn Format>, group_size: usize) -> Self {
        let base = SegmentBase::new(root, relpath, format);
        let data_path = with_suffix(&base.abspath, ".lz4");
        let index_path = with_suffix(&data_path, ".idx");
        Self {
            base,
            data_path,
            index_path,
            group_size: group_size.max(1),
        }
    }

    fn file_size(&self) -> CoreResult<u64> {
        match fs::metadata(&self.data_path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(self.base.not_found()),
            Err(e) => Err(e.into()),
        }
    }

    fn blocks(&self) -> CoreResult<Vec<BlockEntry>> {
        if self.file_size()? == 0 {
            return Ok(Vec::new());
        }
        match fs::read(&self.index_path) {
            Ok(buf) => decode_index(&buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![BlockEntry {
                uncompressed: 0,
                compressed: 0,
            }]),
            Err(e) => Err(e.into()),
        }
    }

    /// Decompresses the whole stream.
    fn stream(&self) -> CoreResult<Vec<u8>> {
        let file = fs::read(&self.data_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => self.base.not_found(),
            _ => e.into(),
        })?;
        let blocks = self.blocks()?;
        let mut out = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            let start = len_of(block.compressed)?;
            let end = match blocks.get(i + 1) {
                Some(next) => len_of(next.compressed)?,
                None => file.len(),
            };
            let chunk = file
                .get(start..end)
                .ok_or_else(|| CoreError::corrupted("block index points past the end of the file"))?;
            out.extend_from_slice(&decompress(chunk)?);
        }
        Ok(out)
    }

    /// Writes a fresh file and index, replacing the current ones.
    fn write_blocks(&self, data: &[u8], entries: &[BlockEntry]) -> CoreResult<()> {
        dir::write_atomically(&self.data_path, data)?;
        if entries.len() > 1 {
            dir::write_atomically(&self.index_path, &encode_index(entries))?;
        } else {
            remove_if_exists(&self.index_path)?;
        }
        Ok(())
    }

    /// Rewrites the uncompressed stream through `change` as a single block,
    /// keeping the segment modification time.
    fn rewrite(&self, change: impl FnOnce(&mut Vec<u8>) -> CoreResult<()>) -> CoreResult<()> {
        let mtime = self.mtime()?;
        let mut buf = self.stream()?;
        change(&mut buf)?;
        let (data, entries) = encode_blocks([buf.as_slice()]);
        self.write_blocks(&data, &entries)?;
        dir::set_mtime(&self.data_path, mtime)
    }

    fn repack_paths(&self) -> (PathBuf, PathBuf) {
        (
            with_suffix(&self.data_path, ".repack"),
            with_suffix(&self.index_path, ".repack"),
        )
    }

    fn write_repacked(&self, records: &mut [Record], validate: bool) -> CoreResult<(PathBuf, PathBuf)> {
        let stream = InMemoryBackend::with_data(self.stream()?);
        self.write_grouped(records, validate, |offset, size| {
            stream
                .read_at(offset, len_of(size)?)
                .map_err(|e| self.base.read_error(e, offset, size))
        })
    }

    /// Writes the records returned by `read` to the repack paths,
    /// `group_size` records per block, and points their sources at the new
    /// stream.
    fn write_grouped(
        &self,
        records: &mut [Record],
        validate: bool,
        read: impl Fn(u64, u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<(PathBuf, PathBuf)> {
        let padding = self.base.format.padding();
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        let mut offset = 0u64;
        for (i, record) in records.iter().enumerate() {
            let source = record.stored_source()?;
            let data = read(source.offset, source.size)?;
            if validate {
                self.base.format.validate(&data)?;
            }
            if i % self.group_size == 0 {
                chunks.push(Vec::new());
            }
            if let Some(chunk) = chunks.last_mut() {
                chunk.extend_from_slice(&data);
                chunk.extend_from_slice(padding);
            }
            offsets.push(offset);
            offset += (data.len() + padding.len()) as u64;
        }

        let (data, entries) = encode_blocks(chunks.iter().map(Vec::as_slice));
        let (tmp_data, tmp_index) = self.repack_paths();
        dir::write_atomically(&tmp_data, &data)?;
        if entries.len() > 1 {
            dir::write_atomically(&tmp_index, &encode_index(&entries))?;
        } else {
            remove_if_exists(&tmp_index)?;
        }

        for (record, offset) in records.iter_mut().zip(offsets) {
            if let Some(source) = record.source.as_mut() {
                source.offset = offset;
                source.basedir.clone_from(&self.base.root);
            }
        }
        Ok((tmp_data, tmp_index))
    }
}

impl CompressedSegment {
    /// Copies the records of `original` into blocks of this segment.
    ///
    /// Sources in `records` are updated to the new stream. Commit moves the
    /// blocks in place and removes `original`; rollback leaves `original`
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if compressed data already exists or a record cannot
    /// be read.
    pub fn compress_from(&self, original: Arc<dyn Segment>, records: &mut [Record]) -> CoreResult<Pending> {
        if self.data_path.exists() || self.index_path.exists() {
            return Err(CoreError::invalid_operation(format!(
                "{} is already compressed",
                self.base.relpath
            )));
        }
        let written = self.write_grouped(records, true, |offset, size| {
            original.read(offset, size).map(|bytes| bytes.to_vec())
        });
        let (tmp_data, tmp_index) = self.repack_paths();
        if let Err(e) = written {
            for tmp in [&tmp_data, &tmp_index] {
                if let Err(cleanup) = remove_if_exists(tmp) {
                    warn!(path = %tmp.display(), error = %cleanup, "cannot remove compress leftover");
                }
            }
            return Err(e);
        }
        Ok(Pending::new(Box::new(CompressTx {
            rename: RenameTx {
                tmp_data,
                tmp_index,
                data: self.data_path.clone(),
                index: self.index_path.clone(),
            },
            original,
        })))
    }
}

/// Undo information for one appended block.
struct AppendTx {
    backend: FileBackend,
    index_path: PathBuf,
    previous_size: u64,
    previous_index: Option<Vec<u8>>,
    created: bool,
    times: Option<SavedTimes>,
}

impl Transaction for AppendTx {
    fn commit(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        let path = self.backend.path().to_path_buf();
        if self.created {
            remove_if_exists(&path)?;
            remove_if_exists(&self.index_path)?;
            return Ok(());
        }
        self.backend.truncate(self.previous_size)?;
        match &self.previous_index {
            Some(buf) => dir::write_atomically(&self.index_path, buf)?,
            None => {
                remove_if_exists(&self.index_path)?;
            }
        }
        if let Some(times) = &self.times {
            times.restore(&path)?;
        }
        Ok(())
    }

    fn revert(&mut self) -> CoreResult<()> {
        self.rollback()
    }
}

/// Moves a repacked file and index over the originals.
struct RenameTx {
    tmp_data: PathBuf,
    tmp_index: PathBuf,
    data: PathBuf,
    index: PathBuf,
}

impl Transaction for RenameTx {
    fn commit(&mut self) -> CoreResult<()> {
        if !rename_if_exists(&self.tmp_index, &self.index)? {
            remove_if_exists(&self.index)?;
        }
        fs::rename(&self.tmp_data, &self.data)?;
        if let Some(parent) = self.data.parent() {
            dir::sync_directory(parent)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        remove_if_exists(&self.tmp_data)?;
        remove_if_exists(&self.tmp_index)?;
        Ok(())
    }
}

/// Replaces a segment of another kind with its compressed copy.
struct CompressTx {
    rename: RenameTx,
    original: Arc<dyn Segment>,
}

impl Transaction for CompressTx {
    fn commit(&mut self) -> CoreResult<()> {
        self.rename.commit()?;
        if let Err(e) = self.original.remove() {
            for path in [&self.rename.data, &self.rename.index] {
                if let Err(undo) = remove_if_exists(path) {
                    warn!(path = %path.display(), error = %undo, "cannot remove compressed copy");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.rename.rollback()
    }
}

impl Segment for CompressedSegment {
    fn relpath(&self) -> &str {
        &self.base.relpath
    }

    fn abspath(&self) -> &Path {
        &self.base.abspath
    }

    fn format(&self) -> &Arc<dyn Format> {
        &self.base.format
    }

    fn exists(&self) -> bool {
        self.data_path.is_file()
    }

    fn size(&self) -> CoreResult<u64> {
        let index = fs::metadata(&self.index_path).map_or(0, |m| m.len());
        Ok(self.file_size()? + index)
    }

    fn mtime(&self) -> CoreResult<i64> {
        let data = dir::mtime_if_exists(&self.data_path)?.ok_or_else(|| self.base.not_found())?;
        let index = dir::mtime_if_exists(&self.index_path)?.unwrap_or(data);
        Ok(data.max(index))
    }

    fn append(&self, data: &[u8]) -> CoreResult<Appended> {
        let created = !self.exists();
        let times = if created {
            None
        } else {
            Some(SavedTimes::of(&self.data_path)?)
        };
        let mut blocks = if created { Vec::new() } else { self.blocks()? };
        let offset = if created {
            0
        } else {
            self.stream_len(&blocks)?
        };
        let previous_index = match fs::read(&self.index_path) {
            Ok(buf) => Some(buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut backend = FileBackend::open_with_create_dirs(&self.data_path)?;
        let previous_size = backend.size()?;
        let mut chunk = Vec::with_capacity(data.len() + self.base.format.padding().len());
        chunk.extend_from_slice(data);
        chunk.extend_from_slice(self.base.format.padding());
        blocks.push(BlockEntry {
            uncompressed: offset,
            compressed: previous_size,
        });

        let written = backend
            .append(&lz4_flex::compress_prepend_size(&chunk))
            .and_then(|_| backend.flush())
            .map_err(CoreError::from)
            .and_then(|()| {
                if blocks.len() > 1 {
                    dir::write_atomically(&self.index_path, &encode_index(&blocks))
                } else {
                    Ok(())
                }
            });
        if let Err(e) = written {
            if let Err(undo) = backend.truncate(previous_size) {
                warn!(segment = %self.base.relpath, error = %undo, "cannot truncate after failed append");
            }
            return Err(e);
        }
        debug!(segment = %self.base.relpath, offset, size = data.len(), "appended block");

        Ok(Appended {
            offset,
            pending: Pending::new(Box::new(AppendTx {
                backend,
                index_path: self.index_path.clone(),
                previous_size,
                previous_index,
                created,
                times,
            })),
        })
    }

    fn read(&self, offset: u64, size: u64) -> CoreResult<Bytes> {
        let file = FileBackend::open_read_only(&self.data_path).map_err(|e| match e {
            StorageError::NotFound(_) => self.base.not_found(),
            other => other.into(),
        })?;
        let file_size = file.size()?;
        let blocks = self.blocks()?;
        let mut out = Vec::with_capacity(len_of(size)?);
        let end = offset
            .checked_add(size)
            .ok_or_else(|| self.base.truncated(offset, size, file_size))?;
        let first = blocks
            .partition_point(|b| b.uncompressed <= offset)
            .saturating_sub(1);
        for (i, block) in blocks.iter().enumerate().skip(first) {
            if block.uncompressed >= end {
                break;
            }
            let next = blocks.get(i + 1).map_or(file_size, |b| b.compressed);
            let compressed_len = next.checked_sub(block.compressed).ok_or_else(|| {
                CoreError::corrupted(format!(
                    "{}: block index is out of order at block {i}",
                    self.base.relpath
                ))
            })?;
            let chunk = file.read_at(block.compressed, len_of(compressed_len)?)?;
            let plain = decompress(&chunk)?;
            let start = offset.saturating_sub(block.uncompressed);
            let stop = (end - block.uncompressed).min(plain.len() as u64);
            if start < stop {
                out.extend_from_slice(&plain[len_of(start)?..len_of(stop)?]);
            }
        }
        if (out.len() as u64) < size {
            return Err(self.base.truncated(offset, size, offset + out.len() as u64));
        }
        Ok(Bytes::from(out))
    }

    fn check(&self, records: &[Record], quick: bool) -> CoreResult<SegmentCheck> {
        let stream = match self.stream() {
            Ok(stream) => stream,
            Err(CoreError::Corrupted { message }) => {
                return Ok(SegmentCheck::with_note(SegmentState::UNALIGNED, message))
            }
            Err(e) => return Err(e),
        };
        let backend = InMemoryBackend::with_data(stream);
        check_stream(&backend, &self.base.relpath, self.base.format.as_ref(), records, quick)
    }

    fn scan(&self) -> CoreResult<Vec<Record>> {
        let buf = self.stream()?;
        let mut records = Vec::new();
        for (offset, size) in self.base.format.split(&buf) {
            let (start, end) = (len_of(offset)?, len_of(offset + size)?);
            match self.base.scanned(&buf[start..end], offset) {
                Ok(record) => records.push(record),
                Err(e) => debug!(segment = %self.base.relpath, offset, error = %e, "skipping unparsable data"),
            }
        }
        Ok(records)
    }

    fn repack(&self, records: &mut [Record], validate: bool) -> CoreResult<Pending> {
        match self.write_repacked(records, validate) {
            Ok((tmp_data, tmp_index)) => Ok(Pending::new(Box::new(RenameTx {
                tmp_data,
                tmp_index,
                data: self.data_path.clone(),
                index: self.index_path.clone(),
            }))),
            Err(e) => {
                let (tmp_data, tmp_index) = self.repack_paths();
                for tmp in [tmp_data, tmp_index] {
                    if let Err(cleanup) = remove_if_exists(&tmp) {
                        warn!(path = %tmp.display(), error = %cleanup, "cannot remove repack leftover");
                    }
                }
                Err(e)
            }
        }
    }

    fn remove(&self) -> CoreResult<u64> {
        let size = match self.size() {
            Ok(size) => size,
            Err(CoreError::NotFound { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };
        fs::remove_file(&self.data_path)?;
        remove_if_exists(&self.index_path)?;
        Ok(size)
    }

    fn truncate(&self, offset: u64) -> CoreResult<()> {
        let mtime = self.mtime()?;
        let stream = self.stream()?;
        if offset > stream.len() as u64 {
            return Err(CoreError::invalid_operation(format!(
                "cannot truncate {} to {offset} bytes: it is only {} bytes",
                self.base.relpath,
                stream.len()
            )));
        }
        let cut = len_of(offset)?;
        let blocks = self.blocks()?;
        let mut chunks: Vec<&[u8]> = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            let start = len_of(block.uncompressed)?;
            if start >= cut {
                break;
            }
            let end = match blocks.get(i + 1) {
                Some(next) => len_of(next.uncompressed)?,
                None => stream.len(),
            };
            chunks.push(&stream[start..end.min(cut)]);
        }
        let (data, entries) = encode_blocks(chunks);
        self.write_blocks(&data, &entries)?;
        dir::set_mtime(&self.data_path, mtime)
    }

    fn make_hole(&self, records: &mut [Record], index: usize, size: u64) -> CoreResult<()> {
        self.rewrite(|buf| mischief::make_hole(buf, records, index, size))
    }

    fn make_overlap(&self, records: &mut [Record], index: usize, overlap: u64) -> CoreResult<()> {
        self.rewrite(|buf| mischief::make_overlap(buf, records, index, overlap))
    }

    fn corrupt(&self, records: &[Record], index: usize) -> CoreResult<()> {
        self.rewrite(|buf| mischief::corrupt(buf, records, index))
    }
}

impl CompressedSegment {
    /// Length of the uncompressed stream, from the last block's size prefix.
    fn stream_len(&self, blocks: &[BlockEntry]) -> CoreResult<u64> {
        let Some(last) = blocks.last() else {
            return Ok(0);
        };
        let file = FileBackend::open_read_only(&self.data_path)?;
        let prefix = file.read_at(last.compressed, 4)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&prefix);
        last.uncompressed
            .checked_add(u64::from(u32::from_le_bytes(len)))
            .ok_or_else(|| CoreError::corrupted(format!("{}: block index is corrupted", self.base.relpath)))
    }
}
