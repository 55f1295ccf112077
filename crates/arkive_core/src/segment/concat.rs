//! Segments stored as a single file of concatenated records.

use super::check::check_stream;
use super::{append_padded, len_of, mischief, Appended, Segment, SegmentBase, SegmentCheck};
use crate::dir::{self, remove_if_exists, SavedTimes};
use crate::error::{CoreError, CoreResult};
use crate::format::Format;
use crate::record::Record;
use crate::transaction::{Pending, Transaction};
use arkive_storage::{FileBackend, StorageBackend, StorageError};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A segment made of one growable file.
#[derive(Debug)]
pub struct ConcatSegment {
    base: SegmentBase,
}

impl ConcatSegment {
    /// Creates a handle; nothing is touched on disk.
    #[must_use]
    pub fn new(root: &Path, relpath: &str, format: Arc<dyn Format>) -> Self {
        Self {
            base: SegmentBase::new(root, relpath, format),
        }
    }

    fn open_read(&self) -> CoreResult<FileBackend> {
        FileBackend::open_read_only(&self.base.abspath).map_err(|e| match e {
            StorageError::NotFound(_) => self.base.not_found(),
            other => other.into(),
        })
    }

    fn read_from(&self, backend: &FileBackend, offset: u64, size: u64) -> CoreResult<Vec<u8>> {
        backend
            .read_at(offset, len_of(size)?)
            .map_err(|e| self.base.read_error(e, offset, size))
    }

    /// Rewrites the whole file through `change`, keeping its times.
    fn rewrite(&self, change: impl FnOnce(&mut Vec<u8>) -> CoreResult<()>) -> CoreResult<()> {
        let path = &self.base.abspath;
        let times = SavedTimes::of(path)?;
        let mut buf = fs::read(path)?;
        change(&mut buf)?;
        fs::write(path, &buf)?;
        times.restore(path)
    }

    fn write_repacked(&self, tmp: &Path, records: &mut [Record], validate: bool) -> CoreResult<()> {
        let src = self.open_read()?;
        let mut out = FileBackend::create(tmp)?;
        let padding = self.base.format.padding();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records.iter() {
            let source = record.stored_source()?;
            let data = self.read_from(&src, source.offset, source.size)?;
            if validate {
                self.base.format.validate(&data)?;
            }
            offsets.push(out.append(&data)?);
            if !padding.is_empty() {
                out.append(padding)?;
            }
        }
        out.sync()?;
        for (record, offset) in records.iter_mut().zip(offsets) {
            if let Some(source) = record.source.as_mut() {
                source.offset = offset;
                source.basedir.clone_from(&self.base.root);
            }
        }
        Ok(())
    }
}

/// Undo information for one append.
struct AppendTx {
    backend: FileBackend,
    offset: u64,
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
            return Ok(());
        }
        self.backend.truncate(self.offset)?;
        if let Some(times) = &self.times {
            times.restore(&path)?;
        }
        Ok(())
    }

    fn revert(&mut self) -> CoreResult<()> {
        self.rollback()
    }
}

/// Moves a repacked file over the original.
struct RenameTx {
    tmp: PathBuf,
    target: PathBuf,
}

impl Transaction for RenameTx {
    fn commit(&mut self) -> CoreResult<()> {
        fs::rename(&self.tmp, &self.target)?;
        if let Some(parent) = self.target.parent() {
            dir::sync_directory(parent)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        remove_if_exists(&self.tmp)?;
        Ok(())
    }
}

impl Segment for ConcatSegment {
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
        self.base.abspath.is_file()
    }

    fn size(&self) -> CoreResult<u64> {
        Ok(self.open_read()?.size()?)
    }

    fn mtime(&self) -> CoreResult<i64> {
        if !self.exists() {
            return Err(self.base.not_found());
        }
        dir::mtime(&self.base.abspath)
    }

    fn append(&self, data: &[u8]) -> CoreResult<Appended> {
        let created = !self.exists();
        let times = if created {
            None
        } else {
            Some(SavedTimes::of(&self.base.abspath)?)
        };
        let mut backend = FileBackend::open_with_create_dirs(&self.base.abspath)?;
        let (start, offset) = append_padded(&mut backend, data, self.base.format.padding())
            .inspect_err(|e| {
                let undo = match &times {
                    None => remove_if_exists(&self.base.abspath).map(|_| ()),
                    Some(times) => times.restore(&self.base.abspath),
                };
                if let Err(undo) = undo {
                    warn!(segment = %self.base.relpath, error = %undo, "cannot undo failed append");
                }
                warn!(segment = %self.base.relpath, error = %e, "append failed");
            })?;
        debug!(segment = %self.base.relpath, offset, size = data.len(), "appended");

        Ok(Appended {
            offset,
            pending: Pending::new(Box::new(AppendTx {
                backend,
                offset: start,
                created,
                times,
            })),
        })
    }

    fn read(&self, offset: u64, size: u64) -> CoreResult<Bytes> {
        let backend = self.open_read()?;
        Ok(Bytes::from(self.read_from(&backend, offset, size)?))
    }

    fn check(&self, records: &[Record], quick: bool) -> CoreResult<SegmentCheck> {
        let backend = self.open_read()?;
        check_stream(&backend, &self.base.relpath, self.base.format.as_ref(), records, quick)
    }

    fn scan(&self) -> CoreResult<Vec<Record>> {
        let buf = match fs::read(&self.base.abspath) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.base.not_found())
            }
            Err(e) => return Err(e.into()),
        };
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
        let tmp = self.base.repack_path();
        if let Err(e) = self.write_repacked(&tmp, records, validate) {
            if let Err(cleanup) = remove_if_exists(&tmp) {
                warn!(path = %tmp.display(), error = %cleanup, "cannot remove repack leftover");
            }
            return Err(e);
        }
        Ok(Pending::new(Box::new(RenameTx {
            tmp,
            target: self.base.abspath.clone(),
        })))
    }

    fn remove(&self) -> CoreResult<u64> {
        let size = match fs::metadata(&self.base.abspath) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&self.base.abspath)?;
        Ok(size)
    }

    fn truncate(&self, offset: u64) -> CoreResult<()> {
        let path = &self.base.abspath;
        let times = SavedTimes::of(path).map_err(|_| self.base.not_found())?;
        let mut backend = FileBackend::open_existing(path)?;
        backend.truncate(offset).map_err(|e| match e {
            StorageError::TruncatePastEnd { requested, size } => {
                CoreError::invalid_operation(format!(
                    "cannot truncate {} to {requested} bytes: it is only {size} bytes",
                    self.base.relpath
                ))
            }
            other => other.into(),
        })?;
        times.restore(path)
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
