//! Segments stored as a directory with one member file per record.
//!
//! ```text
//! 07-08.vm2/
//! ├── .sequence     # u64 LE: the next member number
//! ├── 000000.vm2
//! ├── 000001.vm2
//! └── ...
//! ```
//!
//! A record's offset is its member number and its size is the member's
//! length. Numbers are allocated under a lock on `.sequence`, so concurrent
//! appenders never pick the same member.

use super::{len_of, Appended, Segment, SegmentBase, SegmentCheck, SegmentState};
use crate::dir::{self, with_suffix, SavedTimes, SEQUENCE_FILE};
use crate::error::{CoreError, CoreResult};
use crate::format::Format;
use crate::record::Record;
use crate::transaction::{Pending, Transaction};
use bytes::Bytes;
use fs2::FileExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A segment made of a directory of numbered members.
#[derive(Debug)]
pub struct DirSegment {
    base: SegmentBase,
}

/// The `.sequence` file, locked for the lifetime of the handle.
struct SequenceFile {
    file: File,
}

impl SequenceFile {
    fn open(dir: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(SEQUENCE_FILE))?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    fn read(&mut self) -> CoreResult<u64> {
        let mut buf = [0u8; 8];
        self.file.seek(SeekFrom::Start(0))?;
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(u64::from_le_bytes(buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, value: u64) -> CoreResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&value.to_le_bytes())?;
        self.file.set_len(8)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for SequenceFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "cannot unlock sequence file");
        }
    }
}

fn member_name(seq: u64, format: &str) -> String {
    format!("{seq:06}.{format}")
}

/// Lists `(number, size)` of the members in `dir`.
fn list_members(dir: &Path, format: &str) -> CoreResult<BTreeMap<u64, u64>> {
    let suffix = format!(".{format}");
    let mut members = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(seq) = name.strip_suffix(&suffix).and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        members.insert(seq, entry.metadata()?.len());
    }
    Ok(members)
}

/// Writes `data` as member `seq` under `dir`.
fn write_member(dir: &Path, seq: u64, format: &str, data: &[u8]) -> CoreResult<()> {
    let mut file = File::create(dir.join(member_name(seq, format)))?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

impl DirSegment {
    /// Creates a handle; nothing is touched on disk.
    #[must_use]
    pub fn new(root: &Path, relpath: &str, format: Arc<dyn Format>) -> Self {
        Self {
            base: SegmentBase::new(root, relpath, format),
        }
    }

    fn member_path(&self, seq: u64) -> PathBuf {
        self.base
            .abspath
            .join(member_name(seq, self.base.format.name()))
    }

    fn sequence_path(&self) -> PathBuf {
        self.base.abspath.join(SEQUENCE_FILE)
    }

    fn members(&self) -> CoreResult<BTreeMap<u64, u64>> {
        if !self.exists() {
            return Err(self.base.not_found());
        }
        list_members(&self.base.abspath, self.base.format.name())
    }

    /// Runs `change` with the sequence file times preserved.
    fn preserving_times(&self, change: impl FnOnce() -> CoreResult<()>) -> CoreResult<()> {
        let seq = self.sequence_path();
        let times = SavedTimes::of(&seq).map_err(|_| self.base.not_found())?;
        change()?;
        times.restore(&seq)
    }

    fn offset_of(records: &[Record], index: usize) -> CoreResult<u64> {
        records
            .get(index)
            .ok_or_else(|| CoreError::invalid_operation(format!("no record {index} in segment")))?
            .stored_source()
            .map(|s| s.offset)
    }

    fn build_repacked(&self, tmp: &Path, records: &mut [Record], validate: bool) -> CoreResult<()> {
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        fs::create_dir_all(tmp)?;
        let format = self.base.format.name();
        for (seq, record) in records.iter().enumerate() {
            let source = record.stored_source()?;
            let data = self.read(source.offset, source.size)?;
            if validate {
                self.base.format.validate(&data)?;
            }
            write_member(tmp, seq as u64, format, &data)?;
        }
        let mut sequence = SequenceFile::open(tmp)?;
        sequence.write(records.len() as u64)?;
        drop(sequence);
        dir::sync_directory(tmp)?;

        for (seq, record) in records.iter_mut().enumerate() {
            if let Some(source) = record.source.as_mut() {
                source.offset = seq as u64;
                source.basedir.clone_from(&self.base.root);
            }
        }
        Ok(())
    }
}

/// Undo information for one member append.
struct AppendTx {
    member: PathBuf,
    segment: PathBuf,
    created: bool,
    times: Option<SavedTimes>,
}

impl Transaction for AppendTx {
    fn commit(&mut self) -> CoreResult<()> {
        dir::sync_directory(&self.segment)
    }

    fn rollback(&mut self) -> CoreResult<()> {
        if self.created {
            if self.segment.exists() {
                fs::remove_dir_all(&self.segment)?;
            }
            return Ok(());
        }
        dir::remove_if_exists(&self.member)?;
        if let Some(times) = &self.times {
            times.restore(&self.segment.join(SEQUENCE_FILE))?;
        }
        Ok(())
    }

    fn revert(&mut self) -> CoreResult<()> {
        self.rollback()
    }
}

/// Swaps a repacked directory in place of the original.
struct SwapTx {
    tmp: PathBuf,
    target: PathBuf,
}

impl Transaction for SwapTx {
    fn commit(&mut self) -> CoreResult<()> {
        let old = with_suffix(&self.target, ".repack-old");
        fs::rename(&self.target, &old)?;
        if let Err(e) = fs::rename(&self.tmp, &self.target) {
            fs::rename(&old, &self.target)?;
            return Err(e.into());
        }
        fs::remove_dir_all(&old)?;
        if let Some(parent) = self.target.parent() {
            dir::sync_directory(parent)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        if self.tmp.exists() {
            fs::remove_dir_all(&self.tmp)?;
        }
        Ok(())
    }
}

impl Segment for DirSegment {
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
        self.sequence_path().is_file()
    }

    fn size(&self) -> CoreResult<u64> {
        Ok(self.members()?.values().sum())
    }

    fn mtime(&self) -> CoreResult<i64> {
        if !self.exists() {
            return Err(self.base.not_found());
        }
        dir::mtime(&self.sequence_path())
    }

    fn append(&self, data: &[u8]) -> CoreResult<Appended> {
        let created = !self.exists();
        fs::create_dir_all(&self.base.abspath)?;
        let times = if created {
            None
        } else {
            Some(SavedTimes::of(&self.sequence_path())?)
        };

        let mut sequence = SequenceFile::open(&self.base.abspath)?;
        let mut seq = sequence.read()?;
        let (member, mut file) = loop {
            let path = self.member_path(seq);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let written = file
            .write_all(data)
            .and_then(|()| file.sync_data())
            .map_err(CoreError::from)
            .and_then(|()| sequence.write(seq + 1));
        if let Err(e) = written {
            if let Err(undo) = dir::remove_if_exists(&member) {
                warn!(member = %member.display(), error = %undo, "cannot remove member after failed append");
            }
            return Err(e);
        }
        debug!(segment = %self.base.relpath, offset = seq, size = data.len(), "appended member");

        Ok(Appended {
            offset: seq,
            pending: Pending::new(Box::new(AppendTx {
                member,
                segment: self.base.abspath.clone(),
                created,
                times,
            })),
        })
    }

    fn read(&self, offset: u64, size: u64) -> CoreResult<Bytes> {
        if !self.exists() {
            return Err(self.base.not_found());
        }
        let data = match fs::read(self.member_path(offset)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.base.truncated(offset, size, 0))
            }
            Err(e) => return Err(e.into()),
        };
        if (data.len() as u64) < size {
            return Err(self.base.truncated(offset, size, data.len() as u64));
        }
        let mut data = data;
        data.truncate(len_of(size)?);
        Ok(Bytes::from(data))
    }

    fn check(&self, records: &[Record], quick: bool) -> CoreResult<SegmentCheck> {
        let members = self.members()?;
        let mut seen = BTreeSet::new();
        let mut dirty = Vec::new();
        let mut last = None;

        for record in records {
            let source = record.stored_source()?;
            if source.relpath != self.base.relpath {
                return Err(CoreError::corrupted(format!(
                    "record from {} checked against {}",
                    source.relpath, self.base.relpath
                )));
            }
            let seq = source.offset;
            if !seen.insert(seq) {
                return Ok(SegmentCheck::with_note(
                    SegmentState::UNALIGNED,
                    format!("member {seq} is referenced more than once"),
                ));
            }
            match members.get(&seq) {
                None => {
                    return Ok(SegmentCheck::with_note(
                        SegmentState::UNALIGNED,
                        format!("member {seq} is missing"),
                    ))
                }
                Some(&len) if len < source.size => {
                    return Ok(SegmentCheck::with_note(
                        SegmentState::UNALIGNED,
                        format!("member {seq} looks truncated: {len} bytes, {} expected", source.size),
                    ))
                }
                Some(&len) if len > source.size => {
                    dirty.push(format!("member {seq} has {} extra bytes", len - source.size));
                }
                Some(_) => {}
            }
            if !quick {
                let data = self.read(seq, source.size)?;
                if let Err(e) = self.base.format.validate(&data) {
                    return Ok(SegmentCheck::with_note(
                        SegmentState::UNALIGNED,
                        format!("validation failed at member {seq}: {e}"),
                    ));
                }
            }
            if last.is_some_and(|prev| seq < prev) {
                dirty.push(format!("member {seq} is out of order"));
            }
            last = Some(seq);
        }

        let unreferenced = members.keys().filter(|seq| !seen.contains(seq)).count();
        if unreferenced > 0 {
            dirty.push(format!("{unreferenced} members are not in the index"));
        }

        if dirty.is_empty() {
            Ok(SegmentCheck::ok())
        } else {
            Ok(SegmentCheck {
                state: SegmentState::DIRTY,
                notes: dirty,
            })
        }
    }

    fn scan(&self) -> CoreResult<Vec<Record>> {
        let mut records = Vec::new();
        for seq in self.members()?.into_keys() {
            let data = fs::read(self.member_path(seq))?;
            match self.base.scanned(&data, seq) {
                Ok(record) => records.push(record),
                Err(e) => debug!(segment = %self.base.relpath, member = seq, error = %e, "skipping unparsable member"),
            }
        }
        Ok(records)
    }

    fn repack(&self, records: &mut [Record], validate: bool) -> CoreResult<Pending> {
        let tmp = self.base.repack_path();
        if let Err(e) = self.build_repacked(&tmp, records, validate) {
            if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                warn!(path = %tmp.display(), error = %cleanup, "cannot remove repack leftover");
            }
            return Err(e);
        }
        Ok(Pending::new(Box::new(SwapTx {
            tmp,
            target: self.base.abspath.clone(),
        })))
    }

    fn remove(&self) -> CoreResult<u64> {
        if !self.base.abspath.exists() {
            return Ok(0);
        }
        let size = list_members(&self.base.abspath, self.base.format.name())?
            .values()
            .sum();
        fs::remove_dir_all(&self.base.abspath)?;
        Ok(size)
    }

    fn truncate(&self, offset: u64) -> CoreResult<()> {
        let members = self.members()?;
        self.preserving_times(|| {
            for seq in members.range(offset..).map(|(seq, _)| *seq) {
                fs::remove_file(self.member_path(seq))?;
            }
            Ok(())
        })
    }

    fn make_hole(&self, records: &mut [Record], index: usize, size: u64) -> CoreResult<()> {
        let members = self.members()?;
        let start = if index == records.len() {
            members.keys().next_back().map_or(0, |last| last + 1)
        } else {
            Self::offset_of(records, index)?
        };
        self.preserving_times(|| {
            for seq in members.range(start..).rev().map(|(seq, _)| *seq) {
                fs::rename(self.member_path(seq), self.member_path(seq + 1))?;
            }
            fs::write(self.member_path(start), vec![0u8; len_of(size)?])?;
            let top = members
                .keys()
                .next_back()
                .map_or(start, |&last| (last + 1).max(start));
            let mut sequence = SequenceFile::open(&self.base.abspath)?;
            let next = sequence.read()?;
            sequence.write(next.max(top + 1))
        })?;
        for record in records.iter_mut() {
            if let Some(source) = record.source.as_mut() {
                if source.offset >= start {
                    source.offset += 1;
                }
            }
        }
        Ok(())
    }

    fn make_overlap(&self, records: &mut [Record], index: usize, _overlap: u64) -> CoreResult<()> {
        if index == 0 {
            return Err(CoreError::invalid_operation(
                "the first record has nothing to overlap with",
            ));
        }
        let previous = Self::offset_of(records, index - 1)?;
        Self::offset_of(records, index)?;
        if let Some(source) = records[index].source.as_mut() {
            source.offset = previous;
        }
        Ok(())
    }

    fn corrupt(&self, records: &[Record], index: usize) -> CoreResult<()> {
        let path = self.member_path(Self::offset_of(records, index)?);
        let times = SavedTimes::of(&path)?;
        let mut data = fs::read(&path)?;
        if let Some(first) = data.first_mut() {
            *first = 0;
        }
        fs::write(&path, &data)?;
        times.restore(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Vm2Format;
    use crate::types::parse_time;
    use tempfile::{tempdir, TempDir};

    fn segment() -> (TempDir, DirSegment) {
        let dir = tempdir().unwrap();
        let seg = DirSegment::new(dir.path(), "2007/07-08.vm2", Arc::new(Vm2Format));
        (dir, seg)
    }

    fn store(seg: &DirSegment, hour: u32) -> Record {
        let mut r = Vm2Format::record(
            parse_time(&format!("2007-07-08 {hour:02}:00:00")).unwrap(),
            "1",
            "227",
            "1.2",
        );
        let data = r.data.clone().unwrap();
        let appended = seg.append(&data).unwrap();
        appended.pending.commit().unwrap();
        r.source = Some(seg.base.source(appended.offset, data.len() as u64));
        r
    }

    #[test]
    fn members_are_numbered_in_order() {
        let (_dir, seg) = segment();
        let a = store(&seg, 13);
        let b = store(&seg, 14);
        assert_eq!(a.source.as_ref().unwrap().offset, 0);
        assert_eq!(b.source.as_ref().unwrap().offset, 1);
        assert!(seg.abspath().join("000001.vm2").exists());
        assert_eq!(seg.read(1, 24).unwrap(), b.data.clone().unwrap());
        assert_eq!(seg.size().unwrap(), 48);
        assert_eq!(seg.check(&[a, b], false).unwrap().state, SegmentState::OK);
    }

    #[test]
    fn rollback_removes_member() {
        let (_dir, seg) = segment();
        let a = store(&seg, 13);
        let appended = seg.append(b"20070708140000,1,227,1.3").unwrap();
        assert_eq!(appended.offset, 1);
        drop(appended);
        assert!(!seg.member_path(1).exists());
        assert_eq!(seg.check(&[a], false).unwrap().state, SegmentState::OK);
    }

    #[test]
    fn gaps_are_fine_but_strays_are_dirty() {
        let (_dir, seg) = segment();
        let a = store(&seg, 13);
        let b = store(&seg, 14);
        let c = store(&seg, 15);
        assert_eq!(seg.check(&[a.clone(), c.clone()], true).unwrap().state, SegmentState::DIRTY);
        fs::remove_file(seg.member_path(1)).unwrap();
        assert_eq!(seg.check(&[a.clone(), c.clone()], true).unwrap().state, SegmentState::OK);
        assert_eq!(seg.check(&[a, b, c], true).unwrap().state, SegmentState::UNALIGNED);
    }

    #[test]
    fn repack_renumbers_members() {
        let (_dir, seg) = segment();
        let b = store(&seg, 14);
        let a = store(&seg, 13);
        let mut records = vec![a, b];
        assert_eq!(seg.check(&records, true).unwrap().state, SegmentState::DIRTY);
        seg.repack(&mut records, true).unwrap().commit().unwrap();
        assert_eq!(records[0].source.as_ref().unwrap().offset, 0);
        assert_eq!(seg.check(&records, false).unwrap().state, SegmentState::OK);
        assert!(!seg.base.repack_path().exists());
        assert_eq!(store(&seg, 15).source.unwrap().offset, 2);
    }

    #[test]
    fn fault_injection_is_detected() {
        let (_dir, seg) = segment();
        let mut records = vec![store(&seg, 13), store(&seg, 14)];
        let mtime = seg.mtime().unwrap();

        seg.make_hole(&mut records, 0, 10).unwrap();
        assert_eq!(records[0].source.as_ref().unwrap().offset, 1);
        assert_eq!(seg.check(&records, false).unwrap().state, SegmentState::DIRTY);
        assert_eq!(seg.mtime().unwrap(), mtime);

        seg.corrupt(&records, 1).unwrap();
        assert_eq!(seg.check(&records, false).unwrap().state, SegmentState::UNALIGNED);

        seg.make_overlap(&mut records, 1, 1).unwrap();
        assert_eq!(seg.check(&records, true).unwrap().state, SegmentState::UNALIGNED);
    }

    #[test]
    fn truncate_drops_members() {
        let (_dir, seg) = segment();
        let records = vec![store(&seg, 13), store(&seg, 14)];
        seg.truncate(1).unwrap();
        assert_eq!(seg.check(&records, true).unwrap().state, SegmentState::UNALIGNED);
        assert_eq!(seg.check(&records[..1], true).unwrap().state, SegmentState::OK);
        assert_eq!(seg.remove().unwrap(), 24);
        assert!(!seg.exists());
    }
}
