//! Per-segment metadata files used by the plain and sqlite indexes.
//!
//! Next to each segment live `<segment>.metadata`, the CBOR list of its
//! records, and `<segment>.summary`, their [`Summary`].

use crate::dir::{self, remove_if_exists, with_suffix, SavedTimes};
use crate::error::{CoreError, CoreResult};
use crate::index::Summary;
use crate::record::Record;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Path of the record list of a segment.
#[must_use]
pub fn metadata_path(segment: &Path) -> PathBuf {
    with_suffix(segment, ".metadata")
}

/// Path of the summary of a segment.
#[must_use]
pub fn summary_path(segment: &Path) -> PathBuf {
    with_suffix(segment, ".summary")
}

pub(crate) fn encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode<T: DeserializeOwned>(buf: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(buf).map_err(|e| CoreError::codec(e.to_string()))
}

/// Reads a CBOR value, or `None` if the file does not exist.
pub(crate) fn read_cbor<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    match fs::read(path) {
        Ok(buf) => decode(&buf).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads the records stored for `segment`, rebased on `root`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be decoded.
pub fn read_metadata(segment: &Path, root: &Path) -> CoreResult<Option<Vec<Record>>> {
    let Some(mut records): Option<Vec<Record>> = read_cbor(&metadata_path(segment))? else {
        return Ok(None);
    };
    for record in &mut records {
        if let Some(source) = record.source.as_mut() {
            source.basedir = root.to_path_buf();
        }
    }
    Ok(Some(records))
}

/// Writes the record list and summary for `segment`.
///
/// # Errors
///
/// Returns an error if either file cannot be written.
pub fn write(segment: &Path, records: &[Record]) -> CoreResult<()> {
    let stripped: Vec<Record> = records.iter().map(Record::without_data).collect();
    dir::write_atomically(&metadata_path(segment), &encode(&stripped)?)?;
    dir::write_atomically(&summary_path(segment), &encode(&Summary::of(records))?)?;
    Ok(())
}

/// Contents and times of the sidecars of one segment, taken before they
/// are rewritten.
pub(crate) struct SidecarBackup {
    files: Vec<(PathBuf, Option<(Vec<u8>, SavedTimes)>)>,
}

impl SidecarBackup {
    pub(crate) fn of(segment: &Path) -> CoreResult<Self> {
        let mut files = Vec::with_capacity(2);
        for path in [metadata_path(segment), summary_path(segment)] {
            let saved = match fs::read(&path) {
                Ok(buf) => Some((buf, SavedTimes::of(&path)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            files.push((path, saved));
        }
        Ok(Self { files })
    }

    /// Puts the sidecars back as they were, removing those that did not
    /// exist.
    pub(crate) fn restore(&self) -> CoreResult<()> {
        for (path, saved) in &self.files {
            match saved {
                Some((buf, times)) => {
                    dir::write_atomically(path, buf)?;
                    times.restore(path)?;
                }
                None => {
                    remove_if_exists(path)?;
                }
            }
        }
        Ok(())
    }
}

/// Reads the summary stored for `segment`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be decoded.
pub fn read_summary(segment: &Path) -> CoreResult<Option<Summary>> {
    read_cbor(&summary_path(segment))
}

/// Deletes both sidecars of `segment`.
///
/// # Errors
///
/// Returns an I/O error if a file exists and cannot be removed.
pub fn remove(segment: &Path) -> CoreResult<()> {
    remove_if_exists(&metadata_path(segment))?;
    remove_if_exists(&summary_path(segment))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Vm2Format;
    use crate::record::Source;
    use crate::types::parse_time;
    use tempfile::tempdir;

    #[test]
    fn metadata_is_rebased_on_read() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("2007/07-08.vm2");
        fs::create_dir_all(segment.parent().unwrap()).unwrap();

        let mut r = Vm2Format::record(parse_time("2007-07-08 13:00:00").unwrap(), "1", "227", "1");
        r.source = Some(Source::new("vm2", "/elsewhere", "2007/07-08.vm2", 0, 24));
        write(&segment, &[r.clone()]).unwrap();

        let read = read_metadata(&segment, dir.path()).unwrap().unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].data, None);
        assert_eq!(read[0].attrs, r.attrs);
        assert_eq!(read[0].source.as_ref().unwrap().basedir, dir.path());
        assert_eq!(read_summary(&segment).unwrap().unwrap().count, 1);

        remove(&segment).unwrap();
        assert!(read_metadata(&segment, dir.path()).unwrap().is_none());
    }
}
