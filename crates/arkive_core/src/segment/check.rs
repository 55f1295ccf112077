//! Structural check of a byte stream against the records indexed in it.

use super::{SegmentCheck, SegmentState};
use crate::error::{CoreError, CoreResult};
use crate::format::Format;
use crate::record::Record;
use arkive_storage::StorageBackend;

/// Checks `records` (in index order) against the bytes in `data`.
///
/// Records may be separated by at most `format.padding().len()` bytes;
/// anything else is a hole. Overlaps, truncation and validation failures
/// mean the index no longer describes the segment.
///
/// # Errors
///
/// Returns [`CoreError::Corrupted`] if a record belongs to another segment,
/// or an error reading `data`.
pub(crate) fn check_stream(
    data: &dyn StorageBackend,
    relpath: &str,
    format: &dyn Format,
    records: &[Record],
    quick: bool,
) -> CoreResult<SegmentCheck> {
    let mut spans = Vec::with_capacity(records.len());
    for record in records {
        let source = record.stored_source()?;
        if source.relpath != relpath {
            return Err(CoreError::corrupted(format!(
                "record from {} checked against {relpath}",
                source.relpath
            )));
        }
        let end = source.offset.checked_add(source.size).ok_or_else(|| {
            CoreError::corrupted(format!(
                "record at {relpath}:{}+{} ends past the largest offset",
                source.offset, source.size
            ))
        })?;
        spans.push((source.offset, source.size, end));
    }
    let file_size = data.size()?;

    if !quick {
        for &(offset, size, end) in &spans {
            let problem = if end > file_size {
                Some(format!("segment is only {file_size} bytes"))
            } else {
                let bytes = data.read_at(offset, usize::try_from(size).unwrap_or(usize::MAX))?;
                format.validate(&bytes).err().map(|e| e.to_string())
            };
            if let Some(problem) = problem {
                return Ok(SegmentCheck::with_note(
                    SegmentState::UNALIGNED,
                    format!("validation failed at {relpath}:{offset}+{size}: {problem}"),
                ));
            }
        }
    }

    let mut sorted = spans.clone();
    sorted.sort_unstable();
    let mut end = 0;
    for &(offset, _, record_end) in &sorted {
        if offset < end {
            return Ok(SegmentCheck::with_note(
                SegmentState::UNALIGNED,
                format!("record at offset {offset} overlaps the previous one"),
            ));
        }
        end = record_end;
    }

    if file_size < end {
        return Ok(SegmentCheck::with_note(
            SegmentState::UNALIGNED,
            format!(
                "file looks truncated: its size is {file_size} but data is known to exist until {end} bytes"
            ),
        ));
    }

    let gap = format.padding().len() as u64;
    let mut has_hole = file_size > end.saturating_add(gap);
    let mut end = 0;
    for &(offset, _, record_end) in &spans {
        if offset < end || offset > end.saturating_add(gap) {
            has_hole = true;
        }
        end = end.max(record_end);
    }

    if has_hole {
        Ok(SegmentCheck::with_note(
            SegmentState::DIRTY,
            "contains deleted data or data to be reordered",
        ))
    } else {
        Ok(SegmentCheck::ok())
    }
}
