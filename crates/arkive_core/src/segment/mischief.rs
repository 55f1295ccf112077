//! Fault injection on a segment's byte stream, for exercising the checker.

use crate::error::{CoreError, CoreResult};
use crate::record::Record;

fn offset_at(records: &[Record], index: usize) -> CoreResult<u64> {
    records
        .get(index)
        .ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "record {index} out of range: segment has {} records",
                records.len()
            ))
        })?
        .stored_source()
        .map(|s| s.offset)
}

fn to_usize(value: u64) -> CoreResult<usize> {
    usize::try_from(value).map_err(|_| CoreError::invalid_operation("offset does not fit in memory"))
}

/// Inserts `size` zero bytes before record `index`, shifting it and all
/// records after it. An `index` equal to the record count puts the hole at
/// the end. Records must be in offset order.
pub(crate) fn make_hole(
    buf: &mut Vec<u8>,
    records: &mut [Record],
    index: usize,
    size: u64,
) -> CoreResult<()> {
    let pos = if index == records.len() {
        buf.len()
    } else {
        to_usize(offset_at(records, index)?)?.min(buf.len())
    };
    buf.splice(pos..pos, std::iter::repeat(0u8).take(to_usize(size)?));
    for record in records.iter_mut().skip(index) {
        if let Some(source) = record.source.as_mut() {
            source.offset += size;
        }
    }
    Ok(())
}

/// Moves record `index` and everything after it `overlap` bytes back, so
/// that it overlaps its predecessor.
pub(crate) fn make_overlap(
    buf: &mut Vec<u8>,
    records: &mut [Record],
    index: usize,
    overlap: u64,
) -> CoreResult<()> {
    if index == 0 {
        return Err(CoreError::invalid_operation(
            "the first record has nothing to overlap with",
        ));
    }
    let at = offset_at(records, index)?;
    if overlap > at {
        return Err(CoreError::invalid_operation(format!(
            "cannot move record at offset {at} back by {overlap} bytes"
        )));
    }
    let (from, to) = (to_usize(at)?, to_usize(at - overlap)?);
    buf.drain(to..from);
    for record in records.iter_mut().skip(index) {
        if let Some(source) = record.source.as_mut() {
            source.offset -= overlap;
        }
    }
    Ok(())
}

/// Overwrites the first byte of record `index` with a zero.
pub(crate) fn corrupt(buf: &mut [u8], records: &[Record], index: usize) -> CoreResult<()> {
    let at = to_usize(offset_at(records, index)?)?;
    let byte = buf
        .get_mut(at)
        .ok_or_else(|| CoreError::invalid_operation(format!("offset {at} is past the end")))?;
    *byte = 0;
    Ok(())
}
