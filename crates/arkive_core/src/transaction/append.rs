//! Staging one record into a segment and its index.

use super::Pending;
use crate::config::ReplaceStrategy;
use crate::error::{CoreError, CoreResult};
use crate::index::DatasetIndex;
use crate::record::{Record, Source};
use crate::segment::Segment;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// An append whose data and index changes are staged but not committed.
#[derive(Debug)]
pub struct StagedAppend {
    /// Commits the data, then the index; rollback runs in reverse.
    pub pending: Pending,
    /// Where the record is stored once committed.
    pub source: Source,
    /// Source of the record this one supersedes, if any.
    pub replaced: Option<Source>,
}

/// Stages `record` at the end of `segment` and in `index`.
///
/// The caller must hold the segment append lock until the returned pending
/// is resolved. On error nothing is left staged.
///
/// # Errors
///
/// Returns [`CoreError::DuplicateKey`] if a record with the same unique key
/// exists and `replace` is [`ReplaceStrategy::Never`], a validation error
/// if the bytes are not a well-formed record, or an I/O error.
pub fn stage_append(
    root: &Path,
    segment: &Arc<dyn Segment>,
    index: &dyn DatasetIndex,
    record: &Record,
    unique: &[String],
    replace: ReplaceStrategy,
) -> CoreResult<StagedAppend> {
    let data = record.bytes()?;
    segment.format().validate(data)?;
    if record.reftime.is_none() {
        return Err(CoreError::corrupted("record has no reference time"));
    }

    let key = record.unique_key(unique);
    let mut update = index.begin_update(Arc::clone(segment))?;
    let replaced = update.find_duplicate(&key)?;
    if let Some(old) = &replaced {
        match replace {
            ReplaceStrategy::Never => {
                return Err(CoreError::DuplicateKey {
                    relpath: old.relpath.clone(),
                })
            }
            ReplaceStrategy::Always => update.remove(&key)?,
        }
    }

    let appended = segment.append(data)?;
    let source = Source::new(
        segment.format().name(),
        root,
        segment.relpath(),
        appended.offset,
        data.len() as u64,
    );
    let mut stored = record.without_data();
    stored.source = Some(source.clone());
    update.insert(&stored)?;
    let index_pending = update.into_pending()?;
    debug!(
        segment = segment.relpath(),
        offset = source.offset,
        size = source.size,
        replacing = replaced.is_some(),
        "append staged"
    );
    Ok(StagedAppend {
        pending: Pending::chain(appended.pending, index_pending),
        source,
        replaced,
    })
}
