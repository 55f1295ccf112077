//! Queries over a consistent snapshot of the index.

use super::{Archive, DatasetInner};
use crate::error::{CoreError, CoreResult};
use crate::index::{DatasetIndex, Summary};
use crate::lock::{LockScope, ReadLock};
use crate::record::{Record, UniqueKey};
use crate::segment::{Segment, SegmentManager};
use crate::types::TimeSpan;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{trace, warn};

/// Selects records by reference time and attribute values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Reference times to match; `None` matches everything.
    pub span: Option<TimeSpan>,
    /// Attributes that must have exactly these values.
    pub attrs: BTreeMap<String, String>,
    /// Whether to load record bytes.
    pub with_data: bool,
}

impl Query {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches records whose reference time is in `span`.
    #[must_use]
    pub fn span(span: TimeSpan) -> Self {
        Self {
            span: Some(span),
            ..Self::default()
        }
    }

    /// Also requires `key` to equal `value`.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Loads the bytes of each record.
    #[must_use]
    pub const fn with_data(mut self, value: bool) -> Self {
        self.with_data = value;
        self
    }

    fn matches(&self, record: &Record) -> bool {
        self.attrs
            .iter()
            .all(|(key, value)| record.attr(key) == Some(value.as_str()))
    }
}

/// Where the segments of a snapshot live.
#[derive(Debug, Clone)]
enum Store {
    Live,
    Archive(Arc<Archive>),
}

/// Records of one segment matched when the query started.
enum Snapshot {
    Records(Store, String, Vec<Record>),
    Failed(CoreError),
}

impl Snapshot {
    fn len(&self) -> usize {
        match self {
            Snapshot::Records(_, _, records) => records.len(),
            Snapshot::Failed(_) => 1,
        }
    }
}

/// Records matching a query, archived segments first, then in segment and
/// reference time order.
///
/// The set of records is fixed when the query starts: records appended
/// later are not returned. Each segment is read-locked only while its
/// records are being returned, so its bytes cannot move under the reader.
pub struct QueryStream {
    inner: Arc<DatasetInner>,
    span: Option<TimeSpan>,
    with_data: bool,
    pending: VecDeque<Snapshot>,
    current: VecDeque<Record>,
    segment: Option<Arc<dyn Segment>>,
    _segment_lock: Option<ReadLock>,
    _dataset_lock: ReadLock,
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("remaining", &self.remaining())
            .field("with_data", &self.with_data)
            .finish()
    }
}

impl QueryStream {
    /// Upper bound on the number of items not yet returned.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.current.len() + self.pending.iter().map(Snapshot::len).sum::<usize>()
    }

    /// Locks the segment of `relpath` and loads its records again, keeping
    /// those that were part of the snapshot.
    fn enter(&mut self, store: &Store, relpath: &str, snapshot: &[Record]) -> CoreResult<()> {
        let inner = Arc::clone(&self.inner);
        let (index, segments, scope): (&dyn DatasetIndex, &SegmentManager, LockScope) = match store {
            Store::Live => (&*inner.index, &inner.segments, inner.segment_scope(relpath)),
            Store::Archive(archive) => (
                &archive.index as &dyn DatasetIndex,
                &archive.segments,
                archive.segment_scope(relpath),
            ),
        };
        let lock = inner.locks.read(&scope)?;
        let keys: HashSet<UniqueKey> = snapshot.iter().map(|r| r.unique_key(&inner.unique)).collect();
        self.current = index
            .query_segment(relpath, self.span.as_ref())?
            .into_iter()
            .filter(|r| keys.contains(&r.unique_key(&inner.unique)))
            .collect();
        self.segment = Some(segments.get(relpath));
        self._segment_lock = Some(lock);
        Ok(())
    }

    fn load(&self, mut record: Record) -> CoreResult<Record> {
        let Some(segment) = self.segment.as_ref().filter(|_| self.with_data) else {
            return Ok(record);
        };
        let source = record.stored_source()?;
        let bytes = segment.read(source.offset, source.size)?;
        record.data = Some(bytes);
        Ok(record)
    }
}

impl Iterator for QueryStream {
    type Item = CoreResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.pop_front() {
                let loaded = self.load(record);
                if self.current.is_empty() {
                    self._segment_lock = None;
                }
                return Some(loaded);
            }
            self._segment_lock = None;
            self.segment = None;
            match self.pending.pop_front()? {
                Snapshot::Failed(e) => return Some(Err(e)),
                Snapshot::Records(store, relpath, snapshot) => {
                    if let Err(e) = self.enter(&store, &relpath, &snapshot) {
                        warn!(dataset = %self.inner.config.name, segment = %relpath, error = %e, "cannot read segment");
                        self._segment_lock = None;
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

/// Read-only access to a dataset.
#[derive(Debug, Clone)]
pub struct Reader {
    inner: Arc<DatasetInner>,
}

impl Reader {
    pub(crate) fn new(inner: Arc<DatasetInner>) -> Self {
        Self { inner }
    }

    /// Starts a query over the live and the archived segments.
    ///
    /// A segment whose index cannot be read yields one error item; the
    /// other segments are still returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset lock cannot be taken or the list of
    /// segments cannot be read.
    pub fn query(&self, query: &Query) -> CoreResult<QueryStream> {
        let dataset_lock = self.inner.locks.read(&self.inner.dataset_scope())?;
        let mut pending = VecDeque::new();
        if let Some(archive) = Archive::open(&self.inner)? {
            let archive = Arc::new(archive);
            self.snapshot(&archive.index, &Store::Archive(Arc::clone(&archive)), query, &mut pending)?;
        }
        self.snapshot(&*self.inner.index, &Store::Live, query, &mut pending)?;

        let stream = QueryStream {
            inner: Arc::clone(&self.inner),
            span: query.span,
            with_data: query.with_data,
            pending,
            current: VecDeque::new(),
            segment: None,
            _segment_lock: None,
            _dataset_lock: dataset_lock,
        };
        trace!(dataset = %self.inner.config.name, count = stream.remaining(), "query started");
        Ok(stream)
    }

    fn snapshot(
        &self,
        index: &dyn DatasetIndex,
        store: &Store,
        query: &Query,
        pending: &mut VecDeque<Snapshot>,
    ) -> CoreResult<()> {
        for relpath in index.segments_in_range(query.span.as_ref())? {
            match index.query_segment(&relpath, query.span.as_ref()) {
                Ok(records) => {
                    let matched: Vec<Record> =
                        records.into_iter().filter(|r| query.matches(r)).collect();
                    if !matched.is_empty() {
                        pending.push_back(Snapshot::Records(store.clone(), relpath, matched));
                    }
                }
                Err(e) => {
                    warn!(dataset = %self.inner.config.name, segment = %relpath, error = %e, "cannot query segment");
                    pending.push_back(Snapshot::Failed(e));
                }
            }
        }
        Ok(())
    }

    /// Collects the records of a query.
    ///
    /// # Errors
    ///
    /// Returns the first error of the query.
    pub fn query_all(&self, query: &Query) -> CoreResult<Vec<Record>> {
        self.query(query)?.collect()
    }

    /// Summary of the whole dataset, archive included, computed without
    /// touching the cache if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn summary(&self) -> CoreResult<Summary> {
        let _lock = self.inner.locks.read(&self.inner.dataset_scope())?;
        let mut summary = self.inner.index.summary(false)?;
        if let Some(archive) = Archive::open(&self.inner)? {
            summary.merge(&archive.index.summary(false)?);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatasetConfig;
    use crate::dataset::{AcquireResult, Dataset, Query};
    use crate::format::Vm2Format;
    use crate::types::{parse_time, TimeSpan};
    use tempfile::tempdir;

    fn filled() -> (tempfile::TempDir, Dataset) {
        let dir = tempdir().unwrap();
        let ds = Dataset::open(DatasetConfig::new(dir.path(), "t", "vm2")).unwrap();
        let writer = ds.writer();
        for (time, station) in [
            ("2007-07-08 13:00:00", "1"),
            ("2007-07-08 14:00:00", "2"),
            ("2007-07-09 13:00:00", "1"),
            ("2007-07-10 13:00:00", "2"),
        ] {
            let mut record = Vm2Format::record(parse_time(time).unwrap(), station, "227", "1");
            assert_eq!(writer.acquire(&mut record), AcquireResult::Ok);
        }
        (dir, ds)
    }

    #[test]
    fn span_selects_segments_and_records() {
        let (_dir, ds) = filled();
        let span = TimeSpan::new(
            parse_time("2007-07-08 14:00:00").unwrap(),
            parse_time("2007-07-09 23:59:59").unwrap(),
        );
        let found = ds.reader().query_all(&Query::span(span)).unwrap();
        let relpaths: Vec<_> = found
            .iter()
            .map(|r| r.source.as_ref().unwrap().relpath.as_str())
            .collect();
        assert_eq!(relpaths, ["2007/07-08.vm2", "2007/07-09.vm2"]);
        assert!(found.iter().all(|r| r.data.is_none()));
    }

    #[test]
    fn attributes_filter_and_data_is_loaded() {
        let (_dir, ds) = filled();
        let query = Query::all().with_attr("station", "2").with_data(true);
        let stream = ds.reader().query(&query).unwrap();
        assert_eq!(stream.remaining(), 2);
        let found: Vec<_> = stream.collect::<Result<_, _>>().unwrap();
        assert_eq!(&found[0].data.as_ref().unwrap()[..], b"20070708140000,2,227,1");
        assert_eq!(&found[1].data.as_ref().unwrap()[..], b"20070710130000,2,227,1");
    }

    #[test]
    fn summary_counts_every_record() {
        let (_dir, ds) = filled();
        assert_eq!(ds.reader().summary().unwrap().count, 4);
    }
}
