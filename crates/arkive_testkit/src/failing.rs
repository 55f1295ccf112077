//! A storage backend that fails on demand.
//!
//! Wraps another backend and turns writes into I/O errors once a byte
//! budget is spent, or on flush. Used to check that a failed append
//! leaves the store as it was.

use arkive_storage::{StorageBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A storage backend wrapper that can simulate write failures.
pub struct FailingBackend {
    inner: Box<dyn StorageBackend>,
    fail_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    failed: AtomicBool,
    fail_on_flush: AtomicBool,
}

impl FailingBackend {
    /// Creates a backend wrapping `inner` that never fails.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            fail_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        }
    }

    /// Makes writes fail once `bytes` more bytes have been written.
    ///
    /// The write crossing the budget is applied partially before failing.
    pub fn fail_after(&self, bytes: usize) {
        self.bytes_written.store(0, Ordering::SeqCst);
        self.fail_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Stops failing.
    pub fn reset(&self) {
        self.fail_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
        self.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Returns whether a simulated failure happened.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn failure(&self, what: &str) -> StorageError {
        self.failed.store(true, Ordering::SeqCst);
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("simulated failure during {what}"),
        ))
    }
}

impl StorageBackend for FailingBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let current = self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        let threshold = self.fail_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            return Err(self.failure("write"));
        }
        if current + data.len() > threshold {
            self.inner.append(&data[..threshold - current])?;
            return Err(self.failure("write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.failure("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.flush()?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkive_core::segment::append_padded;
    use arkive_storage::InMemoryBackend;

    fn backend_with(data: &[u8]) -> FailingBackend {
        FailingBackend::new(Box::new(InMemoryBackend::with_data(data.to_vec())))
    }

    #[test]
    fn passes_writes_through() {
        let mut backend = backend_with(b"");
        let offset = backend.append(b"hello").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
        assert!(!backend.has_failed());
    }

    #[test]
    fn partial_write_then_failure() {
        let mut backend = backend_with(b"");
        backend.fail_after(3);
        assert!(backend.append(b"hello").is_err());
        assert!(backend.has_failed());
        assert_eq!(backend.size().unwrap(), 3);
    }

    #[test]
    fn failed_padding_is_truncated_back() {
        let mut backend = backend_with(b"line1\n");
        backend.fail_after(5);
        assert!(append_padded(&mut backend, b"line2", b"\n").is_err());
        assert_eq!(backend.size().unwrap(), 6);
        assert_eq!(backend.read_at(0, 6).unwrap(), b"line1\n");
    }

    #[test]
    fn failed_flush_is_truncated_back() {
        let mut backend = backend_with(b"");
        backend.set_fail_on_flush(true);
        assert!(append_padded(&mut backend, b"line", b"\n").is_err());
        assert_eq!(backend.size().unwrap(), 0);

        backend.reset();
        let (start, offset) = append_padded(&mut backend, b"line", b"\n").unwrap();
        assert_eq!((start, offset), (0, 0));
        assert_eq!(backend.size().unwrap(), 5);
    }
}
