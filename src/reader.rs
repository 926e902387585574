//! Asynchronous sector-aligned reader interface and a positioned-read
//! file implementation.
//!
//! The engine only depends on the [`AlignedFileReader`] trait: a batch of
//! sector-aligned reads either completes fully or fails. Hosts with io_uring
//! or AIO backends implement the trait themselves; [`DirectFileReader`] is
//! the portable default used by the loader and the test suite.

use crate::config::SECTOR_LEN;
use crate::error::{PqFlashError, Result};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One sector-aligned read request. `offset` and `buf.len()` must both be
/// multiples of [`SECTOR_LEN`].
pub struct AlignedRead<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

impl<'a> AlignedRead<'a> {
    pub fn new(offset: u64, buf: &'a mut [u8]) -> Self {
        debug_assert_eq!(offset as usize % SECTOR_LEN, 0);
        debug_assert_eq!(buf.len() % SECTOR_LEN, 0);
        Self { offset, buf }
    }
}

/// Per-worker I/O registration token.
///
/// Obtained from [`AlignedFileReader::register_thread`] and held by a scratch
/// bundle for the bundle's lifetime. Backends that keep per-thread kernel
/// state (an io_uring, an AIO context) key it off this token.
#[derive(Debug)]
pub struct IoContext {
    /// Backend-assigned worker slot.
    pub slot: usize,
}

/// Batched sector-aligned reads over one index file.
///
/// Implementations must be safe to call concurrently from multiple worker
/// threads, each using its own [`IoContext`].
pub trait AlignedFileReader: Send + Sync {
    /// Complete every read in `reqs` or fail the whole batch.
    fn read(&self, reqs: &mut [AlignedRead<'_>], ctx: &IoContext) -> Result<()>;

    /// Register the calling worker and hand back its context.
    fn register_thread(&self) -> IoContext;

    /// Release a worker context.
    fn deregister_thread(&self, ctx: IoContext);
}

/// Positioned-read (`pread`) implementation over a plain file.
///
/// There is no completion queue to drain, so a "batch" is a loop of
/// positioned reads; the trait's all-or-nothing failure contract still holds
/// because any failed read aborts the batch before results are consumed.
#[derive(Debug)]
pub struct DirectFileReader {
    file: File,
    #[cfg(not(unix))]
    lock: parking_lot::Mutex<()>,
    registered: AtomicUsize,
}

impl DirectFileReader {
    /// Open an index file for sector reads.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PqFlashError::MissingFile(path.to_path_buf()),
            _ => PqFlashError::Io(e),
        })?;
        Ok(Self {
            file,
            #[cfg(not(unix))]
            lock: parking_lot::Mutex::new(()),
            registered: AtomicUsize::new(0),
        })
    }
}

impl AlignedFileReader for DirectFileReader {
    fn read(&self, reqs: &mut [AlignedRead<'_>], _ctx: &IoContext) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            for req in reqs.iter_mut() {
                self.file.read_exact_at(req.buf, req.offset)?;
            }
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let _guard = self.lock.lock();
            let mut file = &self.file;
            for req in reqs.iter_mut() {
                file.seek(SeekFrom::Start(req.offset))?;
                file.read_exact(req.buf)?;
            }
        }
        Ok(())
    }

    fn register_thread(&self) -> IoContext {
        let slot = self.registered.fetch_add(1, Ordering::Relaxed);
        IoContext { slot }
    }

    fn deregister_thread(&self, _ctx: IoContext) {
        self.registered.fetch_sub(1, Ordering::Relaxed);
    }
}
