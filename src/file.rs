//! Raw byte-level file access.
//!
//! A [`RawFile`] owns a path and its logical size, and serializes positioned
//! reads and appends through a per-file lock. The two variants differ in how
//! they hold the native handle: `Pooled` defers to the [`HandlePool`] and may
//! be transparently closed and reopened, `Direct` keeps its handle for its
//! entire lifetime and counts against a separate cap.
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::*;

use crate::error::{Error, Result};
use crate::pools::HandlePool;

bitflags::bitflags! {
    /// Open mode of a [`RawFile`].
    pub struct Mode: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const CREATE = 0b0100;
        const TRUNCATE = 0b1000;
        /// Read-only access to an existing file.
        const IMMUTABLE = Self::READ.bits;
        /// Fresh append-only output.
        const OUTPUT = Self::WRITE.bits | Self::CREATE.bits | Self::TRUNCATE.bits;
        /// Read plus append, keeping existing contents.
        const READ_APPEND = Self::READ.bits | Self::WRITE.bits | Self::CREATE.bits;
    }
}
impl Mode {
    /// Mode used for second-and-later opens: reopening never destroys content.
    pub(crate) fn reopen(self) -> Self {
        self - (Mode::CREATE | Mode::TRUNCATE)
    }
    fn open_options(self) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        options
            .read(self.contains(Mode::READ))
            .write(self.contains(Mode::WRITE))
            .create(self.contains(Mode::CREATE))
            .truncate(self.contains(Mode::TRUNCATE));
        options
    }
}

/// Logical size bookkeeping, guarded by the per-file lock.
///
/// `size <= capacity`; `capacity` tracks the on-disk length when space was
/// reserved ahead of the logical end.
pub(crate) struct FileState {
    pub size: u64,
    pub capacity: u64,
}

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// Claim on one of the `max_concurrent_open_unpooled_files` slots.
pub(crate) struct DirectSlot {
    count: Arc<AtomicUsize>,
}
impl DirectSlot {
    pub fn acquire(count: &Arc<AtomicUsize>, limit: usize) -> Result<Self> {
        if count.fetch_add(1, Ordering::SeqCst) >= limit {
            count.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::DirectLimit { limit });
        }
        Ok(Self {
            count: count.clone(),
        })
    }
}
impl Drop for DirectSlot {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Backing {
    Pooled { handles: Arc<HandlePool> },
    Direct { handle: Mutex<File>, _slot: DirectSlot },
}

/// Byte-level positioned read / append / truncate over one physical file.
///
/// While a `RawFile` exists no other `RawFile` (or external process) may
/// touch the same path.
pub struct RawFile {
    id: u64,
    path: PathBuf,
    mode: Mode,
    times_opened: AtomicU32,
    state: Mutex<FileState>,
    backing: Backing,
}

impl RawFile {
    /// Pooled variant: the native handle is opened lazily by the
    /// [`HandlePool`] and may be evicted between operations.
    pub(crate) fn open_pooled(
        path: PathBuf,
        mode: Mode,
        handles: Arc<HandlePool>,
    ) -> Result<Arc<Self>> {
        let size = if mode.contains(Mode::TRUNCATE) {
            0
        } else {
            match std::fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && mode.contains(Mode::CREATE) => {
                    0
                }
                Err(source) => return Err(Error::Open { path, mode, source }),
            }
        };
        Ok(Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::SeqCst),
            path,
            mode,
            times_opened: AtomicU32::new(0),
            state: Mutex::new(FileState {
                size,
                capacity: size,
            }),
            backing: Backing::Pooled { handles },
        }))
    }

    /// Direct variant: opens now and keeps the handle until drop.
    pub(crate) fn open_direct(path: PathBuf, mode: Mode, slot: DirectSlot) -> Result<Arc<Self>> {
        let handle = mode
            .open_options()
            .open(&path)
            .map_err(|source| Error::Open {
                path: path.clone(),
                mode,
                source,
            })?;
        let size = handle.metadata()?.len();
        Ok(Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::SeqCst),
            path,
            mode,
            times_opened: AtomicU32::new(1),
            state: Mutex::new(FileState {
                size,
                capacity: size,
            }),
            backing: Backing::Direct {
                handle: Mutex::new(handle),
                _slot: slot,
            },
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn mode(&self) -> Mode {
        self.mode
    }
    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap()
    }

    /// Open a native handle, applying the reopen policy on second-and-later
    /// opens. Called by the [`HandlePool`] under its lock.
    pub(crate) fn open_handle(&self) -> Result<File> {
        let first = self.times_opened.fetch_add(1, Ordering::SeqCst) == 0;
        let mode = if first { self.mode } else { self.mode.reopen() };
        trace!(path = ?self.path, ?mode, first, "Opening handle");
        mode.open_options().open(&self.path).map_err(|source| Error::Open {
            path: self.path.clone(),
            mode,
            source,
        })
    }

    fn with_handle<R>(&self, f: impl FnOnce(&File, &mut FileState) -> R) -> Result<R> {
        match &self.backing {
            Backing::Pooled { handles } => handles.with_handle(self, f),
            Backing::Direct { handle, .. } => {
                let mut state = self.state.lock().unwrap();
                let handle = handle.lock().unwrap();
                Ok(f(&handle, &mut state))
            }
        }
    }

    /// Positioned read into `dst`, clamped to the logical size. Short reads
    /// are returned as-is; callers decide whether to escalate.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        self.with_handle(|file, state| {
            let end = state.size.min(offset.saturating_add(dst.len() as u64));
            if offset >= end {
                return Ok(0);
            }
            Ok(file.read_at(&mut dst[..(end - offset) as usize], offset)?)
        })?
    }

    /// Append `src` at the logical end. Short writes are returned as-is.
    pub fn append(&self, src: &[u8]) -> Result<usize> {
        self.with_handle(|file, state| {
            let n = file.write_at(src, state.size)?;
            state.size += n as u64;
            if state.size > state.capacity {
                state.capacity = state.size;
            }
            Ok(n)
        })?
    }

    pub fn flush(&self) -> Result<()> {
        self.with_handle(|file, _| Ok(file.sync_data()?))?
    }

    /// Shorten the file to `n` bytes. No-op when `n` is not smaller than the
    /// reserved capacity.
    pub fn truncate(&self, n: u64) -> Result<()> {
        self.with_handle(|file, state| {
            if n >= state.capacity {
                return Ok(());
            }
            file.sync_data()?;
            file.set_len(n)?;
            state.size = state.size.min(n);
            state.capacity = n;
            Ok(())
        })?
    }

    /// Extend the on-disk length to `n` bytes without changing the logical
    /// size; drop restores the length to the logical size.
    pub fn reserve(&self, n: u64) -> Result<()> {
        self.with_handle(|file, state| {
            if n > state.capacity {
                file.set_len(n)?;
                state.capacity = n;
            }
            Ok(())
        })?
    }

    /// Bring the on-disk length back to the logical size.
    pub(crate) fn shrink_to_size(&self) -> Result<()> {
        self.with_handle(|file, state| {
            if state.capacity > state.size {
                file.set_len(state.size)?;
                state.capacity = state.size;
            }
            Ok(())
        })?
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        let restore = (state.capacity > state.size).then(|| state.size);
        match &self.backing {
            Backing::Direct { handle, .. } => {
                if let Some(size) = restore {
                    if let Err(e) = handle.lock().unwrap().set_len(size) {
                        warn!(path = ?self.path, "Failed to restore reserved length: {}", e);
                    }
                }
            }
            Backing::Pooled { handles } => {
                handles.release(self.id, &self.path, restore);
            }
        }
    }
}

impl std::fmt::Debug for RawFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("RawFile")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("size", &state.size)
            .field("capacity", &state.capacity)
            .finish()
    }
}
