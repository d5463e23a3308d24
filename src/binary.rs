//! Typed file facades.
//!
//! Each facade binds a shared [`RawFile`] to the [`IoThreadPool`] routed for
//! its path, and narrows the operations to its role: read-only, append-only,
//! read+append, or append with a write observer. `seal` converts a writable
//! facade into an immutable one by flushing and reopening read-only.
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::file::RawFile;
use crate::pools::{IoFuture, IoThreadPool};
use crate::record::Record;
use crate::{Context, WriteObserver};

/// Read-only file; clones share the underlying handle and pool binding.
#[derive(Clone)]
pub struct ImmutableBinaryFile {
    raw: Arc<RawFile>,
    io: Arc<IoThreadPool>,
}

impl ImmutableBinaryFile {
    pub(crate) fn new(raw: Arc<RawFile>, io: Arc<IoThreadPool>) -> Self {
        Self { raw, io }
    }
    pub fn path(&self) -> &Path {
        self.raw.path()
    }
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.raw.size()
    }
    pub fn schedule_read<T: Record>(
        &self,
        buf: Vec<T>,
        offset_elems: u64,
        count: usize,
    ) -> IoFuture<(Vec<T>, usize)> {
        self.io.schedule_read(self.raw.clone(), buf, offset_elems, count)
    }
}

impl std::fmt::Debug for ImmutableBinaryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ImmutableBinaryFile({:?}, {} bytes)", self.path(), self.size())
    }
}

/// Append surface shared by the writable facades.
pub trait AppendableFile: Send + Sync {
    fn raw(&self) -> &Arc<RawFile>;
    fn io(&self) -> &Arc<IoThreadPool>;

    fn path(&self) -> &Path {
        self.raw().path()
    }
    fn size(&self) -> u64 {
        self.raw().size()
    }
    fn schedule_append<T: Record>(&self, buf: Vec<T>) -> IoFuture<(Vec<T>, usize)> {
        self.io().schedule_append(self.raw().clone(), buf)
    }
    fn flush(&self) -> Result<()> {
        self.raw().flush()
    }
}

/// Append-only output file.
pub struct OutputBinaryFile {
    raw: Arc<RawFile>,
    io: Arc<IoThreadPool>,
    ctx: Arc<Context>,
}

impl OutputBinaryFile {
    pub(crate) fn new(raw: Arc<RawFile>, io: Arc<IoThreadPool>, ctx: Arc<Context>) -> Self {
        Self { raw, io, ctx }
    }
    /// Flush, restore the on-disk length to the logical size, and reopen the
    /// same path read-only. All scheduled appends must have been awaited.
    pub fn seal(self) -> Result<ImmutableBinaryFile> {
        seal(self.raw, &self.ctx)
    }
}
impl AppendableFile for OutputBinaryFile {
    fn raw(&self) -> &Arc<RawFile> {
        &self.raw
    }
    fn io(&self) -> &Arc<IoThreadPool> {
        &self.io
    }
}

/// Read+append file, used by [`crate::inserter::FileVector`].
#[derive(Clone)]
pub struct InputOutputBinaryFile {
    raw: Arc<RawFile>,
    io: Arc<IoThreadPool>,
    ctx: Arc<Context>,
}

impl InputOutputBinaryFile {
    pub(crate) fn new(raw: Arc<RawFile>, io: Arc<IoThreadPool>, ctx: Arc<Context>) -> Self {
        Self { raw, io, ctx }
    }
    pub fn schedule_read<T: Record>(
        &self,
        buf: Vec<T>,
        offset_elems: u64,
        count: usize,
    ) -> IoFuture<(Vec<T>, usize)> {
        self.io.schedule_read(self.raw.clone(), buf, offset_elems, count)
    }
    pub fn seal(self) -> Result<ImmutableBinaryFile> {
        seal(self.raw, &self.ctx)
    }
}
impl AppendableFile for InputOutputBinaryFile {
    fn raw(&self) -> &Arc<RawFile> {
        &self.raw
    }
    fn io(&self) -> &Arc<IoThreadPool> {
        &self.io
    }
}

/// Output file with a write observer invoked before each append is
/// scheduled; used to feed incremental index builders during merges.
///
/// The observer is advisory: if an append later fails partway, it has
/// already consumed the full byte range. Whatever it builds is only valid
/// once `flush` and `seal` succeed.
pub struct ObservableBinaryFile {
    raw: Arc<RawFile>,
    io: Arc<IoThreadPool>,
    ctx: Arc<Context>,
    observer: Mutex<Box<dyn FnMut(&[u8]) + Send>>,
}

impl ObservableBinaryFile {
    pub(crate) fn new(
        raw: Arc<RawFile>,
        io: Arc<IoThreadPool>,
        ctx: Arc<Context>,
        observer: impl WriteObserver,
    ) -> Self {
        Self {
            raw,
            io,
            ctx,
            observer: Mutex::new(Box::new(observer)),
        }
    }
    pub fn seal(self) -> Result<ImmutableBinaryFile> {
        seal(self.raw, &self.ctx)
    }
}
impl AppendableFile for ObservableBinaryFile {
    fn raw(&self) -> &Arc<RawFile> {
        &self.raw
    }
    fn io(&self) -> &Arc<IoThreadPool> {
        &self.io
    }
    fn schedule_append<T: Record>(&self, buf: Vec<T>) -> IoFuture<(Vec<T>, usize)> {
        let mut observer = self.observer.lock().unwrap();
        (*observer)(bytemuck::cast_slice(buf.as_slice()));
        drop(observer);
        self.io.schedule_append(self.raw.clone(), buf)
    }
}

fn seal(raw: Arc<RawFile>, ctx: &Arc<Context>) -> Result<ImmutableBinaryFile> {
    raw.flush()?;
    raw.shrink_to_size()?;
    let path = raw.path().to_owned();
    drop(raw);
    ctx.open_immutable(&path)
}
