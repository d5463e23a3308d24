//! Buffered append sinks with asynchronous flush.
use tracing::*;

use crate::binary::{AppendableFile, InputOutputBinaryFile};
use crate::error::{Error, Result};
use crate::pools::IoFuture;
use crate::record::Record;

fn check_append(path: &std::path::Path, requested: u64, written: u64) -> Result<()> {
    if written != requested {
        return Err(Error::Append {
            path: path.to_owned(),
            requested,
            written,
        });
    }
    Ok(())
}

/// Double-buffered append sink.
///
/// `push` fills the active buffer; a full buffer swaps with the spare and is
/// appended asynchronously while writing continues. At most one append is in
/// flight, and it is awaited before the next is submitted, which keeps the
/// on-disk order equal to the push order.
pub struct BackInserter<T: Record, F: AppendableFile> {
    file: Option<F>,
    capacity: usize,
    active: Vec<T>,
    spare: Option<Vec<T>>,
    pending: Option<IoFuture<(Vec<T>, usize)>>,
}

impl<T: Record, F: AppendableFile> BackInserter<T, F> {
    pub fn new(file: F, buffer_elems: usize) -> Self {
        let capacity = buffer_elems.max(1);
        Self {
            file: Some(file),
            capacity,
            active: Vec::with_capacity(capacity),
            spare: Some(Vec::with_capacity(capacity)),
            pending: None,
        }
    }

    pub fn file(&self) -> &F {
        self.file.as_ref().unwrap()
    }

    /// Await the in-flight append, check for a short write, and recycle its
    /// buffer.
    async fn await_pending(&mut self) -> Result<Vec<T>> {
        match self.pending.take() {
            Some(fut) => {
                let (mut buf, written) = fut.wait().await?;
                let requested = (buf.len() * std::mem::size_of::<T>()) as u64;
                check_append(self.file().path(), requested, written as u64)?;
                buf.clear();
                Ok(buf)
            }
            None => Ok(self
                .spare
                .take()
                .unwrap_or_else(|| Vec::with_capacity(self.capacity))),
        }
    }

    async fn swap_and_write(&mut self) -> Result<()> {
        let next = self.await_pending().await?;
        let full = std::mem::replace(&mut self.active, next);
        self.pending = Some(self.file().schedule_append(full));
        Ok(())
    }

    pub async fn push(&mut self, value: T) -> Result<()> {
        self.active.push(value);
        if self.active.len() >= self.capacity {
            self.swap_and_write().await?;
        }
        Ok(())
    }

    /// Append a batch. Batches fitting the active buffer are copied inline;
    /// larger batches drain the buffer first and then go to the file in one
    /// append, sequenced after the outstanding write.
    pub async fn append(&mut self, records: &[T]) -> Result<()> {
        if records.len() <= self.capacity - self.active.len() {
            self.active.extend_from_slice(records);
            if self.active.len() >= self.capacity {
                self.swap_and_write().await?;
            }
            return Ok(());
        }
        if !self.active.is_empty() {
            self.swap_and_write().await?;
        }
        let spare = self.await_pending().await?;
        self.spare = Some(spare);
        let (_, written) = self.file().schedule_append(records.to_vec()).wait().await?;
        check_append(
            self.file().path(),
            (records.len() * std::mem::size_of::<T>()) as u64,
            written as u64,
        )
    }

    /// Write out the active buffer, await every outstanding append and flush
    /// the underlying file.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.active.is_empty() {
            self.swap_and_write().await?;
        }
        let spare = self.await_pending().await?;
        self.spare = Some(spare);
        self.file().flush()
    }

    /// Flush and hand back the underlying file (for sealing).
    pub async fn finish(mut self) -> Result<F> {
        self.flush().await?;
        Ok(self.file.take().unwrap())
    }
}

impl<T: Record, F: AppendableFile> Drop for BackInserter<T, F> {
    fn drop(&mut self) {
        if self.file.is_some() && (self.pending.is_some() || !self.active.is_empty()) {
            if let Err(e) = futures::executor::block_on(self.flush()) {
                warn!("Discarding append error in teardown: {}", e);
            }
        }
    }
}

/// Growable on-disk vector: buffered appends plus reads that observe every
/// prior write.
pub struct FileVector<T: Record> {
    file: InputOutputBinaryFile,
    inserter: BackInserter<T, InputOutputBinaryFile>,
    len: u64,
}

impl<T: Record> FileVector<T> {
    pub fn new(file: InputOutputBinaryFile, buffer_elems: usize) -> Result<Self> {
        let elem_size = std::mem::size_of::<T>() as u64;
        let size = file.size();
        if size % elem_size != 0 {
            return Err(Error::InvalidLength {
                path: file.path().to_owned(),
                len: size,
            });
        }
        Ok(Self {
            file: file.clone(),
            inserter: BackInserter::new(file, buffer_elems),
            len: size / elem_size,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn push(&mut self, value: T) -> Result<()> {
        self.inserter.push(value).await?;
        self.len += 1;
        Ok(())
    }

    pub async fn append(&mut self, records: &[T]) -> Result<()> {
        self.inserter.append(records).await?;
        self.len += records.len() as u64;
        Ok(())
    }

    /// Read `range`, flushing first so pending writes are observed.
    pub async fn read(&mut self, range: std::ops::Range<u64>) -> Result<Vec<T>> {
        debug_assert!(range.start <= range.end && range.end <= self.len);
        self.inserter.flush().await?;
        let count = (range.end - range.start) as usize;
        let (buf, n) = self
            .file
            .schedule_read(Vec::with_capacity(count), range.start, count)
            .wait()
            .await?;
        if n != count {
            let elem_size = std::mem::size_of::<T>() as u64;
            return Err(Error::Read {
                path: self.file.path().to_owned(),
                offset: range.start * elem_size,
                requested: count as u64 * elem_size,
                got: n as u64 * elem_size,
            });
        }
        Ok(buf)
    }

    pub async fn get(&mut self, idx: u64) -> Result<T> {
        Ok(self.read(idx..idx + 1).await?[0])
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inserter.flush().await
    }

    /// Discard all contents.
    pub async fn clear(&mut self) -> Result<()> {
        self.inserter.flush().await?;
        self.file.raw().truncate(0)?;
        self.len = 0;
        Ok(())
    }
}
