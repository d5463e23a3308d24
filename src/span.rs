//! Typed windows over immutable files.
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Range;
use std::path::Path;

use futures::Stream;

use crate::binary::ImmutableBinaryFile;
use crate::error::{Error, Result};
use crate::pools::IoFuture;
use crate::record::Record;

/// Logical window `[begin, end)` of records over an [`ImmutableBinaryFile`].
///
/// Clones are cheap and share the underlying handle.
#[derive(Clone)]
pub struct ImmutableSpan<T: Record> {
    file: ImmutableBinaryFile,
    begin: u64,
    end: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> ImmutableSpan<T> {
    /// Span over the entire file. The file size must be a multiple of the
    /// record size.
    pub fn whole(file: ImmutableBinaryFile) -> Result<Self> {
        let elem_size = std::mem::size_of::<T>() as u64;
        let size = file.size();
        if size % elem_size != 0 {
            return Err(Error::InvalidLength {
                path: file.path().to_owned(),
                len: size,
            });
        }
        Ok(Self {
            begin: 0,
            end: size / elem_size,
            file,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
    pub fn path(&self) -> &Path {
        self.file.path()
    }
    /// Size of the spanned records in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.len() * std::mem::size_of::<T>() as u64
    }

    /// Sub-window; `range` is relative to this span.
    pub fn subspan(&self, range: Range<u64>) -> Self {
        debug_assert!(range.start <= range.end && range.end <= self.len());
        Self {
            file: self.file.clone(),
            begin: self.begin + range.start,
            end: self.begin + range.end,
            _marker: PhantomData,
        }
    }

    pub(crate) fn byte_offset(&self, elem: u64) -> u64 {
        (self.begin + elem) * std::mem::size_of::<T>() as u64
    }

    /// Read up to `count` records at `offset_elems` (span-relative) into
    /// `buf`, clamped to the span end.
    pub fn schedule_read(
        &self,
        mut buf: Vec<T>,
        offset_elems: u64,
        count: usize,
    ) -> IoFuture<(Vec<T>, usize)> {
        let offset = offset_elems.min(self.len());
        let count = count.min((self.len() - offset) as usize);
        if count == 0 {
            buf.clear();
            return IoFuture::resolved(Ok((buf, 0)));
        }
        self.file.schedule_read(buf, self.begin + offset, count)
    }

    /// Read exactly `range`, reusing `buf`; a shortfall is an error.
    pub async fn read_exact(&self, range: Range<u64>, buf: Vec<T>) -> Result<Vec<T>> {
        debug_assert!(range.start <= range.end && range.end <= self.len());
        let count = (range.end - range.start) as usize;
        let (buf, n) = self.schedule_read(buf, range.start, count).wait().await?;
        if n != count {
            let elem_size = std::mem::size_of::<T>() as u64;
            return Err(Error::Read {
                path: self.path().to_owned(),
                offset: self.byte_offset(range.start),
                requested: count as u64 * elem_size,
                got: n as u64 * elem_size,
            });
        }
        Ok(buf)
    }

    /// Read exactly `range` into a fresh buffer.
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<T>> {
        let buf = Vec::with_capacity((range.end - range.start) as usize);
        self.read_exact(range, buf).await
    }

    /// Sequential iterator with double-buffered prefetch; `buffer_elems`
    /// records per buffer.
    pub fn iter(&self, buffer_elems: usize) -> SpanIter<T> {
        SpanIter::new(self.clone(), buffer_elems)
    }

    /// Stream adapter over [`ImmutableSpan::iter`].
    pub fn stream(&self, buffer_elems: usize) -> impl Stream<Item = Result<T>> {
        let mut it = self.iter(buffer_elems);
        async_stream::try_stream! {
            while let Some(record) = it.next().await? {
                yield record;
            }
        }
    }

    /// Random-access reads with a one-record cache.
    pub fn random_reader(&self) -> RandomReader<T> {
        RandomReader {
            span: self.clone(),
            cached: None,
            buf: Vec::with_capacity(1),
        }
    }
}

impl<T: Record> std::fmt::Debug for ImmutableSpan<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ImmutableSpan({:?}, [{}, {}))",
            self.path(),
            self.begin,
            self.end
        )
    }
}

/// Single-pass forward iterator over a span.
///
/// Two buffers: the front is consumed while the back is filled by an
/// in-flight read; exhausting the front awaits the pending read, swaps, and
/// schedules the next. Construction primes both buffers. Owns its pending
/// I/O, so it is neither copyable nor clonable.
pub struct SpanIter<T: Record> {
    span: ImmutableSpan<T>,
    buffer_elems: usize,
    front: Vec<T>,
    front_pos: usize,
    pending: VecDeque<IoFuture<(Vec<T>, usize)>>,
    next_offset: u64,
}

impl<T: Record> SpanIter<T> {
    fn new(span: ImmutableSpan<T>, buffer_elems: usize) -> Self {
        let buffer_elems = buffer_elems.max(1);
        let mut it = Self {
            span,
            buffer_elems,
            front: Vec::new(),
            front_pos: 0,
            pending: VecDeque::with_capacity(2),
            next_offset: 0,
        };
        it.schedule_next(Vec::with_capacity(buffer_elems));
        it.schedule_next(Vec::with_capacity(buffer_elems));
        it
    }

    fn schedule_next(&mut self, buf: Vec<T>) {
        if self.next_offset >= self.span.len() {
            return;
        }
        let count = self
            .buffer_elems
            .min((self.span.len() - self.next_offset) as usize);
        self.pending
            .push_back(self.span.schedule_read(buf, self.next_offset, count));
        self.next_offset += count as u64;
    }

    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if self.front_pos < self.front.len() {
                let value = self.front[self.front_pos];
                self.front_pos += 1;
                return Ok(Some(value));
            }
            let fut = match self.pending.pop_front() {
                Some(fut) => fut,
                None => return Ok(None),
            };
            let recycled = std::mem::take(&mut self.front);
            let (buf, n) = fut.wait().await?;
            self.front = buf;
            self.front_pos = 0;
            if n == 0 {
                self.pending.clear();
                return Ok(None);
            }
            self.schedule_next(recycled);
        }
    }
}

/// Random-access reader caching the most recent record.
pub struct RandomReader<T: Record> {
    span: ImmutableSpan<T>,
    cached: Option<(u64, T)>,
    buf: Vec<T>,
}

impl<T: Record> RandomReader<T> {
    pub async fn get(&mut self, idx: u64) -> Result<T> {
        if let Some((cached_idx, value)) = self.cached {
            if cached_idx == idx {
                return Ok(value);
            }
        }
        let buf = std::mem::take(&mut self.buf);
        let (buf, n) = self.span.schedule_read(buf, idx, 1).wait().await?;
        self.buf = buf;
        if n != 1 {
            let elem_size = std::mem::size_of::<T>() as u64;
            return Err(Error::Read {
                path: self.span.path().to_owned(),
                offset: self.span.byte_offset(idx),
                requested: elem_size,
                got: 0,
            });
        }
        let value = self.buf[0];
        self.cached = Some((idx, value));
        Ok(value)
    }
}
