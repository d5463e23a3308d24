//! Asynchronous store pipeline: sort, coalesce, write, index.
//!
//! Buffers of unordered records flow caller → sort workers → write worker →
//! back to the caller through a bounded buffer pool; ownership is linear.
//! The write worker uses a direct (unpooled) output handle per file, builds
//! the sparse index in memory and writes the sidecar before the data file.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::*;

use crate::binary::AppendableFile;
use crate::error::{Error, Result};
use crate::index::{sidecar_path, IndexBuilder, RangeIndex};
use crate::pools::IoFuture;
use crate::record::{sort_and_coalesce, Record};
use crate::Context;

struct StoreJob<T: Record> {
    path: PathBuf,
    buffer: Vec<T>,
    promise: oneshot::Sender<Result<RangeIndex<T::Key>>>,
}

struct Queue<J> {
    jobs: VecDeque<J>,
    done: bool,
}
impl<J> Default for Queue<J> {
    fn default() -> Self {
        Self {
            jobs: Default::default(),
            done: false,
        }
    }
}

struct Shared<T: Record> {
    ctx: Arc<Context>,
    granularity: u64,
    index_buffer_size: u64,
    sort: Mutex<Queue<StoreJob<T>>>,
    sort_cv: Condvar,
    write: Mutex<Queue<StoreJob<T>>>,
    write_cv: Condvar,
    buffers: Mutex<Vec<Vec<T>>>,
    buffers_cv: Condvar,
}

impl<T: Record> Shared<T> {
    fn return_buffer(&self, mut buffer: Vec<T>) {
        buffer.clear();
        self.buffers.lock().unwrap().push(buffer);
        self.buffers_cv.notify_one();
    }
}

fn pop_job<J>(queue: &Mutex<Queue<J>>, cv: &Condvar) -> Option<J> {
    let mut queue = queue.lock().unwrap();
    loop {
        if let Some(job) = queue.jobs.pop_front() {
            return Some(job);
        }
        if queue.done {
            return None;
        }
        queue = cv.wait(queue).unwrap();
    }
}

fn sort_loop<T: Record>(shared: &Shared<T>) {
    while let Some(mut job) = pop_job(&shared.sort, &shared.sort_cv) {
        let before = job.buffer.len();
        sort_and_coalesce(&mut job.buffer);
        trace!(path = ?job.path, before, after = job.buffer.len(), "Sorted store buffer");
        shared.write.lock().unwrap().jobs.push_back(job);
        shared.write_cv.notify_one();
    }
}

fn write_loop<T: Record>(shared: &Shared<T>) {
    while let Some(job) = pop_job(&shared.write, &shared.write_cv) {
        let StoreJob {
            path,
            buffer,
            promise,
        } = job;
        let result = write_sorted(shared, &path, &buffer);
        shared.return_buffer(buffer);
        let _ = promise.send(result);
    }
}

fn write_sorted<T: Record>(
    shared: &Shared<T>,
    path: &Path,
    records: &[T],
) -> Result<RangeIndex<T::Key>> {
    let mut builder = IndexBuilder::<T>::new(shared.granularity);
    for record in records {
        builder.push(record);
    }
    let index = builder.finish();
    index.write(&sidecar_path(path), shared.index_buffer_size)?;

    let file = shared.ctx.create_output_direct(path)?;
    let bytes = bytemuck::cast_slice(records);
    let written = file.raw().append(bytes)?;
    if written != bytes.len() {
        return Err(Error::Append {
            path: path.to_owned(),
            requested: bytes.len() as u64,
            written: written as u64,
        });
    }
    file.raw().flush()?;
    debug!(?path, records = records.len(), "Stored sorted file");
    Ok(index)
}

/// Multi-producer pipeline turning unordered record buffers into sorted,
/// coalesced, indexed files.
pub struct AsyncStorePipeline<T: Record> {
    shared: Arc<Shared<T>>,
    sort_workers: Vec<JoinHandle<()>>,
    write_worker: Option<JoinHandle<()>>,
}

impl<T: Record> AsyncStorePipeline<T> {
    pub fn new(
        ctx: &Arc<Context>,
        sort_threads: usize,
        n_buffers: usize,
        buffer_capacity: usize,
    ) -> Self {
        let settings = &ctx.settings().index;
        let shared = Arc::new(Shared {
            ctx: ctx.clone(),
            granularity: settings.granularity,
            index_buffer_size: settings.builder_buffer_size,
            sort: Default::default(),
            sort_cv: Condvar::new(),
            write: Default::default(),
            write_cv: Condvar::new(),
            buffers: Mutex::new(
                (0..n_buffers.max(1))
                    .map(|_| Vec::with_capacity(buffer_capacity))
                    .collect(),
            ),
            buffers_cv: Condvar::new(),
        });
        let sort_workers = (0..sort_threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("store-sort-{}", i))
                    .spawn(move || sort_loop(&shared))
                    .unwrap()
            })
            .collect();
        let write_worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("store-write".into())
                .spawn(move || write_loop(&shared))
                .unwrap()
        };
        Self {
            shared,
            sort_workers,
            write_worker: Some(write_worker),
        }
    }

    /// Take an empty buffer from the pool, blocking until one is returned.
    pub fn get_empty_buffer(&self) -> Vec<T> {
        let mut buffers = self.shared.buffers.lock().unwrap();
        loop {
            if let Some(buffer) = buffers.pop() {
                return buffer;
            }
            buffers = self.shared.buffers_cv.wait(buffers).unwrap();
        }
    }

    /// Schedule `buffer` to be sorted, coalesced and written to `path` (with
    /// its index sidecar alongside). The future resolves once both files are
    /// on disk.
    pub fn store(&self, path: PathBuf, buffer: Vec<T>) -> IoFuture<RangeIndex<T::Key>> {
        let mut queue = self.shared.sort.lock().unwrap();
        if queue.done {
            return IoFuture::resolved(Err(Error::Shutdown));
        }
        let (tx, rx) = oneshot::channel();
        queue.jobs.push_back(StoreJob {
            path,
            buffer,
            promise: tx,
        });
        drop(queue);
        self.shared.sort_cv.notify_one();
        IoFuture::from_receiver(rx)
    }

    /// Drain both queues and join the workers. Idempotent.
    pub fn wait_for_completion(&mut self) {
        self.shared.sort.lock().unwrap().done = true;
        self.shared.sort_cv.notify_all();
        for worker in self.sort_workers.drain(..) {
            let _ = worker.join();
        }
        self.shared.write.lock().unwrap().done = true;
        self.shared.write_cv.notify_all();
        if let Some(worker) = self.write_worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T: Record> Drop for AsyncStorePipeline<T> {
    fn drop(&mut self) {
        self.wait_for_completion();
    }
}
