//! Handle and I/O thread pools.
//!
//! The [`HandlePool`] caps concurrently open pooled handles, evicting in LRU
//! order and transparently reopening on the next access. [`IoThreadPool`]s
//! consume a queue of read/append jobs on dedicated OS threads and resolve
//! [`IoFuture`]s; the [`PoolRouter`] assigns files to pools by the deepest
//! matching path prefix, so different physical devices get independent pools.
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use bytemuck::Zeroable;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::*;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::file::{FileState, Mode, RawFile};
use crate::record::Record;

/// Bounded LRU cache of native file handles, keyed by the owning [`RawFile`].
///
/// `with_handle` holds both the pool lock and the per-file lock for the whole
/// callback, and performs physical opens under the pool lock; this is a known
/// serialization point.
pub struct HandlePool {
    max_open: usize,
    state: Mutex<PoolState>,
}
struct PoolState {
    handles: FxHashMap<u64, File>,
    /// LRU order, freshest at the tail.
    lru: VecDeque<u64>,
}

impl HandlePool {
    pub fn new(max_open: usize) -> Arc<Self> {
        Arc::new(Self {
            max_open: max_open.max(1),
            state: Mutex::new(PoolState {
                handles: Default::default(),
                lru: Default::default(),
            }),
        })
    }

    /// Number of currently cached handles.
    pub fn cached(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    pub(crate) fn with_handle<R>(
        &self,
        file: &RawFile,
        f: impl FnOnce(&File, &mut FileState) -> R,
    ) -> Result<R> {
        let mut pool = self.state.lock().unwrap();
        let id = file.id();
        if pool.handles.contains_key(&id) {
            if let Some(pos) = pool.lru.iter().position(|entry| *entry == id) {
                pool.lru.remove(pos);
                pool.lru.push_back(id);
            }
        } else {
            while pool.handles.len() >= self.max_open {
                match pool.lru.pop_front() {
                    Some(oldest) => {
                        pool.handles.remove(&oldest);
                        trace!(oldest, "Evicted least-recently-used handle");
                    }
                    None => break,
                }
            }
            let handle = file.open_handle()?;
            pool.handles.insert(id, handle);
            pool.lru.push_back(id);
        }
        let handle = &pool.handles[&id];
        let mut state = file.lock_state();
        Ok(f(handle, &mut state))
    }

    /// Forget a file's cached handle; called on [`RawFile`] drop. When the
    /// file reserved more than its logical size, the on-disk length is
    /// restored best-effort.
    pub(crate) fn release(&self, id: u64, path: &Path, restore_len: Option<u64>) {
        let mut pool = self.state.lock().unwrap();
        let handle = pool.handles.remove(&id);
        if let Some(pos) = pool.lru.iter().position(|entry| *entry == id) {
            pool.lru.remove(pos);
        }
        drop(pool);
        if let Some(len) = restore_len {
            let result = match handle {
                Some(handle) => handle.set_len(len),
                None => std::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .and_then(|handle| handle.set_len(len)),
            };
            if let Err(e) = result {
                warn!(?path, len, "Failed to restore reserved length: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "HandlePool with {}/{} handles", self.cached(), self.max_open)
    }
}

/// Future resolved by an I/O worker thread.
pub struct IoFuture<T>(oneshot::Receiver<Result<T>>);
impl<T> IoFuture<T> {
    pub async fn wait(self) -> Result<T> {
        self.0.await.unwrap_or(Err(Error::Shutdown))
    }
    pub(crate) fn resolved(value: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self(rx)
    }
    pub(crate) fn from_receiver(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self(rx)
    }
}

#[derive(Debug, Clone, Copy)]
enum JobKind {
    Read,
    Append,
}
struct Job {
    kind: JobKind,
    run: Box<dyn FnOnce() + Send>,
}
struct JobQueue {
    jobs: VecDeque<Job>,
    done: bool,
}
struct QueueShared {
    queue: Mutex<JobQueue>,
    available: Condvar,
}

/// Pool of OS threads executing read/append jobs against [`RawFile`]s.
///
/// Submission wakes at most one worker; a worker that leaves jobs behind
/// chain-notifies the next. Jobs against the same file may be picked up by
/// several workers concurrently; callers needing strict per-file ordering
/// await each future before submitting the next.
pub struct IoThreadPool {
    name: String,
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl IoThreadPool {
    pub fn new(name: &str, threads: usize) -> Arc<Self> {
        let shared = Arc::new(QueueShared {
            queue: Mutex::new(JobQueue {
                jobs: Default::default(),
                done: false,
            }),
            available: Condvar::new(),
        });
        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("io-{}-{}", name, i))
                    .spawn(move || worker_loop(&shared))
                    .unwrap()
            })
            .collect();
        Arc::new(Self {
            name: name.to_string(),
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job) {
        let mut queue = self.shared.queue.lock().unwrap();
        trace!(pool = %self.name, kind = ?job.kind, pending = queue.jobs.len(), "Submitting job");
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Read `count` records at `offset_elems` into `buf` (recycled through
    /// the future). The future yields the buffer truncated to the records
    /// actually read; a read ending off a record boundary is a short read.
    pub fn schedule_read<T: Record>(
        &self,
        file: Arc<RawFile>,
        mut buf: Vec<T>,
        offset_elems: u64,
        count: usize,
    ) -> IoFuture<(Vec<T>, usize)> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job {
            kind: JobKind::Read,
            run: Box::new(move || {
                let elem_size = std::mem::size_of::<T>();
                buf.clear();
                buf.resize(count, T::zeroed());
                let offset = offset_elems * elem_size as u64;
                let result = match file.read(bytemuck::cast_slice_mut(buf.as_mut_slice()), offset)
                {
                    Ok(n_bytes) if n_bytes % elem_size != 0 => Err(Error::Read {
                        path: file.path().to_owned(),
                        offset,
                        requested: (count * elem_size) as u64,
                        got: n_bytes as u64,
                    }),
                    Ok(n_bytes) => {
                        let n = n_bytes / elem_size;
                        buf.truncate(n);
                        Ok((buf, n))
                    }
                    Err(e) => Err(e),
                };
                let _ = tx.send(result);
            }),
        });
        IoFuture(rx)
    }

    /// Append the records in `buf` at the logical end of `file`. The future
    /// yields the untouched buffer plus the byte count reported by the OS;
    /// short-write escalation is the caller's call.
    pub fn schedule_append<T: Record>(
        &self,
        file: Arc<RawFile>,
        buf: Vec<T>,
    ) -> IoFuture<(Vec<T>, usize)> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job {
            kind: JobKind::Append,
            run: Box::new(move || {
                let result = file
                    .append(bytemuck::cast_slice(buf.as_slice()))
                    .map(|written| (buf, written));
                let _ = tx.send(result);
            }),
        });
        IoFuture(rx)
    }
}

fn worker_loop(shared: &QueueShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    if !queue.jobs.is_empty() {
                        shared.available.notify_one();
                    }
                    break Some(job);
                }
                if queue.done {
                    break None;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };
        match job {
            Some(job) => (job.run)(),
            None => {
                // Chain the shutdown wakeup to the next sleeper.
                shared.available.notify_one();
                return;
            }
        }
    }
}

impl Drop for IoThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().unwrap().done = true;
        self.shared.available.notify_one();
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for IoThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "IoThreadPool {:?}", self.name)
    }
}

/// Path-prefix routing table over [`IoThreadPool`]s.
pub struct PoolRouter {
    routes: Vec<(PathBuf, Arc<IoThreadPool>)>,
    default_pool: Arc<IoThreadPool>,
}

impl PoolRouter {
    pub fn new(settings: &Settings) -> Self {
        let default_pool = IoThreadPool::new("default", settings.default_thread_pool.threads);
        let mut routes = vec![];
        for (i, routed) in settings.thread_pools.iter().enumerate() {
            let pool = IoThreadPool::new(&format!("routed-{}", i), routed.threads);
            for path in &routed.paths {
                routes.push((path.clone(), pool.clone()));
            }
        }
        Self {
            routes,
            default_pool,
        }
    }

    /// Pool serving `path`: deepest matching prefix, default otherwise.
    pub fn pool_for(&self, path: &Path) -> &Arc<IoThreadPool> {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.components().count())
            .map(|(_, pool)| pool)
            .unwrap_or(&self.default_pool)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RoutedPoolSettings;

    #[test]
    fn deepest_prefix_wins() {
        let settings = Settings {
            thread_pools: vec![
                RoutedPoolSettings {
                    threads: 1,
                    paths: vec!["/data".into()],
                },
                RoutedPoolSettings {
                    threads: 1,
                    paths: vec!["/data/fast".into()],
                },
            ],
            ..Default::default()
        };
        let router = PoolRouter::new(&settings);
        assert_eq!(router.pool_for(Path::new("/data/fast/0")).name(), "routed-1");
        assert_eq!(router.pool_for(Path::new("/data/slow/0")).name(), "routed-0");
        assert_eq!(router.pool_for(Path::new("/elsewhere/0")).name(), "default");
    }

    #[test]
    fn lru_eviction() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = HandlePool::new(2);
        let files: Vec<Arc<RawFile>> = (0..3u8)
            .map(|i| {
                let path = dir.path().join(i.to_string());
                std::fs::write(&path, [i; 4]).unwrap();
                RawFile::open_pooled(path, Mode::IMMUTABLE, pool.clone()).unwrap()
            })
            .collect();
        let mut buf = [0u8; 4];
        for (i, file) in files.iter().enumerate() {
            assert_eq!(file.read(&mut buf, 0)?, 4);
            assert_eq!(buf, [i as u8; 4]);
            assert!(pool.cached() <= 2);
        }
        // The first file's handle was evicted above; reading reopens it.
        assert_eq!(files[0].read(&mut buf, 0)?, 4);
        assert_eq!(buf, [0u8; 4]);
        Ok(())
    }
}
