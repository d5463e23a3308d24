#![doc = include_str!("../README.md")]

pub mod binary;
pub mod config;
pub mod equal_range;
pub mod error;
pub mod file;
pub mod index;
pub mod inserter;
pub mod merge;
pub mod partition;
pub mod pools;
pub mod record;
pub mod span;
pub mod store;
#[doc(hidden)]
pub mod utils;

pub use config::Settings;
pub use error::Error;
pub use partition::Partition;
pub use record::{Key, Record};
pub use store::AsyncStorePipeline;

use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::binary::{
    ImmutableBinaryFile, InputOutputBinaryFile, ObservableBinaryFile, OutputBinaryFile,
};
use crate::error::Result;
use crate::file::{DirectSlot, Mode, RawFile};
use crate::pools::{HandlePool, IoThreadPool, PoolRouter};

trait_set::trait_set! {
    /// Convenience trait alias
    pub trait WriteObserver = FnMut(&[u8]) + Send + 'static;
}

/// Engine context: the settings, the pooled-handle cache and the routed I/O
/// thread pools. Created once, shared by every partition and open file;
/// dropping the last reference drains and joins the worker threads.
pub struct Context {
    settings: Settings,
    handles: Arc<HandlePool>,
    router: PoolRouter,
    direct_open: Arc<AtomicUsize>,
}

impl Context {
    pub fn new(settings: Settings) -> Arc<Self> {
        let handles = HandlePool::new(settings.max_concurrent_open_pooled_files);
        let router = PoolRouter::new(&settings);
        Arc::new(Self {
            settings,
            handles,
            router,
            direct_open: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn handle_pool(&self) -> &Arc<HandlePool> {
        &self.handles
    }
    pub fn pool_for(&self, path: &Path) -> &Arc<IoThreadPool> {
        self.router.pool_for(path)
    }

    /// Open an existing file read-only through the handle pool.
    pub fn open_immutable(self: &Arc<Self>, path: &Path) -> Result<ImmutableBinaryFile> {
        let raw = RawFile::open_pooled(path.to_owned(), Mode::IMMUTABLE, self.handles.clone())?;
        Ok(ImmutableBinaryFile::new(raw, self.pool_for(path).clone()))
    }

    /// Create (truncating) a pooled append-only output file.
    pub fn create_output(self: &Arc<Self>, path: &Path) -> Result<OutputBinaryFile> {
        let raw = RawFile::open_pooled(path.to_owned(), Mode::OUTPUT, self.handles.clone())?;
        Ok(OutputBinaryFile::new(
            raw,
            self.pool_for(path).clone(),
            self.clone(),
        ))
    }

    /// Create (truncating) an unpooled output file: the handle stays open
    /// for the file's lifetime, for predictable latency on single-pass
    /// outputs. Counts against `max_concurrent_open_unpooled_files`.
    pub fn create_output_direct(self: &Arc<Self>, path: &Path) -> Result<OutputBinaryFile> {
        let slot = DirectSlot::acquire(
            &self.direct_open,
            self.settings.max_concurrent_open_unpooled_files,
        )?;
        let raw = RawFile::open_direct(path.to_owned(), Mode::OUTPUT, slot)?;
        Ok(OutputBinaryFile::new(
            raw,
            self.pool_for(path).clone(),
            self.clone(),
        ))
    }

    /// Open (creating if missing) a pooled file for reading and appending.
    pub fn open_read_append(self: &Arc<Self>, path: &Path) -> Result<InputOutputBinaryFile> {
        let raw = RawFile::open_pooled(path.to_owned(), Mode::READ_APPEND, self.handles.clone())?;
        Ok(InputOutputBinaryFile::new(
            raw,
            self.pool_for(path).clone(),
            self.clone(),
        ))
    }

    /// Create an output file whose appends are fed to `observer` before
    /// being scheduled.
    pub fn create_observable(
        self: &Arc<Self>,
        path: &Path,
        observer: impl WriteObserver,
    ) -> Result<ObservableBinaryFile> {
        let raw = RawFile::open_pooled(path.to_owned(), Mode::OUTPUT, self.handles.clone())?;
        Ok(ObservableBinaryFile::new(
            raw,
            self.pool_for(path).clone(),
            self.clone(),
            observer,
        ))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Context with {:?}", self.handles)
    }
}
