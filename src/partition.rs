//! Directory-backed partitions of sorted files.
//!
//! A partition owns a directory of immutable sorted data files (decimal id
//! filenames) with index sidecars (`<id>_index`), plus the not-yet-written
//! files pending in a store pipeline. It fans batched queries out over all
//! files and replaces groups of files by merged ones on request.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tracing::*;

use crate::equal_range::batched_equal_range;
use crate::error::Result;
use crate::index::{sidecar_path, IndexBuilder, RangeIndex};
use crate::inserter::BackInserter;
use crate::binary::AppendableFile;
use crate::merge::{make_merge_plan, merge_assess_work, merge_spans};
use crate::pools::IoFuture;
use crate::record::Record;
use crate::span::ImmutableSpan;
use crate::store::AsyncStorePipeline;
use crate::Context;

/// Immutable sorted data file with its sparse index.
pub struct SortedFile<T: Record> {
    pub id: u64,
    pub span: ImmutableSpan<T>,
    pub index: RangeIndex<T::Key>,
}

/// File scheduled in a store pipeline but not yet collected.
pub struct FutureFile<T: Record> {
    id: u64,
    path: PathBuf,
    promise: IoFuture<RangeIndex<T::Key>>,
}

struct Inner<T: Record> {
    files: Vec<SortedFile<T>>,
    future_files: Vec<FutureFile<T>>,
    last_id: u64,
}

pub struct Partition<T: Record> {
    ctx: Arc<Context>,
    dir: PathBuf,
    inner: RwLock<Inner<T>>,
}

impl<T: Record> Partition<T> {
    /// Open (creating the directory if needed) and load every non-empty data
    /// file whose name parses as a decimal id, with its sidecar.
    pub fn open(ctx: &Arc<Context>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut files = vec![];
        let mut last_id = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let id = match entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                Some(id) => id,
                None => continue,
            };
            if entry.metadata()?.len() == 0 {
                continue;
            }
            let span = ImmutableSpan::whole(ctx.open_immutable(&entry.path())?)?;
            let index = RangeIndex::load(&sidecar_path(&entry.path()))?;
            last_id = last_id.max(id);
            files.push(SortedFile { id, span, index });
        }
        files.sort_by_key(|f| f.id);
        info!(?dir, files = files.len(), "Opened partition");
        Ok(Self {
            ctx: ctx.clone(),
            dir,
            inner: RwLock::new(Inner {
                files,
                future_files: vec![],
                last_id,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn file_ids(&self) -> Vec<u64> {
        self.inner.read().await.files.iter().map(|f| f.id).collect()
    }

    /// Records across all collected files.
    pub async fn total_records(&self) -> u64 {
        let inner = self.inner.read().await;
        inner.files.iter().map(|f| f.span.len()).sum()
    }

    /// Allocate the next id and schedule `buffer` through the pipeline.
    pub async fn store_unordered(&self, pipeline: &AsyncStorePipeline<T>, buffer: Vec<T>) {
        let mut inner = self.inner.write().await;
        inner.last_id += 1;
        let id = inner.last_id;
        let path = self.dir.join(id.to_string());
        debug!(?path, records = buffer.len(), "Scheduling store");
        let promise = pipeline.store(path.clone(), buffer);
        inner.future_files.push(FutureFile { id, path, promise });
    }

    /// Await every pending store and register the resulting files. The
    /// partition lock is not held while awaiting.
    pub async fn collect_future_files(&self) -> Result<()> {
        let pending: Vec<FutureFile<T>> = {
            let mut inner = self.inner.write().await;
            inner.future_files.drain(..).collect()
        };
        if pending.is_empty() {
            return Ok(());
        }
        let mut collected = Vec::with_capacity(pending.len());
        for future in pending {
            let index = future.promise.wait().await?;
            let span = ImmutableSpan::whole(self.ctx.open_immutable(&future.path)?)?;
            collected.push(SortedFile {
                id: future.id,
                span,
                index,
            });
        }
        let mut inner = self.inner.write().await;
        inner.files.append(&mut collected);
        inner.files.sort_by_key(|f| f.id);
        Ok(())
    }

    /// Batched lookup across all files; `accumulate` is invoked once per
    /// (file, key) pair with a non-empty range, with the matching records.
    ///
    /// Scans run against a snapshot of the file handles taken under the
    /// partition lock; none of the I/O holds it.
    pub async fn query_batch(
        &self,
        keys: &[T::Key],
        mut accumulate: impl FnMut(&[T], &T::Key),
    ) -> Result<()> {
        let files: Vec<(ImmutableSpan<T>, RangeIndex<T::Key>)> = {
            let inner = self.inner.read().await;
            inner
                .files
                .iter()
                .map(|f| (f.span.clone(), f.index.clone()))
                .collect()
        };
        let settings = &self.ctx.settings().equal_range;
        for (span, index) in &files {
            let ranges = batched_equal_range(span, Some(index), keys, settings).await?;
            for (key, (lo, hi)) in keys.iter().zip(ranges) {
                if lo < hi {
                    let records = span.read_range(lo..hi).await?;
                    accumulate(&records, key);
                }
            }
        }
        Ok(())
    }

    /// Merge all files (after collecting pending ones) into as few as the
    /// temp budget allows: consecutive files are grouped into batches of at
    /// most `temp_budget` bytes, and each batch becomes one new file.
    pub async fn merge_all(
        &self,
        temp_dirs: &[PathBuf],
        temp_budget: Option<u64>,
        mut on_pass: impl FnMut(usize) + Send,
    ) -> Result<()> {
        self.collect_future_files().await?;
        let ids = self.file_ids().await;
        self.merge_files(&ids, temp_dirs, temp_budget, &mut on_pass).await
    }

    /// Like [`Partition::merge_all`], restricted to the named files.
    pub async fn merge_files(
        &self,
        ids: &[u64],
        temp_dirs: &[PathBuf],
        temp_budget: Option<u64>,
        mut on_pass: impl FnMut(usize) + Send,
    ) -> Result<()> {
        self.collect_future_files().await?;
        let mut inner = self.inner.write().await;
        let batches = {
            let selected: Vec<(u64, u64)> = inner
                .files
                .iter()
                .filter(|f| ids.contains(&f.id))
                .map(|f| (f.id, f.span.size_bytes()))
                .collect();
            batches_under_budget(&selected, temp_budget)
        };
        for batch in batches {
            if batch.len() <= 1 {
                continue;
            }
            self.merge_batch(&mut inner, &batch, temp_dirs, &mut on_pass)
                .await?;
        }
        Ok(())
    }

    async fn merge_batch(
        &self,
        inner: &mut Inner<T>,
        ids: &[u64],
        temp_dirs: &[PathBuf],
        on_pass: &mut (impl FnMut(usize) + Send),
    ) -> Result<()> {
        let spans: Vec<ImmutableSpan<T>> = inner
            .files
            .iter()
            .filter(|f| ids.contains(&f.id))
            .map(|f| f.span.clone())
            .collect();
        if spans.is_empty() {
            return Ok(());
        }
        let settings = self.ctx.settings();
        let (dir_a, dir_b) = match temp_dirs {
            [] => (self.dir.clone(), self.dir.clone()),
            [a] => (a.clone(), a.clone()),
            [a, b, ..] => (a.clone(), b.clone()),
        };
        let plan = make_merge_plan(spans.len(), settings.merge.max_batch_size, &dir_a, &dir_b);
        let sizes: Vec<u64> = spans.iter().map(|s| s.size_bytes()).collect();
        let work = merge_assess_work(&sizes, settings.merge.max_batch_size);
        debug!(files = spans.len(), work_bytes = work, %plan, "Merging partition files");

        inner.last_id += 1;
        let new_id = inner.last_id;
        let tmp_path = self.dir.join("merge_tmp");
        let builder = Arc::new(Mutex::new(Some(IndexBuilder::<T>::new(
            settings.index.granularity,
        ))));
        let observer = {
            let builder = builder.clone();
            move |bytes: &[u8]| {
                if let Some(builder) = builder.lock().unwrap().as_mut() {
                    builder.observe_bytes(bytes);
                }
            }
        };
        let out = self.ctx.create_observable(&tmp_path, observer)?;
        out.raw().reserve(sizes.iter().sum())?;
        let buffer_elems =
            (settings.merge.output_buffer_size / 2 / std::mem::size_of::<T>() as u64).max(1);
        let mut sink = BackInserter::new(out, buffer_elems as usize);
        merge_spans(
            &self.ctx,
            &settings.merge,
            &plan,
            spans,
            &mut sink,
            |pass| on_pass(pass),
        )
        .await?;
        drop(sink.finish().await?);

        let index = builder.lock().unwrap().take().unwrap().finish();
        let final_path = self.dir.join(new_id.to_string());
        index.write(
            &sidecar_path(&final_path),
            settings.index.builder_buffer_size,
        )?;
        std::fs::rename(&tmp_path, &final_path)?;

        // Swap the merged result in and unlink the inputs.
        let mut kept = Vec::with_capacity(inner.files.len());
        let mut removed = vec![];
        for file in inner.files.drain(..) {
            if ids.contains(&file.id) {
                removed.push(file);
            } else {
                kept.push(file);
            }
        }
        inner.files = kept;
        for file in removed {
            let path = file.span.path().to_owned();
            drop(file);
            std::fs::remove_file(&path)?;
            std::fs::remove_file(sidecar_path(&path))?;
        }
        let span = ImmutableSpan::whole(self.ctx.open_immutable(&final_path)?)?;
        if span.is_empty() {
            std::fs::remove_file(&final_path)?;
            std::fs::remove_file(sidecar_path(&final_path))?;
        } else {
            info!(new_id, records = span.len(), "Merged files");
            inner.files.push(SortedFile {
                id: new_id,
                span,
                index,
            });
        }
        inner.files.sort_by_key(|f| f.id);
        Ok(())
    }

    /// Collect pending stores, then unlink every data file, sidecar and
    /// leftover merge temp.
    pub async fn clear(&self) -> Result<()> {
        self.collect_future_files().await?;
        let mut inner = self.inner.write().await;
        for file in inner.files.drain(..) {
            let path = file.span.path().to_owned();
            drop(file);
            std::fs::remove_file(&path)?;
            std::fs::remove_file(sidecar_path(&path))?;
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with("merge_tmp"))
                .unwrap_or(false)
            {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl<T: Record> std::fmt::Display for Partition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Partition at {:?}", self.dir)
    }
}

/// Group consecutive `(id, size)` pairs into batches whose total size stays
/// within the budget; a single file over budget forms its own batch.
fn batches_under_budget(selected: &[(u64, u64)], budget: Option<u64>) -> Vec<Vec<u64>> {
    let budget = match budget {
        None => return vec![selected.iter().map(|(id, _)| *id).collect()],
        Some(budget) => budget,
    };
    let mut batches = vec![];
    let mut batch: Vec<u64> = vec![];
    let mut batch_size = 0;
    for &(id, size) in selected {
        if !batch.is_empty() && batch_size + size > budget {
            batches.push(std::mem::take(&mut batch));
            batch_size = 0;
        }
        batch.push(id);
        batch_size += size;
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn budget_batching() {
        let selected = [(1, 10), (2, 10), (3, 25), (4, 5)];
        assert_eq!(
            batches_under_budget(&selected, Some(20)),
            vec![vec![1, 2], vec![3], vec![4]]
        );
        assert_eq!(
            batches_under_budget(&selected, None),
            vec![vec![1, 2, 3, 4]]
        );
        assert!(batches_under_budget(&[], Some(10)).is_empty());
    }
}
