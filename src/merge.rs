//! External k-way merge.
//!
//! Inputs are sorted spans; a single pass merges up to `fan_in` of them,
//! stable by input index. Many inputs run through a priority queue; once the
//! active count drops to [`LINEAR_SCAN_MAX`] the merge switches to a linear
//! scan over the current heads. Multi-pass plans alternate temp directories
//! and stream the final pass straight into the caller's sink.
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use tracing::*;

use crate::binary::AppendableFile;
use crate::config::MergeSettings;
use crate::error::Result;
use crate::inserter::BackInserter;
use crate::record::Record;
use crate::span::{ImmutableSpan, SpanIter};
use crate::Context;

/// Largest fan-in handled by linear scanning of the current heads.
pub const LINEAR_SCAN_MAX: usize = 24;

/// Output of a merge, fed one record at a time in sorted order.
#[async_trait::async_trait]
pub trait MergeSink<T: Record>: Send {
    async fn push(&mut self, record: T) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: Record, S: MergeSink<T>> MergeSink<T> for &mut S {
    async fn push(&mut self, record: T) -> Result<()> {
        (**self).push(record).await
    }
    async fn finish(&mut self) -> Result<()> {
        (**self).finish().await
    }
}

#[async_trait::async_trait]
impl<T: Record, F: AppendableFile> MergeSink<T> for BackInserter<T, F> {
    async fn push(&mut self, record: T) -> Result<()> {
        BackInserter::push(self, record).await
    }
    async fn finish(&mut self) -> Result<()> {
        self.flush().await
    }
}

/// In-memory sink, mostly for tests and small result sets.
#[derive(Default)]
pub struct VecSink<T>(pub Vec<T>);
#[async_trait::async_trait]
impl<T: Record> MergeSink<T> for VecSink<T> {
    async fn push(&mut self, record: T) -> Result<()> {
        self.0.push(record);
        Ok(())
    }
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sink wrapper coalescing consecutive equivalent records with
/// [`Record::combine`], left-to-right.
pub struct CombiningSink<T: Record, S: MergeSink<T>> {
    inner: S,
    pending: Option<T>,
}

impl<T: Record, S: MergeSink<T>> CombiningSink<T, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: None,
        }
    }
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait::async_trait]
impl<T: Record, S: MergeSink<T>> MergeSink<T> for CombiningSink<T, S> {
    async fn push(&mut self, record: T) -> Result<()> {
        match self.pending {
            Some(pending) if pending.eq_full(&record) => {
                self.pending = Some(pending.combine(record));
            }
            Some(pending) => {
                self.inner.push(pending).await?;
                self.pending = Some(record);
            }
            None => self.pending = Some(record),
        }
        Ok(())
    }
    async fn finish(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            self.inner.push(pending).await?;
        }
        self.inner.finish().await
    }
}

/// One pass of a merge plan.
#[derive(Debug, Clone)]
pub struct Pass {
    pub read_dir: PathBuf,
    pub write_dir: PathBuf,
}

/// Multi-pass plan alternating between two temp directories. The first pass
/// reads the inputs where they live; `read_dir` of pass `p > 0` is the
/// `write_dir` of pass `p - 1`.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub passes: Vec<Pass>,
    dir_a: PathBuf,
    dir_b: PathBuf,
}

impl MergePlan {
    /// Write directory of `pass`, continuing to alternate beyond the
    /// planned passes.
    pub fn write_dir(&self, pass: usize) -> &Path {
        if pass % 2 == 0 {
            &self.dir_a
        } else {
            &self.dir_b
        }
    }
}

impl std::fmt::Display for MergePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Merge plan with {} passes", self.passes.len())
    }
}

/// Number of passes needed to merge `n_inputs` with the given fan-in,
/// including the final streaming pass.
pub(crate) fn plan_passes(n_inputs: usize, fan_in: usize) -> usize {
    let fan_in = fan_in.max(2);
    if n_inputs == 0 {
        return 0;
    }
    let mut passes = 1;
    let mut n = n_inputs;
    while n > fan_in {
        n = (n + fan_in - 1) / fan_in;
        passes += 1;
    }
    passes
}

pub fn make_merge_plan(n_inputs: usize, fan_in: usize, dir_a: &Path, dir_b: &Path) -> MergePlan {
    let passes = (0..plan_passes(n_inputs, fan_in))
        .map(|i| Pass {
            read_dir: if i == 0 {
                dir_a.to_owned()
            } else if (i - 1) % 2 == 0 {
                dir_a.to_owned()
            } else {
                dir_b.to_owned()
            },
            write_dir: if i % 2 == 0 {
                dir_a.to_owned()
            } else {
                dir_b.to_owned()
            },
        })
        .collect();
    MergePlan {
        passes,
        dir_a: dir_a.to_owned(),
        dir_b: dir_b.to_owned(),
    }
}

/// Total bytes processed across all passes; drives progress reporting.
pub fn merge_assess_work(input_sizes: &[u64], fan_in: usize) -> u64 {
    let total: u64 = input_sizes.iter().sum();
    total * plan_passes(input_sizes.len(), fan_in) as u64
}

struct HeapEntry<T: Record> {
    value: T,
    source: usize,
}
impl<T: Record> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp_full(&other.value)
            .then(self.source.cmp(&other.source))
    }
}
impl<T: Record> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: Record> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl<T: Record> Eq for HeapEntry<T> {}

struct MergeSource<T: Record> {
    iter: SpanIter<T>,
    head: Option<T>,
}

/// Merge one group of sorted spans (fan-in already bounded) into `sink`.
pub async fn merge_group<T: Record, S: MergeSink<T>>(
    inputs: Vec<ImmutableSpan<T>>,
    input_buffer_bytes: u64,
    sink: &mut S,
) -> Result<()> {
    let elem_size = std::mem::size_of::<T>() as u64;
    let per_input = (input_buffer_bytes / (2 * inputs.len().max(1) as u64) / elem_size).max(1);
    let mut sources = Vec::with_capacity(inputs.len());
    for span in inputs {
        let buffer = per_input.min(span.len().max(1)) as usize;
        let mut iter = span.iter(buffer);
        let head = iter.next().await?;
        sources.push(MergeSource { iter, head });
    }
    let mut active = sources.iter().filter(|s| s.head.is_some()).count();

    if active > LINEAR_SCAN_MAX {
        let mut heap: BinaryHeap<Reverse<HeapEntry<T>>> = sources
            .iter()
            .enumerate()
            .filter_map(|(source, s)| s.head.map(|value| Reverse(HeapEntry { value, source })))
            .collect();
        while active > LINEAR_SCAN_MAX {
            let Reverse(entry) = heap.pop().unwrap();
            sink.push(entry.value).await?;
            let source = &mut sources[entry.source];
            source.head = source.iter.next().await?;
            match source.head {
                Some(value) => heap.push(Reverse(HeapEntry {
                    value,
                    source: entry.source,
                })),
                None => active -= 1,
            }
        }
        trace!(active, "Switching to linear scan");
    }

    loop {
        let mut best: Option<(usize, T)> = None;
        for (idx, source) in sources.iter().enumerate() {
            if let Some(head) = source.head {
                let replace = match &best {
                    Some((_, value)) => head.cmp_full(value) == Ordering::Less,
                    None => true,
                };
                if replace {
                    best = Some((idx, head));
                }
            }
        }
        let Some((idx, value)) = best else { break };
        sink.push(value).await?;
        sources[idx].head = sources[idx].iter.next().await?;
    }
    Ok(())
}

/// Multi-pass merge of sorted spans into `sink`, coalescing equivalent
/// records at every pass boundary. Intermediate passes write sealed temp
/// files into the plan's alternating directories; a pass's read-side temps
/// are removed before `on_pass(pass_id)` fires, so the caller may drop its
/// own references to the original inputs on the first callback.
pub async fn merge_spans<T: Record, S: MergeSink<T>>(
    ctx: &Arc<Context>,
    settings: &MergeSettings,
    plan: &MergePlan,
    mut inputs: Vec<ImmutableSpan<T>>,
    sink: &mut S,
    mut on_pass: impl FnMut(usize) + Send,
) -> Result<()> {
    let elem_size = std::mem::size_of::<T>() as u64;
    let fan_in = settings.max_batch_size.max(2);
    let output_buffer = (settings.output_buffer_size / 2 / elem_size).max(1) as usize;
    let mut pass_id = 0;
    let mut prev_temps: Vec<PathBuf> = vec![];

    while inputs.len() > fan_in {
        let write_dir = plan.write_dir(pass_id);
        let mut next_inputs = Vec::new();
        let mut new_temps = Vec::new();
        let chunks = inputs.into_iter().chunks(fan_in);
        let groups: Vec<Vec<ImmutableSpan<T>>> =
            chunks.into_iter().map(|chunk| chunk.collect()).collect();
        debug!(pass_id, groups = groups.len(), ?write_dir, "Starting merge pass");
        for (group_id, group) in groups.into_iter().enumerate() {
            let tmp = write_dir.join(format!("merge_tmp_{}_{}", pass_id, group_id));
            let out = ctx.create_output(&tmp)?;
            out.raw().reserve(group.iter().map(|s| s.size_bytes()).sum())?;
            let mut pass_sink = CombiningSink::new(BackInserter::new(out, output_buffer));
            merge_group(group, settings.input_buffer_size, &mut pass_sink).await?;
            pass_sink.finish().await?;
            let sealed = pass_sink.into_inner().finish().await?.seal()?;
            next_inputs.push(ImmutableSpan::whole(sealed)?);
            new_temps.push(tmp);
        }
        for tmp in prev_temps.drain(..) {
            std::fs::remove_file(&tmp)?;
        }
        on_pass(pass_id);
        pass_id += 1;
        inputs = next_inputs;
        prev_temps = new_temps;
    }

    let mut combining = CombiningSink::new(&mut *sink);
    merge_group(inputs, settings.input_buffer_size, &mut combining).await?;
    combining.finish().await?;
    for tmp in prev_temps {
        std::fs::remove_file(&tmp)?;
    }
    on_pass(pass_id);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pass_counts() {
        assert_eq!(plan_passes(0, 2), 0);
        assert_eq!(plan_passes(1, 2), 1);
        assert_eq!(plan_passes(2, 2), 1);
        assert_eq!(plan_passes(3, 2), 2);
        assert_eq!(plan_passes(4, 2), 2);
        assert_eq!(plan_passes(5, 2), 3);
        assert_eq!(plan_passes(1024, 1024), 1);
        assert_eq!(plan_passes(1025, 1024), 2);
        assert_eq!(plan_passes(1024 * 1024 + 1, 1024), 3);
    }

    #[test]
    fn work_assessment() {
        assert_eq!(merge_assess_work(&[10, 20], 2), 30);
        assert_eq!(merge_assess_work(&[10, 20, 30], 2), 120);
        assert_eq!(merge_assess_work(&[], 2), 0);
    }

    #[test]
    fn plan_alternates() {
        let plan = make_merge_plan(5, 2, Path::new("/a"), Path::new("/b"));
        assert_eq!(plan.passes.len(), 3);
        assert_eq!(plan.write_dir(0), Path::new("/a"));
        assert_eq!(plan.write_dir(1), Path::new("/b"));
        assert_eq!(plan.write_dir(2), Path::new("/a"));
        assert_eq!(plan.passes[1].read_dir, PathBuf::from("/a"));
        assert_eq!(plan.passes[2].read_dir, PathBuf::from("/b"));
    }
}
