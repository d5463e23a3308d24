//! Sparse range index over sorted files.
//!
//! The sidecar holds a packed array of [`RangeEntry`]: `(low_elem: u64,
//! high_elem: u64, low_key: K, high_key: K)`, fixint-encoded, so `K` must
//! serialize to a fixed size.
use std::io::Write;
use std::path::Path;

use bincode::Options as _;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::error::{Error, Result};
use crate::record::{Key, Record};

/// Path of the index sidecar belonging to a data file.
pub fn sidecar_path(data: &Path) -> std::path::PathBuf {
    let mut name = data.as_os_str().to_owned();
    name.push("_index");
    std::path::PathBuf::from(name)
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Contiguous block `[low_elem, high_elem]` of a sorted file together with
/// the keys at its ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RangeEntry<K> {
    pub low_elem: u64,
    pub high_elem: u64,
    pub low_key: K,
    pub high_key: K,
}

/// Result of an index lookup: either the element range covered by the
/// candidate entries, or the position where the key would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup<K> {
    Empty {
        at: u64,
    },
    Candidates {
        lo: u64,
        hi: u64,
        lo_key: K,
        hi_key: K,
    },
}

/// Ordered sequence of non-overlapping range entries covering a sorted file.
#[derive(Debug, Clone)]
pub struct RangeIndex<K: Key> {
    entries: Vec<RangeEntry<K>>,
}

impl<K: Key> RangeIndex<K> {
    pub fn new(entries: Vec<RangeEntry<K>>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].high_elem < w[1].low_elem
            || (w[0].high_elem + 1 == w[1].low_elem && w[0].high_key <= w[1].low_key)));
        Self { entries }
    }
    pub fn entries(&self) -> &[RangeEntry<K>] {
        &self.entries
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Number of records covered.
    pub fn total_records(&self) -> u64 {
        self.entries.last().map(|e| e.high_elem + 1).unwrap_or(0)
    }

    /// Element range whose entries may contain `key`, narrowed by the
    /// bracketing keys of the first and last overlapping entries.
    pub fn equal_range(&self, key: &K) -> IndexLookup<K> {
        let first = self.entries.partition_point(|e| e.high_key < *key);
        if first == self.entries.len() {
            return IndexLookup::Empty {
                at: self.total_records(),
            };
        }
        if *key < self.entries[first].low_key {
            return IndexLookup::Empty {
                at: self.entries[first].low_elem,
            };
        }
        let last = self.entries.partition_point(|e| e.low_key <= *key) - 1;
        IndexLookup::Candidates {
            lo: self.entries[first].low_elem,
            hi: self.entries[last].high_elem + 1,
            lo_key: self.entries[first].low_key,
            hi_key: self.entries[last].high_key,
        }
    }

    /// Write the sidecar file.
    pub fn write(&self, path: &Path, buffer_size: u64) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::with_capacity(buffer_size.max(4096) as usize, file);
        for entry in &self.entries {
            bincode_options()
                .serialize_into(&mut writer, entry)
                .map_err(|_| Error::InvalidIndex {
                    path: path.to_owned(),
                })?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_data()?;
        debug!(?path, entries = self.entries.len(), "Wrote index sidecar");
        Ok(())
    }

    /// Load a sidecar file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Self { entries: vec![] });
        }
        let invalid = || Error::InvalidIndex {
            path: path.to_owned(),
        };
        let first: RangeEntry<K> = bincode_options()
            .deserialize(&bytes)
            .map_err(|_| invalid())?;
        let entry_size = bincode_options()
            .serialized_size(&first)
            .map_err(|_| invalid())? as usize;
        if entry_size == 0 || bytes.len() % entry_size != 0 {
            return Err(invalid());
        }
        let entries = bytes
            .chunks_exact(entry_size)
            .map(|chunk| {
                bincode_options()
                    .with_limit(entry_size as u64)
                    .deserialize(chunk)
                    .map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }
}

impl<K: Key> std::fmt::Display for RangeIndex<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Range index with {} entries over {} records",
            self.entries.len(),
            self.total_records()
        )
    }
}

struct Run<K> {
    start_idx: u64,
    start_key: K,
    prev_key: K,
}

/// Streaming builder: consumes records in sorted order and emits a range
/// entry roughly every `granularity` records. A run of equal keys is never
/// split, even past the granularity.
pub struct IndexBuilder<T: Record> {
    granularity: u64,
    entries: Vec<RangeEntry<T::Key>>,
    run: Option<Run<T::Key>>,
    next_idx: u64,
}

impl<T: Record> IndexBuilder<T> {
    pub fn new(granularity: u64) -> Self {
        Self {
            granularity: granularity.max(1),
            entries: vec![],
            run: None,
            next_idx: 0,
        }
    }

    pub fn push(&mut self, record: &T) {
        let key = record.key();
        let idx = self.next_idx;
        self.next_idx += 1;
        match &mut self.run {
            None => {
                self.run = Some(Run {
                    start_idx: idx,
                    start_key: key,
                    prev_key: key,
                });
            }
            Some(run) => {
                if run.prev_key < key {
                    if idx - run.start_idx >= self.granularity {
                        self.entries.push(RangeEntry {
                            low_elem: run.start_idx,
                            high_elem: idx - 1,
                            low_key: run.start_key,
                            high_key: run.prev_key,
                        });
                        *run = Run {
                            start_idx: idx,
                            start_key: key,
                            prev_key: key,
                        };
                    } else {
                        run.prev_key = key;
                    }
                }
            }
        }
    }

    /// Feed raw appended bytes (the write-observer path during merges).
    pub fn observe_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks_exact(std::mem::size_of::<T>()) {
            let record: T = bytemuck::pod_read_unaligned(chunk);
            self.push(&record);
        }
    }

    pub fn finish(mut self) -> RangeIndex<T::Key> {
        if let Some(run) = self.run.take() {
            self.entries.push(RangeEntry {
                low_elem: run.start_idx,
                high_elem: self.next_idx - 1,
                low_key: run.start_key,
                high_key: run.prev_key,
            });
        }
        RangeIndex::new(self.entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn build(records: &[u32], granularity: u64) -> RangeIndex<u32> {
        let mut builder = IndexBuilder::<u32>::new(granularity);
        for r in records {
            builder.push(r);
        }
        builder.finish()
    }

    #[test]
    fn two_entries() {
        let index = build(&[2, 5, 7, 9], 2);
        let entries = index.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            (entries[0].low_elem, entries[0].high_elem, entries[0].low_key, entries[0].high_key),
            (0, 1, 2, 5)
        );
        assert_eq!(
            (entries[1].low_elem, entries[1].high_elem, entries[1].low_key, entries[1].high_key),
            (2, 3, 7, 9)
        );
    }

    #[test]
    fn granularity_one_and_large() {
        let records = [1u32, 2, 3, 4, 5];
        let index = build(&records, 1);
        assert_eq!(index.entries().len(), records.len());
        let index = build(&records, 1000);
        assert_eq!(index.entries().len(), 1);
        assert_eq!(index.total_records(), 5);
    }

    #[test]
    fn equal_run_never_split() {
        let index = build(&[1, 3, 3, 3, 3, 3, 3, 9], 2);
        for w in index.entries().windows(2) {
            assert!(w[0].high_key < w[1].low_key);
        }
        // The run of 3s stays within one entry.
        let covering: Vec<_> = index
            .entries()
            .iter()
            .filter(|e| e.low_key <= 3 && 3 <= e.high_key)
            .collect();
        assert_eq!(covering.len(), 1);
    }

    #[test]
    fn lookup() {
        let index = build(&[1, 1, 1, 4, 4, 7, 9, 9, 9], 2);
        match index.equal_range(&4) {
            IndexLookup::Candidates { lo, hi, .. } => {
                assert!(lo <= 3 && 5 <= hi);
            }
            empty => panic!("unexpected {:?}", empty),
        }
        assert_eq!(index.equal_range(&0), IndexLookup::Empty { at: 0 });
        assert_eq!(index.equal_range(&100), IndexLookup::Empty { at: 9 });
    }

    #[test]
    fn sidecar_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0_index");
        let index = build(&[1, 1, 1, 4, 4, 7, 9, 9, 9], 3);
        index.write(&path, 1 << 16)?;
        let loaded: RangeIndex<u32> = RangeIndex::load(&path)?;
        assert_eq!(loaded.entries().len(), index.entries().len());
        assert_eq!(loaded.total_records(), 9);
        Ok(())
    }
}
