//! Engine configuration.
//!
//! Every knob has a default; [`Settings`] can be deserialized from any
//! serde format by the embedding application (loading files is not the
//! engine's concern).
use std::path::PathBuf;

use serde::Deserialize;

/// Engine settings, consumed once by [`crate::Context::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cap on concurrently open pooled file handles.
    pub max_concurrent_open_pooled_files: usize,
    /// Advisory cap on simultaneously open unpooled (direct) handles.
    pub max_concurrent_open_unpooled_files: usize,
    /// Thread pool handling files not matched by any routing entry.
    pub default_thread_pool: ThreadPoolSettings,
    /// Device-group routing: the deepest matching path prefix wins.
    pub thread_pools: Vec<RoutedPoolSettings>,
    pub merge: MergeSettings,
    pub equal_range: EqualRangeSettings,
    pub index: IndexSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadPoolSettings {
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutedPoolSettings {
    pub threads: usize,
    /// Path prefixes served by this pool.
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Bytes buffered ahead of the output file.
    pub output_buffer_size: u64,
    /// Bytes shared by all input iterators of one pass.
    pub input_buffer_size: u64,
    /// Fan-in: maximum number of inputs merged in one pass.
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EqualRangeSettings {
    /// Bytes fetched by one sequential probe window.
    pub max_random_read_size: u64,
    /// Narrow later queries of a batch with windows read for earlier ones.
    pub cross_updates: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Bytes buffered while building an index from a stream of records.
    pub builder_buffer_size: u64,
    /// Target number of records per sparse range entry.
    pub granularity: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_open_pooled_files: 256,
            max_concurrent_open_unpooled_files: 64,
            default_thread_pool: Default::default(),
            thread_pools: vec![],
            merge: Default::default(),
            equal_range: Default::default(),
            index: Default::default(),
        }
    }
}
impl Default for ThreadPoolSettings {
    fn default() -> Self {
        Self { threads: 4 }
    }
}
impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            output_buffer_size: 8 << 20,
            input_buffer_size: 64 << 20,
            max_batch_size: 64,
        }
    }
}
impl Default for EqualRangeSettings {
    fn default() -> Self {
        Self {
            max_random_read_size: 32 << 10,
            cross_updates: true,
        }
    }
}
impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            builder_buffer_size: 4 << 20,
            granularity: 1024,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn defaults_from_empty_document() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.merge.max_batch_size, 64);
        assert_eq!(s.equal_range.max_random_read_size, 32 << 10);
        assert!(s.equal_range.cross_updates);
        assert!(s.thread_pools.is_empty());
    }
    #[test]
    fn routed_pools() {
        let s: Settings = serde_json::from_str(
            r#"{"thread_pools": [{"threads": 2, "paths": ["/mnt/ssd"]}]}"#,
        )
        .unwrap();
        assert_eq!(s.thread_pools.len(), 1);
        assert_eq!(s.thread_pools[0].paths[0], PathBuf::from("/mnt/ssd"));
    }
}
