//! Record and key capabilities.
//!
//! The engine knows nothing about a record beyond its byte size, a total
//! order, an equivalence used to coalesce duplicates, a combining function
//! and an extractable key used for indexing.
use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;

trait_set::trait_set! {
    /// Bounds required of anything crossing an I/O worker thread.
    pub trait SendStatic = Send + Sync + 'static;
}

/// Key projected out of a record for indexing and batched search.
///
/// Keys are persisted inside index sidecars with a fixed-size encoding, so
/// implementors must serialize to a constant number of bytes.
pub trait Key: Copy + Ord + Serialize + DeserializeOwned + SendStatic {
    /// Linear distance between two keys, when key arithmetic is meaningful.
    ///
    /// Drives interpolation probes in the batched search; `None` falls back
    /// to binary midpoints.
    fn distance(lo: &Self, hi: &Self) -> Option<u64> {
        let _ = (lo, hi);
        None
    }
}

/// Fixed-size, trivially byte-copyable record stored by the engine.
pub trait Record: bytemuck::Pod + SendStatic {
    type Key: Key;

    /// Key used for indexing; a weakening of the total order. Records equal
    /// under the key form contiguous runs when sorted by [`Record::cmp_full`].
    fn key(&self) -> Self::Key;

    /// Total order used for sorting and merging.
    fn cmp_full(&self, other: &Self) -> Ordering;

    /// Equivalence used to coalesce duplicates. Records equal here must
    /// compare `Equal` under [`Record::cmp_full`].
    fn eq_full(&self, other: &Self) -> bool {
        self.cmp_full(other) == Ordering::Equal
    }

    /// Merge two equivalent records into one; `self` arrived first.
    fn combine(self, other: Self) -> Self;

    fn cmp_key(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

macro_rules! identity_record {
    ($t:ty) => {
        impl Key for $t {
            fn distance(lo: &Self, hi: &Self) -> Option<u64> {
                Some((*hi as u64).saturating_sub(*lo as u64))
            }
        }
        impl Record for $t {
            type Key = $t;
            fn key(&self) -> $t {
                *self
            }
            fn cmp_full(&self, other: &Self) -> Ordering {
                self.cmp(other)
            }
            fn combine(self, _other: Self) -> Self {
                self
            }
        }
    };
}
identity_record!(u32);
identity_record!(u64);

/// Sort a buffer by the full order, then coalesce equivalent records.
pub fn sort_and_coalesce<T: Record>(buffer: &mut Vec<T>) {
    buffer.sort_by(|a, b| a.cmp_full(b));
    coalesce_sorted(buffer);
}

/// Coalesce equivalent adjacent records in place, combining left-to-right.
pub fn coalesce_sorted<T: Record>(buffer: &mut Vec<T>) {
    if buffer.is_empty() {
        return;
    }
    let mut write = 0;
    for read in 1..buffer.len() {
        let cur = buffer[read];
        if buffer[write].eq_full(&cur) {
            buffer[write] = buffer[write].combine(cur);
        } else {
            write += 1;
            buffer[write] = cur;
        }
    }
    buffer.truncate(write + 1);
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn coalesce() {
        let mut v = vec![5u32, 2, 9, 2, 5, 7];
        sort_and_coalesce(&mut v);
        assert_eq!(v, vec![2, 5, 7, 9]);

        let mut v: Vec<u32> = vec![];
        sort_and_coalesce(&mut v);
        assert!(v.is_empty());

        let mut v = vec![3u32; 10];
        sort_and_coalesce(&mut v);
        assert_eq!(v, vec![3]);
    }
    #[test]
    fn distances() {
        assert_eq!(<u32 as Key>::distance(&3, &10), Some(7));
        assert_eq!(<u64 as Key>::distance(&0, &u64::MAX), Some(u64::MAX));
    }
}
