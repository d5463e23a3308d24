//! Batched equality-range search.
//!
//! For every query key, finds the element range `[lo, hi)` of records whose
//! key equals it, against a span sorted by the full record order. Queries
//! are processed in input order; every window read for one query can narrow
//! or outright commit later queries in the same batch (cross-updates).
//!
//! A query carries a bracket `[lo, hi)` with the keys of its boundary
//! records. The bracket is strict: every element before `lo` has a key below
//! the query key and every element at or past `hi` a key above it, so a
//! bound found at a window edge that coincides with the bracket is exact.
use tracing::*;

use crate::config::EqualRangeSettings;
use crate::error::Result;
use crate::index::{IndexLookup, RangeIndex};
use crate::record::{Key, Record};
use crate::span::{ImmutableSpan, RandomReader};

#[derive(Clone, Copy)]
struct Query<K> {
    key: K,
    lo: u64,
    hi: u64,
    lo_key: K,
    hi_key: K,
    result: Option<(u64, u64)>,
}

fn probe_midpoint<K: Key>(lo: u64, hi: u64, lo_key: &K, hi_key: &K, key: &K) -> u64 {
    if let (Some(total), Some(part)) = (K::distance(lo_key, hi_key), K::distance(lo_key, key)) {
        if total > 0 {
            return lo + (part as u128 * (hi - lo - 1) as u128 / total as u128) as u64;
        }
    }
    lo + (hi - lo) / 2
}

/// Batched lookup over `span`, optionally seeded by its [`RangeIndex`].
/// Returns one span-relative `[lo, hi)` per key, in input order; a key with
/// no matching records yields an empty range at its insertion position.
pub async fn batched_equal_range<T: Record>(
    span: &ImmutableSpan<T>,
    index: Option<&RangeIndex<T::Key>>,
    keys: &[T::Key],
    settings: &EqualRangeSettings,
) -> Result<Vec<(u64, u64)>> {
    if span.is_empty() || keys.is_empty() {
        return Ok(keys.iter().map(|_| (0, 0)).collect());
    }
    let elem_size = std::mem::size_of::<T>();
    let window_elems = ((settings.max_random_read_size as usize).max(1) / elem_size).max(2) as u64;

    let mut reader = span.random_reader();
    // Without an index, all queries share the whole-span bracket.
    let whole = match index {
        Some(_) => None,
        None => Some((
            reader.get(0).await?.key(),
            reader.get(span.len() - 1).await?.key(),
        )),
    };
    let mut queries: Vec<Query<T::Key>> = keys
        .iter()
        .map(|&key| match index {
            Some(index) => match index.equal_range(&key) {
                IndexLookup::Empty { at } => Query {
                    key,
                    lo: at,
                    hi: at,
                    lo_key: key,
                    hi_key: key,
                    result: Some((at, at)),
                },
                IndexLookup::Candidates {
                    lo,
                    hi,
                    lo_key,
                    hi_key,
                } => Query {
                    key,
                    lo,
                    hi,
                    lo_key,
                    hi_key,
                    result: None,
                },
            },
            None => {
                let (lo_key, hi_key) = whole.unwrap();
                Query {
                    key,
                    lo: 0,
                    hi: span.len(),
                    lo_key,
                    hi_key,
                    result: None,
                }
            }
        })
        .collect();

    let mut scratch: Vec<T> = Vec::new();
    for i in 0..queries.len() {
        loop {
            let Query {
                key,
                lo,
                hi,
                lo_key,
                hi_key,
                result,
            } = queries[i];
            if result.is_some() {
                break;
            }
            if lo >= hi || key < lo_key {
                queries[i].result = Some((lo, lo));
                break;
            }
            if hi_key < key {
                queries[i].result = Some((hi, hi));
                break;
            }
            if !(lo_key < hi_key) {
                // The whole bracket is one run of the key.
                queries[i].result = Some((lo, hi));
                break;
            }
            if hi - lo <= window_elems {
                let buf = span.read_exact(lo..hi, std::mem::take(&mut scratch)).await?;
                let lower = lo + buf.partition_point(|r| r.key() < key) as u64;
                let upper = lo + buf.partition_point(|r| r.key() <= key) as u64;
                trace!(query = i, lo, hi, lower, upper, "Committing from full load");
                queries[i].result = Some((lower, upper));
                if settings.cross_updates {
                    cross_narrow(&mut queries[i + 1..], &buf, lo, hi);
                }
                scratch = buf;
                break;
            }

            let mid = probe_midpoint(lo, hi, &lo_key, &hi_key, &key);
            let base = mid
                .saturating_sub(window_elems / 2)
                .min(hi - window_elems)
                .max(lo);
            // One sentinel element on each side, within the bracket.
            let wa = base.saturating_sub(1).max(lo);
            let wb = (base + window_elems + 1).min(hi);
            let buf = span.read_exact(wa..wb, std::mem::take(&mut scratch)).await?;
            let lower = wa + buf.partition_point(|r| r.key() < key) as u64;
            let upper = wa + buf.partition_point(|r| r.key() <= key) as u64;
            let lower_exact = (lower > wa || wa == lo) && (lower < wb || wb == hi);
            let upper_exact = (upper > wa || wa == lo) && (upper < wb || wb == hi);
            trace!(query = i, lo, hi, wa, wb, lower_exact, upper_exact, "Probe window");
            match (lower_exact, upper_exact) {
                (true, true) => queries[i].result = Some((lower, upper)),
                (true, false) => {
                    if lower > lo {
                        queries[i].lo = lower;
                        queries[i].lo_key = key;
                    } else {
                        // Lower bound nailed at `lo`; the equal run escapes
                        // the window above.
                        let upper = expand_upper(&mut reader, wb - 1, hi, &key).await?;
                        queries[i].result = Some((lo, upper));
                    }
                }
                (false, true) => {
                    if upper < hi {
                        queries[i].hi = upper;
                        queries[i].hi_key = key;
                    } else {
                        let lower = expand_lower(&mut reader, lo, wa, &key).await?;
                        queries[i].result = Some((lower, hi));
                    }
                }
                (false, false) => {
                    if key < buf[0].key() {
                        queries[i].hi = wa + 1;
                        queries[i].hi_key = buf[0].key();
                    } else if buf[buf.len() - 1].key() < key {
                        queries[i].lo = wb - 1;
                        queries[i].lo_key = buf[buf.len() - 1].key();
                    } else {
                        // The window is interior to a run of the key.
                        let lower = expand_lower(&mut reader, lo, wa, &key).await?;
                        let upper = expand_upper(&mut reader, wb - 1, hi, &key).await?;
                        queries[i].result = Some((lower, upper));
                    }
                }
            }
            if settings.cross_updates {
                cross_narrow(&mut queries[i + 1..], &buf, wa, wb);
            }
            scratch = buf;
        }
    }
    Ok(queries.into_iter().map(|q| q.result.unwrap()).collect())
}

/// Narrow (or commit) pending queries with a window `[wa, wb)` read for an
/// earlier one. Sortedness makes any bound strictly inside the window
/// globally exact; window edges are exact only where they meet the query's
/// own bracket.
fn cross_narrow<T: Record>(queries: &mut [Query<T::Key>], buf: &[T], wa: u64, wb: u64) {
    for q in queries.iter_mut() {
        if q.result.is_some() || wb <= q.lo || wa >= q.hi {
            continue;
        }
        let key = q.key;
        let lower = wa + buf.partition_point(|r| r.key() < key) as u64;
        let upper = wa + buf.partition_point(|r| r.key() <= key) as u64;
        let lower_exact = (lower > wa || wa <= q.lo) && (lower < wb || wb >= q.hi);
        let upper_exact = (upper > wa || wa <= q.lo) && (upper < wb || wb >= q.hi);
        if lower_exact && upper_exact {
            q.result = Some((lower.clamp(q.lo, q.hi), upper.clamp(q.lo, q.hi)));
            continue;
        }
        if lower_exact {
            let new_lo = lower.clamp(q.lo, q.hi);
            if new_lo > q.lo {
                q.lo = new_lo;
                q.lo_key = key;
            }
        } else if lower == wb && wb - 1 > q.lo {
            // Whole window below the key.
            q.lo = wb - 1;
            q.lo_key = buf[buf.len() - 1].key();
        }
        if upper_exact {
            let new_hi = upper.clamp(q.lo, q.hi);
            if new_hi < q.hi {
                q.hi = new_hi;
                q.hi_key = key;
            }
        } else if upper == wa && wa + 1 < q.hi {
            // Whole window above the key.
            q.hi = wa + 1;
            q.hi_key = buf[0].key();
        }
    }
}

/// Find the first element of the run at `base` (`span[base]` equals `key`):
/// geometric steps down until a strictly-less record, then a binary search.
/// Everything before `floor` is known to be below the key.
async fn expand_lower<T: Record>(
    reader: &mut RandomReader<T>,
    floor: u64,
    base: u64,
    key: &T::Key,
) -> Result<u64> {
    let mut prev_ge = base;
    let mut step = 1u64;
    let (mut a, mut b);
    loop {
        if prev_ge == floor {
            return Ok(floor);
        }
        let probe = base.saturating_sub(step).max(floor);
        let record = reader.get(probe).await?;
        if record.key() < *key {
            a = probe + 1;
            b = prev_ge;
            break;
        }
        prev_ge = probe;
        step *= 2;
    }
    while a < b {
        let mid = a + (b - a) / 2;
        if reader.get(mid).await?.key() < *key {
            a = mid + 1;
        } else {
            b = mid;
        }
    }
    Ok(b)
}

/// Find one past the last element of the run at `base`; everything at or
/// past `ceil` is known to be above the key.
async fn expand_upper<T: Record>(
    reader: &mut RandomReader<T>,
    base: u64,
    ceil: u64,
    key: &T::Key,
) -> Result<u64> {
    let mut prev_le = base;
    let mut step = 1u64;
    let (mut a, mut b);
    loop {
        if prev_le + 1 >= ceil {
            return Ok(ceil);
        }
        let probe = (base + step).min(ceil - 1);
        let record = reader.get(probe).await?;
        if *key < record.key() {
            a = prev_le + 1;
            b = probe;
            break;
        }
        prev_le = probe;
        step *= 2;
    }
    while a < b {
        let mid = a + (b - a) / 2;
        if *key < reader.get(mid).await?.key() {
            b = mid;
        } else {
            a = mid + 1;
        }
    }
    Ok(a)
}
