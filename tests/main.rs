
use std::collections::HashMap;

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sortfile_async::config::{EqualRangeSettings, MergeSettings};
use sortfile_async::equal_range::batched_equal_range;
use sortfile_async::error::Error;
use sortfile_async::index::{IndexBuilder, RangeIndex};
use sortfile_async::inserter::{BackInserter, FileVector};
use sortfile_async::merge::{make_merge_plan, merge_spans, VecSink};
use sortfile_async::span::ImmutableSpan;
use sortfile_async::{AsyncStorePipeline, Partition, Record};

use testdata::{context, context_with, linear_equal_range, tagged, write_span, Tagged};

#[tokio::test]
async fn store_pipeline_sort_and_write() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context_with(|s| s.index.granularity = 2);
    let partition = Partition::<u32>::open(&ctx, dir.path())?;
    let mut pipeline = AsyncStorePipeline::new(&ctx, 1, 2, 16);

    let mut buffer = pipeline.get_empty_buffer();
    buffer.extend_from_slice(&[5, 2, 9, 2, 5, 7]);
    partition.store_unordered(&pipeline, buffer).await;
    partition.collect_future_files().await?;
    pipeline.wait_for_completion();

    let span = ImmutableSpan::<u32>::whole(ctx.open_immutable(&dir.path().join("1"))?)?;
    assert_eq!(span.read_range(0..span.len()).await?, vec![2, 5, 7, 9]);

    let index: RangeIndex<u32> = RangeIndex::load(&dir.path().join("1_index"))?;
    let entries = index.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!((entries[0].low_elem, entries[0].high_elem), (0, 1));
    assert_eq!((entries[1].low_elem, entries[1].high_elem), (2, 3));

    let reopened = Partition::<u32>::open(&ctx, dir.path())?;
    assert_eq!(reopened.file_ids().await, vec![1]);
    assert_eq!(reopened.total_records().await, 4);
    Ok(())
}

#[tokio::test]
async fn batched_lookup_single_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let records = [1u32, 1, 1, 4, 4, 7, 9, 9, 9];
    let span = write_span(&ctx, dir.path(), "data", &records).await?;
    let keys = [1u32, 2, 4, 8, 9];
    let expected = vec![(0, 3), (3, 3), (3, 5), (6, 6), (6, 9)];

    let mut builder = IndexBuilder::<u32>::new(2);
    for r in &records {
        builder.push(r);
    }
    let index = builder.finish();

    for cross_updates in [false, true] {
        let settings = EqualRangeSettings {
            cross_updates,
            ..Default::default()
        };
        let got = batched_equal_range(&span, None, &keys, &settings).await?;
        assert_eq!(got, expected, "no index, cross_updates={}", cross_updates);
        let got = batched_equal_range(&span, Some(&index), &keys, &settings).await?;
        assert_eq!(got, expected, "index, cross_updates={}", cross_updates);
    }
    Ok(())
}

#[tokio::test]
async fn two_pass_merge() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let a = write_span(&ctx, dir.path(), "a", &[1u32, 3, 5]).await?;
    let b = write_span(&ctx, dir.path(), "b", &[2u32, 4, 6]).await?;
    let c = write_span(&ctx, dir.path(), "c", &[0u32, 7, 8]).await?;
    let d = write_span(&ctx, dir.path(), "d", &[3u32, 5, 9]).await?;
    let tmp_a = dir.path().join("tmp_a");
    let tmp_b = dir.path().join("tmp_b");
    std::fs::create_dir_all(&tmp_a)?;
    std::fs::create_dir_all(&tmp_b)?;

    let settings = MergeSettings {
        max_batch_size: 2,
        ..Default::default()
    };
    let plan = make_merge_plan(4, 2, &tmp_a, &tmp_b);
    assert_eq!(plan.passes.len(), 2);

    let mut sink = VecSink::default();
    let mut passes = vec![];
    merge_spans(&ctx, &settings, &plan, vec![a, b, c, d], &mut sink, |p| {
        passes.push(p)
    })
    .await?;
    assert_eq!(sink.0, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(passes, vec![0, 1]);
    // Intermediate temp files are gone.
    assert_eq!(std::fs::read_dir(&tmp_a)?.count(), 0);
    assert_eq!(std::fs::read_dir(&tmp_b)?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn cross_narrowing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let records: Vec<u32> = (1..=10).map(|i| i * 10).collect();
    let span = write_span(&ctx, dir.path(), "data", &records).await?;
    for cross_updates in [true, false] {
        let settings = EqualRangeSettings {
            // Six records per window.
            max_random_read_size: 24,
            cross_updates,
        };
        let got = batched_equal_range(&span, None, &[25u32, 55, 85], &settings).await?;
        assert_eq!(got, vec![(2, 2), (5, 5), (8, 8)]);
    }
    Ok(())
}

#[tokio::test]
async fn handle_pool_eviction_reopens_without_truncate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context_with(|s| s.max_concurrent_open_pooled_files = 2);

    let out = ctx.create_output(&dir.path().join("out"))?;
    let mut inserter = BackInserter::new(out, 4);
    for v in [1u32, 2, 3, 4] {
        inserter.push(v).await?;
    }
    inserter.flush().await?;

    // Touching other files evicts the output handle.
    let s1 = write_span(&ctx, dir.path(), "f1", &[10u32, 11]).await?;
    let s2 = write_span(&ctx, dir.path(), "f2", &[20u32, 21]).await?;
    assert_eq!(s1.read_range(0..2).await?, vec![10, 11]);
    assert_eq!(s2.read_range(0..2).await?, vec![20, 21]);
    assert!(ctx.handle_pool().cached() <= 2);

    // The next append reopens the handle; a truncating reopen would lose the
    // first chunk.
    for v in [5u32, 6] {
        inserter.push(v).await?;
    }
    let span = ImmutableSpan::<u32>::whole(inserter.finish().await?.seal()?)?;
    assert_eq!(span.read_range(0..6).await?, vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[tokio::test]
async fn append_ordering_across_buffer_swaps() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let out = ctx.create_output(&dir.path().join("out"))?;
    let mut inserter = BackInserter::new(out, 4);
    for v in 1..=5u32 {
        inserter.push(v).await?;
    }
    inserter.flush().await?;
    let span = ImmutableSpan::<u32>::whole(inserter.finish().await?.seal()?)?;
    assert_eq!(span.read_range(0..5).await?, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[tokio::test]
async fn oversized_append_bypasses_buffer_in_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let out = ctx.create_output(&dir.path().join("out"))?;
    let mut inserter = BackInserter::new(out, 4);
    inserter.push(1u32).await?;
    inserter.append(&(2..=9u32).collect::<Vec<_>>()).await?;
    inserter.push(10).await?;
    let span = ImmutableSpan::<u32>::whole(inserter.finish().await?.seal()?)?;
    assert_eq!(
        span.read_range(0..10).await?,
        (1..=10u32).collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn dropped_inserter_flushes_best_effort() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let path = dir.path().join("out");
    {
        let mut inserter = BackInserter::new(ctx.create_output(&path)?, 16);
        for v in [1u32, 2, 3] {
            inserter.push(v).await?;
        }
    }
    let span = ImmutableSpan::<u32>::whole(ctx.open_immutable(&path)?)?;
    assert_eq!(span.read_range(0..3).await?, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn long_equal_run_geometric_expansion() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let mut records = vec![1u32];
    records.extend(std::iter::repeat(7u32).take(100));
    records.push(9);
    let span = write_span(&ctx, dir.path(), "data", &records).await?;
    let settings = EqualRangeSettings {
        // Window of four records, far smaller than the run.
        max_random_read_size: 16,
        cross_updates: true,
    };
    let keys = [7u32, 0, 8, 10, 1, 9];
    let got = batched_equal_range(&span, None, &keys, &settings).await?;
    assert_eq!(
        got,
        vec![(1, 101), (0, 0), (101, 101), (102, 102), (0, 1), (101, 102)]
    );
    Ok(())
}

#[tokio::test]
async fn empty_and_single_record_spans() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let empty = write_span::<u32>(&ctx, dir.path(), "empty", &[]).await?;
    let settings = EqualRangeSettings::default();
    let got = batched_equal_range(&empty, None, &[1u32, 2, 3], &settings).await?;
    assert_eq!(got, vec![(0, 0), (0, 0), (0, 0)]);

    let single = write_span(&ctx, dir.path(), "single", &[5u32]).await?;
    let got = batched_equal_range(&single, None, &[4u32, 5, 6], &settings).await?;
    assert_eq!(got, vec![(0, 0), (0, 1), (1, 1)]);
    Ok(())
}

#[tokio::test]
async fn equal_range_matches_linear_scan() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let mut rng = StdRng::seed_from_u64(7);
    for granularity in [1u64, 3, 1000] {
        for trial in 0..3 {
            let len = rng.gen_range(1..400);
            let mut records: Vec<u32> = (0..len).map(|_| rng.gen_range(0..60)).collect();
            records.sort_unstable();
            let name = format!("r{}_{}", granularity, trial);
            let span = write_span(&ctx, dir.path(), &name, &records).await?;
            let mut builder = IndexBuilder::<u32>::new(granularity);
            for r in &records {
                builder.push(r);
            }
            let index = builder.finish();
            let keys: Vec<u32> = (0..50).map(|_| rng.gen_range(0..70)).collect();
            let expected: Vec<(u64, u64)> = keys
                .iter()
                .map(|k| linear_equal_range(&records, k))
                .collect();
            for max_random_read_size in [8u64, 4096] {
                for cross_updates in [true, false] {
                    let settings = EqualRangeSettings {
                        max_random_read_size,
                        cross_updates,
                    };
                    let got = batched_equal_range(&span, None, &keys, &settings).await?;
                    assert_eq!(got, expected, "no index, S={}", max_random_read_size);
                    let got =
                        batched_equal_range(&span, Some(&index), &keys, &settings).await?;
                    assert_eq!(
                        got, expected,
                        "granularity={}, S={}, cross={}",
                        granularity, max_random_read_size, cross_updates
                    );
                }
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn partition_ingest_merge_query() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context_with(|s| {
        s.index.granularity = 4;
        s.merge.max_batch_size = 2;
    });
    let partition = Partition::<Tagged>::open(&ctx, dir.path())?;
    let mut pipeline = AsyncStorePipeline::new(&ctx, 2, 3, 64);

    let mut expected: HashMap<u32, u32> = HashMap::new();
    for batch_id in 0..5u32 {
        let mut buffer = pipeline.get_empty_buffer();
        for i in 0..40u32 {
            let key = (batch_id * 7 + i * 3) % 30;
            buffer.push(tagged(key, batch_id));
            *expected.entry(key).or_insert(0) += 1;
        }
        partition.store_unordered(&pipeline, buffer).await;
    }
    partition.collect_future_files().await?;
    pipeline.wait_for_completion();
    assert_eq!(partition.file_ids().await.len(), 5);
    let total_before = partition.total_records().await;

    // Budgeted merge: files are ~120 bytes each, so pairs fit in 250.
    partition.merge_all(&[], Some(250), |_| {}).await?;
    assert_eq!(partition.file_ids().await.len(), 3);
    assert!(partition.total_records().await <= total_before);

    partition.merge_all(&[], None, |_| {}).await?;
    let ids = partition.file_ids().await;
    assert_eq!(ids.len(), 1);
    // The merged file and its sidecar are discoverable and loadable.
    let reopened = Partition::<Tagged>::open(&ctx, dir.path())?;
    assert_eq!(reopened.file_ids().await, ids);

    let keys: Vec<u32> = (0..30).collect();
    let mut got: HashMap<u32, u32> = HashMap::new();
    partition
        .query_batch(&keys, |records, key| {
            *got.entry(*key).or_insert(0) += records.iter().map(|r| r.count).sum::<u32>();
        })
        .await?;
    assert_eq!(got, expected);

    partition.clear().await?;
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn merge_is_stable_and_combines_left_to_right() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let a = write_span(&ctx, dir.path(), "a", &[tagged(5, 0), tagged(8, 0)]).await?;
    let b = write_span(&ctx, dir.path(), "b", &[tagged(5, 1)]).await?;
    let c = write_span(&ctx, dir.path(), "c", &[tagged(5, 2), tagged(9, 2)]).await?;

    let plan = make_merge_plan(3, 64, dir.path(), dir.path());
    let mut sink = VecSink::default();
    merge_spans(
        &ctx,
        &MergeSettings::default(),
        &plan,
        vec![a, b, c],
        &mut sink,
        |_| {},
    )
    .await?;
    assert_eq!(
        sink.0,
        vec![
            Tagged {
                key: 5,
                tag: 0,
                count: 3
            },
            Tagged {
                key: 8,
                tag: 0,
                count: 1
            },
            Tagged {
                key: 9,
                tag: 2,
                count: 1
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn merge_is_associative() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let settings = MergeSettings::default();
    let a = [tagged(1, 0), tagged(3, 0), tagged(5, 0)];
    let b = [tagged(2, 1), tagged(3, 1)];
    let c = [tagged(3, 2), tagged(6, 2)];

    let merge_to_vec = |spans: Vec<ImmutableSpan<Tagged>>| {
        let ctx = ctx.clone();
        let settings = settings.clone();
        let dir = dir.path().to_owned();
        async move {
            let plan = make_merge_plan(spans.len(), 64, &dir, &dir);
            let mut sink = VecSink::default();
            merge_spans(&ctx, &settings, &plan, spans, &mut sink, |_| {}).await?;
            anyhow::Ok(sink.0)
        }
    };

    let sa = write_span(&ctx, dir.path(), "a", &a).await?;
    let sb = write_span(&ctx, dir.path(), "b", &b).await?;
    let sc = write_span(&ctx, dir.path(), "c", &c).await?;
    let ab = merge_to_vec(vec![sa.clone(), sb.clone()]).await?;
    let sab = write_span(&ctx, dir.path(), "ab", &ab).await?;
    let left = merge_to_vec(vec![sab, sc.clone()]).await?;
    let flat = merge_to_vec(vec![sa, sb, sc]).await?;
    assert_eq!(left, flat);
    Ok(())
}

#[tokio::test]
async fn file_vector() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let path = dir.path().join("vec");
    let mut vector = FileVector::<u32>::new(ctx.open_read_append(&path)?, 4)?;
    for v in 0..10u32 {
        vector.push(v).await?;
    }
    assert_eq!(vector.len(), 10);
    assert_eq!(vector.read(2..5).await?, vec![2, 3, 4]);
    assert_eq!(vector.get(9).await?, 9);
    vector.append(&[100, 101]).await?;
    assert_eq!(vector.read(10..12).await?, vec![100, 101]);
    vector.flush().await?;
    drop(vector);

    // Contents survive reopening.
    let mut vector = FileVector::<u32>::new(ctx.open_read_append(&path)?, 4)?;
    assert_eq!(vector.len(), 12);
    assert_eq!(vector.get(11).await?, 101);
    vector.clear().await?;
    assert!(vector.is_empty());
    vector.push(42).await?;
    assert_eq!(vector.get(0).await?, 42);
    Ok(())
}

#[tokio::test]
async fn direct_handle_cap() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context_with(|s| s.max_concurrent_open_unpooled_files = 1);
    let first = ctx.create_output_direct(&dir.path().join("d1"))?;
    match ctx.create_output_direct(&dir.path().join("d2")) {
        Err(Error::DirectLimit { limit }) => assert_eq!(limit, 1),
        other => panic!("expected DirectLimit, got {:?}", other.map(|_| ())),
    }
    drop(first);
    ctx.create_output_direct(&dir.path().join("d2"))?;
    Ok(())
}

#[tokio::test]
async fn span_stream_adapter() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let records: Vec<u32> = (0..23).collect();
    let span = write_span(&ctx, dir.path(), "data", &records).await?;
    let stream = span.stream(4);
    futures::pin_mut!(stream);
    let mut got = vec![];
    while let Some(record) = stream.next().await {
        got.push(record?);
    }
    assert_eq!(got, records);
    Ok(())
}

#[tokio::test]
async fn pipeline_round_trip_sorts_and_dedups() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context();
    let mut pipeline = AsyncStorePipeline::<Tagged>::new(&ctx, 2, 2, 1024);
    let mut rng = StdRng::seed_from_u64(42);
    let records: Vec<Tagged> = (0..500u32)
        .map(|i| tagged(rng.gen_range(0..100), i))
        .collect();

    let mut expected: Vec<Tagged> = vec![];
    let mut sorted = records.clone();
    sorted.sort_by(|x, y| x.cmp_full(y));
    for r in sorted {
        match expected.last_mut() {
            Some(last) if last.eq_full(&r) => *last = last.combine(r),
            _ => expected.push(r),
        }
    }

    let path = dir.path().join("0");
    let mut buffer = pipeline.get_empty_buffer();
    buffer.extend_from_slice(&records);
    let index = pipeline.store(path.clone(), buffer).wait().await?;
    pipeline.wait_for_completion();

    let span = ImmutableSpan::<Tagged>::whole(ctx.open_immutable(&path)?)?;
    assert_eq!(span.read_range(0..span.len()).await?, expected);
    assert_eq!(index.total_records(), expected.len() as u64);
    Ok(())
}
