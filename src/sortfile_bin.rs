use std::cmp::Ordering;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use rand::Rng;
use tracing::*;

use sortfile_async::utils::display_bytes;
use sortfile_async::{AsyncStorePipeline, Context, Partition, Record, Settings};

#[derive(Parser)]
#[clap(name = "sortfile")]
struct Flags {
    /// Partition directory
    dir: PathBuf,
    /// Number of records to ingest
    #[clap(long, default_value_t = 1_000_000)]
    records: u64,
    /// Records per store buffer
    #[clap(long, default_value_t = 100_000)]
    batch_size: usize,
    /// Number of batched query keys
    #[clap(long, default_value_t = 1000)]
    queries: usize,
    /// Sort threads in the store pipeline
    #[clap(long, default_value_t = 2)]
    sort_threads: usize,
    /// Sparse index granularity (records per range entry)
    #[clap(long, default_value_t = 1024)]
    index_granularity: u64,
    /// Merge fan-in
    #[clap(long, default_value_t = 64)]
    merge_fan_in: usize,
    #[clap(long, short)]
    debug: bool,
}

/// Reference to a game position: hash key plus an occurrence count; two
/// references to the same (position, game) coalesce by summing counts.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct PositionRef {
    position: u64,
    game: u32,
    count: u32,
}

impl Record for PositionRef {
    type Key = u64;
    fn key(&self) -> u64 {
        self.position
    }
    fn cmp_full(&self, other: &Self) -> Ordering {
        (self.position, self.game).cmp(&(other.position, other.game))
    }
    fn eq_full(&self, other: &Self) -> bool {
        self.position == other.position && self.game == other.game
    }
    fn combine(self, other: Self) -> Self {
        Self {
            count: self.count + other.count,
            ..self
        }
    }
}

async fn main_impl(flags: Flags) -> anyhow::Result<()> {
    sortfile_async::utils::setup_logger(flags.debug)?;

    let mut settings = Settings::default();
    settings.index.granularity = flags.index_granularity;
    settings.merge.max_batch_size = flags.merge_fan_in;
    let ctx = Context::new(settings);
    let partition = Partition::<PositionRef>::open(&ctx, &flags.dir)?;

    let mut pipeline = AsyncStorePipeline::new(&ctx, flags.sort_threads, 4, flags.batch_size);
    let mut rng = rand::thread_rng();
    let key_space = (flags.records / 4).max(1);
    let start = std::time::Instant::now();
    let mut remaining = flags.records;
    while remaining > 0 {
        let mut buffer = pipeline.get_empty_buffer();
        for _ in 0..flags.batch_size.min(remaining as usize) {
            buffer.push(PositionRef {
                position: rng.gen_range(0..key_space),
                game: rng.gen_range(0..1000),
                count: 1,
            });
        }
        remaining -= buffer.len() as u64;
        partition.store_unordered(&pipeline, buffer).await;
    }
    partition.collect_future_files().await?;
    pipeline.wait_for_completion();
    let files = partition.file_ids().await.len();
    info!(
        records = flags.records,
        files,
        "Ingested in {:.2?}",
        start.elapsed()
    );

    let start = std::time::Instant::now();
    partition
        .merge_all(&[], None, |pass| debug!(pass, "Merge pass done"))
        .await?;
    let files = partition.file_ids().await.len();
    let records = partition.total_records().await;
    info!(
        files,
        records,
        bytes = %display_bytes(records * std::mem::size_of::<PositionRef>() as u64),
        "Merged in {:.2?}",
        start.elapsed()
    );

    let keys: Vec<u64> = (0..flags.queries)
        .map(|_| rng.gen_range(0..key_space))
        .collect();
    let start = std::time::Instant::now();
    let mut hits = 0u64;
    let mut occurrences = 0u64;
    partition
        .query_batch(&keys, |records, _key| {
            hits += 1;
            occurrences += records.iter().map(|r| r.count as u64).sum::<u64>();
        })
        .await?;
    info!(
        queries = keys.len(),
        hits,
        occurrences,
        "Queried in {:.2?}",
        start.elapsed()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let flags = Flags::parse();
    if let Err(e) = main_impl(flags).await {
        error!("{:?}", e);
        process::exit(1)
    }
}
