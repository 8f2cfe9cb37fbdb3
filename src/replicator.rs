//! Pipeline supervisor: wires the components together, spawns one task
//! per role, and owns shutdown.
//!
//! Soft shutdown (first signal, or natural end of input) stops the
//! reader, lets the parser drain through the last committed SCN, waits
//! for the writer to confirm everything, writes a final checkpoint, and
//! exits. A second signal goes hard: every task observes its stop flag
//! and partial work is discarded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::{builder_queue, Builder, BuilderQueue, FormatOptions, JsonFormatter};
use crate::checkpoint::{CheckpointKeeper, CheckpointRecord};
use crate::config::{Config, FLAG_ADAPTIVE_SCHEMA};
use crate::memory::{MemoryArena, SwapSpace, CHUNK_SIZE};
use crate::redo::block::{LogBlockReader, ReaderPosition};
use crate::redo::parser::{DebugStops, ParserCounters, RedoParser};
use crate::schema::SchemaCache;
use crate::transaction::TransactionBuffer;
use crate::types::Scn;
use crate::writer::{WriterSink, WriterTask};
use crate::{Error, Result};

pub struct Replicator {
    config: Config,
    config_path: Option<PathBuf>,
}

impl Replicator {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Replicator { config, config_path }
    }

    pub async fn run(&mut self) -> Result<()> {
        let source = self.config.source().clone();
        let target = self.config.target().clone();

        let arena = Arc::new(MemoryArena::new(&source.memory)?);
        let swap = Arc::new(SwapSpace::new(source.memory.swap_path.clone())?);
        swap.cleanup()?;

        let filters = table_filters(&source);
        let adaptive = source.flags & FLAG_ADAPTIVE_SCHEMA != 0;
        let schema = Arc::new(SchemaCache::new(adaptive, filters));

        // Recovery: newest checkpoint decides where the reader starts and
        // which commits are suppressed as already emitted.
        let keeper = CheckpointKeeper::new(&source.state, &source.name)?;
        let mut resume_scn = Scn::ZERO;
        let mut start = (source.reader.start_seq.unwrap_or(0), 0u64);
        let mut message_count = 0u64;
        match keeper.load_latest().await? {
            Some((record, schema_body)) => {
                schema.restore(&schema_body)?;
                resume_scn = record.scn;
                start = record.start_position();
                message_count = record.message_count;
                info!(
                    resume_scn = %resume_scn,
                    sequence = start.0,
                    offset = start.1,
                    "resuming from checkpoint"
                );
            }
            None => {
                if let Some(scn) = source.reader.start_scn {
                    resume_scn = Scn::new(scn);
                }
                info!(sequence = start.0, "starting without checkpoint");
            }
        }

        let buffer = Arc::new(TransactionBuffer::new(
            &source.filter.skip_xid,
            &source.filter.dump_xid,
            source.transaction_max_mb,
        )?);

        let write_max = source.memory.write_buffer_max_mb.saturating_mul(1024 * 1024);
        let (producer, consumer, queue) =
            builder_queue(Arc::clone(&arena), write_max, source.format.flush_buffer).await?;
        let builder = Builder::new(
            JsonFormatter::new(FormatOptions::from_config(&source.format)),
            producer,
            Arc::clone(&schema),
            source.name.clone(),
        );

        // Reader back-pressure: the block channel holds at most the
        // read-buffer quota.
        let capacity = ((source.memory.read_buffer_max_mb.max(1) as usize * CHUNK_SIZE)
            / source.reader.block_size as usize)
            .clamp(64, 65_536);
        let (block_tx, block_rx) = mpsc::channel(capacity);

        let reader_stop = Arc::new(AtomicBool::new(false));
        let writer_stop = Arc::new(AtomicBool::new(false));
        let hard = Arc::new(AtomicBool::new(false));
        let position = Arc::new(ReaderPosition::default());
        position.ack(start.0, start.1);
        let lwn_scn = Arc::new(AtomicU64::new(0));
        let counters = Arc::new(ParserCounters::default());

        let reader = LogBlockReader::new(
            &source.reader,
            block_tx,
            Arc::clone(&reader_stop),
            start,
            source.debug.stop_log_switches,
        );
        let parser = RedoParser::new(
            block_rx,
            Arc::clone(&buffer),
            Arc::clone(&schema),
            builder,
            Arc::clone(&arena),
            Arc::clone(&swap),
            Arc::clone(&position),
            Arc::clone(&lwn_scn),
            Arc::clone(&counters),
            resume_scn,
            DebugStops {
                transactions: source.debug.stop_transactions,
                checkpoints: source.debug.stop_checkpoints,
            },
            self.config.dump_path.clone(),
            source.reader.block_size as u64,
        );
        let sink = WriterSink::from_config(&target.writer).await?;
        let writer = WriterTask::new(
            sink,
            consumer,
            target.writer.poll_interval_us,
            Arc::clone(&writer_stop),
        );

        let mut reader_handle = tokio::spawn(reader.run());
        let mut parser_handle = tokio::spawn(parser.run());
        let mut writer_handle = tokio::spawn(writer.run());
        let swap_handle = spawn_swap_worker(
            Arc::clone(&arena),
            Arc::clone(&swap),
            Arc::clone(&buffer),
            Arc::clone(&hard),
        );

        let checkpoint_stop = Arc::new(AtomicBool::new(false));
        let checkpoint_handle = spawn_checkpoint_worker(
            keeper,
            CheckpointContext {
                queue: Arc::clone(&queue),
                position: Arc::clone(&position),
                buffer: Arc::clone(&buffer),
                schema: Arc::clone(&schema),
                lwn_scn: Arc::clone(&lwn_scn),
                interval: Duration::from_secs(source.state.interval_s),
                interval_bytes: source.state.interval_mb.saturating_mul(1024 * 1024),
                message_count_base: message_count,
                config_path: self.config_path.clone(),
            },
            Arc::clone(&checkpoint_stop),
        );

        spawn_signal_watcher(
            Arc::clone(&reader_stop),
            Arc::clone(&writer_stop),
            Arc::clone(&hard),
            Arc::clone(&arena),
            Arc::clone(&queue),
        );

        // Supervise: collect each task's result; a fatal error anywhere
        // flips the stop flags so the rest unwind.
        let mut reader_result: Option<Result<()>> = None;
        let mut parser_result: Option<Result<()>> = None;
        let mut writer_result: Option<Result<()>> = None;
        let mut drained = false;

        while reader_result.is_none() || parser_result.is_none() || writer_result.is_none() {
            tokio::select! {
                r = &mut reader_handle, if reader_result.is_none() => {
                    reader_result = Some(flatten(r));
                }
                p = &mut parser_handle, if parser_result.is_none() => {
                    let result = flatten(p);
                    if let Err(e) = &result {
                        if e.is_fatal() && !matches!(e, Error::Shutdown) {
                            error!("parser failed: {e}");
                            hard.store(true, Ordering::Release);
                            writer_stop.store(true, Ordering::Release);
                            arena.shut_down();
                            queue.wake_consumer();
                        }
                    }
                    // The parser is the reader's only consumer.
                    reader_stop.store(true, Ordering::Release);
                    parser_result = Some(result);
                }
                w = &mut writer_handle, if writer_result.is_none() => {
                    let result = flatten(w);
                    if let Err(e) = &result {
                        if e.is_fatal() && !matches!(e, Error::Shutdown) {
                            error!("writer failed: {e}");
                            hard.store(true, Ordering::Release);
                            reader_stop.store(true, Ordering::Release);
                            arena.shut_down();
                        }
                    }
                    writer_result = Some(result);
                }
            }

            if parser_result.is_some() && writer_result.is_none() && !drained {
                drained = true;
                // Drain through the last committed SCN before stopping
                // the writer.
                while queue.unconfirmed_bytes() > 0 && !hard.load(Ordering::Acquire) {
                    queue.wake_consumer();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                writer_stop.store(true, Ordering::Release);
                queue.wake_consumer();
            }
        }

        // Stop the background workers and take a final checkpoint.
        hard.store(true, Ordering::Release);
        checkpoint_stop.store(true, Ordering::Release);
        let _ = swap_handle.await;
        let keeper = checkpoint_handle.await.map_err(|e| Error::runtime(10014, e.to_string()))?;
        self.final_checkpoint(keeper, &queue, &position, &buffer, &schema, &lwn_scn, message_count)
            .await;

        buffer.drain(&arena, &swap).await;

        info!(
            transactions = counters.transactions.load(Ordering::Relaxed),
            rollbacks = counters.rollbacks.load(Ordering::Relaxed),
            skipped = counters.skipped.load(Ordering::Relaxed),
            warnings = counters.warnings.load(Ordering::Relaxed),
            messages = queue.message_count(),
            memory_hwm_mb = arena.hwm_mb(),
            swapped_mb = arena.swapped_out_mb(),
            "replication finished"
        );

        for result in [reader_result, parser_result, writer_result].into_iter().flatten() {
            match result {
                Err(Error::Shutdown) | Ok(()) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn final_checkpoint(
        &self,
        mut keeper: CheckpointKeeper,
        queue: &BuilderQueue,
        position: &ReaderPosition,
        buffer: &TransactionBuffer,
        schema: &SchemaCache,
        lwn_scn: &AtomicU64,
        message_count_base: u64,
    ) {
        let scn = queue.confirmed_scn();
        if scn.is_zero() {
            debug!("nothing confirmed, final checkpoint skipped");
            return;
        }
        let record = build_record(
            scn,
            queue,
            position,
            buffer,
            schema,
            lwn_scn,
            message_count_base,
        )
        .await;
        let Ok(record) = record else {
            warn!("final checkpoint could not be assembled");
            return;
        };
        match schema.snapshot() {
            Ok(body) => {
                if let Err(e) = keeper.save(record, &body).await {
                    warn!("final checkpoint failed: {e}");
                } else {
                    info!(scn = %scn, "final checkpoint written");
                }
            }
            Err(e) => warn!("schema snapshot failed: {e}"),
        }
    }
}

fn table_filters(source: &crate::config::SourceConfig) -> Vec<crate::schema::TableMatch> {
    source
        .filter
        .table
        .iter()
        .map(|t| crate::schema::TableMatch {
            owner: t.owner.clone(),
            table: t.table.clone(),
            tag: t.tag.clone(),
        })
        .collect()
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::runtime(10014, format!("task panicked: {e}"))),
    }
}

/// First signal: soft shutdown (stop reading, drain). Second: hard.
fn spawn_signal_watcher(
    reader_stop: Arc<AtomicBool>,
    writer_stop: Arc<AtomicBool>,
    hard: Arc<AtomicBool>,
    arena: Arc<MemoryArena>,
    queue: Arc<BuilderQueue>,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("shutdown requested, draining through the last committed transaction");
        reader_stop.store(true, Ordering::Release);

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("hard shutdown, discarding in-flight work");
        hard.store(true, Ordering::Release);
        writer_stop.store(true, Ordering::Release);
        arena.shut_down();
        queue.wake_consumer();
    });
}

/// Background memory worker: when usage crosses the swap threshold, the
/// transaction holding the most resident chunks spills its middle.
fn spawn_swap_worker(
    arena: Arc<MemoryArena>,
    swap: Arc<SwapSpace>,
    buffer: Arc<TransactionBuffer>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if stop.load(Ordering::Acquire) {
                return;
            }
            if !arena.swap_needed() {
                continue;
            }
            let Some(candidate) = buffer.largest_resident() else {
                continue;
            };
            let mut tx = candidate.lock().await;
            match tx.swap_out_middle(&arena, &swap).await {
                Ok(moved) if moved > 0 => {
                    debug!(xid = %tx.xid, moved, "swap worker spilled chunks");
                }
                Ok(_) => {}
                Err(e) => warn!("swap worker failed: {e}"),
            }
        }
    })
}

struct CheckpointContext {
    queue: Arc<BuilderQueue>,
    position: Arc<ReaderPosition>,
    buffer: Arc<TransactionBuffer>,
    schema: Arc<SchemaCache>,
    lwn_scn: Arc<AtomicU64>,
    interval: Duration,
    interval_bytes: u64,
    message_count_base: u64,
    config_path: Option<PathBuf>,
}

/// Periodic checkpoints plus config-file change tracking, one tick per
/// second. Returns the keeper so the supervisor can take the final
/// checkpoint after the drain.
fn spawn_checkpoint_worker(
    mut keeper: CheckpointKeeper,
    ctx: CheckpointContext,
    stop: Arc<AtomicBool>,
) -> JoinHandle<CheckpointKeeper> {
    tokio::spawn(async move {
        let mut last_save = Instant::now();
        let mut last_emitted = ctx.queue.emitted_bytes();
        let mut last_saved_scn = Scn::ZERO;
        let mut last_sequence = ctx.position.get().0;
        let mut config_mtime = config_modified(&ctx.config_path);

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if stop.load(Ordering::Acquire) {
                return keeper;
            }

            // Config reload: only the filter section is re-applied; a
            // broken file is logged and ignored.
            let mtime = config_modified(&ctx.config_path);
            if mtime != config_mtime {
                config_mtime = mtime;
                if let Some(path) = &ctx.config_path {
                    match Config::load(path) {
                        Ok(new_config) => {
                            let filters = table_filters(new_config.source());
                            ctx.schema.set_filters(filters);
                            info!("config file changed, filters reloaded");
                        }
                        Err(e) => {
                            error!("config reload failed, keeping old config: {e}");
                        }
                    }
                }
            }

            let emitted = ctx.queue.emitted_bytes();
            let (sequence, _) = ctx.position.get();
            let scn = ctx.queue.confirmed_scn();

            let due = last_save.elapsed() >= ctx.interval
                || emitted.saturating_sub(last_emitted) >= ctx.interval_bytes
                || sequence != last_sequence;
            if !due || scn <= last_saved_scn {
                continue;
            }

            let record = match build_record(
                scn,
                &ctx.queue,
                &ctx.position,
                &ctx.buffer,
                &ctx.schema,
                &ctx.lwn_scn,
                ctx.message_count_base,
            )
            .await
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("checkpoint record could not be assembled: {e}");
                    continue;
                }
            };
            let body = match ctx.schema.snapshot() {
                Ok(body) => body,
                Err(e) => {
                    warn!("schema snapshot failed: {e}");
                    continue;
                }
            };
            match keeper.save(record, &body).await {
                Ok(()) => {
                    last_save = Instant::now();
                    last_emitted = emitted;
                    last_saved_scn = scn;
                    last_sequence = sequence;
                }
                Err(e) => warn!("checkpoint save failed: {e}"),
            }
        }
    })
}

async fn build_record(
    scn: Scn,
    queue: &BuilderQueue,
    position: &ReaderPosition,
    buffer: &TransactionBuffer,
    schema: &SchemaCache,
    lwn_scn: &AtomicU64,
    message_count_base: u64,
) -> Result<CheckpointRecord> {
    let (sequence, offset) = position.get();
    Ok(CheckpointRecord {
        scn,
        lwn_scn: Scn::new(lwn_scn.load(Ordering::Acquire)),
        sequence,
        offset,
        timestamp: chrono::Utc::now(),
        message_count: message_count_base + queue.message_count(),
        open_xids: buffer.open_xids().await,
        schema_digest: schema.digest()?,
        schema: None,
    })
}

fn config_modified(path: &Option<PathBuf>) -> Option<std::time::SystemTime> {
    path.as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .and_then(|m| m.modified().ok())
}
