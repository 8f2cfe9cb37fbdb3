//! The redo parser: LWN grouping, change-vector dispatch, and commit
//! replay.
//!
//! One task consumes verified block payloads, reassembles LWN groups,
//! types each member vector, and routes it: data vectors into the
//! transaction buffer, LOB vectors into the assembler, DDL into the
//! schema overlay, control vectors into transaction lifecycle. A COMMIT
//! replays the transaction into the output builder immediately, which is
//! what yields the `(commitScn, lwnIdx)` ordering downstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::builder::Builder;
use crate::memory::{MemoryArena, Module, SwapSpace};
use crate::redo::block::{BlockPayload, ReaderPosition};
use crate::redo::lob::LobAssembler;
use crate::redo::record::{
    decode_columns, encode_columns, opcode, ChangeRecord, ChangeVector, ColumnValue, RowOp, FB_N,
    FB_P,
};
use crate::schema::{SchemaCache, SchemaDelta};
use crate::transaction::{AppendOutcome, Transaction, TransactionBuffer, TransactionReplay, TxState};
use crate::types::{Scn, Seq};
use crate::{Error, Result};

/// LWN group header: `{lwn_scn u64, records u32, length u32}`.
pub const LWN_HEADER_SIZE: usize = 16;

/// Debug stop knobs, straight from `debug` config.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugStops {
    pub transactions: u64,
    pub checkpoints: u64,
}

/// Aggregated warning counters, reported at shutdown.
#[derive(Default)]
pub struct ParserCounters {
    pub warnings: AtomicU64,
    pub transactions: AtomicU64,
    pub rollbacks: AtomicU64,
    pub skipped: AtomicU64,
}

pub struct RedoParser {
    rx: mpsc::Receiver<BlockPayload>,
    buffer: Arc<TransactionBuffer>,
    schema: Arc<SchemaCache>,
    lob: LobAssembler,
    builder: Builder,
    arena: Arc<MemoryArena>,
    swap: Arc<SwapSpace>,
    position: Arc<ReaderPosition>,
    /// SCN of the last checkpoint marker, for the state keeper.
    lwn_scn: Arc<AtomicU64>,
    counters: Arc<ParserCounters>,
    /// Commits at or below this SCN were already emitted before the
    /// checkpoint this run resumed from.
    resume_scn: Scn,
    stops: DebugStops,
    dump_dir: Option<std::path::PathBuf>,

    pending: BytesMut,
    sequence: Seq,
    offset: u64,
    block_size: u64,
    /// Position of the block that started the current LWN accumulation;
    /// always an LWN boundary, so it is safe to resume from.
    run_start_sequence: Seq,
    run_start_offset: u64,
    committed: u64,
    checkpoints_seen: u64,
}

impl RedoParser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<BlockPayload>,
        buffer: Arc<TransactionBuffer>,
        schema: Arc<SchemaCache>,
        builder: Builder,
        arena: Arc<MemoryArena>,
        swap: Arc<SwapSpace>,
        position: Arc<ReaderPosition>,
        lwn_scn: Arc<AtomicU64>,
        counters: Arc<ParserCounters>,
        resume_scn: Scn,
        stops: DebugStops,
        dump_dir: Option<std::path::PathBuf>,
        block_size: u64,
    ) -> Self {
        RedoParser {
            rx,
            buffer,
            schema,
            lob: LobAssembler::new(),
            builder,
            arena,
            swap,
            position,
            lwn_scn,
            counters,
            resume_scn,
            stops,
            dump_dir,
            pending: BytesMut::new(),
            sequence: 0,
            offset: 0,
            block_size,
            run_start_sequence: 0,
            run_start_offset: 0,
            committed: 0,
            checkpoints_seen: 0,
        }
    }

    /// Main loop: drain blocks until the reader closes the channel or a
    /// debug stop fires.
    pub async fn run(mut self) -> Result<()> {
        while let Some(block) = self.rx.recv().await {
            if block.sequence != self.sequence {
                if !self.pending.is_empty() {
                    return Err(Error::redo(
                        50012,
                        format!("sequence {} ended inside an LWN group", self.sequence),
                    ));
                }
                self.sequence = block.sequence;
            }
            self.offset = block.offset;
            if self.pending.is_empty() {
                self.run_start_sequence = block.sequence;
                self.run_start_offset = block.offset;
            }
            self.pending.extend_from_slice(&block.data);

            if !self.drain_lwn_groups().await? {
                info!("debug stop reached, ending replication");
                return Ok(());
            }

            if self.pending.is_empty() {
                // Everything up to the end of this block is consumed;
                // the next block is where a restart would resume.
                self.position.ack(self.sequence, self.offset + self.block_size);
            }
        }
        debug!("block channel closed, parser finishing");
        self.finish().await
    }

    /// Processes every complete LWN group in the pending buffer.
    /// Returns false when a debug stop was hit.
    async fn drain_lwn_groups(&mut self) -> Result<bool> {
        loop {
            if self.pending.len() < LWN_HEADER_SIZE {
                return Ok(true);
            }
            let length = u32::from_le_bytes([
                self.pending[12],
                self.pending[13],
                self.pending[14],
                self.pending[15],
            ]) as usize;
            if self.pending.len() < LWN_HEADER_SIZE + length {
                return Ok(true);
            }

            let mut group = self.pending.split_to(LWN_HEADER_SIZE + length).freeze();
            let lwn_scn = Scn::new(group.get_u64_le());
            let records = group.get_u32_le();
            let _length = group.get_u32_le();

            self.lwn_scn.store(lwn_scn.as_u64(), Ordering::Release);
            self.builder.set_lwn(lwn_scn);

            for _ in 0..records {
                let vector = ChangeVector::decode(&mut group)?;
                if !self.dispatch(vector).await? {
                    return Ok(false);
                }
            }
        }
    }

    /// Routes one change vector. Returns false on a debug stop.
    async fn dispatch(&mut self, vector: ChangeVector) -> Result<bool> {
        match vector.opcode {
            opcode::BEGIN => {
                self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);
            }
            opcode::SESSION_ATTRS => self.apply_attributes(&vector).await?,
            opcode::UNDO => self.apply_undo(&vector).await,
            opcode::INSERT_ROW => self.apply_row(vector, RowOp::Insert).await?,
            opcode::DELETE_ROW => self.apply_row(vector, RowOp::Delete).await?,
            opcode::UPDATE_ROW => self.apply_row(vector, RowOp::Update).await?,
            opcode::INSERT_ROWS => self.apply_multi_row(vector, RowOp::Insert).await?,
            opcode::DELETE_ROWS => self.apply_multi_row(vector, RowOp::Delete).await?,
            opcode::SUPPLEMENTAL => self.apply_supplemental(&vector).await?,
            opcode::LOB_DATA => {
                self.lob.add_data(vector.xid, vector.dba, vector.payload.clone());
            }
            opcode::LOB_INDEX => {
                if let Err(e) = self.lob.add_index(vector.xid, vector.payload.clone()) {
                    self.warn_recoverable(&e);
                }
            }
            opcode::DDL => self.apply_ddl(&vector).await?,
            opcode::COMMIT => return self.apply_commit(&vector).await,
            opcode::CHECKPOINT_MARK => return self.apply_checkpoint(&vector).await,
            other => {
                debug!(opcode = format!("{:x}.{:x}", other >> 8, other & 0xFF), "unknown opcode skipped");
            }
        }
        Ok(true)
    }

    async fn apply_attributes(&mut self, vector: &ChangeVector) -> Result<()> {
        let attributes = match decode_attributes(vector.payload.clone()) {
            Ok(attributes) => attributes,
            Err(e) => {
                self.warn_recoverable(&e);
                return Ok(());
            }
        };
        let tx = self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);
        tx.lock().await.attributes.extend(attributes);
        Ok(())
    }

    /// Stages a prior image until its redo vector arrives.
    async fn apply_undo(&mut self, vector: &ChangeVector) {
        let tx = self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);
        tx.lock()
            .await
            .pending_undo
            .insert((vector.dba, vector.slot), vector.payload.clone());
    }

    /// Merges a supplemental prior image into the staged undo for the
    /// same `(dba, slot)`.
    async fn apply_supplemental(&mut self, vector: &ChangeVector) -> Result<()> {
        let tx = self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);
        let mut tx = tx.lock().await;
        let key = (vector.dba, vector.slot);
        match tx.pending_undo.remove(&key) {
            None => {
                tx.pending_undo.insert(key, vector.payload.clone());
            }
            Some(existing) => {
                let merged = merge_column_lists(existing, vector.payload.clone())?;
                tx.pending_undo.insert(key, merged);
            }
        }
        Ok(())
    }

    /// Handles a single-row vector, staging multi-part rows until the
    /// terminal part arrives.
    async fn apply_row(&mut self, vector: ChangeVector, op: RowOp) -> Result<()> {
        let tx_arc = self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);

        let record = {
            let mut tx = tx_arc.lock().await;

            let key = (vector.obj, vector.dba, vector.slot);
            let payload = if vector.fb & FB_N != 0 {
                // More parts follow.
                tx.partial_rows.entry(key).or_default().extend_from_slice(&vector.payload);
                return Ok(());
            } else if vector.fb & FB_P != 0 {
                let mut staged = tx.partial_rows.remove(&key).unwrap_or_default();
                staged.extend_from_slice(&vector.payload);
                staged.freeze()
            } else {
                vector.payload.clone()
            };

            let before = tx.pending_undo.remove(&(vector.dba, vector.slot));
            let (before, after) = match op {
                RowOp::Insert => (None, Some(payload)),
                RowOp::Delete => (before.or(Some(payload)), None),
                RowOp::Update => (before, Some(payload)),
                RowOp::Ddl => (None, Some(payload)),
            };

            ChangeRecord {
                op,
                obj: vector.obj,
                data_obj: vector.data_obj,
                dba: vector.dba,
                slot: vector.slot,
                scn: vector.scn,
                before,
                after,
            }
        };

        self.buffer_record(&tx_arc, &record).await
    }

    /// Expands a multi-row vector in embedded sub-slot order.
    async fn apply_multi_row(&mut self, vector: ChangeVector, op: RowOp) -> Result<()> {
        let tx_arc = self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);

        let mut payload = vector.payload.clone();
        if payload.remaining() < 2 {
            return Err(Error::redo(50010, "multi-row vector truncated"));
        }
        let rows = payload.get_u16_le();
        for _ in 0..rows {
            if payload.remaining() < 2 {
                return Err(Error::redo(50010, "multi-row entry truncated"));
            }
            let sub_slot = payload.get_u16_le();
            let columns = decode_columns(&mut payload)?;
            let mut encoded = BytesMut::new();
            encode_columns(&columns, &mut encoded);
            let body = encoded.freeze();

            let record = ChangeRecord {
                op,
                obj: vector.obj,
                data_obj: vector.data_obj,
                dba: vector.dba,
                slot: sub_slot,
                scn: vector.scn,
                before: if op == RowOp::Delete { Some(body.clone()) } else { None },
                after: if op == RowOp::Insert { Some(body) } else { None },
            };
            self.buffer_record(&tx_arc, &record).await?;
        }
        Ok(())
    }

    /// Appends one record, drawing chunks from the arena between lock
    /// holds so the swap worker stays able to free memory.
    async fn buffer_record(
        &self,
        tx: &Arc<tokio::sync::Mutex<Transaction>>,
        record: &ChangeRecord,
    ) -> Result<()> {
        loop {
            {
                let mut guard = tx.lock().await;
                match guard.try_append(record, &self.arena, self.buffer.max_size())? {
                    AppendOutcome::Appended | AppendOutcome::Skipped => return Ok(()),
                    AppendOutcome::NeedsChunk => {}
                }
            }
            let chunk = self.arena.acquire(Module::Transaction).await?;
            tx.lock().await.attach_chunk(chunk);
        }
    }

    /// Stages the DDL delta in the schema overlay and records the event
    /// in transaction order.
    async fn apply_ddl(&mut self, vector: &ChangeVector) -> Result<()> {
        let delta = match SchemaDelta::decode(&vector.payload) {
            Ok(delta) => delta,
            Err(e) => {
                self.warn_recoverable(&e);
                return Ok(());
            }
        };
        self.schema.stage(vector.xid, delta);

        let tx_arc = self.buffer.open(vector.xid, vector.scn, self.run_start_sequence, self.run_start_offset);
        tx_arc.lock().await.has_ddl = true;
        let record = ChangeRecord {
            op: RowOp::Ddl,
            obj: vector.obj,
            data_obj: vector.data_obj,
            dba: vector.dba,
            slot: vector.slot,
            scn: vector.scn,
            before: None,
            after: Some(vector.payload.clone()),
        };
        self.buffer_record(&tx_arc, &record).await
    }

    /// Commit or rollback. Returns false when the debug transaction stop
    /// fires.
    async fn apply_commit(&mut self, vector: &ChangeVector) -> Result<bool> {
        let (rollback, commit_time) = decode_commit_payload(&vector.payload)?;
        let xid = vector.xid;

        let Some(tx) = self.buffer.remove(xid) else {
            // A commit for an unknown XID is a transaction fully emitted
            // before the checkpoint this run resumed from.
            debug!(%xid, "commit for unknown transaction ignored");
            return Ok(true);
        };

        if rollback {
            let mut tx = tx.lock().await;
            tx.state = TxState::RolledBack;
            tx.release_chunks(&self.arena);
            drop(tx);
            self.schema.discard(xid);
            self.lob.reap(xid);
            self.swap.remove(xid).await;
            self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            debug!(%xid, "transaction rolled back");
            return Ok(true);
        }

        {
            let mut tx = tx.lock().await;
            if !tx.partial_rows.is_empty() {
                return Err(Error::runtime(
                    50012,
                    format!("transaction {xid} committed with {} unfinished multi-part rows", tx.partial_rows.len()),
                ));
            }
            tx.state = TxState::Committed;
            tx.commit_scn = vector.scn;
            tx.commit_time_us = commit_time;
        }

        let skip = self.buffer.skip_if_listed(xid) || tx.lock().await.skipped;
        let dump = self.buffer.dump_if_listed(xid);
        let suppressed = vector.scn <= self.resume_scn;
        let has_ddl = tx.lock().await.has_ddl;

        if has_ddl && !skip {
            self.schema.merge(xid);
        } else if has_ddl {
            self.schema.discard(xid);
        }

        if skip {
            let mut tx = tx.lock().await;
            tx.release_chunks(&self.arena);
            drop(tx);
            self.swap.remove(xid).await;
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            info!(%xid, "transaction discarded by skip list");
        } else if dump {
            let mut replay = TransactionReplay::new(tx).await;
            self.dump_transaction(&mut replay).await?;
            replay.finish(&self.arena, &self.swap).await;
        } else if suppressed {
            let mut tx = tx.lock().await;
            tx.release_chunks(&self.arena);
            drop(tx);
            self.swap.remove(xid).await;
            debug!(%xid, scn = %vector.scn, "commit below resume fence, suppressed");
        } else {
            let mut replay = TransactionReplay::new(tx).await;
            self.builder
                .process_transaction(&mut replay, &self.lob, &self.arena, &self.swap, self.sequence)
                .await?;
            replay.finish(&self.arena, &self.swap).await;
            self.committed += 1;
            self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        }

        self.lob.reap(xid);

        if self.stops.transactions != 0 && self.committed >= self.stops.transactions {
            return Ok(false);
        }
        Ok(true)
    }

    async fn apply_checkpoint(&mut self, vector: &ChangeVector) -> Result<bool> {
        let mut payload = vector.payload.clone();
        let scn = if payload.remaining() >= 8 { Scn::new(payload.get_u64_le()) } else { vector.scn };
        self.builder.process_checkpoint(scn, self.sequence).await?;
        self.checkpoints_seen += 1;
        debug!(%scn, "checkpoint marker");
        if self.stops.checkpoints != 0 && self.checkpoints_seen >= self.stops.checkpoints {
            return Ok(false);
        }
        Ok(true)
    }

    /// Writes a dump-listed transaction to its side stream instead of
    /// the output queue.
    async fn dump_transaction(&mut self, replay: &mut TransactionReplay) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let dir = self.dump_dir.clone().unwrap_or_else(|| std::path::PathBuf::from("."));
        tokio::fs::create_dir_all(&dir).await?;
        let xid = replay.transaction().xid;
        let path = dir.join(format!("{xid}.dump"));
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(record) = replay.next(&self.arena, &self.swap).await? {
            file.write_all(format!("{record:?}\n").as_bytes()).await?;
        }
        file.flush().await?;
        info!(%xid, path = %path.display(), "transaction dumped");
        Ok(())
    }

    /// Drains whatever is left at end of input.
    async fn finish(self) -> Result<()> {
        if !self.pending.is_empty() {
            warn!(bytes = self.pending.len(), "trailing bytes after last complete LWN group");
        }
        let open = self.buffer.open_count();
        if open > 0 {
            info!(open, "open transactions remain at end of stream");
        }
        self.builder.flush();
        Ok(())
    }

    fn warn_recoverable(&self, error: &Error) {
        warn!("recoverable redo anomaly: {error}");
        self.counters.warnings.fetch_add(1, Ordering::Relaxed);
    }

}

/// Commit payload: `{flag u8, timestamp_us i64}`.
pub fn decode_commit_payload(payload: &Bytes) -> Result<(bool, i64)> {
    if payload.len() < 9 {
        return Err(Error::redo(50010, "commit vector truncated"));
    }
    let rollback = payload[0] != 0;
    let time = i64::from_le_bytes([
        payload[1], payload[2], payload[3], payload[4], payload[5], payload[6], payload[7],
        payload[8],
    ]);
    Ok((rollback, time))
}

pub fn encode_commit_payload(rollback: bool, timestamp_us: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(rollback as u8);
    buf.put_i64_le(timestamp_us);
    buf.freeze()
}

/// Attributes payload: `{count u16, {klen u16, key, vlen u16, value}*}`.
pub fn decode_attributes(mut payload: Bytes) -> Result<HashMap<String, String>> {
    if payload.remaining() < 2 {
        return Err(Error::redo(50010, "attributes vector truncated"));
    }
    let count = payload.get_u16_le();
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = take_string(&mut payload)?;
        let value = take_string(&mut payload)?;
        out.insert(key, value);
    }
    Ok(out)
}

pub fn encode_attributes(attributes: &[(String, String)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16_le(attributes.len() as u16);
    for (key, value) in attributes {
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u16_le(value.len() as u16);
        buf.put_slice(value.as_bytes());
    }
    buf.freeze()
}

fn take_string(payload: &mut Bytes) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(Error::redo(50010, "string field truncated"));
    }
    let len = payload.get_u16_le() as usize;
    if payload.remaining() < len {
        return Err(Error::redo(50010, "string field truncated"));
    }
    let bytes = payload.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::redo(60002, "string field is not valid UTF-8"))
}

fn merge_column_lists(a: Bytes, b: Bytes) -> Result<Bytes> {
    let mut a = a;
    let mut b = b;
    let mut merged: Vec<ColumnValue> = decode_columns(&mut a)?;
    for column in decode_columns(&mut b)? {
        match merged.iter_mut().find(|c| c.column == column.column) {
            Some(existing) => *existing = column,
            None => merged.push(column),
        }
    }
    merged.sort_by_key(|c| c.column);
    let mut out = BytesMut::new();
    encode_columns(&merged, &mut out);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_payload_roundtrip() {
        let bytes = encode_commit_payload(false, 123_456);
        assert_eq!(decode_commit_payload(&bytes).unwrap(), (false, 123_456));
        let bytes = encode_commit_payload(true, -1);
        assert_eq!(decode_commit_payload(&bytes).unwrap(), (true, -1));
    }

    #[test]
    fn attributes_roundtrip() {
        let attrs = vec![
            ("user".to_string(), "scott".to_string()),
            ("client".to_string(), "app-7".to_string()),
        ];
        let decoded = decode_attributes(encode_attributes(&attrs)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["user"], "scott");
        assert_eq!(decoded["client"], "app-7");
    }

    #[test]
    fn merge_prefers_later_values() {
        let mut a = BytesMut::new();
        encode_columns(
            &[
                ColumnValue { column: 1, value: Some(Bytes::from_static(b"a")) },
                ColumnValue { column: 2, value: None },
            ],
            &mut a,
        );
        let mut b = BytesMut::new();
        encode_columns(
            &[ColumnValue { column: 2, value: Some(Bytes::from_static(b"b")) }],
            &mut b,
        );

        let merged = merge_column_lists(a.freeze(), b.freeze()).unwrap();
        let columns = decode_columns(&mut merged.clone()).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].value.as_deref(), Some(&b"b"[..]));
    }
}
