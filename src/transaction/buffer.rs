//! Transaction buffer: append-only chunk lists keyed by XID.
//!
//! Each open transaction accumulates fused change records in arena
//! chunks until its commit or rollback arrives. Chunks may be spilled to
//! a per-transaction swap file under memory pressure; replay pulls them
//! back in order. A chunk starts with a `{used, count}` header so it can
//! be validated on its own after a round trip through the swap file.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::memory::{Chunk, MemoryArena, Module, SwapSpace, CHUNK_SIZE};
use crate::redo::record::ChangeRecord;
use crate::types::{Scn, Seq, Xid};
use crate::{Error, Result};

/// `{used u32, count u32}` at the head of every chunk.
pub const CHUNK_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Result of a non-blocking append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The tail chunk is full; acquire one and retry.
    NeedsChunk,
    /// The transaction is (now) skipped; the record is dropped.
    Skipped,
}

/// Checkpoint descriptor for a transaction still open at fence time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenXid {
    pub xid: String,
    pub first_scn: Scn,
    pub sequence: Seq,
    pub offset: u64,
}

pub struct Transaction {
    pub xid: Xid,
    pub first_scn: Scn,
    pub commit_scn: Scn,
    /// Commit timestamp (epoch microseconds) from the commit vector.
    pub commit_time_us: i64,
    pub state: TxState,
    /// Log position of the first change, recorded so an open transaction
    /// can be re-read after a restart.
    pub start_sequence: Seq,
    pub start_offset: u64,
    pub attributes: HashMap<String, String>,
    pub has_ddl: bool,
    pub skipped: bool,
    pub dump: bool,
    chunks: VecDeque<Option<Chunk>>,
    /// Inclusive range of chunk indices currently on disk.
    swapped: Option<(u32, u32)>,
    tail_used: usize,
    size: u64,
    records: u64,
    /// Staged before-images keyed by `(dba, slot)` awaiting their
    /// matching redo vector.
    pub pending_undo: HashMap<(u32, u16), Bytes>,
    /// Multi-part row payloads keyed by `(obj, dba, slot)`.
    pub partial_rows: HashMap<(u32, u32, u16), BytesMut>,
}

impl Transaction {
    fn new(xid: Xid, first_scn: Scn, sequence: Seq, offset: u64) -> Self {
        Transaction {
            xid,
            first_scn,
            commit_scn: Scn::ZERO,
            commit_time_us: 0,
            state: TxState::Open,
            start_sequence: sequence,
            start_offset: offset,
            attributes: HashMap::new(),
            has_ddl: false,
            skipped: false,
            dump: false,
            chunks: VecDeque::new(),
            swapped: None,
            tail_used: 0,
            size: 0,
            records: 0,
            pending_undo: HashMap::new(),
            partial_rows: HashMap::new(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Number of chunks currently resident in RAM.
    pub fn resident_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Appends a fused record into the resident tail chunk.
    ///
    /// Never suspends: when the tail is full the caller must release the
    /// lock, draw a chunk from the arena, [`attach_chunk`] it, and retry.
    /// Holding the transaction lock across an arena wait would lock out
    /// the swap worker that could free the memory.
    ///
    /// Promotes the transaction to skipped once `max_size` (bytes, 0 =
    /// unbounded) would be exceeded, returning its chunks immediately.
    ///
    /// [`attach_chunk`]: Transaction::attach_chunk
    pub fn try_append(
        &mut self,
        record: &ChangeRecord,
        arena: &MemoryArena,
        max_size: u64,
    ) -> Result<AppendOutcome> {
        if self.skipped {
            return Ok(AppendOutcome::Skipped);
        }
        let need = record.wire_size();
        if need > CHUNK_SIZE - CHUNK_HEADER_SIZE {
            return Err(Error::runtime(
                10069,
                format!("change record of {need} bytes exceeds the memory chunk size"),
            ));
        }
        if max_size != 0 && self.size + need as u64 > max_size {
            warn!(
                xid = %self.xid,
                size = self.size,
                "transaction exceeds transaction-max-mb, skipping"
            );
            self.skipped = true;
            self.release_chunks(arena);
            return Ok(AppendOutcome::Skipped);
        }

        let tail_full = match self.chunks.back() {
            None => true,
            Some(None) => true,
            Some(Some(_)) => self.tail_used + need > CHUNK_SIZE,
        };
        if tail_full {
            return Ok(AppendOutcome::NeedsChunk);
        }

        let mut encoded = BytesMut::with_capacity(need);
        record.encode(&mut encoded);

        let tail = self
            .chunks
            .back_mut()
            .and_then(|c| c.as_mut())
            .ok_or_else(|| Error::runtime(50001, "transaction tail chunk missing"))?;
        tail[self.tail_used..self.tail_used + need].copy_from_slice(&encoded);
        self.tail_used += need;

        let count = u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]) + 1;
        tail[0..4].copy_from_slice(&(self.tail_used as u32).to_le_bytes());
        tail[4..8].copy_from_slice(&count.to_le_bytes());

        self.size += need as u64;
        self.records += 1;
        Ok(AppendOutcome::Appended)
    }

    /// Installs a freshly acquired chunk as the new tail.
    pub fn attach_chunk(&mut self, mut chunk: Chunk) {
        chunk[0..4].copy_from_slice(&(CHUNK_HEADER_SIZE as u32).to_le_bytes());
        chunk[4..8].copy_from_slice(&0u32.to_le_bytes());
        self.chunks.push_back(Some(chunk));
        self.tail_used = CHUNK_HEADER_SIZE;
    }

    /// Spills every resident chunk except the first and the tail to the
    /// swap file, returning the freed chunks to the arena. The swap
    /// window stays contiguous because the middle is always taken whole.
    pub async fn swap_out_middle(
        &mut self,
        arena: &MemoryArena,
        swap: &SwapSpace,
    ) -> Result<usize> {
        if self.chunks.len() < 3 || self.state != TxState::Open {
            return Ok(0);
        }
        let mut moved = 0usize;
        let last = self.chunks.len() - 1;
        for idx in 1..last {
            if let Some(chunk) = self.chunks[idx].take() {
                let used = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
                swap.write_chunk(self.xid, idx as u32, &chunk[..used]).await?;
                arena.release(Module::Transaction, chunk);
                arena.record_swapped_out();
                moved += 1;
                self.swapped = Some(match self.swapped {
                    None => (idx as u32, idx as u32),
                    Some((min, max)) => (min.min(idx as u32), max.max(idx as u32)),
                });
            }
        }
        if moved > 0 {
            debug!(xid = %self.xid, moved, "swapped transaction chunks out");
        }
        Ok(moved)
    }

    pub fn release_chunks(&mut self, arena: &MemoryArena) {
        while let Some(slot) = self.chunks.pop_front() {
            if let Some(chunk) = slot {
                arena.release(Module::Transaction, chunk);
            }
        }
        self.tail_used = 0;
        self.swapped = None;
    }
}

/// Replays a committed transaction in append order, pulling swapped
/// chunks back through the arena as it goes. Holds the transaction's
/// lock for the whole replay; replay is single-threaded per XID.
pub struct TransactionReplay {
    transaction: tokio::sync::OwnedMutexGuard<Transaction>,
    current: Option<Bytes>,
}

impl TransactionReplay {
    pub async fn new(transaction: Arc<Mutex<Transaction>>) -> Self {
        TransactionReplay { transaction: transaction.lock_owned().await, current: None }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub async fn next(
        &mut self,
        arena: &MemoryArena,
        swap: &SwapSpace,
    ) -> Result<Option<ChangeRecord>> {
        loop {
            if let Some(buf) = &mut self.current {
                if buf.is_empty() {
                    self.current = None;
                } else {
                    return ChangeRecord::decode(buf).map(Some);
                }
            }

            let Some(slot) = self.transaction.chunks.pop_front() else {
                return Ok(None);
            };
            match slot {
                Some(chunk) => {
                    let used = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
                    if used < CHUNK_HEADER_SIZE || used > chunk.len() {
                        return Err(Error::runtime(50002, format!("corrupt chunk header: used = {used}")));
                    }
                    self.current = Some(Bytes::copy_from_slice(&chunk[CHUNK_HEADER_SIZE..used]));
                    arena.release(Module::Transaction, chunk);
                }
                None => {
                    // Swapped out; bring it back through the arena's
                    // unswap reserve.
                    let idx = self.swapped_front()?;
                    let mut chunk = arena.acquire_unswap().await?;
                    let used = swap.read_chunk(self.transaction.xid, idx, &mut chunk).await?;
                    if used < CHUNK_HEADER_SIZE {
                        return Err(Error::runtime(50002, format!("corrupt swapped chunk {idx}")));
                    }
                    self.current = Some(Bytes::copy_from_slice(&chunk[CHUNK_HEADER_SIZE..used]));
                    arena.release(Module::Transaction, chunk);
                    if let Some((min, max)) = self.transaction.swapped {
                        self.transaction.swapped = if min < max { Some((min + 1, max)) } else { None };
                    }
                }
            }
        }
    }

    /// Releases whatever is left (early-terminated replay) and removes
    /// the swap file.
    pub async fn finish(mut self, arena: &MemoryArena, swap: &SwapSpace) {
        self.transaction.release_chunks(arena);
        swap.remove(self.transaction.xid).await;
    }

    fn swapped_front(&self) -> Result<u32> {
        self.transaction
            .swapped
            .map(|(min, _)| min)
            .ok_or_else(|| Error::runtime(50002, "missing chunk without a swap window"))
    }
}

/// The XID-keyed registry of in-flight transactions.
///
/// The map itself takes a short lock for insert and delete only; each
/// transaction carries its own lock so the parser and the swap worker
/// never contend for longer than one operation.
pub struct TransactionBuffer {
    map: RwLock<HashMap<Xid, Arc<Mutex<Transaction>>>>,
    skip_xids: HashSet<Xid>,
    dump_xids: HashSet<Xid>,
    max_size: u64,
}

impl TransactionBuffer {
    pub fn new(skip_xid: &[String], dump_xid: &[String], transaction_max_mb: u64) -> Result<Self> {
        let parse = |list: &[String]| -> Result<HashSet<Xid>> {
            list.iter()
                .map(|s| s.parse::<Xid>().map_err(|e| Error::config(30001, e)))
                .collect()
        };
        Ok(TransactionBuffer {
            map: RwLock::new(HashMap::new()),
            skip_xids: parse(skip_xid)?,
            dump_xids: parse(dump_xid)?,
            max_size: transaction_max_mb.saturating_mul(1024 * 1024),
        })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Fetches or lazily creates the transaction for `xid`.
    pub fn open(&self, xid: Xid, scn: Scn, sequence: Seq, offset: u64) -> Arc<Mutex<Transaction>> {
        if let Some(existing) = self.map.read().get(&xid) {
            return Arc::clone(existing);
        }
        let mut map = self.map.write();
        Arc::clone(map.entry(xid).or_insert_with(|| {
            let mut tx = Transaction::new(xid, scn, sequence, offset);
            tx.dump = self.dump_xids.contains(&xid);
            Arc::new(Mutex::new(tx))
        }))
    }

    pub fn get(&self, xid: Xid) -> Option<Arc<Mutex<Transaction>>> {
        self.map.read().get(&xid).cloned()
    }

    /// Removes the transaction for terminal processing.
    pub fn remove(&self, xid: Xid) -> Option<Arc<Mutex<Transaction>>> {
        self.map.write().remove(&xid)
    }

    pub fn skip_if_listed(&self, xid: Xid) -> bool {
        self.skip_xids.contains(&xid)
    }

    pub fn dump_if_listed(&self, xid: Xid) -> bool {
        self.dump_xids.contains(&xid)
    }

    pub fn open_count(&self) -> usize {
        self.map.read().len()
    }

    /// Candidate for the swap worker: the open transaction holding the
    /// most resident chunks. Transactions whose lock is currently held
    /// (being appended to or replayed) are passed over.
    pub fn largest_resident(&self) -> Option<Arc<Mutex<Transaction>>> {
        let candidates: Vec<Arc<Mutex<Transaction>>> =
            self.map.read().values().cloned().collect();
        let mut best: Option<(usize, Arc<Mutex<Transaction>>)> = None;
        for candidate in candidates {
            let Ok(tx) = candidate.try_lock() else {
                continue;
            };
            let resident = tx.resident_chunks();
            drop(tx);
            if resident >= 3 && best.as_ref().map(|(n, _)| resident > *n).unwrap_or(true) {
                best = Some((resident, candidate));
            }
        }
        best.map(|(_, tx)| tx)
    }

    /// Descriptors of every open transaction, for checkpoint records.
    pub async fn open_xids(&self) -> Vec<OpenXid> {
        let snapshot: Vec<Arc<Mutex<Transaction>>> = self.map.read().values().cloned().collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for tx in snapshot {
            let tx = tx.lock().await;
            if tx.state == TxState::Open && !tx.skipped {
                out.push(OpenXid {
                    xid: tx.xid.to_hex(),
                    first_scn: tx.first_scn,
                    sequence: tx.start_sequence,
                    offset: tx.start_offset,
                });
            }
        }
        out
    }

    /// Releases every remaining transaction's chunks on shutdown.
    pub async fn drain(&self, arena: &MemoryArena, swap: &SwapSpace) {
        let all: Vec<Arc<Mutex<Transaction>>> = {
            let mut map = self.map.write();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in all {
            let mut tx = tx.lock().await;
            let xid = tx.xid;
            tx.release_chunks(arena);
            swap.remove(xid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::redo::record::RowOp;
    use tempfile::TempDir;

    fn arena(max_mb: u64) -> MemoryArena {
        MemoryArena::new(&MemoryConfig {
            min_mb: 1,
            max_mb,
            read_buffer_min_mb: 0,
            read_buffer_max_mb: 0,
            write_buffer_min_mb: 0,
            write_buffer_max_mb: 0,
            swap_mb: 0,
            swap_path: std::path::PathBuf::from("."),
            unswap_buffer_min_mb: 0,
        })
        .unwrap()
    }

    fn record(scn: u64, payload: &[u8]) -> ChangeRecord {
        ChangeRecord {
            op: RowOp::Insert,
            obj: 101,
            data_obj: 101,
            dba: 1,
            slot: 0,
            scn: Scn::new(scn),
            before: None,
            after: Some(Bytes::copy_from_slice(payload)),
        }
    }

    /// Append loop as the parser drives it: acquire chunks as needed.
    async fn append(
        tx: &mut Transaction,
        record: &ChangeRecord,
        arena: &MemoryArena,
        max: u64,
    ) -> crate::Result<()> {
        loop {
            match tx.try_append(record, arena, max)? {
                AppendOutcome::Appended | AppendOutcome::Skipped => return Ok(()),
                AppendOutcome::NeedsChunk => {
                    let chunk = arena.acquire(Module::Transaction).await?;
                    tx.attach_chunk(chunk);
                }
            }
        }
    }

    #[tokio::test]
    async fn append_and_replay_in_order() {
        let tmp = TempDir::new().unwrap();
        let arena = arena(8);
        let swap = SwapSpace::new(tmp.path().to_path_buf()).unwrap();
        let buffer = TransactionBuffer::new(&[], &[], 0).unwrap();

        let xid = Xid::new(1, 1, 1);
        let tx = buffer.open(xid, Scn::new(100), 1, 0);
        {
            let mut tx = tx.lock().await;
            for i in 0..100u64 {
                append(&mut tx, &record(100 + i, &i.to_le_bytes()), &arena, 0).await.unwrap();
            }
            assert_eq!(tx.record_count(), 100);
        }

        let tx = buffer.remove(xid).unwrap();
        let mut replay = TransactionReplay::new(tx).await;
        let mut seen = 0u64;
        while let Some(rec) = replay.next(&arena, &swap).await.unwrap() {
            assert_eq!(rec.scn, Scn::new(100 + seen));
            seen += 1;
        }
        assert_eq!(seen, 100);
        replay.finish(&arena, &swap).await;
    }

    #[tokio::test]
    async fn swap_roundtrip_preserves_records() {
        let tmp = TempDir::new().unwrap();
        let arena = arena(16);
        let swap = SwapSpace::new(tmp.path().to_path_buf()).unwrap();
        let buffer = TransactionBuffer::new(&[], &[], 0).unwrap();

        let xid = Xid::new(2, 0, 9);
        let tx = buffer.open(xid, Scn::new(1), 1, 0);
        let payload = vec![0x5Au8; 200_000];
        {
            let mut tx = tx.lock().await;
            // Spread across several chunks.
            for i in 0..20u64 {
                append(&mut tx, &record(i, &payload), &arena, 0).await.unwrap();
            }
            let moved = tx.swap_out_middle(&arena, &swap).await.unwrap();
            assert!(moved > 0, "expected middle chunks to spill");
        }

        let tx = buffer.remove(xid).unwrap();
        let mut replay = TransactionReplay::new(tx).await;
        let mut seen = 0u64;
        while let Some(rec) = replay.next(&arena, &swap).await.unwrap() {
            assert_eq!(rec.scn, Scn::new(seen));
            assert_eq!(rec.after.as_ref().unwrap().len(), payload.len());
            seen += 1;
        }
        assert_eq!(seen, 20);
        replay.finish(&arena, &swap).await;
    }

    #[tokio::test]
    async fn oversize_transaction_is_skipped() {
        let arena = arena(8);
        let buffer = TransactionBuffer::new(&[], &[], 0).unwrap();
        let xid = Xid::new(3, 0, 1);
        let tx = buffer.open(xid, Scn::new(1), 1, 0);
        let mut tx = tx.lock().await;

        // Limit chosen so the second append crosses it.
        let limit = record(0, b"x").wire_size() as u64;
        append(&mut tx, &record(0, b"x"), &arena, limit).await.unwrap();
        assert!(!tx.skipped);
        append(&mut tx, &record(1, b"x"), &arena, limit).await.unwrap();
        assert!(tx.skipped);
        assert_eq!(tx.resident_chunks(), 0);
    }

    #[tokio::test]
    async fn skip_and_dump_lists() {
        let buffer = TransactionBuffer::new(
            &["0x0001.001.00000001".to_string()],
            &["0x0002.002.00000002".to_string()],
            0,
        )
        .unwrap();
        assert!(buffer.skip_if_listed(Xid::new(1, 1, 1)));
        assert!(!buffer.skip_if_listed(Xid::new(9, 9, 9)));
        assert!(buffer.dump_if_listed(Xid::new(2, 2, 2)));

        let tx = buffer.open(Xid::new(2, 2, 2), Scn::new(5), 1, 0);
        assert!(tx.lock().await.dump);
    }

    #[tokio::test]
    async fn open_xids_reports_positions() {
        let buffer = TransactionBuffer::new(&[], &[], 0).unwrap();
        buffer.open(Xid::new(1, 0, 1), Scn::new(50), 3, 1024);
        let open = buffer.open_xids().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].sequence, 3);
        assert_eq!(open[0].offset, 1024);
        assert_eq!(open[0].first_scn, Scn::new(50));
    }
}
