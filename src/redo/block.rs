//! Physical block layer of the redo stream.
//!
//! A log file is a sequence of fixed-size blocks, each carrying a CRC and
//! its `(sequence, block)` coordinates. The reader verifies continuity
//! and hands contiguous payload bytes to the parser in strict
//! `(sequence, offset)` order. At the hot end of an online log a torn
//! tail is expected; the reader sleeps and retries until the block fills.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ReaderConfig, ReaderType};
use crate::types::Seq;
use crate::{Error, Result};

pub const BLOCK_HEADER_SIZE: usize = 20;
pub const BLOCK_MAGIC: u32 = 0x4C4F_4452;
pub const BLOCK_FLAG_LAST: u16 = 0x0001;

/// Header of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub sequence: Seq,
    pub block: u32,
    pub payload_size: u16,
    pub flags: u16,
    pub crc: u32,
}

impl BlockHeader {
    /// Decodes a header; returns `None` for an all-zero (unwritten) slot.
    pub fn decode(buf: &[u8]) -> Result<Option<BlockHeader>> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(Error::redo(50009, "block header truncated"));
        }
        if buf[..BLOCK_HEADER_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != BLOCK_MAGIC {
            return Err(Error::redo(50009, format!("bad block magic: {magic:#010x}")));
        }
        Ok(Some(BlockHeader {
            sequence: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            block: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload_size: u16::from_le_bytes([buf[12], buf[13]]),
            flags: u16::from_le_bytes([buf[14], buf[15]]),
            crc: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        }))
    }

    pub fn verify(&self, payload: &[u8]) -> bool {
        self.crc == crc32fast::hash(payload)
    }
}

/// Builds one complete on-disk block. Used by the copy path and by test
/// fixtures that synthesize log files.
pub fn encode_block(sequence: Seq, block: u32, payload: &[u8], last: bool, block_size: usize) -> Vec<u8> {
    assert!(payload.len() <= block_size - BLOCK_HEADER_SIZE);
    let mut out = vec![0u8; block_size];
    out[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&sequence.to_le_bytes());
    out[8..12].copy_from_slice(&block.to_le_bytes());
    out[12..14].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    let flags: u16 = if last { BLOCK_FLAG_LAST } else { 0 };
    out[14..16].copy_from_slice(&flags.to_le_bytes());
    out[16..20].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    out
}

/// Verified payload bytes of one block, with its log coordinates.
#[derive(Debug, Clone)]
pub struct BlockPayload {
    pub sequence: Seq,
    /// Byte offset of the block within its log file.
    pub offset: u64,
    pub data: Bytes,
    /// Set on the final block of a sequence (clean log switch).
    pub last: bool,
}

/// Read position acknowledged by the parser, consumed by checkpoints.
#[derive(Default)]
pub struct ReaderPosition {
    inner: Mutex<(Seq, u64)>,
}

impl ReaderPosition {
    pub fn ack(&self, sequence: Seq, offset: u64) {
        let mut inner = self.inner.lock();
        *inner = (sequence, offset);
    }

    pub fn get(&self) -> (Seq, u64) {
        *self.inner.lock()
    }
}

/// Produces the contiguous block stream for the parser.
pub struct LogBlockReader {
    config: ReaderConfig,
    block_size: usize,
    tx: mpsc::Sender<BlockPayload>,
    shutdown: Arc<AtomicBool>,
    start_sequence: Seq,
    start_offset: u64,
    stop_log_switches: u64,
    switches: u64,
}

impl LogBlockReader {
    pub fn new(
        config: &ReaderConfig,
        tx: mpsc::Sender<BlockPayload>,
        shutdown: Arc<AtomicBool>,
        start: (Seq, u64),
        stop_log_switches: u64,
    ) -> Self {
        LogBlockReader {
            block_size: config.block_size as usize,
            config: config.clone(),
            tx,
            shutdown,
            start_sequence: start.0,
            start_offset: start.1,
            stop_log_switches,
            switches: 0,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let result = match self.config.reader_type {
            ReaderType::Batch => self.run_batch().await,
            ReaderType::Offline => self.run_archive().await,
            ReaderType::Online => self.run_online().await,
        };
        match &result {
            Ok(()) => info!("log reader finished"),
            Err(Error::Shutdown) => debug!("log reader stopped on shutdown"),
            Err(e) => warn!("log reader failed: {e}"),
        }
        result
    }

    /// Fixed file list, processed in order, stop at the end.
    async fn run_batch(&mut self) -> Result<()> {
        let files: Vec<PathBuf> = self.config.redo_log.clone();
        for path in files {
            let path = self.map_path(&path);
            self.read_log_file(&path, false).await?;
            if self.switch_limit_reached() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Walks an archive directory, picking up new files between rescans.
    async fn run_archive(&mut self) -> Result<()> {
        let dir = self
            .config
            .redo_log
            .first()
            .cloned()
            .ok_or_else(|| Error::config(30001, "'reader.redo-log' must name the archive directory"))?;
        let dir = self.map_path(&dir);

        let mut processed: Option<Seq> = None;
        let mut tries = 0u32;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }

            let pending = self.scan_archive(&dir, processed).await?;
            if pending.is_empty() {
                tries += 1;
                if tries >= self.config.arch_read_tries {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_micros(self.config.arch_read_sleep_us)).await;
                continue;
            }
            tries = 0;

            for (sequence, path) in pending {
                self.read_log_file(&path, false).await?;
                processed = Some(sequence);
                if self.switch_limit_reached() {
                    return Ok(());
                }
            }
        }
    }

    /// Follows the hot log file, rotating when the sequence bumps.
    async fn run_online(&mut self) -> Result<()> {
        let path = self
            .config
            .redo_log
            .first()
            .cloned()
            .ok_or_else(|| Error::config(30001, "'reader.redo-log' must name the online log"))?;
        let path = self.map_path(&path);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            self.read_log_file(&path, true).await?;
            if self.switch_limit_reached() {
                return Ok(());
            }
            // The completed sequence must be replaced by its successor
            // before there is anything new to read.
            tokio::time::sleep(Duration::from_micros(self.config.redo_read_sleep_us)).await;
        }
    }

    /// Orders archive files by the sequence in their first block header.
    async fn scan_archive(&self, dir: &Path, after: Option<Seq>) -> Result<BTreeMap<Seq, PathBuf>> {
        let mut pending = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            Error::runtime(10013, format!("archive directory {}: {e}", dir.display()))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let mut header = vec![0u8; BLOCK_HEADER_SIZE];
            let mut file = match File::open(&path).await {
                Ok(f) => f,
                Err(_) => continue,
            };
            if file.read_exact(&mut header).await.is_err() {
                continue;
            }
            let Ok(Some(header)) = BlockHeader::decode(&header) else {
                continue;
            };
            if header.sequence < self.start_sequence {
                continue;
            }
            if let Some(after) = after {
                if header.sequence <= after {
                    continue;
                }
            }
            pending.insert(header.sequence, path);
        }
        Ok(pending)
    }

    /// Reads one log file block by block, delivering verified payloads.
    ///
    /// In online mode a short or zeroed tail means the writer has not
    /// finished the block yet; the reader sleeps and re-reads. The file
    /// ends cleanly at EOF (batch) or at a block flagged as last.
    async fn read_log_file(&mut self, path: &Path, online: bool) -> Result<()> {
        let mut offset = 0u64;
        let mut expected_block = 0u32;
        let mut sequence: Option<Seq> = None;
        let mut copy = self.open_copy_file(path).await?;
        let mut buf = vec![0u8; self.block_size];

        'blocks: loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }

            let mut file = File::open(path).await.map_err(|e| {
                Error::runtime(10013, format!("log file {}: {e}", path.display()))
            })?;
            let len = file.metadata().await?.len();
            if len < offset + self.block_size as u64 {
                if online {
                    tokio::time::sleep(Duration::from_micros(self.config.redo_read_sleep_us)).await;
                    continue;
                }
                if len > offset {
                    return Err(Error::redo(
                        50011,
                        format!("log file {} torn at offset {offset}", path.display()),
                    ));
                }
                return Ok(());
            }

            use tokio::io::AsyncSeekExt;
            file.seek(std::io::SeekFrom::Start(offset)).await?;

            while offset + (self.block_size as u64) <= len {
                file.read_exact(&mut buf).await?;

                let header = match BlockHeader::decode(&buf)? {
                    Some(header) => header,
                    None => {
                        // Zeroed slot: unwritten tail.
                        if online {
                            drop(file);
                            tokio::time::sleep(Duration::from_micros(self.config.redo_read_sleep_us)).await;
                            continue 'blocks;
                        }
                        return Ok(());
                    }
                };

                match sequence {
                    None => {
                        if header.sequence < self.start_sequence {
                            debug!(sequence = header.sequence, "skipping already-confirmed sequence");
                            return Ok(());
                        }
                        sequence = Some(header.sequence);
                    }
                    Some(seq) if seq != header.sequence => {
                        return Err(Error::redo(
                            50010,
                            format!("sequence changed mid-file: {seq} -> {}", header.sequence),
                        ));
                    }
                    _ => {}
                }
                if header.block != expected_block {
                    return Err(Error::redo(
                        50010,
                        format!("block out of order: expected {expected_block}, got {}", header.block),
                    ));
                }

                if header.payload_size as usize > self.block_size - BLOCK_HEADER_SIZE {
                    return Err(Error::redo(
                        50009,
                        format!("block {} declares {} payload bytes", header.block, header.payload_size),
                    ));
                }
                let payload = &buf[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + header.payload_size as usize];
                if !header.verify(payload) {
                    if online {
                        // Possibly a torn write still in flight.
                        drop(file);
                        tokio::time::sleep(Duration::from_micros(self.config.redo_read_sleep_us)).await;
                        continue 'blocks;
                    }
                    return Err(Error::redo(
                        50011,
                        format!("block {} of sequence {:?} failed checksum", header.block, sequence),
                    ));
                }

                if let Some(copy) = copy.as_mut() {
                    copy.write_all(&buf).await?;
                }

                let seq = sequence.unwrap_or(header.sequence);
                let deliver = seq > self.start_sequence || offset >= self.start_offset;
                if deliver {
                    let block = BlockPayload {
                        sequence: seq,
                        offset,
                        data: Bytes::copy_from_slice(payload),
                        last: header.flags & BLOCK_FLAG_LAST != 0,
                    };
                    if self.tx.send(block).await.is_err() {
                        return Err(Error::Shutdown);
                    }
                }

                offset += self.block_size as u64;
                expected_block += 1;

                if header.flags & BLOCK_FLAG_LAST != 0 {
                    self.switches += 1;
                    self.start_sequence = seq + 1;
                    self.start_offset = 0;
                    info!(sequence = seq, "log switch");
                    return Ok(());
                }
            }
        }
    }

    async fn open_copy_file(&self, source: &Path) -> Result<Option<File>> {
        let Some(dir) = &self.config.redo_copy_path else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir).await?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "redo".to_string());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{name}.copy")))
            .await?;
        Ok(Some(file))
    }

    fn switch_limit_reached(&self) -> bool {
        self.stop_log_switches != 0 && self.switches >= self.stop_log_switches
    }

    /// Applies the pairwise `path-mapping` rewrites.
    fn map_path(&self, path: &Path) -> PathBuf {
        let mapping = &self.config.path_mapping;
        let text = path.to_string_lossy();
        for pair in mapping.chunks(2) {
            if pair.len() == 2 {
                if let Some(rest) = text.strip_prefix(&pair[0]) {
                    return PathBuf::from(format!("{}{rest}", pair[1]));
                }
            }
        }
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 512;

    fn reader_config(paths: Vec<PathBuf>, reader_type: ReaderType) -> ReaderConfig {
        ReaderConfig {
            reader_type,
            start_scn: None,
            start_seq: None,
            start_time: None,
            start_time_rel: None,
            con_id: None,
            redo_copy_path: None,
            db_timezone: None,
            host_timezone: None,
            log_timezone: None,
            user: None,
            password: None,
            server: None,
            redo_log: paths,
            path_mapping: vec![],
            block_size: BLOCK_SIZE as u32,
            redo_read_sleep_us: 1000,
            arch_read_sleep_us: 1000,
            arch_read_tries: 2,
        }
    }

    fn write_log(path: &Path, sequence: Seq, payloads: &[&[u8]]) {
        let mut out = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let last = i == payloads.len() - 1;
            out.extend_from_slice(&encode_block(sequence, i as u32, payload, last, BLOCK_SIZE));
        }
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn header_roundtrip() {
        let block = encode_block(7, 3, b"hello", false, BLOCK_SIZE);
        let header = BlockHeader::decode(&block).unwrap().unwrap();
        assert_eq!(header.sequence, 7);
        assert_eq!(header.block, 3);
        assert_eq!(header.payload_size, 5);
        assert!(header.verify(b"hello"));
        assert!(!header.verify(b"olleh"));
    }

    #[test]
    fn zeroed_header_is_tail() {
        let zeros = vec![0u8; BLOCK_SIZE];
        assert!(BlockHeader::decode(&zeros).unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_delivers_in_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("redo.1");
        write_log(&path, 1, &[b"first", b"second", b"third"]);

        let (tx, mut rx) = mpsc::channel(16);
        let reader = LogBlockReader::new(
            &reader_config(vec![path], ReaderType::Batch),
            tx,
            Arc::new(AtomicBool::new(false)),
            (0, 0),
            0,
        );
        reader.run().await.unwrap();

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(&a.data[..], b"first");
        assert_eq!(a.offset, 0);
        assert_eq!(&b.data[..], b"second");
        assert_eq!(b.offset, BLOCK_SIZE as u64);
        assert!(!b.last);
        assert!(c.last);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_block_fails_batch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("redo.1");
        write_log(&path, 1, &[b"data"]);

        // Flip a payload byte without fixing the CRC.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[BLOCK_HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let reader = LogBlockReader::new(
            &reader_config(vec![path], ReaderType::Batch),
            tx,
            Arc::new(AtomicBool::new(false)),
            (0, 0),
            0,
        );
        let err = reader.run().await.unwrap_err();
        assert_eq!(err.code(), 50011);
    }

    #[tokio::test]
    async fn resume_skips_confirmed_offsets() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("redo.2");
        write_log(&path, 2, &[b"old", b"new", b"tail"]);

        let (tx, mut rx) = mpsc::channel(16);
        let reader = LogBlockReader::new(
            &reader_config(vec![path], ReaderType::Batch),
            tx,
            Arc::new(AtomicBool::new(false)),
            (2, BLOCK_SIZE as u64),
            0,
        );
        reader.run().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(&first.data[..], b"new");
    }

    #[tokio::test]
    async fn archive_orders_by_sequence() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_log(&tmp.path().join("b.arc"), 4, &[b"four"]);
        write_log(&tmp.path().join("a.arc"), 3, &[b"three"]);

        let (tx, mut rx) = mpsc::channel(16);
        let reader = LogBlockReader::new(
            &reader_config(vec![tmp.path().to_path_buf()], ReaderType::Offline),
            tx,
            Arc::new(AtomicBool::new(false)),
            (0, 0),
            0,
        );
        reader.run().await.unwrap();

        assert_eq!(&rx.recv().await.unwrap().data[..], b"three");
        assert_eq!(&rx.recv().await.unwrap().data[..], b"four");
    }
}
