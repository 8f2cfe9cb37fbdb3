//! Single-producer/single-consumer chunked output ring.
//!
//! Nodes own arena chunks. The producer appends framed messages and
//! publishes bytes by advancing the node's atomic `size`; the consumer
//! reads published bytes, reassembles frames (a large message may span
//! nodes), and returns each node's chunk to the arena once drained.
//! Each node's buffer is behind its own mutex, held only for the copy
//! in or out; the atomics carry the published sizes and confirmation
//! counters between the two ends.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::memory::{Chunk, MemoryArena, Module, CHUNK_SIZE};
use crate::types::{Obj, Scn, Seq};
use crate::{Error, Result};

pub const MSG_FLAG_ALLOCATED: u16 = 1 << 0;
pub const MSG_FLAG_CONFIRMED: u16 = 1 << 1;
pub const MSG_FLAG_CHECKPOINT: u16 = 1 << 2;

/// Fixed frame header: `{len u32, tag_size u32, flags u16, pad u16,
/// id u64, scn u64, c_scn u64, c_idx u64, sequence u32, obj u32, pad u32}`,
/// 8-byte aligned. Frames are padded to 8 bytes.
pub const MESSAGE_HEADER_SIZE: usize = 56;

/// Metadata of one output message.
#[derive(Debug, Clone, Copy)]
pub struct MessageMeta {
    pub id: u64,
    pub scn: Scn,
    pub c_scn: Scn,
    pub c_idx: u64,
    pub sequence: Seq,
    pub obj: Obj,
    pub flags: u16,
}

/// A reassembled message on the consumer side.
#[derive(Debug, Clone)]
pub struct OutputMessage {
    pub meta: MessageMeta,
    pub tag: Option<Bytes>,
    pub payload: Bytes,
}

struct BuilderNode {
    id: u64,
    /// Bytes published so far; the consumer never reads past it.
    size: AtomicUsize,
    data: Mutex<Chunk>,
    next: Mutex<Option<Arc<BuilderNode>>>,
    arena: Arc<MemoryArena>,
}

impl Drop for BuilderNode {
    fn drop(&mut self) {
        let chunk = std::mem::take(&mut *self.data.get_mut());
        if !chunk.is_empty() {
            self.arena.release(Module::Builder, chunk);
        }
    }
}

/// State shared by both ends.
pub struct BuilderQueue {
    notify: Notify,
    unconfirmed: AtomicU64,
    confirmed_scn: AtomicU64,
    emitted_bytes: AtomicU64,
    messages: AtomicU64,
}

impl BuilderQueue {
    pub fn unconfirmed_bytes(&self) -> u64 {
        self.unconfirmed.load(Ordering::Acquire)
    }

    /// Highest commit SCN fully confirmed by the writer; the checkpoint
    /// fence.
    pub fn confirmed_scn(&self) -> Scn {
        Scn::new(self.confirmed_scn.load(Ordering::Acquire))
    }

    pub fn emitted_bytes(&self) -> u64 {
        self.emitted_bytes.load(Ordering::Relaxed)
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn wake_consumer(&self) {
        self.notify.notify_waiters();
    }
}

/// Producer half, owned by the parser thread during commit replay.
pub struct BuilderProducer {
    queue: Arc<BuilderQueue>,
    tail: Arc<BuilderNode>,
    arena: Arc<MemoryArena>,
    next_node_id: u64,
    /// Hard ceiling on one message, from `write-buffer-max-mb` (0 = off).
    max_message_bytes: u64,
    flush_buffer: u64,
}

/// Consumer half, owned by the writer task.
pub struct BuilderConsumer {
    queue: Arc<BuilderQueue>,
    head: Arc<BuilderNode>,
    pos: usize,
    pending: BytesMut,
}

/// Builds the ring with its first node.
pub async fn builder_queue(
    arena: Arc<MemoryArena>,
    max_message_bytes: u64,
    flush_buffer: u64,
) -> Result<(BuilderProducer, BuilderConsumer, Arc<BuilderQueue>)> {
    let chunk = arena.acquire(Module::Builder).await?;
    let first = Arc::new(BuilderNode {
        id: 0,
        size: AtomicUsize::new(0),
        data: Mutex::new(chunk),
        next: Mutex::new(None),
        arena: Arc::clone(&arena),
    });
    let queue = Arc::new(BuilderQueue {
        notify: Notify::new(),
        unconfirmed: AtomicU64::new(0),
        confirmed_scn: AtomicU64::new(0),
        emitted_bytes: AtomicU64::new(0),
        messages: AtomicU64::new(0),
    });

    let producer = BuilderProducer {
        queue: Arc::clone(&queue),
        tail: Arc::clone(&first),
        arena,
        next_node_id: 1,
        max_message_bytes,
        flush_buffer,
    };
    let consumer = BuilderConsumer {
        queue: Arc::clone(&queue),
        head: first,
        pos: 0,
        pending: BytesMut::new(),
    };
    Ok((producer, consumer, queue))
}

impl BuilderProducer {
    /// Frames and publishes one message.
    pub async fn publish(
        &mut self,
        meta: &MessageMeta,
        tag: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<()> {
        let tag_len = tag.map_or(0, |t| t.len());
        let len = MESSAGE_HEADER_SIZE + tag_len + payload.len();
        let padded = (len + 7) & !7;
        if self.max_message_bytes != 0 && padded as u64 > self.max_message_bytes {
            return Err(Error::runtime(
                10072,
                format!(
                    "writer buffer is too small to fit a message with size: {padded}, limit: {}",
                    self.max_message_bytes
                ),
            ));
        }

        let mut frame = BytesMut::with_capacity(padded);
        frame.put_u32_le(len as u32);
        frame.put_u32_le(tag_len as u32);
        frame.put_u16_le(meta.flags | MSG_FLAG_ALLOCATED);
        frame.put_u16_le(0);
        frame.put_u64_le(meta.id);
        frame.put_u64_le(meta.scn.as_u64());
        frame.put_u64_le(meta.c_scn.as_u64());
        frame.put_u64_le(meta.c_idx);
        frame.put_u32_le(meta.sequence);
        frame.put_u32_le(meta.obj);
        frame.put_u32_le(0);
        if let Some(tag) = tag {
            frame.put_slice(tag);
        }
        frame.put_slice(payload);
        frame.resize(padded, 0);

        self.write_bytes(&frame).await?;

        self.queue.unconfirmed.fetch_add(padded as u64, Ordering::AcqRel);
        self.queue.emitted_bytes.fetch_add(padded as u64, Ordering::Relaxed);
        self.queue.messages.fetch_add(1, Ordering::Relaxed);

        if self.flush_buffer == 0 || self.queue.unconfirmed_bytes() >= self.flush_buffer {
            self.queue.notify.notify_waiters();
        }
        Ok(())
    }

    /// Wakes the consumer regardless of the flush threshold.
    pub fn flush(&self) {
        self.queue.notify.notify_waiters();
    }

    async fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        // A message that fits in one node is kept whole by rotating
        // early; larger messages span nodes.
        let used = self.tail.size.load(Ordering::Relaxed);
        if bytes.len() <= CHUNK_SIZE && used + bytes.len() > CHUNK_SIZE {
            self.rotate().await?;
        }

        while !bytes.is_empty() {
            let used = self.tail.size.load(Ordering::Relaxed);
            let available = CHUNK_SIZE - used;
            if available == 0 {
                self.rotate().await?;
                continue;
            }
            let n = bytes.len().min(available);
            {
                let mut data = self.tail.data.lock();
                data[used..used + n].copy_from_slice(&bytes[..n]);
            }
            self.tail.size.store(used + n, Ordering::Release);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        let chunk = self.arena.acquire(Module::Builder).await?;
        let node = Arc::new(BuilderNode {
            id: self.next_node_id,
            size: AtomicUsize::new(0),
            data: Mutex::new(chunk),
            next: Mutex::new(None),
            arena: Arc::clone(&self.arena),
        });
        self.next_node_id += 1;
        *self.tail.next.lock() = Some(Arc::clone(&node));
        self.tail = node;
        self.queue.notify.notify_waiters();
        debug!(node = self.next_node_id - 1, "builder queue rotated");
        Ok(())
    }
}

impl BuilderConsumer {
    /// Returns the next message, waiting up to the poll interval between
    /// checks. `Ok(None)` when `stop` is set and no complete message is
    /// buffered; a partial frame is discarded at that point.
    pub async fn next(
        &mut self,
        poll_interval: Duration,
        stop: &AtomicBool,
    ) -> Result<Option<OutputMessage>> {
        loop {
            if let Some(message) = self.parse_pending()? {
                return Ok(Some(message));
            }
            if self.pull_published() {
                continue;
            }
            if stop.load(Ordering::Acquire) {
                return Ok(None);
            }
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Drains any published bytes into the local buffer. Returns true if
    /// progress was made.
    fn pull_published(&mut self) -> bool {
        let size = self.head.size.load(Ordering::Acquire);
        if self.pos < size {
            {
                let data = self.head.data.lock();
                self.pending.extend_from_slice(&data[self.pos..size]);
            }
            self.pos = size;
            return true;
        }

        let next = self.head.next.lock().clone();
        if let Some(next) = next {
            if self.pos == size {
                self.head = next;
                self.pos = 0;
                return true;
            }
        }
        false
    }

    fn parse_pending(&mut self) -> Result<Option<OutputMessage>> {
        if self.pending.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }
        let len =
            u32::from_le_bytes([self.pending[0], self.pending[1], self.pending[2], self.pending[3]])
                as usize;
        let padded = (len + 7) & !7;
        if len < MESSAGE_HEADER_SIZE {
            return Err(Error::runtime(50003, format!("corrupt output frame length: {len}")));
        }
        if self.pending.len() < padded {
            return Ok(None);
        }

        let mut frame = self.pending.split_to(padded).freeze();
        frame.advance(4);
        let tag_size = frame.get_u32_le() as usize;
        let flags = frame.get_u16_le();
        let _pad = frame.get_u16_le();
        let id = frame.get_u64_le();
        let scn = Scn::new(frame.get_u64_le());
        let c_scn = Scn::new(frame.get_u64_le());
        let c_idx = frame.get_u64_le();
        let sequence = frame.get_u32_le();
        let obj = frame.get_u32_le();
        let _pad2 = frame.get_u32_le();

        let tag = if tag_size > 0 { Some(frame.split_to(tag_size)) } else { None };
        let payload = frame.split_to(len - MESSAGE_HEADER_SIZE - tag_size);

        Ok(Some(OutputMessage {
            meta: MessageMeta { id, scn, c_scn, c_idx, sequence, obj, flags },
            tag,
            payload,
        }))
    }

    /// Confirms a delivered message, advancing the checkpoint fence.
    pub fn confirm(&self, message: &OutputMessage) {
        let len = MESSAGE_HEADER_SIZE
            + message.tag.as_ref().map_or(0, |t| t.len())
            + message.payload.len();
        let padded = ((len + 7) & !7) as u64;
        self.queue.unconfirmed.fetch_sub(padded, Ordering::AcqRel);
        self.queue.confirmed_scn.fetch_max(message.meta.scn.as_u64(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn arena() -> Arc<MemoryArena> {
        Arc::new(
            MemoryArena::new(&MemoryConfig {
                min_mb: 2,
                max_mb: 16,
                read_buffer_min_mb: 0,
                read_buffer_max_mb: 0,
                write_buffer_min_mb: 0,
                write_buffer_max_mb: 0,
                swap_mb: 0,
                swap_path: std::path::PathBuf::from("."),
                unswap_buffer_min_mb: 0,
            })
            .unwrap(),
        )
    }

    fn meta(id: u64, scn: u64) -> MessageMeta {
        MessageMeta {
            id,
            scn: Scn::new(scn),
            c_scn: Scn::new(scn),
            c_idx: 0,
            sequence: 1,
            obj: 101,
            flags: 0,
        }
    }

    #[tokio::test]
    async fn publish_consume_roundtrip() {
        let (mut producer, mut consumer, _queue) = builder_queue(arena(), 0, 0).await.unwrap();
        producer.publish(&meta(1, 100), None, b"{\"a\":1}").await.unwrap();
        producer.publish(&meta(2, 101), Some(b"tag"), b"{\"b\":2}").await.unwrap();

        let stop = AtomicBool::new(false);
        let first = consumer.next(Duration::from_millis(1), &stop).await.unwrap().unwrap();
        assert_eq!(first.meta.id, 1);
        assert_eq!(&first.payload[..], b"{\"a\":1}");
        assert!(first.tag.is_none());
        consumer.confirm(&first);

        let second = consumer.next(Duration::from_millis(1), &stop).await.unwrap().unwrap();
        assert_eq!(second.meta.id, 2);
        assert_eq!(second.tag.as_deref(), Some(&b"tag"[..]));
        consumer.confirm(&second);

        assert_eq!(consumer.queue.unconfirmed_bytes(), 0);
        assert_eq!(consumer.queue.confirmed_scn(), Scn::new(101));
    }

    #[tokio::test]
    async fn large_message_spans_nodes() {
        let (mut producer, mut consumer, _queue) = builder_queue(arena(), 0, 0).await.unwrap();
        let payload = vec![0xA5u8; CHUNK_SIZE + 1000];
        producer.publish(&meta(1, 5), None, &payload).await.unwrap();

        let stop = AtomicBool::new(false);
        let message = consumer.next(Duration::from_millis(1), &stop).await.unwrap().unwrap();
        assert_eq!(message.payload.len(), payload.len());
        assert_eq!(&message.payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn message_limit_enforced() {
        let (mut producer, _consumer, _queue) = builder_queue(arena(), 1024, 0).await.unwrap();
        let err = producer.publish(&meta(1, 5), None, &vec![0u8; 2048]).await.unwrap_err();
        assert_eq!(err.code(), 10072);
    }

    #[tokio::test]
    async fn consumer_stops_on_flag() {
        let (_producer, mut consumer, _queue) = builder_queue(arena(), 0, 0).await.unwrap();
        let stop = AtomicBool::new(true);
        assert!(consumer.next(Duration::from_millis(1), &stop).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consumer_wakes_on_publish() {
        let (mut producer, mut consumer, _queue) = builder_queue(arena(), 0, 0).await.unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let stop2 = Arc::clone(&stop);
        let reader = tokio::spawn(async move {
            let msg = consumer.next(Duration::from_secs(5), &stop2).await.unwrap().unwrap();
            msg.meta.id
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.publish(&meta(42, 9), None, b"x").await.unwrap();
        producer.flush();

        assert_eq!(reader.await.unwrap(), 42);
    }
}
