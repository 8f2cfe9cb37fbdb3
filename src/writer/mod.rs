//! Downstream writers: consume the builder queue and hand messages to a
//! sink. Transports beyond the local filesystem plug in here.

mod file;

pub use file::FileWriter;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::builder::{BuilderConsumer, OutputMessage, MSG_FLAG_CHECKPOINT};
use crate::config::{WriterConfig, WriterType};
use crate::Result;

/// The available sinks.
pub enum WriterSink {
    File(FileWriter),
    Discard,
}

impl WriterSink {
    pub async fn from_config(config: &WriterConfig) -> Result<Self> {
        match config.writer_type {
            WriterType::File => Ok(WriterSink::File(FileWriter::new(config).await?)),
            WriterType::Discard => Ok(WriterSink::Discard),
        }
    }

    async fn send(&mut self, message: &OutputMessage) -> Result<()> {
        match self {
            WriterSink::File(writer) => writer.send(message).await,
            WriterSink::Discard => Ok(()),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            WriterSink::File(writer) => writer.flush().await,
            WriterSink::Discard => Ok(()),
        }
    }
}

/// The writer task: single consumer of the builder queue.
///
/// Confirms each message after the sink accepts it, which advances the
/// checkpoint fence. Checkpoint-flagged messages are confirmed without
/// being written.
pub struct WriterTask {
    sink: WriterSink,
    consumer: BuilderConsumer,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl WriterTask {
    pub fn new(
        sink: WriterSink,
        consumer: BuilderConsumer,
        poll_interval_us: u64,
        stop: Arc<AtomicBool>,
    ) -> Self {
        WriterTask {
            sink,
            consumer,
            poll_interval: Duration::from_micros(poll_interval_us),
            stop,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut written = 0u64;
        while let Some(message) = self.consumer.next(self.poll_interval, &self.stop).await? {
            if message.meta.flags & MSG_FLAG_CHECKPOINT == 0 {
                self.sink.send(&message).await?;
                written += 1;
            } else {
                debug!(scn = %message.meta.scn, "checkpoint message confirmed");
            }
            self.consumer.confirm(&message);
        }
        self.sink.flush().await?;
        info!(written, "writer finished");
        Ok(())
    }
}
