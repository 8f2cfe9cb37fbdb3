//! File sink: appends serialized messages to an output file, rotating
//! when it grows past `max-file-size`.

use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::builder::OutputMessage;
use crate::config::WriterConfig;
use crate::{Error, Result};

pub struct FileWriter {
    path: PathBuf,
    file: File,
    written: u64,
    max_file_size: u64,
    new_line: bool,
    append: bool,
    timestamp_format: Option<String>,
    rotation: u32,
}

impl FileWriter {
    pub async fn new(config: &WriterConfig) -> Result<Self> {
        let path = config
            .output
            .clone()
            .ok_or_else(|| Error::config(30001, "'writer.output' is required for the file writer"))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let append = config.append != 0;
        let file = Self::open(&path, append).await?;
        let written = file.metadata().await?.len();

        Ok(FileWriter {
            path,
            file,
            written,
            max_file_size: config.max_file_size,
            new_line: config.new_line != 0,
            append,
            timestamp_format: config.timestamp_format.clone(),
            rotation: 0,
        })
    }

    pub async fn send(&mut self, message: &OutputMessage) -> Result<()> {
        if self.max_file_size != 0
            && self.written + message.payload.len() as u64 > self.max_file_size
        {
            self.rotate().await?;
        }
        self.file.write_all(&message.payload).await?;
        if self.new_line {
            self.file.write_all(b"\n").await?;
        }
        self.written += message.payload.len() as u64 + u64::from(self.new_line);
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        debug!(path = %self.path.display(), bytes = self.written, "output flushed");
        Ok(())
    }

    /// Closes the current file under a rotation name and starts fresh.
    async fn rotate(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let suffix = match &self.timestamp_format {
            Some(format) => chrono::Utc::now().format(format).to_string(),
            None => {
                self.rotation += 1;
                format!("{:06}", self.rotation)
            }
        };
        let rotated = self.path.with_extension(format!("{suffix}.json"));
        tokio::fs::rename(&self.path, &rotated).await?;
        info!(path = %rotated.display(), "output file rotated");

        self.file = Self::open(&self.path, self.append).await?;
        self.written = 0;
        Ok(())
    }

    async fn open(path: &PathBuf, append: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        Ok(options.open(path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MessageMeta;
    use crate::types::Scn;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn writer_config(output: PathBuf, max_file_size: u64) -> WriterConfig {
        WriterConfig {
            writer_type: crate::config::WriterType::File,
            poll_interval_us: 1000,
            queue_size: 100,
            max_file_size,
            timestamp_format: None,
            output: Some(output),
            new_line: 1,
            append: 1,
            max_message_mb: 16,
        }
    }

    fn message(payload: &str) -> OutputMessage {
        OutputMessage {
            meta: MessageMeta {
                id: 0,
                scn: Scn::new(1),
                c_scn: Scn::new(1),
                c_idx: 0,
                sequence: 1,
                obj: 0,
                flags: 0,
            },
            tag: None,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    #[tokio::test]
    async fn writes_line_per_message() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        let mut writer = FileWriter::new(&writer_config(path.clone(), 0)).await.unwrap();

        writer.send(&message("{\"a\":1}")).await.unwrap();
        writer.send(&message("{\"b\":2}")).await.unwrap();
        writer.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
    }

    #[tokio::test]
    async fn rotates_at_size_limit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        let mut writer = FileWriter::new(&writer_config(path.clone(), 10)).await.unwrap();

        writer.send(&message("0123456789")).await.unwrap();
        writer.send(&message("abcdefghij")).await.unwrap();
        writer.flush().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 2, "expected rotated file plus current file");
    }

    #[tokio::test]
    async fn append_mode_keeps_existing_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        std::fs::write(&path, "existing\n").unwrap();

        let mut writer = FileWriter::new(&writer_config(path.clone(), 0)).await.unwrap();
        writer.send(&message("new")).await.unwrap();
        writer.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "existing\nnew\n");
    }
}
