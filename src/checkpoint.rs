//! Checkpoint persistence.
//!
//! Progress records are self-contained JSON files named
//! `<db>-<scn>.json` under the state directory, written atomically via a
//! temp file and rename. A record carries the output fence (the highest
//! commit SCN fully confirmed by the writer), the reader position, the
//! open-transaction descriptors needed to re-read in-flight work, and
//! the schema digest, with the full schema body included periodically so
//! recovery never depends on more than the checkpoint directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::StateConfig;
use crate::transaction::OpenXid;
use crate::types::{Scn, Seq};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Highest commit SCN whose messages are fully confirmed downstream.
    pub scn: Scn,
    /// SCN of the LWN group being parsed when the record was taken.
    pub lwn_scn: Scn,
    pub sequence: Seq,
    pub offset: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub message_count: u64,
    pub open_xids: Vec<OpenXid>,
    pub schema_digest: u32,
    /// Full schema body, present every `schema-force-interval` records
    /// and always in the first.
    #[serde(default)]
    pub schema: Option<String>,
}

impl CheckpointRecord {
    /// Reader start position for recovery: the stored offset, or the
    /// earliest open transaction if one began before it.
    pub fn start_position(&self) -> (Seq, u64) {
        self.open_xids
            .iter()
            .map(|open| (open.sequence, open.offset))
            .chain(std::iter::once((self.sequence, self.offset)))
            .min()
            .unwrap_or((self.sequence, self.offset))
    }
}

/// Writes, restores, and garbage-collects checkpoint records.
pub struct CheckpointKeeper {
    dir: PathBuf,
    db_name: String,
    keep: u32,
    schema_force_interval: u32,
    saves_since_schema: u32,
}

impl CheckpointKeeper {
    pub fn new(config: &StateConfig, db_name: &str) -> Result<Self> {
        std::fs::create_dir_all(&config.path).map_err(|e| {
            Error::config(
                10001,
                format!("state path {} cannot be created: {e}", config.path.display()),
            )
        })?;
        Ok(CheckpointKeeper {
            dir: config.path.clone(),
            db_name: db_name.to_string(),
            keep: config.keep_checkpoints,
            schema_force_interval: config.schema_force_interval,
            saves_since_schema: 0,
        })
    }

    /// Loads the newest valid checkpoint, together with the newest
    /// schema body at or before it.
    pub async fn load_latest(&self) -> Result<Option<(CheckpointRecord, String)>> {
        let mut records = self.list_records().await?;
        records.sort_by_key(|(scn, _)| *scn);

        let mut schema_body: Option<String> = None;
        let mut newest: Option<CheckpointRecord> = None;
        for (_, path) in &records {
            match self.read_record(path).await {
                Ok(record) => {
                    if let Some(body) = &record.schema {
                        schema_body = Some(body.clone());
                    }
                    newest = Some(record);
                }
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable checkpoint: {e}");
                }
            }
        }

        match (newest, schema_body) {
            (Some(record), Some(schema)) => {
                info!(
                    scn = %record.scn,
                    sequence = record.sequence,
                    offset = record.offset,
                    open = record.open_xids.len(),
                    "loaded checkpoint"
                );
                Ok(Some((record, schema)))
            }
            (Some(record), None) => Err(Error::data(
                20003,
                format!("checkpoint {} found but no schema body in {}", record.scn, self.dir.display()),
            )),
            (None, _) => {
                debug!(dir = %self.dir.display(), "no checkpoint found");
                Ok(None)
            }
        }
    }

    /// Saves a record atomically and prunes old ones.
    pub async fn save(&mut self, mut record: CheckpointRecord, schema_body: &str) -> Result<()> {
        let force_schema = self.saves_since_schema == 0
            || (self.schema_force_interval != 0
                && self.saves_since_schema >= self.schema_force_interval);
        if force_schema {
            record.schema = Some(schema_body.to_string());
            self.saves_since_schema = 0;
        }
        self.saves_since_schema += 1;

        let path = self.path_for(record.scn);
        let temp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&record)?;

        let mut file = fs::File::create(&temp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp, &path).await?;

        debug!(scn = %record.scn, path = %path.display(), "checkpoint saved");
        self.gc().await?;
        Ok(())
    }

    /// Keeps the most recent `keep-checkpoints` records.
    async fn gc(&self) -> Result<()> {
        let mut records = self.list_records().await?;
        if records.len() <= self.keep as usize {
            return Ok(());
        }
        records.sort_by_key(|(scn, _)| *scn);
        let excess = records.len() - self.keep as usize;
        for (scn, path) in records.into_iter().take(excess) {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(scn, "old checkpoint removed"),
                Err(e) => warn!(path = %path.display(), "failed to remove old checkpoint: {e}"),
            }
        }
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        let prefix = format!("{}-", self.db_name);
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Some(scn_text) = stem.strip_prefix(&prefix) else {
                continue;
            };
            if let Ok(scn) = scn_text.parse::<u64>() {
                out.push((scn, path));
            }
        }
        Ok(out)
    }

    async fn read_record(&self, path: &PathBuf) -> Result<CheckpointRecord> {
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| Error::data(20003, format!("invalid checkpoint {}: {e}", path.display())))
    }

    fn path_for(&self, scn: Scn) -> PathBuf {
        self.dir.join(format!("{}-{}.json", self.db_name, scn.as_u64()))
    }
}
