//! Shared harness for integration tests: builds configurations around a
//! temp directory, runs the replicator to completion over synthesized
//! log files, and reads back the emitted JSON lines.

use std::path::PathBuf;

use redo_capture::config::{
    Config, DebugConfig, FilterConfig, FormatConfig, MemoryConfig, ReaderConfig, ReaderType,
    SourceConfig, StateConfig, TargetConfig, WriterConfig, WriterType, FLAG_ADAPTIVE_SCHEMA,
    SCHEMA_VERSION,
};
use redo_capture::{Replicator, Result};
use tempfile::TempDir;

pub const BLOCK_SIZE: u32 = 512;

pub struct TestEnv {
    pub dir: TempDir,
    pub output: PathBuf,
    pub state: PathBuf,
    pub swap: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let output = dir.path().join("out.json");
        let state = dir.path().join("state");
        let swap = dir.path().join("swap");
        TestEnv { dir, output, state, swap }
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Batch-mode config over the given log files, adaptive schema on,
    /// discarding nothing.
    pub fn config(&self, log_files: Vec<PathBuf>) -> Config {
        Config {
            version: SCHEMA_VERSION.to_string(),
            log_level: 3,
            trace: 0,
            dump_path: Some(self.dir.path().join("dump")),
            source: vec![SourceConfig {
                alias: "S1".to_string(),
                name: "TESTDB".to_string(),
                memory: MemoryConfig {
                    min_mb: 4,
                    max_mb: 64,
                    swap_path: self.swap.clone(),
                    ..MemoryConfig::default()
                },
                reader: ReaderConfig {
                    reader_type: ReaderType::Batch,
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
                    redo_log: log_files,
                    path_mapping: vec![],
                    block_size: BLOCK_SIZE,
                    redo_read_sleep_us: 1000,
                    arch_read_sleep_us: 1000,
                    arch_read_tries: 1,
                },
                state: StateConfig {
                    state_type: "disk".to_string(),
                    path: self.state.clone(),
                    interval_s: 3600,
                    interval_mb: 100_000,
                    keep_checkpoints: 10,
                    schema_force_interval: 5,
                },
                debug: DebugConfig::default(),
                flags: FLAG_ADAPTIVE_SCHEMA,
                transaction_max_mb: 0,
                metrics: None,
                filter: FilterConfig::default(),
                format: FormatConfig::default(),
            }],
            target: vec![TargetConfig {
                alias: "T1".to_string(),
                source: "S1".to_string(),
                writer: WriterConfig {
                    writer_type: WriterType::File,
                    poll_interval_us: 1000,
                    queue_size: 1000,
                    max_file_size: 0,
                    timestamp_format: None,
                    output: Some(self.output.clone()),
                    new_line: 1,
                    append: 1,
                    max_message_mb: 16,
                },
            }],
        }
    }

    pub fn read_output(&self) -> Vec<serde_json::Value> {
        read_json_lines(&self.output)
    }
}

pub async fn run(config: Config) -> Result<()> {
    Replicator::new(config, None).run().await
}

pub fn read_json_lines(path: &PathBuf) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).expect("valid JSON line"))
            .collect(),
        Err(_) => vec![],
    }
}

/// Payload elements with a given `op` across all messages, in order.
pub fn payload_ops(lines: &[serde_json::Value], op: &str) -> Vec<serde_json::Value> {
    lines
        .iter()
        .flat_map(|line| {
            line["payload"]
                .as_array()
                .map(|a| a.to_vec())
                .unwrap_or_default()
        })
        .filter(|element| element["op"] == op)
        .collect()
}
