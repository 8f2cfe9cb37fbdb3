//! Configuration for redo-capture.
//!
//! Configuration is a single JSON document (path given on the command
//! line) with one `source` and one `target` section. Every numeric option
//! has a declared range; unknown keys are a hard error unless the
//! tag-check disable flag is set in `source.flags`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Config schema version accepted by this build.
pub const SCHEMA_VERSION: &str = "1.8.5";

/// `source.flags` bits.
pub const FLAG_ADAPTIVE_SCHEMA: u32 = 1 << 0;
pub const FLAG_DISABLE_JSON_TAG_CHECK: u32 = 1 << 1;
pub const FLAG_MAX: u32 = 524287;

/// `format.message` bits.
pub const MSG_FULL: u32 = 1 << 0;
pub const MSG_ADD_SEQUENCES: u32 = 1 << 1;
pub const MSG_SKIP_BEGIN: u32 = 1 << 2;
pub const MSG_SKIP_COMMIT: u32 = 1 << 3;
pub const MSG_ADD_OFFSET: u32 = 1 << 4;

/// `format.schema` bits.
pub const SCHEMA_FULL: u32 = 1 << 0;
pub const SCHEMA_REPEATED: u32 = 1 << 1;
pub const SCHEMA_OBJ: u32 = 1 << 2;

/// `format.scn-type` bits.
pub const SCN_ALL_PAYLOADS: u32 = 1 << 0;
pub const SCN_COMMIT_VALUE: u32 = 1 << 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub version: String,
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub trace: u32,
    #[serde(default)]
    pub dump_path: Option<PathBuf>,
    pub source: Vec<SourceConfig>,
    pub target: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    pub alias: String,
    pub name: String,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub reader: ReaderConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub flags: u32,
    #[serde(default = "default_transaction_max_mb")]
    pub transaction_max_mb: u64,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub format: FormatConfig,
}

/// Memory quotas, all in megabytes. The arena chunk size is 1 MiB, so
/// these translate directly into chunk counts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryConfig {
    #[serde(default = "default_memory_min_mb")]
    pub min_mb: u64,
    #[serde(default = "default_memory_max_mb")]
    pub max_mb: u64,
    #[serde(default = "default_buffer_min_mb")]
    pub read_buffer_min_mb: u64,
    #[serde(default = "default_read_buffer_max_mb")]
    pub read_buffer_max_mb: u64,
    #[serde(default = "default_buffer_min_mb")]
    pub write_buffer_min_mb: u64,
    #[serde(default = "default_write_buffer_max_mb")]
    pub write_buffer_max_mb: u64,
    #[serde(default)]
    pub swap_mb: u64,
    #[serde(default = "default_swap_path")]
    pub swap_path: PathBuf,
    #[serde(default = "default_buffer_min_mb")]
    pub unswap_buffer_min_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            min_mb: default_memory_min_mb(),
            max_mb: default_memory_max_mb(),
            read_buffer_min_mb: default_buffer_min_mb(),
            read_buffer_max_mb: default_read_buffer_max_mb(),
            write_buffer_min_mb: default_buffer_min_mb(),
            write_buffer_max_mb: default_write_buffer_max_mb(),
            swap_mb: 0,
            swap_path: default_swap_path(),
            unswap_buffer_min_mb: default_buffer_min_mb(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderType {
    Online,
    Offline,
    Batch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReaderConfig {
    #[serde(rename = "type")]
    pub reader_type: ReaderType,
    #[serde(default)]
    pub start_scn: Option<u64>,
    #[serde(default)]
    pub start_seq: Option<u32>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub start_time_rel: Option<u64>,
    #[serde(default)]
    pub con_id: Option<i32>,
    #[serde(default)]
    pub redo_copy_path: Option<PathBuf>,
    #[serde(default)]
    pub db_timezone: Option<String>,
    #[serde(default)]
    pub host_timezone: Option<String>,
    #[serde(default)]
    pub log_timezone: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub redo_log: Vec<PathBuf>,
    /// Pairwise source/destination path rewrites.
    #[serde(default)]
    pub path_mapping: Vec<String>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_redo_read_sleep_us")]
    pub redo_read_sleep_us: u64,
    #[serde(default = "default_arch_read_sleep_us")]
    pub arch_read_sleep_us: u64,
    #[serde(default = "default_arch_read_tries")]
    pub arch_read_tries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateConfig {
    #[serde(rename = "type", default = "default_state_type")]
    pub state_type: String,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default = "default_checkpoint_interval_s")]
    pub interval_s: u64,
    #[serde(default = "default_checkpoint_interval_mb")]
    pub interval_mb: u64,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: u32,
    #[serde(default = "default_schema_force_interval")]
    pub schema_force_interval: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            state_type: default_state_type(),
            path: default_state_path(),
            interval_s: default_checkpoint_interval_s(),
            interval_mb: default_checkpoint_interval_mb(),
            keep_checkpoints: default_keep_checkpoints(),
            schema_force_interval: default_schema_force_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DebugConfig {
    #[serde(default)]
    pub stop_log_switches: u64,
    #[serde(default)]
    pub stop_checkpoints: u64,
    #[serde(default)]
    pub stop_transactions: u64,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(rename = "type")]
    pub metrics_type: String,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub tag_names: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterConfig {
    #[serde(default)]
    pub table: Vec<TableFilter>,
    #[serde(default = "default_separator")]
    pub separator: Option<String>,
    #[serde(default)]
    pub skip_xid: Vec<String>,
    #[serde(default)]
    pub dump_xid: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableFilter {
    pub owner: String,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Output format knobs. All numeric knobs map onto enumerations in the
/// builder; ranges are validated here.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FormatConfig {
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub attributes: u32,
    #[serde(default)]
    pub interval_dts: u32,
    #[serde(default)]
    pub interval_ytm: u32,
    #[serde(default)]
    pub message: u32,
    #[serde(default)]
    pub rid: u32,
    #[serde(default)]
    pub xid: u32,
    #[serde(default)]
    pub timestamp: u32,
    #[serde(default)]
    pub timestamp_tz: u32,
    #[serde(default)]
    pub timestamp_all: u32,
    #[serde(rename = "char", default)]
    pub char_format: u32,
    #[serde(default)]
    pub scn: u32,
    #[serde(default)]
    pub scn_type: u32,
    #[serde(default)]
    pub unknown: u32,
    #[serde(default)]
    pub schema: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub unknown_type: u32,
    #[serde(default = "default_flush_buffer")]
    pub flush_buffer: u64,
    #[serde(rename = "type", default = "default_format_type")]
    pub format_type: FormatType,
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            db: 0,
            attributes: 0,
            interval_dts: 0,
            interval_ytm: 0,
            message: 0,
            rid: 0,
            xid: 0,
            timestamp: 0,
            timestamp_tz: 0,
            timestamp_all: 0,
            char_format: 0,
            scn: 0,
            scn_type: 0,
            unknown: 0,
            schema: 0,
            column: 0,
            unknown_type: 0,
            flush_buffer: default_flush_buffer(),
            format_type: FormatType::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    Json,
    Protobuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    pub alias: String,
    pub source: String,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterType {
    File,
    Discard,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WriterConfig {
    #[serde(rename = "type")]
    pub writer_type: WriterType,
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: u64,
    #[serde(default)]
    pub max_file_size: u64,
    #[serde(default)]
    pub timestamp_format: Option<String>,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default = "default_one")]
    pub new_line: u8,
    #[serde(default = "default_one")]
    pub append: u8,
    #[serde(default = "default_max_message_mb")]
    pub max_message_mb: u64,
}

fn default_log_level() -> u8 {
    3
}
fn default_transaction_max_mb() -> u64 {
    0
}
fn default_memory_min_mb() -> u64 {
    32
}
fn default_memory_max_mb() -> u64 {
    1024
}
fn default_buffer_min_mb() -> u64 {
    4
}
fn default_read_buffer_max_mb() -> u64 {
    32
}
fn default_write_buffer_max_mb() -> u64 {
    0
}
fn default_swap_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_block_size() -> u32 {
    512
}
fn default_redo_read_sleep_us() -> u64 {
    50_000
}
fn default_arch_read_sleep_us() -> u64 {
    10_000_000
}
fn default_arch_read_tries() -> u32 {
    10
}
fn default_state_type() -> String {
    "disk".to_string()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("checkpoint")
}
fn default_checkpoint_interval_s() -> u64 {
    600
}
fn default_checkpoint_interval_mb() -> u64 {
    500
}
fn default_keep_checkpoints() -> u32 {
    100
}
fn default_schema_force_interval() -> u32 {
    20
}
fn default_separator() -> Option<String> {
    Some(".".to_string())
}
fn default_flush_buffer() -> u64 {
    1_048_576
}
fn default_format_type() -> FormatType {
    FormatType::Json
}
fn default_poll_interval_us() -> u64 {
    100_000
}
fn default_queue_size() -> u64 {
    65536
}
fn default_one() -> u8 {
    1
}
fn default_max_message_mb() -> u64 {
    16
}

impl Config {
    /// Reads and validates the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(10001, format!("file: {} - open for read returned: {e}", path.display()))
        })?;
        if content.is_empty() {
            return Err(Error::config(10004, format!("file: {} - wrong size: 0", path.display())));
        }
        Self::parse(&content, &path.display().to_string())
    }

    /// Parses a config document from a string, applying the JSON tag check
    /// unless disabled via `source.flags`.
    pub fn parse(content: &str, origin: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(content)
            .map_err(|e| Error::config(10005, format!("file: {origin} - parse error: {e}")))?;

        let tag_check = !flags_of(&document)
            .map(|f| f & FLAG_DISABLE_JSON_TAG_CHECK != 0)
            .unwrap_or(false);
        if tag_check {
            check_document_tags(origin, &document)?;
        }

        let config: Config = serde_json::from_value(document)
            .map_err(|e| Error::config(30001, format!("file: {origin} - bad JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation of ranges and cross-field rules.
    pub fn validate(&self) -> Result<()> {
        if self.version != SCHEMA_VERSION {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid 'version' value: {}, expected: {SCHEMA_VERSION}", self.version),
            ));
        }
        if self.log_level > 4 {
            return Err(Error::config(30001, format!("'log-level' out of range: {}", self.log_level)));
        }
        if self.trace > FLAG_MAX {
            return Err(Error::config(30001, format!("'trace' out of range: {}", self.trace)));
        }
        if self.source.len() != 1 {
            return Err(Error::config(30001, "exactly one 'source' element is required"));
        }
        if self.target.len() != 1 {
            return Err(Error::config(30001, "exactly one 'target' element is required"));
        }

        let source = &self.source[0];
        let target = &self.target[0];
        if target.source != source.alias {
            return Err(Error::config(
                30001,
                format!("'target.source' = {} does not match 'source.alias' = {}", target.source, source.alias),
            ));
        }
        if source.flags > FLAG_MAX {
            return Err(Error::config(30001, format!("'flags' out of range: {}", source.flags)));
        }

        let mem = &source.memory;
        if mem.min_mb > mem.max_mb {
            return Err(Error::config(
                30001,
                format!("'min-mb' ({}) must not exceed 'max-mb' ({})", mem.min_mb, mem.max_mb),
            ));
        }
        if mem.swap_mb != 0 && mem.swap_mb + 4 > mem.max_mb {
            return Err(Error::config(
                30001,
                format!("'swap-mb' ({}) must not exceed 'max-mb' - 4 ({})", mem.swap_mb, mem.max_mb.saturating_sub(4)),
            ));
        }
        for (name, value) in [
            ("unswap-buffer-min-mb", mem.unswap_buffer_min_mb),
            ("read-buffer-min-mb", mem.read_buffer_min_mb),
            ("write-buffer-min-mb", mem.write_buffer_min_mb),
        ] {
            if value + 4 > mem.max_mb {
                return Err(Error::config(
                    30001,
                    format!("'{name}' ({value}) + 4 must not exceed 'max-mb' ({})", mem.max_mb),
                ));
            }
        }
        if mem.read_buffer_max_mb != 0 && mem.read_buffer_max_mb < mem.read_buffer_min_mb {
            return Err(Error::config(30001, "'read-buffer-max-mb' below 'read-buffer-min-mb'"));
        }

        if !source.reader.block_size.is_power_of_two() || source.reader.block_size < 128 {
            return Err(Error::config(
                30001,
                format!("'block-size' must be a power of two >= 128, got {}", source.reader.block_size),
            ));
        }
        if source.state.state_type != "disk" {
            return Err(Error::config(
                30001,
                format!("unsupported 'state.type': {}", source.state.state_type),
            ));
        }

        let fmt = &source.format;
        for (name, value, max) in [
            ("db", fmt.db, 3),
            ("attributes", fmt.attributes, 7),
            ("interval-dts", fmt.interval_dts, 10),
            ("interval-ytm", fmt.interval_ytm, 4),
            ("message", fmt.message, 31),
            ("rid", fmt.rid, 1),
            ("xid", fmt.xid, 2),
            ("timestamp", fmt.timestamp, 15),
            ("timestamp-tz", fmt.timestamp_tz, 11),
            ("timestamp-all", fmt.timestamp_all, 1),
            ("char", fmt.char_format, 3),
            ("scn", fmt.scn, 1),
            ("scn-type", fmt.scn_type, 3),
            ("unknown", fmt.unknown, 1),
            ("schema", fmt.schema, 7),
            ("column", fmt.column, 2),
            ("unknown-type", fmt.unknown_type, 1),
        ] {
            if value > max {
                return Err(Error::config(30001, format!("'format.{name}' out of range: {value}")));
            }
        }
        if fmt.message & MSG_FULL != 0 && fmt.message & (MSG_SKIP_BEGIN | MSG_SKIP_COMMIT) != 0 {
            return Err(Error::config(
                30001,
                "'format.message': full message mode cannot be combined with skip-begin/skip-commit",
            ));
        }
        if fmt.format_type == FormatType::Protobuf {
            return Err(Error::config(30001, "'format.type' protobuf is not available in this build"));
        }

        let writer = &target.writer;
        if !(100..=3_600_000_000).contains(&writer.poll_interval_us) {
            return Err(Error::config(
                30001,
                format!("'writer.poll-interval-us' out of range: {}", writer.poll_interval_us),
            ));
        }
        if !(1..=1_000_000).contains(&writer.queue_size) {
            return Err(Error::config(30001, format!("'writer.queue-size' out of range: {}", writer.queue_size)));
        }
        if writer.writer_type == WriterType::File && writer.output.is_none() {
            return Err(Error::config(30001, "'writer.output' is required for the file writer"));
        }
        if writer.new_line > 1 || writer.append > 1 {
            return Err(Error::config(30001, "'writer.new-line' and 'writer.append' must be 0 or 1"));
        }

        for xid in source.filter.skip_xid.iter().chain(source.filter.dump_xid.iter()) {
            xid.parse::<crate::types::Xid>().map_err(|e| Error::config(30001, e))?;
        }

        Ok(())
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source[0]
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target[0]
    }
}

fn flags_of(document: &Value) -> Option<u32> {
    document
        .get("source")?
        .as_array()?
        .first()?
        .get("flags")?
        .as_u64()
        .map(|f| f as u32)
}

/// Verifies that every key of `value` is one of `allowed`.
fn check_fields(origin: &str, section: &str, value: &Value, allowed: &[&str]) -> Result<()> {
    let Some(object) = value.as_object() else {
        return Ok(());
    };
    let allowed: HashSet<&str> = allowed.iter().copied().collect();
    for key in object.keys() {
        if !allowed.contains(key.as_str()) {
            return Err(Error::config(
                30001,
                format!("file: {origin} - unknown key '{key}' in {section}"),
            ));
        }
    }
    Ok(())
}

fn check_document_tags(origin: &str, document: &Value) -> Result<()> {
    check_fields(origin, "document", document, &["version", "log-level", "trace", "dump-path", "source", "target"])?;

    if let Some(sources) = document.get("source").and_then(Value::as_array) {
        for source in sources {
            check_fields(
                origin,
                "source",
                source,
                &["alias", "name", "memory", "reader", "state", "debug", "flags", "transaction-max-mb", "metrics", "filter", "format"],
            )?;
            if let Some(memory) = source.get("memory") {
                check_fields(
                    origin,
                    "source.memory",
                    memory,
                    &["min-mb", "max-mb", "read-buffer-min-mb", "read-buffer-max-mb", "write-buffer-min-mb", "write-buffer-max-mb", "swap-mb", "swap-path", "unswap-buffer-min-mb"],
                )?;
            }
            if let Some(reader) = source.get("reader") {
                check_fields(
                    origin,
                    "source.reader",
                    reader,
                    &["type", "start-scn", "start-seq", "start-time", "start-time-rel", "con-id", "redo-copy-path", "db-timezone", "host-timezone", "log-timezone", "user", "password", "server", "redo-log", "path-mapping", "block-size", "redo-read-sleep-us", "arch-read-sleep-us", "arch-read-tries"],
                )?;
            }
            if let Some(state) = source.get("state") {
                check_fields(
                    origin,
                    "source.state",
                    state,
                    &["type", "path", "interval-s", "interval-mb", "keep-checkpoints", "schema-force-interval"],
                )?;
            }
            if let Some(debug) = source.get("debug") {
                check_fields(
                    origin,
                    "source.debug",
                    debug,
                    &["stop-log-switches", "stop-checkpoints", "stop-transactions", "owner", "table"],
                )?;
            }
            if let Some(filter) = source.get("filter") {
                check_fields(origin, "source.filter", filter, &["table", "separator", "skip-xid", "dump-xid"])?;
            }
            if let Some(format) = source.get("format") {
                check_fields(
                    origin,
                    "source.format",
                    format,
                    &["db", "attributes", "interval-dts", "interval-ytm", "message", "rid", "xid", "timestamp", "timestamp-tz", "timestamp-all", "char", "scn", "scn-type", "unknown", "schema", "column", "unknown-type", "flush-buffer", "type"],
                )?;
            }
        }
    }

    if let Some(targets) = document.get("target").and_then(Value::as_array) {
        for target in targets {
            check_fields(origin, "target", target, &["alias", "source", "writer"])?;
            if let Some(writer) = target.get("writer") {
                check_fields(
                    origin,
                    "target.writer",
                    writer,
                    &["type", "poll-interval-us", "queue-size", "max-file-size", "timestamp-format", "output", "new-line", "append", "max-message-mb", "topic", "properties", "uri"],
                )?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(extra_format: &str) -> String {
        format!(
            r#"{{
                "version": "1.8.5",
                "source": [{{
                    "alias": "S1",
                    "name": "DB1",
                    "reader": {{"type": "batch", "redo-log": ["/tmp/redo.log"]}},
                    "format": {{{extra_format}}}
                }}],
                "target": [{{
                    "alias": "T1",
                    "source": "S1",
                    "writer": {{"type": "discard"}}
                }}]
            }}"#
        )
    }

    #[test]
    fn parses_minimal_config() {
        let config = Config::parse(&minimal_config(""), "test").unwrap();
        assert_eq!(config.source().alias, "S1");
        assert_eq!(config.source().memory.min_mb, 32);
        assert_eq!(config.target().writer.poll_interval_us, 100_000);
    }

    #[test]
    fn rejects_unknown_keys() {
        let bad = minimal_config("").replace("\"name\"", "\"nam\"");
        let err = Config::parse(&bad, "test").unwrap_err();
        assert_eq!(err.code(), 30001);
    }

    #[test]
    fn rejects_bad_version() {
        let bad = minimal_config("").replace("1.8.5", "0.0.1");
        assert!(Config::parse(&bad, "test").is_err());
    }

    #[test]
    fn rejects_full_with_skip_begin() {
        let bad = minimal_config("\"message\": 5");
        let err = Config::parse(&bad, "test").unwrap_err();
        assert_eq!(err.code(), 30001);
    }

    #[test]
    fn rejects_memory_rule_violations() {
        let bad = minimal_config("").replace(
            "\"reader\"",
            "\"memory\": {\"min-mb\": 64, \"max-mb\": 32}, \"reader\"",
        );
        assert!(Config::parse(&bad, "test").is_err());
    }

    #[test]
    fn rejects_file_writer_without_output() {
        let bad = minimal_config("").replace("\"type\": \"discard\"", "\"type\": \"file\"");
        assert!(Config::parse(&bad, "test").is_err());
    }

    #[test]
    fn parses_skip_xid_list() {
        let good = minimal_config("").replace(
            "\"format\": {}",
            "\"filter\": {\"skip-xid\": [\"0x0001.001.00000001\"]}, \"format\": {}",
        );
        let config = Config::parse(&good, "test").unwrap();
        assert_eq!(config.source().filter.skip_xid.len(), 1);
    }
}
